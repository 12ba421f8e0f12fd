//! Clock frequency of a timing domain.

/// Clock configuration of one timing domain.
///
/// Each domain (the main unit, a disk drive) has one crystal-derived clock
/// that its scheduler counts. Protocol timings expressed in microseconds
/// are converted through this.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MasterClock {
    /// Clock frequency in Hz (e.g., `985_248.444` for a PAL C64 CPU).
    pub frequency_hz: f64,
}

impl MasterClock {
    #[must_use]
    pub const fn new(frequency_hz: f64) -> Self {
        Self { frequency_hz }
    }

    /// Clock cycles elapsing per microsecond.
    #[must_use]
    pub fn cycles_per_us(&self) -> f64 {
        self.frequency_hz / 1_000_000.0
    }

    /// Convert a microsecond window to whole cycles, rounding to nearest.
    #[must_use]
    pub fn us_to_cycles(&self, us: u32) -> u64 {
        (f64::from(us) * self.cycles_per_us() + 0.5) as u64
    }
}
