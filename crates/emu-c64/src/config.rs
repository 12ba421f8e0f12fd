//! C64 configuration: model selection and peripheral clocking.

pub use mos_cia_6526::CiaModel;

/// C64 model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum C64Model {
    /// PAL C64 (6569 VIC-II, 985,248 Hz CPU).
    #[default]
    C64Pal,
    /// NTSC C64 (6567 VIC-II, 1,022,727 Hz CPU).
    C64Ntsc,
}

impl C64Model {
    /// CPU clock in Hz.
    #[must_use]
    pub fn cpu_frequency(self) -> f64 {
        match self {
            Self::C64Pal => 985_248.444,
            Self::C64Ntsc => 1_022_727.143,
        }
    }

    /// CPU cycles per video frame: 312 lines x 63 cycles on PAL, 263 x 65
    /// on NTSC.
    #[must_use]
    pub fn cycles_per_frame(self) -> u64 {
        match self {
            Self::C64Pal => 312 * 63,
            Self::C64Ntsc => 263 * 65,
        }
    }

    /// Mains frequency the power supply feeds to the CIA TOD pins.
    #[must_use]
    pub fn mains_hz(self) -> f64 {
        match self {
            Self::C64Pal => 50.0,
            Self::C64Ntsc => 60.0,
        }
    }

    #[must_use]
    pub fn cycles_per_mains_period(self) -> f64 {
        self.cpu_frequency() / self.mains_hz()
    }
}

/// How the peripheral clock domain is kept up with the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncMode {
    /// Catch up on a fixed period as well as on every bus access.
    Eager,
    /// Catch up only when the CPU touches the serial port.
    #[default]
    Lazy,
}

/// Configuration for constructing a C64 instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct C64Config {
    pub model: C64Model,
    pub cia_model: CiaModel,
    /// Crystal of the serial peripherals, in Hz.
    pub peripheral_clock_hz: f64,
    pub peripheral_sync: SyncMode,
    /// Whether serial peripherals are switched on at power-up.
    pub peripheral_power: bool,
    /// Let CIA timers skip ahead to their next underflow instead of
    /// ticking every cycle.
    pub cycle_skipping: bool,
}

impl Default for C64Config {
    fn default() -> Self {
        Self {
            model: C64Model::C64Pal,
            cia_model: CiaModel::Mos6526,
            peripheral_clock_hz: 1_000_000.0,
            peripheral_sync: SyncMode::Lazy,
            peripheral_power: true,
            cycle_skipping: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mains_period_matches_cpu_clock() {
        let pal = C64Model::C64Pal.cycles_per_mains_period();
        assert!((pal - 19_704.968_88).abs() < 1e-3);
        let ntsc = C64Model::C64Ntsc.cycles_per_mains_period();
        assert!((ntsc - 17_045.452_38).abs() < 1e-3);
    }

    #[test]
    fn frame_lengths() {
        assert_eq!(C64Model::C64Pal.cycles_per_frame(), 19_656);
        assert_eq!(C64Model::C64Ntsc.cycles_per_frame(), 17_095);
    }

    #[test]
    fn default_is_pal_lazy_powered() {
        let config = C64Config::default();
        assert_eq!(config.model, C64Model::C64Pal);
        assert_eq!(config.peripheral_sync, SyncMode::Lazy);
        assert!(config.peripheral_power);
        assert!((config.peripheral_clock_hz - 1e6).abs() < f64::EPSILON);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_round_trips_through_json() {
        let config = C64Config {
            model: C64Model::C64Ntsc,
            cia_model: CiaModel::Mos6526A,
            peripheral_sync: SyncMode::Eager,
            ..C64Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: C64Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
