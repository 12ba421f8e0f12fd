//! Dual-clock synchronizer.
//!
//! A peripheral with its own crystal (a disk drive) runs its own
//! [`EventScheduler`]. Rather than stepping it every master cycle, the
//! master credits it with slave cycles on demand: elapsed master cycles are
//! multiplied by a 16.16 fixed-point ratio, whole slave cycles are run, and
//! the fractional remainder carries into the next call.

use std::fmt::Debug;
use std::hash::Hash;

use crate::{EventHandler, EventScheduler, SchedulerError};

const FRACTION_BITS: u32 = 16;
const ONE: i64 = 1 << FRACTION_BITS;

/// Conversion state between a master and a slave clock domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSync {
    /// Slave cycles per master cycle, 16.16 fixed point.
    factor: i64,
    /// Slave cycles owed but not yet run, 16.16 fixed point. Negative when
    /// a write offset credited cycles ahead of the master.
    accumulator: i64,
    /// Master time (plus offset) at the last synchronization point.
    last_master: i64,
}

impl ClockSync {
    #[must_use]
    pub fn new(master_hz: f64, slave_hz: f64) -> Self {
        let mut sync = Self {
            factor: ONE,
            accumulator: 0,
            last_master: 0,
        };
        sync.set_clock_divider(master_hz, slave_hz);
        sync
    }

    /// Recompute the ratio, rounding to the nearest 1/65536.
    ///
    /// Cycles already owed keep their old conversion.
    pub fn set_clock_divider(&mut self, master_hz: f64, slave_hz: f64) {
        self.factor = (slave_hz / master_hz * ONE as f64 + 0.5) as i64;
        log::debug!(
            "clock divider {master_hz} Hz -> {slave_hz} Hz, factor {:#x}",
            self.factor
        );
    }

    /// Take `master_now` as the new reference point and drop any remainder.
    pub fn reset(&mut self, master_now: u64) {
        self.last_master = master_now as i64;
        self.accumulator = 0;
    }

    #[must_use]
    pub fn factor(&self) -> i64 {
        self.factor
    }

    /// Fractional slave cycles carried to the next call, 16.16 fixed point.
    #[must_use]
    pub fn remainder(&self) -> i64 {
        self.accumulator
    }

    /// Whole slave cycles owed up to `master_now + offset`.
    ///
    /// A positive `offset` credits cycles ahead of the master (a write must
    /// be seen one cycle after a read in the same cycle). A later call at
    /// an earlier reference sees a negative delta and pays the credit back
    /// instead of counting it twice.
    pub fn slave_cycles_owed(&mut self, master_now: u64, offset: i64) -> u64 {
        let target = master_now as i64 + offset;
        let elapsed = target - self.last_master;
        self.last_master = target;
        self.accumulator += self.factor * elapsed;
        if self.accumulator < ONE {
            return 0;
        }
        let whole = self.accumulator >> FRACTION_BITS;
        self.accumulator &= ONE - 1;
        whole as u64
    }

    /// Run `slave` forward by the cycles owed up to `master_now + offset`.
    ///
    /// Returns the number of slave cycles run.
    pub fn synchronize<E, H>(
        &mut self,
        master_now: u64,
        offset: i64,
        slave: &mut EventScheduler<E>,
        handler: &mut H,
    ) -> Result<u64, SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
        H: EventHandler<E> + ?Sized,
    {
        let owed = self.slave_cycles_owed(master_now, offset);
        slave.advance(owed, handler)?;
        Ok(owed)
    }
}
