//! Interrupt control register (ICR) latch.
//!
//! Both chip revisions latch incoming sources the same way; they differ in
//! when the request line follows. The 6526A asserts it inside `trigger`;
//! the older 6526 asserts it one cycle later from a scheduled event.

use std::fmt::Debug;
use std::hash::Hash;

use emu_core::{EventScheduler, Phase, SchedulerError};

use crate::{CiaModel, CiaPorts};

/// Timer A underflow.
pub const TIMER_A: u8 = 0x01;
/// Timer B underflow.
pub const TIMER_B: u8 = 0x02;
/// Time-of-day alarm.
pub const ALARM: u8 = 0x04;
/// Serial shift register finished a byte.
pub const SERIAL: u8 = 0x08;
/// FLAG pin falling edge.
pub const FLAG: u8 = 0x10;
/// Request bit, set while the interrupt line is asserted.
pub const REQUEST: u8 = 0x80;

pub(crate) struct InterruptSource {
    model: CiaModel,
    /// Enabled sources.
    mask: u8,
    /// Latched sources plus the request bit.
    data: u8,
    /// A delayed assertion is pending (6526 only).
    scheduled: bool,
}

impl InterruptSource {
    pub(crate) fn new(model: CiaModel) -> Self {
        Self {
            model,
            mask: 0,
            data: 0,
            scheduled: false,
        }
    }

    pub(crate) fn mask(&self) -> u8 {
        self.mask
    }

    pub(crate) fn data(&self) -> u8 {
        self.data
    }

    /// Drop latched and enabled sources without signalling the CPU.
    pub(crate) fn reset<E>(&mut self, sched: &mut EventScheduler<E>, event: E)
    where
        E: Copy + Eq + Hash + Debug,
    {
        self.mask = 0;
        self.data = 0;
        self.scheduled = false;
        sched.cancel(event);
    }

    /// Latch `flags` and raise the request if an enabled source is latched.
    pub(crate) fn trigger<E, P>(
        &mut self,
        flags: u8,
        sched: &mut EventScheduler<E>,
        event: E,
        ports: &mut P,
    ) -> Result<(), SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
        P: CiaPorts + ?Sized,
    {
        self.data |= flags;
        if self.mask & self.data == 0 || self.data & REQUEST != 0 {
            return Ok(());
        }
        match self.model {
            CiaModel::Mos6526A => {
                self.data |= REQUEST;
                ports.interrupt(true);
            }
            CiaModel::Mos6526 => {
                if !self.scheduled {
                    sched.schedule(event, 1, Phase::Phi1)?;
                    self.scheduled = true;
                }
            }
        }
        Ok(())
    }

    /// The delayed assertion event fired.
    pub(crate) fn assert_delayed<P: CiaPorts + ?Sized>(&mut self, ports: &mut P) {
        self.data |= REQUEST;
        self.scheduled = false;
        ports.interrupt(true);
    }

    /// Read-and-clear of the ICR. Returns the latch as it was.
    pub(crate) fn clear<E, P>(&mut self, sched: &mut EventScheduler<E>, event: E, ports: &mut P) -> u8
    where
        E: Copy + Eq + Hash + Debug,
        P: CiaPorts + ?Sized,
    {
        if self.scheduled {
            sched.cancel(event);
            self.scheduled = false;
        }
        if self.data & REQUEST != 0 {
            ports.interrupt(false);
        }
        std::mem::take(&mut self.data)
    }

    pub(crate) fn set_enabled<E, P>(
        &mut self,
        flags: u8,
        sched: &mut EventScheduler<E>,
        event: E,
        ports: &mut P,
    ) -> Result<(), SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
        P: CiaPorts + ?Sized,
    {
        self.mask |= flags & !REQUEST;
        self.trigger(0, sched, event, ports)
    }

    pub(crate) fn clear_enabled(&mut self, flags: u8) {
        self.mask &= !flags;
    }
}
