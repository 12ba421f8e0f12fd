//! One CIA interval timer.
//!
//! The control logic is modelled as a small delay line. A write to the
//! control register only sets the raw bits (`started`, `one_shot`,
//! `force_load`, `phi2_input`). Each clock derives the delayed bits from
//! them: `count2` one cycle later, `count3` a further cycle later, and only
//! `count3` lets the counter decrement. Force-load and one-shot travel
//! through `load1`/`load` and `one_shot0`/`one_shot_delayed` the same way.
//!
//! While a timer counts steadily from the system clock there is nothing
//! to observe until the next underflow, so instead of a tick event every
//! cycle a single skip event is scheduled shortly before it. Any register
//! access calls [`Timer::sync_with_cpu`] first, which replays the skipped
//! cycles onto the counter.

use std::fmt::Debug;
use std::hash::Hash;

use emu_core::{EventScheduler, Phase, SchedulerError};

use crate::CiaEvent;

/// Which of the two timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    A,
    B,
}

/// How the timer is currently being advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// A tick event runs every cycle.
    Ticking,
    /// A skip event is pending; `since` is the first PHI1 cycle not yet
    /// applied to the counter.
    Skipping { since: u64 },
    /// Nothing pending; the timer only changes when written.
    Stopped,
}

pub(crate) struct Timer {
    id: TimerId,
    counter: u16,
    latch: u16,

    // Raw control register bits.
    started: bool,
    one_shot: bool,
    force_load: bool,
    phi2_input: bool,
    /// One count pulse from the cascade input, consumed by the next clock.
    step: bool,

    // Delay line.
    count2: bool,
    count3: bool,
    load1: bool,
    load: bool,
    one_shot0: bool,
    one_shot_delayed: bool,
    /// Underflowed this cycle.
    out: bool,

    last_control: u8,
    /// PB6/PB7 toggle flip-flop.
    pb_toggle: bool,

    mode: Mode,
    cycle_skipping: bool,
}

impl Timer {
    pub(crate) fn new(id: TimerId) -> Self {
        Self {
            id,
            counter: 0xFFFF,
            latch: 0xFFFF,
            started: false,
            one_shot: false,
            force_load: false,
            phi2_input: false,
            step: false,
            count2: false,
            count3: false,
            load1: false,
            load: false,
            one_shot0: false,
            one_shot_delayed: false,
            out: false,
            last_control: 0,
            pb_toggle: false,
            mode: Mode::Stopped,
            cycle_skipping: true,
        }
    }

    fn tick_event<E>(&self, wrap: fn(CiaEvent) -> E) -> E {
        wrap(CiaEvent::Tick(self.id))
    }

    fn skip_event<E>(&self, wrap: fn(CiaEvent) -> E) -> E {
        wrap(CiaEvent::Skip(self.id))
    }

    pub(crate) fn reset<E>(
        &mut self,
        sched: &mut EventScheduler<E>,
        wrap: fn(CiaEvent) -> E,
    ) -> Result<(), SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
    {
        let cycle_skipping = self.cycle_skipping;
        *self = Self::new(self.id);
        self.cycle_skipping = cycle_skipping;

        sched.cancel(self.skip_event(wrap));
        sched.cancel(self.tick_event(wrap));
        self.mode = Mode::Ticking;
        sched.schedule(self.tick_event(wrap), 1, Phase::Phi1)
    }

    pub(crate) fn set_cycle_skipping(&mut self, enabled: bool) {
        self.cycle_skipping = enabled;
    }

    /// Counter value as of the last clocked cycle.
    pub(crate) fn counter(&self) -> u16 {
        self.counter
    }

    pub(crate) fn latch(&self) -> u16 {
        self.latch
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn out(&self) -> bool {
        self.out
    }

    pub(crate) fn pb_toggle(&self) -> bool {
        self.pb_toggle
    }

    pub(crate) fn set_pb_toggle(&mut self, value: bool) {
        self.pb_toggle = value;
    }

    /// Count one cascade pulse on the next clock.
    pub(crate) fn step(&mut self) {
        self.step = true;
    }

    /// Bit 5 must already hold "count the system clock" inverted, the way
    /// CRA is laid out. CRB callers fold bit 6 into bit 5 first.
    pub(crate) fn set_control_register(&mut self, cr: u8) {
        self.started = cr & 0x01 != 0;
        self.one_shot = cr & 0x08 != 0;
        self.force_load = cr & 0x10 != 0;
        self.phi2_input = cr & 0x20 == 0;
        self.last_control = cr;
    }

    pub(crate) fn set_latch_low(&mut self, value: u8) {
        self.latch = (self.latch & 0xFF00) | u16::from(value);
        if self.load {
            self.counter = (self.counter & 0xFF00) | u16::from(value);
        }
    }

    pub(crate) fn set_latch_high(&mut self, value: u8) {
        self.latch = (self.latch & 0x00FF) | (u16::from(value) << 8);
        if self.load || !self.started {
            self.counter = self.latch;
        }
    }

    /// Run the control logic for one cycle. Returns whether the counter
    /// underflowed.
    pub(crate) fn clock(&mut self) -> bool {
        if self.counter != 0 && self.count3 {
            self.counter -= 1;
        }

        let count2 = self.started && self.phi2_input;
        let count3 = self.count2 || (self.step && self.started);
        self.load = self.load1;
        self.load1 = self.force_load;
        self.one_shot_delayed = self.one_shot0;
        self.one_shot0 = self.one_shot;
        self.count2 = count2;
        self.count3 = count3;
        self.force_load = false;
        self.step = false;
        self.out = false;

        let mut underflow = false;
        if self.counter == 0 && self.count3 {
            self.load = true;
            self.out = true;
            if self.one_shot_delayed || self.one_shot0 {
                self.started = false;
                self.count2 = false;
            }
            let toggle_mode = self.last_control & 0x06 == 0x06;
            self.pb_toggle = toggle_mode && !self.pb_toggle;
            underflow = true;
        }

        if self.load {
            self.counter = self.latch;
            self.count3 = false;
        }
        underflow
    }

    /// Decide how the timer advances from the next cycle on.
    pub(crate) fn reschedule<E>(
        &mut self,
        sched: &mut EventScheduler<E>,
        wrap: fn(CiaEvent) -> E,
    ) -> Result<(), SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
    {
        // Transient bits must cycle through the delay line one clock at a time.
        if self.out || self.force_load || self.load1 || self.load {
            self.mode = Mode::Ticking;
            return sched.schedule(self.tick_event(wrap), 1, Phase::Phi1);
        }

        if self.count3 {
            let steady = self.started && self.phi2_input && self.count2;
            if self.cycle_skipping && self.counter > 2 && steady {
                // This cycle has been clocked, so the first skipped one is next.
                let since = sched.time(Phase::Phi1) + 1;
                self.mode = Mode::Skipping { since };
                return sched.schedule(
                    self.skip_event(wrap),
                    u64::from(self.counter) - 1,
                    Phase::Phi1,
                );
            }
            self.mode = Mode::Ticking;
            return sched.schedule(self.tick_event(wrap), 1, Phase::Phi1);
        }

        if self.started && (self.phi2_input || self.step) {
            self.mode = Mode::Ticking;
            return sched.schedule(self.tick_event(wrap), 1, Phase::Phi1);
        }

        self.mode = Mode::Stopped;
        Ok(())
    }

    /// The skip event fired: apply the skipped cycles before clocking.
    pub(crate) fn catch_up<E>(&mut self, sched: &EventScheduler<E>)
    where
        E: Copy + Eq + Hash + Debug,
    {
        if let Mode::Skipping { since } = self.mode {
            let elapsed = sched.time(Phase::Phi1).saturating_sub(since);
            self.counter = self.counter.wrapping_sub(elapsed as u16);
        }
        self.mode = Mode::Ticking;
    }

    /// Bring the counter up to date before a register access and stop
    /// automatic advancement until [`wake`](Self::wake). Returns whether
    /// catching up underflowed the counter.
    pub(crate) fn sync_with_cpu<E>(
        &mut self,
        sched: &mut EventScheduler<E>,
        wrap: fn(CiaEvent) -> E,
    ) -> bool
    where
        E: Copy + Eq + Hash + Debug,
    {
        let mut underflow = false;
        match self.mode {
            Mode::Skipping { since } => {
                sched.cancel(self.skip_event(wrap));
                let now = sched.time(Phase::Phi2);
                // The first skipped cycle may still be in the future.
                if now >= since {
                    self.counter = self.counter.wrapping_sub((now - since) as u16);
                    underflow = self.clock();
                }
            }
            Mode::Ticking => {
                sched.cancel(self.tick_event(wrap));
            }
            Mode::Stopped => {}
        }
        self.mode = Mode::Stopped;
        underflow
    }

    /// Resume ticking from the next PHI1 after a register access.
    pub(crate) fn wake<E>(
        &mut self,
        sched: &mut EventScheduler<E>,
        wrap: fn(CiaEvent) -> E,
    ) -> Result<(), SchedulerError>
    where
        E: Copy + Eq + Hash + Debug,
    {
        self.mode = Mode::Ticking;
        sched.schedule(self.tick_event(wrap), 0, Phase::Phi1)
    }
}
