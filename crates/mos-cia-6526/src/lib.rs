//! MOS 6526 Complex Interface Adapter (CIA).
//!
//! Two 8-bit ports, two 16-bit interval timers (B can count A's
//! underflows), a BCD time-of-day clock with alarm, a serial shift
//! register and an interrupt controller. All timing is event driven: the
//! chip schedules its own work on the owning machine's
//! [`EventScheduler`] and does nothing between events.
//!
//! # Registers
//!
//! | Reg | Read                | Write                  |
//! |-----|---------------------|------------------------|
//! | $x0 | Port A data         | Port A data            |
//! | $x1 | Port B data         | Port B data            |
//! | $x2 | Port A DDR          | Port A DDR             |
//! | $x3 | Port B DDR          | Port B DDR             |
//! | $x4 | Timer A low (cnt)   | Timer A low (latch)    |
//! | $x5 | Timer A high (cnt)  | Timer A high (latch)   |
//! | $x6 | Timer B low (cnt)   | Timer B low (latch)    |
//! | $x7 | Timer B high (cnt)  | Timer B high (latch)   |
//! | $x8 | TOD 10ths           | TOD 10ths (or alarm)   |
//! | $x9 | TOD seconds         | TOD seconds (or alarm) |
//! | $xA | TOD minutes         | TOD minutes (or alarm) |
//! | $xB | TOD hours           | TOD hours (or alarm)   |
//! | $xC | Serial shift reg    | Serial shift reg       |
//! | $xD | ICR (read/clear)    | ICR (set/clear mask)   |
//! | $xE | Control reg A       | Control reg A          |
//! | $xF | Control reg B       | Control reg B          |

pub mod interrupt;
mod timer;
mod tod;

use std::fmt::Debug;
use std::hash::Hash;

use emu_core::{EventScheduler, Observable, Phase, SchedulerError, Value};

use interrupt::InterruptSource;
use timer::{Mode, Timer};
use tod::TimeOfDay;

pub use timer::TimerId;

const PRA: u8 = 0x0;
const PRB: u8 = 0x1;
const DDRA: u8 = 0x2;
const DDRB: u8 = 0x3;
const TAL: u8 = 0x4;
const TAH: u8 = 0x5;
const TBL: u8 = 0x6;
const TBH: u8 = 0x7;
const TOD_TEN: u8 = 0x8;
const TOD_HR: u8 = 0xB;
const SDR: u8 = 0xC;
const ICR: u8 = 0xD;
const CRA: u8 = 0xE;
const CRB: u8 = 0xF;

/// Work a CIA schedules on its owner's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiaEvent {
    /// Clock a timer for one cycle.
    Tick(TimerId),
    /// Catch a timer up after skipping cycles.
    Skip(TimerId),
    /// Timer B counts one timer A underflow.
    CascadeB,
    /// Delayed interrupt assertion (6526 only).
    Interrupt,
    /// Advance the time-of-day clock one tenth.
    TimeOfDay,
}

/// Chip revision, which decides interrupt timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CiaModel {
    /// Original 6526: the interrupt line follows the latch one cycle late.
    #[default]
    Mos6526,
    /// 6526A / 8521: the interrupt line follows the latch immediately.
    Mos6526A,
}

/// The chip's connections to the rest of the machine.
///
/// Port callbacks can reach into another clock domain (CIA2's port A is
/// the serial bus), so they may fail with a scheduler fault.
pub trait CiaPorts {
    /// IRQ (CIA1) or NMI (CIA2) line level.
    fn interrupt(&mut self, asserted: bool);

    /// External levels on port A. Undriven pins read high.
    fn read_port_a(&mut self) -> Result<u8, SchedulerError> {
        Ok(0xFF)
    }

    fn read_port_b(&mut self) -> Result<u8, SchedulerError> {
        Ok(0xFF)
    }

    /// Port A output; input pins are driven high.
    fn write_port_a(&mut self, _value: u8) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn write_port_b(&mut self, _value: u8) -> Result<(), SchedulerError> {
        Ok(())
    }

    /// PC handshake strobe after a port B access.
    fn pulse(&mut self) {}
}

/// MOS 6526 instance scheduling on an `EventScheduler<E>`.
///
/// `wrap` embeds this chip's [`CiaEvent`]s into the owner's event type,
/// so two CIAs can share one scheduler.
pub struct Cia<E> {
    model: CiaModel,
    wrap: fn(CiaEvent) -> E,
    regs: [u8; 16],
    timer_a: Timer,
    timer_b: Timer,
    interrupt: InterruptSource,
    tod: TimeOfDay,
    sdr_out: u8,
    sdr_buffered: bool,
    /// Timer A underflows left in the current shift-out; two per bit.
    sdr_count: u8,
}

impl<E: Copy + Eq + Hash + Debug> Cia<E> {
    /// Create a CIA. Nothing is scheduled until [`reset`](Self::reset).
    #[must_use]
    pub fn new(model: CiaModel, wrap: fn(CiaEvent) -> E) -> Self {
        Self {
            model,
            wrap,
            regs: [0; 16],
            timer_a: Timer::new(TimerId::A),
            timer_b: Timer::new(TimerId::B),
            interrupt: InterruptSource::new(model),
            tod: TimeOfDay::new(),
            sdr_out: 0,
            sdr_buffered: false,
            sdr_count: 0,
        }
    }

    /// Power-on state. Cancels everything this chip had pending and starts
    /// the timers and time-of-day clock afresh.
    pub fn reset(&mut self, sched: &mut EventScheduler<E>) -> Result<(), SchedulerError> {
        let wrap = self.wrap;
        self.timer_a.reset(sched, wrap)?;
        self.timer_b.reset(sched, wrap)?;
        sched.cancel(wrap(CiaEvent::CascadeB));
        self.sdr_out = 0;
        self.sdr_count = 0;
        self.sdr_buffered = false;
        self.interrupt.reset(sched, wrap(CiaEvent::Interrupt));
        self.regs = [0; 16];

        self.tod.reset();
        sched.cancel(wrap(CiaEvent::TimeOfDay));
        sched.schedule(wrap(CiaEvent::TimeOfDay), 0, Phase::Phi1)
    }

    #[must_use]
    pub fn model(&self) -> CiaModel {
        self.model
    }

    /// Use per-cycle tick events instead of skipping ahead to underflows.
    /// Both produce the same register values and interrupt timing.
    pub fn set_cycle_skipping(&mut self, enabled: bool) {
        self.timer_a.set_cycle_skipping(enabled);
        self.timer_b.set_cycle_skipping(enabled);
    }

    /// CPU cycles per mains period feeding the TOD pin.
    pub fn set_tod_rate(&mut self, cycles_per_period: f64) {
        log::debug!("CIA TOD: {cycles_per_period:.3} cycles per mains period");
        self.tod.set_rate(cycles_per_period);
    }

    /// Byte most recently loaded for shifting out of the serial port.
    #[must_use]
    pub fn serial_out(&self) -> u8 {
        self.sdr_out
    }

    /// Interrupt latch without the read side effect.
    #[must_use]
    pub fn interrupt_latch(&self) -> u8 {
        self.interrupt.data()
    }

    #[must_use]
    pub fn interrupt_mask(&self) -> u8 {
        self.interrupt.mask()
    }

    fn timer_mut(&mut self, id: TimerId) -> &mut Timer {
        match id {
            TimerId::A => &mut self.timer_a,
            TimerId::B => &mut self.timer_b,
        }
    }

    fn trigger<P: CiaPorts + ?Sized>(
        &mut self,
        flags: u8,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        let event = (self.wrap)(CiaEvent::Interrupt);
        self.interrupt.trigger(flags, sched, event, ports)
    }

    fn underflow<P: CiaPorts + ?Sized>(
        &mut self,
        id: TimerId,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        match id {
            TimerId::A => {
                self.shift_serial(sched, ports)?;
                self.trigger(interrupt::TIMER_A, sched, ports)?;
                // PHI2 so timer B's own PHI1 tick for this cycle has run.
                if self.regs[CRB as usize] & 0x41 == 0x41 && self.timer_b.is_started() {
                    sched.schedule((self.wrap)(CiaEvent::CascadeB), 0, Phase::Phi2)?;
                }
                Ok(())
            }
            TimerId::B => self.trigger(interrupt::TIMER_B, sched, ports),
        }
    }

    /// Serial port output, clocked by timer A underflows.
    fn shift_serial<P: CiaPorts + ?Sized>(
        &mut self,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        if self.regs[CRA as usize] & 0x40 == 0 {
            return Ok(());
        }
        if self.sdr_count != 0 {
            self.sdr_count -= 1;
            if self.sdr_count == 0 {
                self.trigger(interrupt::SERIAL, sched, ports)?;
            }
        }
        if self.sdr_count == 0 && self.sdr_buffered {
            self.sdr_out = self.regs[SDR as usize];
            self.sdr_buffered = false;
            self.sdr_count = 16;
        }
        Ok(())
    }

    fn sync_timer<P: CiaPorts + ?Sized>(
        &mut self,
        id: TimerId,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        let wrap = self.wrap;
        if self.timer_mut(id).sync_with_cpu(sched, wrap) {
            self.underflow(id, sched, ports)?;
        }
        Ok(())
    }

    fn wake_timer(&mut self, id: TimerId, sched: &mut EventScheduler<E>) -> Result<(), SchedulerError> {
        let wrap = self.wrap;
        self.timer_mut(id).wake(sched, wrap)
    }

    fn run_timer<P: CiaPorts + ?Sized>(
        &mut self,
        id: TimerId,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        if self.timer_mut(id).clock() {
            self.underflow(id, sched, ports)?;
        }
        let wrap = self.wrap;
        self.timer_mut(id).reschedule(sched, wrap)
    }

    /// Dispatch one of this chip's events.
    pub fn handle_event<P: CiaPorts + ?Sized>(
        &mut self,
        event: CiaEvent,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        match event {
            CiaEvent::Tick(id) => self.run_timer(id, sched, ports),
            CiaEvent::Skip(id) => {
                self.timer_mut(id).catch_up(sched);
                self.run_timer(id, sched, ports)
            }
            CiaEvent::CascadeB => {
                // Same path as a CPU write, so B sees A's new state.
                self.sync_timer(TimerId::B, sched, ports)?;
                self.timer_b.step();
                self.wake_timer(TimerId::B, sched)
            }
            CiaEvent::Interrupt => {
                self.interrupt.assert_delayed(ports);
                Ok(())
            }
            CiaEvent::TimeOfDay => {
                let fifty_hz = self.regs[CRA as usize] & 0x80 != 0;
                let delay = self.tod.next_delay(fifty_hz);
                sched.schedule((self.wrap)(CiaEvent::TimeOfDay), delay, Phase::Phi1)?;
                if self.tod.tick() {
                    self.trigger(interrupt::ALARM, sched, ports)?;
                }
                Ok(())
            }
        }
    }

    /// FLAG pin falling edge.
    pub fn set_flag<P: CiaPorts + ?Sized>(
        &mut self,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        self.trigger(interrupt::FLAG, sched, ports)
    }

    /// Read a register. Only the low four address bits are decoded.
    pub fn read<P: CiaPorts + ?Sized>(
        &mut self,
        reg: u8,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<u8, SchedulerError> {
        let reg = reg & 0x0F;

        self.sync_timer(TimerId::A, sched, ports)?;
        self.wake_timer(TimerId::A, sched)?;
        self.sync_timer(TimerId::B, sched, ports)?;
        self.wake_timer(TimerId::B, sched)?;

        let r = &self.regs;
        let value = match reg {
            PRA => ports.read_port_a()? & (r[PRA as usize] | !r[DDRA as usize]),
            PRB => {
                let mut data = ports.read_port_b()? & (r[PRB as usize] | !r[DDRB as usize]);
                ports.pulse();
                // Timer outputs on PB6/PB7, as a toggle or a one-cycle pulse.
                let cra = r[CRA as usize];
                if cra & 0x02 != 0 {
                    data &= 0xBF;
                    let high = if cra & 0x04 != 0 {
                        self.timer_a.pb_toggle()
                    } else {
                        self.timer_a.out()
                    };
                    if high {
                        data |= 0x40;
                    }
                }
                let crb = r[CRB as usize];
                if crb & 0x02 != 0 {
                    data &= 0x7F;
                    let high = if crb & 0x04 != 0 {
                        self.timer_b.pb_toggle()
                    } else {
                        self.timer_b.out()
                    };
                    if high {
                        data |= 0x80;
                    }
                }
                data
            }
            TAL => self.timer_a.counter() as u8,
            TAH => (self.timer_a.counter() >> 8) as u8,
            TBL => self.timer_b.counter() as u8,
            TBH => (self.timer_b.counter() >> 8) as u8,
            TOD_TEN..=TOD_HR => self.tod.read(usize::from(reg - TOD_TEN)),
            ICR => {
                let event = (self.wrap)(CiaEvent::Interrupt);
                self.interrupt.clear(sched, event, ports)
            }
            CRA => (r[CRA as usize] & 0xEE) | u8::from(self.timer_a.is_started()),
            CRB => (r[CRB as usize] & 0xEE) | u8::from(self.timer_b.is_started()),
            _ => r[reg as usize],
        };
        Ok(value)
    }

    /// Write a register. Only the low four address bits are decoded.
    pub fn write<P: CiaPorts + ?Sized>(
        &mut self,
        reg: u8,
        value: u8,
        sched: &mut EventScheduler<E>,
        ports: &mut P,
    ) -> Result<(), SchedulerError> {
        let reg = reg & 0x0F;

        self.sync_timer(TimerId::A, sched, ports)?;
        self.sync_timer(TimerId::B, sched, ports)?;

        let old = self.regs[reg as usize];
        self.regs[reg as usize] = value;

        match reg {
            PRA | DDRA => {
                ports.write_port_a(self.regs[PRA as usize] | !self.regs[DDRA as usize])?;
            }
            PRB | DDRB => {
                if reg == PRB {
                    ports.pulse();
                }
                ports.write_port_b(self.regs[PRB as usize] | !self.regs[DDRB as usize])?;
            }
            TAL => self.timer_a.set_latch_low(value),
            TAH => self.timer_a.set_latch_high(value),
            TBL => self.timer_b.set_latch_low(value),
            TBH => self.timer_b.set_latch_high(value),
            TOD_TEN..=TOD_HR => {
                let alarm_mode = self.regs[CRB as usize] & 0x80 != 0;
                if self.tod.write(usize::from(reg - TOD_TEN), value, alarm_mode) {
                    self.trigger(interrupt::ALARM, sched, ports)?;
                }
            }
            SDR => {
                if self.regs[CRA as usize] & 0x40 != 0 {
                    self.sdr_buffered = true;
                }
            }
            ICR => {
                if value & 0x80 != 0 {
                    let event = (self.wrap)(CiaEvent::Interrupt);
                    self.interrupt.set_enabled(value, sched, event, ports)?;
                } else {
                    self.interrupt.clear_enabled(value);
                }
            }
            CRA | CRB => {
                let timer = if reg == CRA {
                    &mut self.timer_a
                } else {
                    &mut self.timer_b
                };
                // A start edge resets the PB toggle flip-flop high.
                if value & 0x01 != 0 && old & 0x01 == 0 {
                    timer.set_pb_toggle(true);
                }
                if reg == CRB {
                    // "Count timer A" replaces "count phi2" on timer B.
                    timer.set_control_register(value | (value & 0x40) >> 1);
                } else {
                    timer.set_control_register(value);
                }
            }
            _ => {}
        }

        self.wake_timer(TimerId::A, sched)?;
        self.wake_timer(TimerId::B, sched)
    }
}

impl<E> Observable for Cia<E> {
    fn query(&self, path: &str) -> Option<Value> {
        let timer = |t: &Timer, field: &str| -> Option<Value> {
            match field {
                "counter" => Some(t.counter().into()),
                "latch" => Some(t.latch().into()),
                "running" => Some(t.is_started().into()),
                "mode" => Some(
                    match t.mode() {
                        Mode::Ticking => "ticking",
                        Mode::Skipping { .. } => "skipping",
                        Mode::Stopped => "stopped",
                    }
                    .into(),
                ),
                _ => None,
            }
        };
        match path.split_once('.') {
            Some(("timer_a", field)) => timer(&self.timer_a, field),
            Some(("timer_b", field)) => timer(&self.timer_b, field),
            Some(("icr", "mask")) => Some(self.interrupt.mask().into()),
            Some(("icr", "data")) => Some(self.interrupt.data().into()),
            Some(("tod", "clock")) => Some(self.tod.clock().as_slice().into()),
            Some(("tod", "alarm")) => Some(self.tod.alarm().as_slice().into()),
            Some(("tod", "stopped")) => Some(self.tod.is_stopped().into()),
            _ => match path {
                "cra" => Some(self.regs[CRA as usize].into()),
                "crb" => Some(self.regs[CRB as usize].into()),
                "sdr" => Some(self.regs[SDR as usize].into()),
                "model" => Some(format!("{:?}", self.model).as_str().into()),
                _ => None,
            },
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "timer_a.counter",
            "timer_a.latch",
            "timer_a.running",
            "timer_a.mode",
            "timer_b.counter",
            "timer_b.latch",
            "timer_b.running",
            "timer_b.mode",
            "icr.mask",
            "icr.data",
            "tod.clock",
            "tod.alarm",
            "tod.stopped",
            "cra",
            "crb",
            "sdr",
            "model",
        ]
    }
}
