//! Top-level C64 timing core.
//!
//! One [`EventScheduler`] counts CPU cycles. Both CIAs schedule their
//! timers and time-of-day clocks on it; everything between events is
//! idle. The CPU itself lives outside: it calls [`C64::clock`] once per
//! cycle and routes `$DC00-$DDFF` accesses through [`C64::read_io`] and
//! [`C64::write_io`], which happen at PHI2 of the current cycle.
//!
//! # Wiring
//!
//! - CIA1 drives IRQ.
//! - CIA2 drives NMI. Port A bits 0-1 (inverted) select the VIC bank, bits
//!   3-5 drive ATN/CLK/DATA and bits 6-7 read CLK/DATA back.
//! - Serial devices run in their own clock domain ([`PeripheralUnit`]).

use commodore_iec::{LogicalDevice, SerialPeripherals};
use emu_core::{
    EventHandler, EventScheduler, Observable, Phase, SchedulerError, SchedulerHandle, Value,
};
use mos_cia_6526::{Cia, CiaEvent, CiaPorts};

use crate::config::{C64Config, C64Model, SyncMode};
use crate::peripheral::PeripheralUnit;

/// Master cycles between catch-ups in [`SyncMode::Eager`].
pub const EAGER_SYNC_INTERVAL: u64 = 2000;

/// Events on the master scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineEvent {
    Cia1(CiaEvent),
    Cia2(CiaEvent),
    /// Periodic peripheral catch-up.
    PeripheralSync,
    /// Peripheral power switch, usually flipped from another thread.
    PeripheralPower(bool),
}

#[derive(Default)]
struct Cia1Wiring {
    irq: bool,
}

impl CiaPorts for Cia1Wiring {
    fn interrupt(&mut self, asserted: bool) {
        self.irq = asserted;
    }
}

struct Cia2Wiring {
    nmi: bool,
    vic_bank: u8,
    serial: PeripheralUnit,
    /// Master cycle of the access in progress.
    now: u64,
}

impl CiaPorts for Cia2Wiring {
    fn interrupt(&mut self, asserted: bool) {
        self.nmi = asserted;
    }

    fn read_port_a(&mut self) -> Result<u8, SchedulerError> {
        self.serial.host_read(self.now)
    }

    fn write_port_a(&mut self, value: u8) -> Result<(), SchedulerError> {
        self.vic_bank = !value & 0x03;
        self.serial.host_write(self.now, value)
    }
}

/// Everything the master scheduler dispatches to.
struct Chips {
    cia1: Cia<MachineEvent>,
    cia1_pins: Cia1Wiring,
    cia2: Cia<MachineEvent>,
    cia2_pins: Cia2Wiring,
}

impl EventHandler<MachineEvent> for Chips {
    fn handle(
        &mut self,
        event: MachineEvent,
        sched: &mut EventScheduler<MachineEvent>,
    ) -> Result<(), SchedulerError> {
        let now = sched.time(Phase::Phi2);
        match event {
            MachineEvent::Cia1(e) => self.cia1.handle_event(e, sched, &mut self.cia1_pins),
            MachineEvent::Cia2(e) => {
                self.cia2_pins.now = now;
                self.cia2.handle_event(e, sched, &mut self.cia2_pins)
            }
            MachineEvent::PeripheralSync => {
                self.cia2_pins.serial.sync(now)?;
                sched.schedule(MachineEvent::PeripheralSync, EAGER_SYNC_INTERVAL, Phase::Phi2)
            }
            MachineEvent::PeripheralPower(on) => self.cia2_pins.serial.set_power(on, now),
        }
    }
}

/// Flips the peripheral power from any thread. Takes effect at the next
/// master cycle.
#[derive(Debug, Clone)]
pub struct PowerSwitch(SchedulerHandle<MachineEvent>);

impl PowerSwitch {
    pub fn set(&self, on: bool) -> Result<(), SchedulerError> {
        self.0.schedule_thread_safe(MachineEvent::PeripheralPower(on))
    }
}

/// C64 timing core.
pub struct C64 {
    scheduler: EventScheduler<MachineEvent>,
    chips: Chips,
    config: C64Config,
}

impl C64 {
    /// Create a C64 in its power-on state.
    pub fn new(config: &C64Config) -> Result<Self, SchedulerError> {
        let cpu_hz = config.model.cpu_frequency();
        let mut cia1 = Cia::new(config.cia_model, MachineEvent::Cia1);
        let mut cia2 = Cia::new(config.cia_model, MachineEvent::Cia2);
        for cia in [&mut cia1, &mut cia2] {
            cia.set_cycle_skipping(config.cycle_skipping);
            cia.set_tod_rate(config.model.cycles_per_mains_period());
        }
        let mut c64 = Self {
            scheduler: EventScheduler::new(),
            chips: Chips {
                cia1,
                cia1_pins: Cia1Wiring::default(),
                cia2,
                cia2_pins: Cia2Wiring {
                    nmi: false,
                    vic_bank: 0,
                    serial: PeripheralUnit::new(cpu_hz, config.peripheral_clock_hz),
                    now: 0,
                },
            },
            config: config.clone(),
        };
        c64.reset()?;
        Ok(c64)
    }

    /// Power-on reset: time restarts at cycle 0. The peripherals come back
    /// in the power state they were last switched to.
    pub fn reset(&mut self) -> Result<(), SchedulerError> {
        let sched = &mut self.scheduler;
        let chips = &mut self.chips;
        sched.reset();
        chips.cia1.reset(sched)?;
        chips.cia2.reset(sched)?;
        chips.cia1_pins = Cia1Wiring::default();
        chips.cia2_pins.nmi = false;
        chips.cia2_pins.vic_bank = 0;
        chips.cia2_pins.now = 0;

        let serial = &mut chips.cia2_pins.serial;
        serial.set_power(false, 0)?;
        serial.reset(0);
        serial.set_power(self.config.peripheral_power, 0)?;
        if self.config.peripheral_sync == SyncMode::Eager {
            sched.schedule(MachineEvent::PeripheralSync, EAGER_SYNC_INTERVAL, Phase::Phi2)?;
        }
        // Park at PHI2 of cycle 0, where CPU accesses happen.
        sched.step_phase(chips)
    }

    #[must_use]
    pub fn config(&self) -> &C64Config {
        &self.config
    }

    /// Current master cycle.
    #[must_use]
    pub fn time(&self) -> u64 {
        self.scheduler.time(Phase::Phi2)
    }

    /// Events fired since the last reset.
    #[must_use]
    pub fn events_fired(&self) -> u64 {
        self.scheduler.fired_count()
    }

    /// Run one master cycle.
    pub fn clock(&mut self) -> Result<(), SchedulerError> {
        let result = self.scheduler.clock(&mut self.chips);
        self.record_power();
        result
    }

    /// Run `cycles` master cycles.
    pub fn run_cycles(&mut self, cycles: u64) -> Result<(), SchedulerError> {
        let result = self.scheduler.advance(cycles, &mut self.chips);
        self.record_power();
        result
    }

    /// A [`PowerSwitch`] flip fires inside the run loop; carry it into the
    /// configuration so a later reset keeps it.
    fn record_power(&mut self) {
        self.config.peripheral_power = self.chips.cia2_pins.serial.is_powered();
    }

    /// Run one video frame's worth of cycles.
    pub fn run_frame(&mut self) -> Result<(), SchedulerError> {
        self.run_cycles(self.config.model.cycles_per_frame())
    }

    /// CPU read in I/O space. Only the CIAs are decoded here; anything else
    /// reads as an open bus.
    pub fn read_io(&mut self, addr: u16) -> Result<u8, SchedulerError> {
        let reg = (addr & 0x0F) as u8;
        let sched = &mut self.scheduler;
        let chips = &mut self.chips;
        match addr {
            0xDC00..=0xDCFF => chips.cia1.read(reg, sched, &mut chips.cia1_pins),
            0xDD00..=0xDDFF => {
                chips.cia2_pins.now = sched.time(Phase::Phi2);
                chips.cia2.read(reg, sched, &mut chips.cia2_pins)
            }
            _ => Ok(0xFF),
        }
    }

    /// CPU write in I/O space.
    pub fn write_io(&mut self, addr: u16, value: u8) -> Result<(), SchedulerError> {
        let reg = (addr & 0x0F) as u8;
        let sched = &mut self.scheduler;
        let chips = &mut self.chips;
        match addr {
            0xDC00..=0xDCFF => chips.cia1.write(reg, value, sched, &mut chips.cia1_pins),
            0xDD00..=0xDDFF => {
                chips.cia2_pins.now = sched.time(Phase::Phi2);
                chips.cia2.write(reg, value, sched, &mut chips.cia2_pins)
            }
            _ => Ok(()),
        }
    }

    /// FLAG input of CIA1 (cassette read line).
    pub fn cassette_pulse(&mut self) -> Result<(), SchedulerError> {
        let chips = &mut self.chips;
        chips.cia1.set_flag(&mut self.scheduler, &mut chips.cia1_pins)
    }

    /// IRQ line level from CIA1.
    #[must_use]
    pub fn irq(&self) -> bool {
        self.chips.cia1_pins.irq
    }

    /// NMI line level from CIA2.
    #[must_use]
    pub fn nmi(&self) -> bool {
        self.chips.cia2_pins.nmi
    }

    /// VIC-II bank (0-3) selected through CIA2 port A.
    #[must_use]
    pub fn vic_bank(&self) -> u8 {
        self.chips.cia2_pins.vic_bank
    }

    #[must_use]
    pub fn cia1(&self) -> &Cia<MachineEvent> {
        &self.chips.cia1
    }

    #[must_use]
    pub fn cia2(&self) -> &Cia<MachineEvent> {
        &self.chips.cia2
    }

    #[must_use]
    pub fn serial(&self) -> &SerialPeripherals {
        self.chips.cia2_pins.serial.devices()
    }

    /// Current cycle of the peripheral clock domain.
    #[must_use]
    pub fn peripheral_time(&self) -> u64 {
        self.chips.cia2_pins.serial.time()
    }

    #[must_use]
    pub fn peripherals_powered(&self) -> bool {
        self.chips.cia2_pins.serial.is_powered()
    }

    /// Plug a logical device into the serial bus at `address`.
    pub fn attach_serial(&mut self, address: u8, logical: Box<dyn LogicalDevice>) {
        self.chips.cia2_pins.serial.attach(address, logical);
    }

    pub fn detach_serial(&mut self, address: u8) -> Option<Box<dyn LogicalDevice>> {
        self.chips.cia2_pins.serial.detach(address)
    }

    /// Switch the peripherals now, from the emulation thread.
    pub fn set_peripheral_power(&mut self, on: bool) -> Result<(), SchedulerError> {
        let now = self.time();
        self.chips.cia2_pins.serial.set_power(on, now)?;
        self.config.peripheral_power = on;
        Ok(())
    }

    /// A switch other threads can use to power the peripherals.
    #[must_use]
    pub fn power_switch(&self) -> PowerSwitch {
        PowerSwitch(self.scheduler.handle())
    }

    /// Choose eager or lazy peripheral synchronization.
    pub fn set_peripheral_sync(&mut self, mode: SyncMode) -> Result<(), SchedulerError> {
        let pending = self.scheduler.is_pending(MachineEvent::PeripheralSync);
        match mode {
            SyncMode::Eager if !pending => self.scheduler.schedule(
                MachineEvent::PeripheralSync,
                EAGER_SYNC_INTERVAL,
                Phase::Phi2,
            )?,
            SyncMode::Lazy => {
                self.scheduler.cancel(MachineEvent::PeripheralSync);
            }
            SyncMode::Eager => {}
        }
        self.config.peripheral_sync = mode;
        log::debug!("peripheral sync {mode:?}");
        Ok(())
    }

    /// Switch between PAL and NTSC without resetting.
    pub fn set_model(&mut self, model: C64Model) -> Result<(), SchedulerError> {
        let now = self.time();
        let chips = &mut self.chips;
        chips
            .cia2_pins
            .serial
            .set_master_frequency(model.cpu_frequency(), now)?;
        for cia in [&mut chips.cia1, &mut chips.cia2] {
            cia.set_tod_rate(model.cycles_per_mains_period());
        }
        self.config.model = model;
        log::debug!("model {model:?}, CPU {} Hz", model.cpu_frequency());
        Ok(())
    }

    /// Change the peripheral crystal. Device protocol windows follow.
    pub fn set_peripheral_clock(&mut self, hz: f64) -> Result<(), SchedulerError> {
        let now = self.time();
        let cpu_hz = self.config.model.cpu_frequency();
        self.chips
            .cia2_pins
            .serial
            .set_frequency(cpu_hz, hz, now)?;
        self.config.peripheral_clock_hz = hz;
        Ok(())
    }
}

impl Observable for C64 {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("cia1.") {
            self.chips.cia1.query(rest)
        } else if let Some(rest) = path.strip_prefix("cia2.") {
            self.chips.cia2.query(rest)
        } else if let Some(rest) = path.strip_prefix("iec.") {
            self.serial().query(rest)
        } else {
            match path {
                "cycle" => Some(self.time().into()),
                "irq" => Some(self.irq().into()),
                "nmi" => Some(self.nmi().into()),
                "vic_bank" => Some(self.vic_bank().into()),
                "model" => Some(format!("{:?}", self.config.model).as_str().into()),
                "peripheral.cycle" => Some(self.peripheral_time().into()),
                "peripheral.powered" => Some(self.peripherals_powered().into()),
                _ => None,
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "cia1.<cia_paths>",
            "cia2.<cia_paths>",
            "iec.<serial_paths>",
            "cycle",
            "irq",
            "nmi",
            "vic_bank",
            "model",
            "peripheral.cycle",
            "peripheral.powered",
        ]
    }
}
