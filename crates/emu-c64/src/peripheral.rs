//! Serial peripherals in their own clock domain.
//!
//! Devices on the serial bus run from their own crystal, so they get their
//! own [`EventScheduler`]. The CPU side never steps it directly: every
//! access to CIA2 port A first credits the peripheral scheduler with the
//! cycles that passed in the meantime, converted through [`ClockSync`].
//! Handshake timeouts are deadline events on that scheduler, so a lazily
//! synchronized device still sees them at the right peripheral cycle.

use commodore_iec::{LogicalDevice, SerialDevice, SerialPeripherals};
use emu_core::{ClockSync, EventHandler, EventScheduler, MasterClock, Phase, SchedulerError};

/// Work on the peripheral scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralEvent {
    /// Some device's handshake window expires.
    Deadline,
}

/// Device set as the peripheral scheduler's event handler.
struct Devices(SerialPeripherals);

impl EventHandler<PeripheralEvent> for Devices {
    fn handle(
        &mut self,
        event: PeripheralEvent,
        sched: &mut EventScheduler<PeripheralEvent>,
    ) -> Result<(), SchedulerError> {
        match event {
            PeripheralEvent::Deadline => {
                self.0.clock(sched.time(Phase::Phi2));
                arm_deadline(&self.0, sched)
            }
        }
    }
}

/// Keep exactly one deadline event, at the earliest device timeout.
fn arm_deadline(
    devices: &SerialPeripherals,
    sched: &mut EventScheduler<PeripheralEvent>,
) -> Result<(), SchedulerError> {
    sched.cancel(PeripheralEvent::Deadline);
    match devices.next_deadline(sched.time(Phase::Phi2)) {
        Some(at) => sched.schedule_absolute(PeripheralEvent::Deadline, at, Phase::Phi2),
        None => Ok(()),
    }
}

/// The serial bus, its devices and the clock domain they run in.
pub struct PeripheralUnit {
    scheduler: EventScheduler<PeripheralEvent>,
    devices: Devices,
    sync: ClockSync,
    clock: MasterClock,
    powered: bool,
}

impl PeripheralUnit {
    /// Peripherals clocked at `peripheral_hz`, synchronized to a master
    /// running at `master_hz`. Starts switched off.
    #[must_use]
    pub fn new(master_hz: f64, peripheral_hz: f64) -> Self {
        let mut unit = Self {
            scheduler: EventScheduler::new(),
            devices: Devices(SerialPeripherals::new()),
            sync: ClockSync::new(master_hz, peripheral_hz),
            clock: MasterClock::new(peripheral_hz),
            powered: false,
        };
        unit.park();
        unit
    }

    /// Peripheral time 0 at PHI2, where bus accesses land.
    fn park(&mut self) {
        self.scheduler.reset();
        let parked = self.scheduler.step_phase(&mut self.devices);
        debug_assert!(parked.is_ok(), "empty scheduler faulted: {parked:?}");
    }

    /// Abort every transfer, release the bus and restart peripheral time
    /// in step with `master_now`.
    pub fn reset(&mut self, master_now: u64) {
        self.devices.0.reset();
        self.park();
        self.sync.reset(master_now);
    }

    #[must_use]
    pub fn devices(&self) -> &SerialPeripherals {
        &self.devices.0
    }

    #[must_use]
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Current peripheral cycle.
    #[must_use]
    pub fn time(&self) -> u64 {
        self.scheduler.time(Phase::Phi2)
    }

    #[must_use]
    pub fn clock(&self) -> MasterClock {
        self.clock
    }

    /// Plug a logical device in at `address`, replacing any other there.
    pub fn attach(&mut self, address: u8, logical: Box<dyn LogicalDevice>) {
        self.devices
            .0
            .attach(SerialDevice::new(address, self.clock), logical);
        self.devices.0.set_device_enabled(address, self.powered);
    }

    pub fn detach(&mut self, address: u8) -> Option<Box<dyn LogicalDevice>> {
        self.devices.0.detach(address)
    }

    /// Switch the peripherals on or off at master cycle `master_now`.
    ///
    /// Switching on starts peripheral time from `master_now`; nothing is
    /// owed for the time spent off.
    pub fn set_power(&mut self, on: bool, master_now: u64) -> Result<(), SchedulerError> {
        if on == self.powered {
            return Ok(());
        }
        if on {
            self.sync.reset(master_now);
            self.powered = true;
            self.devices.0.set_enabled(true);
        } else {
            self.catch_up(master_now, 0)?;
            self.devices.0.set_enabled(false);
            self.scheduler.cancel(PeripheralEvent::Deadline);
            self.powered = false;
        }
        log::debug!(
            "serial peripherals powered {} at cycle {master_now}",
            if on { "on" } else { "off" }
        );
        Ok(())
    }

    /// Master clock changed. Cycles owed so far are paid at the old ratio.
    pub fn set_master_frequency(
        &mut self,
        master_hz: f64,
        master_now: u64,
    ) -> Result<(), SchedulerError> {
        self.catch_up(master_now, 0)?;
        self.sync
            .set_clock_divider(master_hz, self.clock.frequency_hz);
        Ok(())
    }

    /// Peripheral crystal changed: new ratio and new protocol windows.
    pub fn set_frequency(
        &mut self,
        master_hz: f64,
        peripheral_hz: f64,
        master_now: u64,
    ) -> Result<(), SchedulerError> {
        self.catch_up(master_now, 0)?;
        self.clock = MasterClock::new(peripheral_hz);
        self.sync.set_clock_divider(master_hz, peripheral_hz);
        self.devices.0.set_clock(self.clock);
        Ok(())
    }

    /// Run the peripherals up to master cycle `master_now + offset`.
    fn catch_up(&mut self, master_now: u64, offset: i64) -> Result<(), SchedulerError> {
        if !self.powered {
            return Ok(());
        }
        self.sync
            .synchronize(master_now, offset, &mut self.scheduler, &mut self.devices)?;
        Ok(())
    }

    /// Periodic catch-up with nothing written or read.
    pub fn sync(&mut self, master_now: u64) -> Result<(), SchedulerError> {
        self.catch_up(master_now, 0)
    }

    /// CPU wrote CIA2 port A. The write lands one master cycle after a
    /// read in the same cycle would.
    pub fn host_write(&mut self, master_now: u64, pa: u8) -> Result<(), SchedulerError> {
        self.catch_up(master_now, 1)?;
        let now = self.time();
        self.devices.0.host_write(now, pa);
        arm_deadline(&self.devices.0, &mut self.scheduler)
    }

    /// CPU reads CIA2 port A: bus levels on bits 6-7, the rest high.
    pub fn host_read(&mut self, master_now: u64) -> Result<u8, SchedulerError> {
        self.catch_up(master_now, 0)?;
        let now = self.time();
        let value = self.devices.0.host_read(now);
        arm_deadline(&self.devices.0, &mut self.scheduler)?;
        Ok(value)
    }
}
