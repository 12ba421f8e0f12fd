//! Commodore IEC serial bus.
//!
//! The bus itself ([`IecBus`]) only resolves open-collector line levels.
//! Each attached [`SerialDevice`] runs the device half of the handshake
//! and hands complete bytes to a [`LogicalDevice`]. [`SerialPeripherals`]
//! ties the three together: the C64 side writes and reads through it, and
//! it lets every device react until the lines stop changing.

pub mod bus;
pub mod device;
pub mod logical;

use emu_core::{MasterClock, Observable, Value};

pub use bus::IecBus;
pub use device::{HandshakeState, SerialDevice};
pub use logical::{BusRole, ChannelStatus, LogicalDevice};

/// Bound on passes over all devices for one bus change.
const MAX_PASSES: usize = 16;

struct Slot {
    device: SerialDevice,
    logical: Box<dyn LogicalDevice>,
}

/// The bus with its attached devices.
pub struct SerialPeripherals {
    bus: IecBus,
    slots: Vec<Slot>,
}

impl SerialPeripherals {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: IecBus::new(),
            slots: Vec::new(),
        }
    }

    /// Plug in a device, replacing any other at the same address.
    pub fn attach(&mut self, device: SerialDevice, logical: Box<dyn LogicalDevice>) {
        // The displaced device, if any, is dropped.
        self.detach(device.address());
        log::debug!("serial device {} attached", device.address());
        self.slots.push(Slot { device, logical });
    }

    /// Unplug the device at `address`, releasing its lines.
    pub fn detach(&mut self, address: u8) -> Option<Box<dyn LogicalDevice>> {
        let index = self
            .slots
            .iter()
            .position(|s| s.device.address() == address & 0x0F)?;
        let slot = self.slots.remove(index);
        self.bus.release(usize::from(slot.device.address()));
        Some(slot.logical)
    }

    #[must_use]
    pub fn bus(&self) -> &IecBus {
        &self.bus
    }

    #[must_use]
    pub fn device(&self, address: u8) -> Option<&SerialDevice> {
        self.slots
            .iter()
            .map(|s| &s.device)
            .find(|d| d.address() == address & 0x0F)
    }

    pub fn devices(&self) -> impl Iterator<Item = &SerialDevice> {
        self.slots.iter().map(|s| &s.device)
    }

    /// Switch one device on or off. Returns false if nothing is attached
    /// at `address`.
    pub fn set_device_enabled(&mut self, address: u8, enabled: bool) -> bool {
        let bus = &mut self.bus;
        match self
            .slots
            .iter_mut()
            .find(|s| s.device.address() == address & 0x0F)
        {
            Some(slot) => {
                slot.device.set_enabled(enabled, bus);
                true
            }
            None => false,
        }
    }

    /// Switch every device on or off.
    pub fn set_enabled(&mut self, enabled: bool) {
        for slot in &mut self.slots {
            slot.device.set_enabled(enabled, &mut self.bus);
        }
    }

    /// Rescale every device's protocol windows.
    pub fn set_clock(&mut self, clock: MasterClock) {
        for slot in &mut self.slots {
            slot.device.set_clock(clock);
        }
    }

    /// Release all lines and abort any transfer.
    pub fn reset(&mut self) {
        self.bus.reset();
        for slot in &mut self.slots {
            slot.device.reset(&mut self.bus);
        }
    }

    /// Let every device react to the bus at cycle `now` until the lines
    /// are stable.
    pub fn clock(&mut self, now: u64) {
        for _ in 0..MAX_PASSES {
            let before = self.bus.device_read();
            for slot in &mut self.slots {
                slot.device.clock(now, &mut self.bus, &mut *slot.logical);
            }
            if self.bus.device_read() == before {
                return;
            }
        }
        log::warn!("serial bus did not settle at cycle {now}");
    }

    /// C64 writes CIA2 port A. Devices see the bus as it was, then as it
    /// is after the write.
    pub fn host_write(&mut self, now: u64, pa: u8) {
        self.clock(now);
        if self.bus.host_write(pa) {
            self.clock(now);
        }
    }

    /// C64 reads CIA2 port A.
    pub fn host_read(&mut self, now: u64) -> u8 {
        self.clock(now);
        self.bus.host_read()
    }

    /// Earliest cycle after `now` at which some device is waiting on a
    /// timeout.
    #[must_use]
    pub fn next_deadline(&self, now: u64) -> Option<u64> {
        self.devices().filter_map(|d| d.next_deadline(now)).min()
    }
}

impl Default for SerialPeripherals {
    fn default() -> Self {
        Self::new()
    }
}

impl Observable for SerialPeripherals {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "bus.atn" => Some(self.bus.atn().into()),
            "bus.clk" => Some(self.bus.clk().into()),
            "bus.data" => Some(self.bus.data().into()),
            "devices" => Some(Value::Array(
                self.devices().map(|d| Value::U8(d.address())).collect(),
            )),
            _ => {
                // "device8.state" and so on.
                let (head, field) = path.split_once('.')?;
                let address = head.strip_prefix("device")?.parse::<u8>().ok()?;
                self.device(address)?.query(field)
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["bus.atn", "bus.clk", "bus.data", "devices"]
    }
}
