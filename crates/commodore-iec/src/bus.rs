//! IEC serial bus connecting the C64 to its serial devices.
//!
//! Three open-collector lines: ATN, CLK, DATA. Each participant (the C64
//! and up to sixteen devices) can independently pull a line low. A line
//! reads high only when nobody pulls it low, so the bus value is the
//! bitwise AND of every driver's output.
//!
//! Host polarity (C64 CIA2 port A):
//!   Output: PA bit = 1 means pull line LOW (bit 3=ATN, 4=CLK, 5=DATA)
//!   Input:  PA bit = 0 means line is LOW (bit 6=CLK IN, 7=DATA IN)
//!
//! Device polarity (bit = 1 means released/high):
//!   Read:  bit 0=DATA, bit 2=CLK, bit 7=ATN
//!   Write: bit 6=CLK, bit 7=DATA

/// Driver slots on the bus, one per device address.
pub const MAX_DEVICES: usize = 16;

/// Device view: DATA line level.
pub const DATA_IN: u8 = 0x01;
/// Device view: CLK line level.
pub const CLK_IN: u8 = 0x04;
/// Device view: ATN line level.
pub const ATN_IN: u8 = 0x80;
/// Device output: release CLK.
pub const CLK_OUT: u8 = 0x40;
/// Device output: release DATA.
pub const DATA_OUT: u8 = 0x80;
/// Device output with both lines released.
pub const RELEASED: u8 = CLK_OUT | DATA_OUT;

// Bus value layout.
const BUS_DATA: u8 = 0x80;
const BUS_CLK: u8 = 0x40;
const BUS_ATN: u8 = 0x10;

/// Shared open-collector bus.
pub struct IecBus {
    /// Output of each device, indexed by device address. Unused slots
    /// stay at 0xFF.
    drivers: [u8; MAX_DEVICES],
    /// C64 output in bus layout.
    cpu_bus: u8,
    /// Resolved bus value in bus layout.
    cpu_port: u8,
    /// Resolved bus value in device layout.
    device_port: u8,
}

impl IecBus {
    /// Create a new IEC bus with all lines released (high).
    #[must_use]
    pub fn new() -> Self {
        let mut bus = Self {
            drivers: [0xFF; MAX_DEVICES],
            cpu_bus: 0xFF,
            cpu_port: 0xFF,
            device_port: 0,
        };
        bus.reset();
        bus
    }

    /// Release every line.
    pub fn reset(&mut self) {
        self.drivers = [0xFF; MAX_DEVICES];
        self.cpu_bus = 0xFF;
        self.cpu_port = 0xFF;
        self.device_port = DATA_IN | CLK_IN | ATN_IN;
    }

    // --- Device side ---

    /// Set one device's output levels. Returns whether the bus changed.
    pub fn write(&mut self, id: usize, levels: u8) -> bool {
        self.drivers[id % MAX_DEVICES] = levels;
        self.update()
    }

    /// Drop a device's output entirely, as if it were unplugged.
    pub fn release(&mut self, id: usize) -> bool {
        self.write(id, 0xFF)
    }

    /// Current output of one device.
    #[must_use]
    pub fn driver(&self, id: usize) -> u8 {
        self.drivers[id % MAX_DEVICES]
    }

    /// Bus value as seen by the devices.
    #[must_use]
    pub fn device_read(&self) -> u8 {
        self.device_port
    }

    /// Bus value: the C64's output ANDed with every device's output.
    #[must_use]
    pub fn read(&self) -> u8 {
        self.cpu_port
    }

    // --- C64 side ---

    /// Apply CIA2 port A output. Returns whether the bus changed.
    pub fn host_write(&mut self, pa: u8) -> bool {
        let data = !pa;
        self.cpu_bus = (data << 2 & BUS_DATA) | (data << 2 & BUS_CLK) | (data << 1 & BUS_ATN);
        self.update()
    }

    /// CIA2 port A input. Bits the bus does not drive read as 1.
    #[must_use]
    pub fn host_read(&self) -> u8 {
        self.cpu_port | 0x3F
    }

    fn update(&mut self) -> bool {
        let before = (self.cpu_port, self.device_port);
        self.cpu_port = self.drivers.iter().fold(self.cpu_bus, |acc, &d| acc & d);
        // ATN is only ever driven by the C64.
        self.device_port = (self.cpu_port >> 4 & CLK_IN)
            | (self.cpu_port >> 7)
            | (self.cpu_bus << 3 & ATN_IN);
        before != (self.cpu_port, self.device_port)
    }

    // --- Line state (true = high, false = low) ---

    /// ATN line state. High unless the C64 pulls it low.
    #[must_use]
    pub fn atn(&self) -> bool {
        self.device_port & ATN_IN != 0
    }

    /// CLK line state. High when nobody pulls it low.
    #[must_use]
    pub fn clk(&self) -> bool {
        self.device_port & CLK_IN != 0
    }

    /// DATA line state. High when nobody pulls it low.
    #[must_use]
    pub fn data(&self) -> bool {
        self.device_port & DATA_IN != 0
    }
}

impl Default for IecBus {
    fn default() -> Self {
        Self::new()
    }
}
