//! Line printer on serial device 4.
//!
//! Behaves like an MPS 803 as far as the bus can tell: it only ever
//! listens. Secondary address 0 selects the upper case / graphics
//! character set, 7 the lower case ("business") set. Text collects until
//! a carriage return and each finished line is published on a channel, so
//! whatever displays the paper can live on another thread.

use commodore_iec::{BusRole, ChannelStatus, LogicalDevice};
use crossbeam_channel::{Receiver, Sender};

/// Default serial address of a printer.
pub const PRINTER_ADDRESS: u8 = 4;

const CARRIAGE_RETURN: u8 = 0x0D;

/// Character set the printer decodes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintMode {
    #[default]
    Graphic,
    Business,
}

pub struct LinePrinter {
    mode: PrintMode,
    line: String,
    output: Sender<String>,
}

impl LinePrinter {
    /// A printer and the receiving end of its paper.
    #[must_use]
    pub fn new() -> (Self, Receiver<String>) {
        let (output, paper) = crossbeam_channel::unbounded();
        let printer = Self {
            mode: PrintMode::default(),
            line: String::new(),
            output,
        };
        (printer, paper)
    }

    #[must_use]
    pub fn mode(&self) -> PrintMode {
        self.mode
    }

    /// Text received since the last carriage return.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.line
    }

    fn select_mode(&mut self, secondary: u8) {
        match secondary & 0x0F {
            0 => self.mode = PrintMode::Graphic,
            7 => self.mode = PrintMode::Business,
            _ => {}
        }
    }

    /// PETSCII to the closest printable character.
    fn decode(&self, byte: u8) -> char {
        match (self.mode, byte) {
            (PrintMode::Business, 0x41..=0x5A) => char::from(byte + 0x20),
            (PrintMode::Business, 0xC1..=0xDA) => char::from(byte - 0x80),
            (_, 0x20..=0x5F) => char::from(byte),
            (PrintMode::Graphic, 0xC1..=0xDA) => char::from(byte - 0x80),
            _ => '?',
        }
    }

    fn feed(&mut self) -> ChannelStatus {
        let line = std::mem::take(&mut self.line);
        if self.output.send(line).is_err() {
            log::warn!("printer output disconnected, line dropped");
            return ChannelStatus::WRITE_TIMEOUT;
        }
        ChannelStatus::OK
    }
}

impl LogicalDevice for LinePrinter {
    fn open(&mut self, secondary: u8) -> ChannelStatus {
        self.select_mode(secondary);
        ChannelStatus::OK
    }

    /// Closing the channel prints whatever is left on the line.
    fn close(&mut self, _secondary: u8) -> ChannelStatus {
        if self.line.is_empty() {
            return ChannelStatus::OK;
        }
        self.feed()
    }

    fn listen_talk(&mut self, secondary: u8, role: BusRole) -> ChannelStatus {
        match role {
            BusRole::Listen => {
                self.select_mode(secondary);
                ChannelStatus::OK
            }
            BusRole::Talk => ChannelStatus::DEVICE_NOT_PRESENT,
        }
    }

    /// Nothing to say.
    fn read(&mut self, _secondary: u8) -> (u8, ChannelStatus) {
        (0, ChannelStatus::READ_TIMEOUT)
    }

    fn write(&mut self, _secondary: u8, data: u8) -> ChannelStatus {
        if data == CARRIAGE_RETURN {
            return self.feed();
        }
        let c = self.decode(data);
        self.line.push(c);
        ChannelStatus::OK
    }
}
