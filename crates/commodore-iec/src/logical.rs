//! The file-level side of a serial device.
//!
//! The handshake in [`crate::device`] only moves bytes. What the bytes
//! mean (a printer line, a disk file) is up to a [`LogicalDevice`], which
//! answers each bus command with a [`ChannelStatus`].

use std::fmt;

/// KERNAL status byte for one channel (secondary address).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus(u8);

impl ChannelStatus {
    pub const OK: Self = Self(0x00);
    pub const WRITE_TIMEOUT: Self = Self(0x01);
    pub const READ_TIMEOUT: Self = Self(0x02);
    /// The byte just read is the last one.
    pub const EOI: Self = Self(0x40);
    pub const DEVICE_NOT_PRESENT: Self = Self(0x80);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Any bit other than EOI is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & !Self::EOI.0 != 0
    }
}

impl fmt::Debug for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => write!(f, "OK"),
            Self::EOI => write!(f, "EOI"),
            Self::WRITE_TIMEOUT => write!(f, "WRITE_TIMEOUT"),
            Self::READ_TIMEOUT => write!(f, "READ_TIMEOUT"),
            Self::DEVICE_NOT_PRESENT => write!(f, "DEVICE_NOT_PRESENT"),
            Self(bits) => write!(f, "ChannelStatus({bits:#04X})"),
        }
    }
}

/// Direction the bus master asked for with LISTEN or TALK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRole {
    /// The device receives bytes.
    Listen,
    /// The device sends bytes.
    Talk,
}

/// Commands delivered by the handshake, one per bus transaction.
///
/// `secondary` is the raw secondary address byte (`$6x` data, `$Ex`
/// close, `$Fx` open); the channel is its low nibble.
pub trait LogicalDevice {
    /// OPEN. Bytes received until the next UNLISTEN are the file name.
    fn open(&mut self, _secondary: u8) -> ChannelStatus {
        ChannelStatus::OK
    }

    fn close(&mut self, _secondary: u8) -> ChannelStatus {
        ChannelStatus::OK
    }

    /// LISTEN or TALK followed by a data secondary address.
    fn listen_talk(&mut self, _secondary: u8, _role: BusRole) -> ChannelStatus {
        ChannelStatus::OK
    }

    /// UNLISTEN. `status` is the channel's status before the call, so a
    /// device can tell a pending OPEN from a plain data transfer.
    fn unlisten(&mut self, _secondary: u8, status: ChannelStatus) -> ChannelStatus {
        status
    }

    fn untalk(&mut self, _secondary: u8) -> ChannelStatus {
        ChannelStatus::OK
    }

    /// Next byte to send. [`ChannelStatus::EOI`] marks the last one; an
    /// error status sends nothing and ends the talk.
    fn read(&mut self, secondary: u8) -> (u8, ChannelStatus);

    /// A received byte. An error status stops listening.
    fn write(&mut self, secondary: u8, data: u8) -> ChannelStatus;
}

impl<T: LogicalDevice + ?Sized> LogicalDevice for Box<T> {
    fn open(&mut self, secondary: u8) -> ChannelStatus {
        (**self).open(secondary)
    }

    fn close(&mut self, secondary: u8) -> ChannelStatus {
        (**self).close(secondary)
    }

    fn listen_talk(&mut self, secondary: u8, role: BusRole) -> ChannelStatus {
        (**self).listen_talk(secondary, role)
    }

    fn unlisten(&mut self, secondary: u8, status: ChannelStatus) -> ChannelStatus {
        (**self).unlisten(secondary, status)
    }

    fn untalk(&mut self, secondary: u8) -> ChannelStatus {
        (**self).untalk(secondary)
    }

    fn read(&mut self, secondary: u8) -> (u8, ChannelStatus) {
        (**self).read(secondary)
    }

    fn write(&mut self, secondary: u8, data: u8) -> ChannelStatus {
        (**self).write(secondary, data)
    }
}
