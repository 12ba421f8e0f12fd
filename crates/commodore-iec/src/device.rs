//! Device side of the IEC serial handshake.
//!
//! A [`SerialDevice`] watches the bus and walks the wire protocol one
//! state at a time: ATN addressing, byte receive while listening, byte
//! send while talking. It has no timer of its own. The owner calls
//! [`SerialDevice::clock`] whenever the bus changes and at the cycle
//! reported by [`SerialDevice::next_deadline`], and the device compares
//! the current time against its pending timeout.
//!
//! Protocol windows are given in microseconds and converted through the
//! device's [`MasterClock`], so a different crystal rescales them.

use emu_core::{MasterClock, Observable, Value};

use crate::bus::{ATN_IN, CLK_IN, CLK_OUT, DATA_IN, DATA_OUT, IecBus, RELEASED};
use crate::logical::{BusRole, ChannelStatus, LogicalDevice};

/// Ignore the bus this long after ATN falls.
const ATN_SETTLE_US: u32 = 100;
/// A sender that keeps CLK high this long after "ready for data" signals EOI.
const READY_US: u32 = 200;
/// Length of the listener's EOI acknowledge pulse.
const EOI_ACK_US: u32 = 60;
/// Talker holds CLK low this long after turnaround.
const TURNAROUND_US: u32 = 80;
/// Talker setup and valid time per bit.
const BIT_HOLD_US: u32 = 60;
/// Listener must acknowledge a frame within this window.
const FRAME_ACK_US: u32 = 1000;
/// Length of the frame-error CLK pulse.
const FRAME_ERROR_US: u32 = 100;

/// Bound on state changes applied for one bus level.
const MAX_STEPS: usize = 64;

const LISTEN: u8 = 0x20;
const TALK: u8 = 0x40;
const UNLISTEN: u8 = 0x3F;
const UNTALK: u8 = 0x5F;

/// Handshake progress of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not addressed; both lines released.
    Idle,
    /// Just after ATN fell (listener) or before turnaround (talker).
    Pre0,
    /// Waiting for CLK low (listener) or holding turnaround (talker).
    Pre1,
    /// Waiting for the sender to release CLK.
    Pre2,
    /// Listener: ready for data. Talker: waiting for the listener.
    Ready,
    Eoi,
    EoiWait,
    /// Bit `n` of the frame: listener waits for CLK high, talker drives it.
    Bit(u8),
    /// After bit `n`: listener waits for CLK low, talker holds data valid.
    BitWait(u8),
    /// Frame done. A listener stays here when a frame is refused.
    Done0,
    /// Talker waiting for the frame acknowledge.
    Done1,
    FrameError0,
    FrameError1,
}

/// One device's handshake engine, attached to the bus at its address.
pub struct SerialDevice {
    address: u8,
    enabled: bool,
    state: HandshakeState,

    // Role flags.
    under_atn: bool,
    listening: bool,
    talking: bool,

    /// Byte being shifted in or out.
    byte: u8,
    primary: u8,
    secondary: u8,
    /// Secondary address of the previous ATN sequence, used by UNLISTEN
    /// and UNTALK.
    secondary_prev: u8,
    /// Status per channel (secondary address low nibble).
    status: [ChannelStatus; 16],
    /// The last byte sent was not acknowledged.
    resend: bool,
    /// Absolute cycle the current wait expires.
    timeout: u64,
    clock: MasterClock,
}

impl SerialDevice {
    /// Create a device at bus address `address` (0-15). It stays off the
    /// bus until enabled.
    #[must_use]
    pub fn new(address: u8, clock: MasterClock) -> Self {
        Self {
            address: address & 0x0F,
            enabled: false,
            state: HandshakeState::Idle,
            under_atn: false,
            listening: false,
            talking: false,
            byte: 0,
            primary: 0,
            secondary: 0,
            secondary_prev: 0,
            status: [ChannelStatus::OK; 16],
            resend: false,
            timeout: 0,
            clock,
        }
    }

    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    #[must_use]
    pub fn is_talking(&self) -> bool {
        self.talking
    }

    #[must_use]
    pub fn is_under_atn(&self) -> bool {
        self.under_atn
    }

    /// Status of a channel.
    #[must_use]
    pub fn status(&self, channel: u8) -> ChannelStatus {
        self.status[usize::from(channel & 0x0F)]
    }

    fn id(&self) -> usize {
        usize::from(self.address)
    }

    fn drive(&self, bus: &mut IecBus, levels: u8) {
        bus.write(self.id(), levels);
    }

    fn after(&self, now: u64, us: u32) -> u64 {
        now + self.clock.us_to_cycles(us)
    }

    fn channel(secondary: u8) -> usize {
        usize::from(secondary & 0x0F)
    }

    fn clear_session(&mut self) {
        self.state = HandshakeState::Idle;
        self.under_atn = false;
        self.listening = false;
        self.talking = false;
        self.resend = false;
        self.timeout = 0;
        self.status = [ChannelStatus::OK; 16];
    }

    /// Switch the device on or off. Switching off releases its lines.
    pub fn set_enabled(&mut self, enabled: bool, bus: &mut IecBus) {
        if enabled == self.enabled {
            return;
        }
        if enabled {
            self.clear_session();
        } else {
            self.drive(bus, RELEASED);
            self.timeout = 0;
        }
        self.enabled = enabled;
        log::debug!("serial device {} {}", self.address, if enabled { "on" } else { "off" });
    }

    /// Bus reset: release the lines and forget any transfer in progress.
    pub fn reset(&mut self, bus: &mut IecBus) {
        if self.enabled {
            self.drive(bus, RELEASED);
            self.clear_session();
        }
    }

    /// Use a different clock for the protocol windows. A wait already in
    /// progress keeps its deadline.
    pub fn set_clock(&mut self, clock: MasterClock) {
        self.clock = clock;
    }

    /// When the device next needs to look at the bus even if nothing on
    /// it changes.
    #[must_use]
    pub fn next_deadline(&self, now: u64) -> Option<u64> {
        let active = self.under_atn || self.listening || self.talking;
        (self.enabled && active && self.timeout > now).then_some(self.timeout)
    }

    /// React to the bus as it is at cycle `now`, running the state
    /// machine until it stops moving.
    pub fn clock<L: LogicalDevice + ?Sized>(&mut self, now: u64, bus: &mut IecBus, logical: &mut L) {
        if !self.enabled {
            return;
        }
        for _ in 0..MAX_STEPS {
            let before = self.snapshot(bus);
            self.step(now, bus, logical);
            if self.snapshot(bus) == before {
                return;
            }
        }
        log::warn!("serial device {} did not settle at cycle {now}", self.address);
    }

    fn snapshot(&self, bus: &IecBus) -> (HandshakeState, bool, bool, bool, u8) {
        (
            self.state,
            self.under_atn,
            self.listening,
            self.talking,
            bus.device_read(),
        )
    }

    fn step<L: LogicalDevice + ?Sized>(&mut self, now: u64, bus: &mut IecBus, logical: &mut L) {
        let lines = bus.device_read();
        let atn_low = lines & ATN_IN == 0;

        if !self.under_atn && atn_low {
            self.attention(now, bus);
        } else if self.under_atn && !atn_low {
            self.end_attention(bus, logical);
        }

        if self.under_atn || self.listening {
            self.receive(now, lines, bus, logical);
        } else if self.talking {
            self.send(now, lines, bus, logical);
        }
    }

    /// ATN fell: every device gets ready to hear an address.
    fn attention(&mut self, now: u64, bus: &mut IecBus) {
        self.state = HandshakeState::Pre0;
        self.under_atn = true;
        self.primary = 0;
        self.secondary_prev = self.secondary;
        self.secondary = 0;
        self.timeout = self.after(now, ATN_SETTLE_US);
        // DATA low: "device present".
        self.drive(bus, CLK_OUT);
    }

    /// ATN rose: act on the addresses collected under it.
    fn end_attention<L: LogicalDevice + ?Sized>(&mut self, bus: &mut IecBus, logical: &mut L) {
        self.under_atn = false;
        let listen = LISTEN | self.address;
        let talk = TALK | self.address;

        if self.primary == listen || self.primary == talk {
            let channel = Self::channel(self.secondary);
            match self.secondary & 0xF0 {
                0x60 => {
                    let role = if self.primary == listen {
                        BusRole::Listen
                    } else {
                        BusRole::Talk
                    };
                    let status = logical.listen_talk(self.secondary, role);
                    log::trace!(
                        "serial device {}: {role:?} {:#04X} -> {status:?}",
                        self.address,
                        self.secondary
                    );
                }
                0xE0 => self.status[channel] = logical.close(self.secondary),
                0xF0 => self.status[channel] = logical.open(self.secondary),
                _ => {}
            }

            if self.primary == listen {
                self.talking = false;
                // A failed OPEN refuses the LISTEN, which the sender sees
                // as an error.
                if self.status[channel].is_ok() {
                    self.listening = true;
                    self.state = HandshakeState::Pre1;
                }
                self.drive(bus, CLK_OUT);
            } else {
                self.listening = false;
                self.talking = true;
                self.state = HandshakeState::Pre0;
            }
        } else if self.primary == UNLISTEN && self.listening {
            self.listening = false;
            let channel = Self::channel(self.secondary_prev);
            self.status[channel] = logical.unlisten(self.secondary_prev, self.status[channel]);
            log::trace!("serial device {}: unlisten", self.address);
        } else if self.primary == UNTALK && self.talking {
            let status = logical.untalk(self.secondary_prev);
            if status.is_error() {
                log::warn!("serial device {}: untalk reported {status:?}", self.address);
            }
            self.talking = false;
        }

        if !self.listening && !self.talking {
            self.drive(bus, RELEASED);
            self.state = HandshakeState::Idle;
        }
    }

    /// Listener side, also used for addresses under ATN.
    fn receive<L: LogicalDevice + ?Sized>(
        &mut self,
        now: u64,
        lines: u8,
        bus: &mut IecBus,
        logical: &mut L,
    ) {
        use HandshakeState as S;

        let clk_high = lines & CLK_IN != 0;
        match self.state {
            S::Pre0 => {
                if now >= self.timeout {
                    self.state = S::Pre1;
                }
            }
            S::Pre1 => {
                if !clk_high {
                    self.state = S::Pre2;
                }
            }
            S::Pre2 => {
                if clk_high {
                    // Ready for data.
                    self.drive(bus, RELEASED);
                    self.timeout = self.after(now, READY_US);
                    self.state = S::Ready;
                }
            }
            S::Ready => {
                if !clk_high {
                    self.state = S::Bit(0);
                } else if !self.under_atn && now >= self.timeout {
                    // Sender is signalling the last byte; acknowledge.
                    self.drive(bus, CLK_OUT);
                    self.timeout = self.after(now, EOI_ACK_US);
                    self.state = S::Eoi;
                }
            }
            S::Eoi => {
                if now >= self.timeout {
                    self.drive(bus, RELEASED);
                    self.state = S::EoiWait;
                }
            }
            S::EoiWait => {
                if !clk_high {
                    self.state = S::Bit(0);
                }
            }
            S::Bit(n) => {
                if clk_high {
                    let bit = 1 << n;
                    self.byte &= !bit;
                    if lines & DATA_IN != 0 {
                        self.byte |= bit;
                    }
                    self.state = S::BitWait(n);
                }
            }
            S::BitWait(n) => {
                if !clk_high {
                    if n < 7 {
                        self.state = S::Bit(n + 1);
                    } else {
                        self.frame_received(bus, logical);
                    }
                }
            }
            S::Idle | S::Done0 | S::Done1 | S::FrameError0 | S::FrameError1 => {}
        }
    }

    fn frame_received<L: LogicalDevice + ?Sized>(&mut self, bus: &mut IecBus, logical: &mut L) {
        if self.under_atn {
            if self.primary == 0 {
                self.primary = self.byte;
            } else if self.secondary == 0 {
                self.secondary = self.byte;
            }
            // Not UNLISTEN/UNTALK and not our address: leave the frame
            // unacknowledged so the master sees "device not present" if
            // nobody else answers.
            if self.primary & 0x10 == 0 && self.primary & 0x0F != self.address {
                self.state = HandshakeState::Done0;
                return;
            }
        } else if self.listening {
            let channel = Self::channel(self.secondary);
            let status = logical.write(self.secondary, self.byte);
            self.status[channel] = status;
            if !status.is_ok() {
                log::warn!(
                    "serial device {}: write refused with {status:?}, listen aborted",
                    self.address
                );
                self.state = HandshakeState::Done0;
                return;
            }
        }
        // DATA low: frame accepted. CLK is already low, so skip Pre1.
        self.drive(bus, CLK_OUT);
        self.state = HandshakeState::Pre2;
    }

    /// Talker side.
    fn send<L: LogicalDevice + ?Sized>(
        &mut self,
        now: u64,
        lines: u8,
        bus: &mut IecBus,
        logical: &mut L,
    ) {
        use HandshakeState as S;

        let data_high = lines & DATA_IN != 0;
        match self.state {
            S::Pre0 => {
                if lines & CLK_IN != 0 {
                    // Turnaround: take CLK, let go of DATA.
                    self.drive(bus, DATA_OUT);
                    self.timeout = self.after(now, TURNAROUND_US);
                    self.state = S::Pre1;
                }
            }
            S::Pre1 => {
                if now >= self.timeout {
                    // Ready to send.
                    self.drive(bus, RELEASED);
                    self.state = S::Ready;
                } else {
                    self.offer_byte(now, data_high, bus, logical);
                }
            }
            S::Ready => self.offer_byte(now, data_high, bus, logical),
            S::Eoi => {
                if !data_high {
                    self.state = S::EoiWait;
                }
            }
            S::EoiWait => {
                if data_high {
                    self.timeout = now;
                    self.state = S::Bit(0);
                }
            }
            S::Bit(n) => {
                if now >= self.timeout {
                    // CLK low, bit on DATA.
                    let levels = if self.byte & (1 << n) != 0 { DATA_OUT } else { 0 };
                    self.drive(bus, levels);
                    self.timeout = self.after(now, BIT_HOLD_US);
                    self.state = S::BitWait(n);
                }
            }
            S::BitWait(n) => {
                if now >= self.timeout {
                    // CLK high: data valid.
                    let levels = if data_high { RELEASED } else { CLK_OUT };
                    self.drive(bus, levels);
                    self.timeout = self.after(now, BIT_HOLD_US);
                    self.state = if n < 7 { S::Bit(n + 1) } else { S::Done0 };
                }
            }
            S::Done0 => {
                if now >= self.timeout {
                    self.drive(bus, DATA_OUT);
                    self.timeout = self.after(now, FRAME_ACK_US);
                    self.state = S::Done1;
                }
            }
            S::Done1 => {
                let channel = Self::channel(self.secondary);
                if !data_high {
                    if self.status[channel] == ChannelStatus::EOI {
                        // Last byte acknowledged.
                        self.talking = false;
                        self.status[channel] = ChannelStatus::OK;
                        self.drive(bus, RELEASED);
                        self.state = S::Idle;
                    } else {
                        self.timeout = now;
                        self.state = S::Pre1;
                    }
                } else if now >= self.timeout {
                    log::warn!(
                        "serial device {}: frame not acknowledged, signalling frame error",
                        self.address
                    );
                    self.drive(bus, RELEASED);
                    self.timeout = self.after(now, FRAME_ERROR_US);
                    self.resend = true;
                    self.state = S::FrameError0;
                }
            }
            S::FrameError0 => {
                if now >= self.timeout {
                    self.drive(bus, DATA_OUT);
                    self.state = S::FrameError1;
                }
            }
            S::FrameError1 => {
                if !data_high {
                    self.timeout = now;
                    self.state = S::Pre1;
                }
            }
            S::Idle | S::Pre2 => {}
        }
    }

    /// The listener is ready for data: fetch the next byte (or reuse an
    /// unacknowledged one) and start sending it.
    fn offer_byte<L: LogicalDevice + ?Sized>(
        &mut self,
        now: u64,
        data_high: bool,
        bus: &mut IecBus,
        logical: &mut L,
    ) {
        if !data_high {
            return;
        }
        let channel = Self::channel(self.secondary);
        if self.resend {
            self.resend = false;
        } else {
            let (byte, status) = logical.read(self.secondary);
            self.byte = byte;
            self.status[channel] = status;
        }

        let status = self.status[channel];
        if status.is_ok() {
            self.timeout = now;
            self.state = HandshakeState::Bit(0);
        } else if status == ChannelStatus::EOI {
            // Last byte: keep CLK high until the listener acknowledges EOI.
            self.state = HandshakeState::Eoi;
        } else {
            log::warn!(
                "serial device {}: read failed with {status:?}, talk aborted",
                self.address
            );
            // Sit out the rest of the frame until the next ATN.
            self.talking = false;
            self.drive(bus, RELEASED);
            self.state = HandshakeState::Done0;
        }
    }
}

impl Observable for SerialDevice {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "address" => Some(self.address.into()),
            "enabled" => Some(self.enabled.into()),
            "state" => Some(format!("{:?}", self.state).as_str().into()),
            "atn" => Some(self.under_atn.into()),
            "listening" => Some(self.listening.into()),
            "talking" => Some(self.talking.into()),
            "primary" => Some(self.primary.into()),
            "secondary" => Some(self.secondary.into()),
            "timeout" => Some(self.timeout.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "address",
            "enabled",
            "state",
            "atn",
            "listening",
            "talking",
            "primary",
            "secondary",
            "timeout",
        ]
    }
}
