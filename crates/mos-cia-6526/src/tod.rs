//! Time-of-day clock.
//!
//! Four BCD registers: tenths, seconds, minutes, hours with bit 7 as PM.
//! The clock counts mains half-waves from the TOD pin; five make a tenth
//! at 50 Hz, six at 60 Hz. The interval between tenths is kept as 25.7
//! fixed point so a fractional mains period does not drift.

const TEN: usize = 0;
const HR: usize = 3;

/// Bits each register stores.
const MASKS: [u8; 4] = [0x0F, 0x7F, 0x7F, 0x9F];

/// PAL mains period (985 248.444 Hz / 50 Hz) until the machine sets one.
const DEFAULT_PERIOD: f64 = 19_704.969;

pub(crate) struct TimeOfDay {
    clock: [u8; 4],
    alarm: [u8; 4],
    latch: [u8; 4],
    latched: bool,
    stopped: bool,
    /// Fractional cycles carried between tenths, 25.7 fixed point.
    cycles: u64,
    /// Cycles per mains period, 25.7 fixed point.
    period: u64,
}

fn from_bcd(bcd: u8) -> u8 {
    10 * (bcd >> 4) + (bcd & 0x0F)
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

impl TimeOfDay {
    pub(crate) fn new() -> Self {
        let mut tod = Self {
            clock: [0; 4],
            alarm: [0; 4],
            latch: [0; 4],
            latched: false,
            stopped: true,
            cycles: 0,
            period: 0,
        };
        tod.set_rate(DEFAULT_PERIOD);
        tod.reset();
        tod
    }

    pub(crate) fn reset(&mut self) {
        self.clock = [0, 0, 0, 1];
        self.alarm = [0; 4];
        self.latch = [0; 4];
        self.latched = false;
        self.stopped = true;
        self.cycles = 0;
    }

    /// Set the number of CPU cycles per mains period.
    pub(crate) fn set_rate(&mut self, cycles_per_period: f64) {
        self.period = (cycles_per_period * 128.0) as u64;
    }

    pub(crate) fn clock(&self) -> [u8; 4] {
        self.clock
    }

    pub(crate) fn alarm(&self) -> [u8; 4] {
        self.alarm
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whole cycles until the next tenth, keeping the remainder.
    pub(crate) fn next_delay(&mut self, fifty_hz: bool) -> u64 {
        let periods = if fifty_hz { 5 } else { 6 };
        self.cycles += self.period * periods;
        let delay = self.cycles >> 7;
        self.cycles &= 0x7F;
        delay.max(1)
    }

    /// Advance one tenth of a second. Returns whether the alarm matched.
    pub(crate) fn tick(&mut self) -> bool {
        if self.stopped {
            return false;
        }

        let tenths = from_bcd(self.clock[0]) + 1;
        self.clock[0] = to_bcd(tenths % 10);
        if tenths >= 10 {
            let seconds = from_bcd(self.clock[1]) + 1;
            self.clock[1] = to_bcd(seconds % 60);
            if seconds >= 60 {
                let minutes = from_bcd(self.clock[2]) + 1;
                self.clock[2] = to_bcd(minutes % 60);
                if minutes >= 60 {
                    self.clock[3] = next_hour(self.clock[3]);
                }
            }
        }
        self.clock == self.alarm
    }

    /// Reading hours freezes the visible value until tenths are read.
    pub(crate) fn read(&mut self, index: usize) -> u8 {
        if !self.latched {
            self.latch = self.clock;
        }
        match index {
            TEN => self.latched = false,
            HR => self.latched = true,
            _ => {}
        }
        self.latch[index]
    }

    /// Write one register of the clock, or of the alarm when
    /// `alarm_mode`. Writing hours halts the clock until tenths are
    /// written. Returns whether the running clock now matches the alarm.
    pub(crate) fn write(&mut self, index: usize, value: u8, alarm_mode: bool) -> bool {
        let mut value = value & MASKS[index];
        // 12 is written with the AM/PM sense inverted.
        if index == HR && value & 0x1F == 0x12 && !alarm_mode {
            value ^= 0x80;
        }

        if alarm_mode {
            self.alarm[index] = value;
        } else {
            match index {
                TEN => self.stopped = false,
                HR => self.stopped = true,
                _ => {}
            }
            self.clock[index] = value;
        }
        !self.stopped && self.clock == self.alarm
    }
}

/// 11 -> 12 flips AM/PM, 12 -> 1 does not.
fn next_hour(hour: u8) -> u8 {
    let mut pm = hour & 0x80;
    let mut h = hour & 0x1F;
    if h == 0x11 {
        pm ^= 0x80;
    }
    if h == 0x12 {
        h = 1;
    } else {
        h += 1;
        if h == 10 {
            h = 0x10;
        }
    }
    (h & 0x1F) | pm
}
