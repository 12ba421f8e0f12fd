//! Commodore 64 timing core.
//!
//! The C64 master clock ticks at CPU cycle rate (985,248 Hz PAL). The two
//! CIAs schedule their work on the master [`emu_core::EventScheduler`];
//! serial peripherals run on a second scheduler in their own clock domain
//! and are caught up whenever the CPU touches the serial port.

mod c64;
pub mod config;
pub mod peripheral;
pub mod printer;

pub use c64::{C64, EAGER_SYNC_INTERVAL, MachineEvent, PowerSwitch};
pub use config::{C64Config, C64Model, CiaModel, SyncMode};
pub use peripheral::PeripheralUnit;
pub use printer::{LinePrinter, PRINTER_ADDRESS, PrintMode};
