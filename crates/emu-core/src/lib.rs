//! Core scheduling and timing types for cycle-accurate emulation.
//!
//! Every chip schedules its work against an [`EventScheduler`]. Time is a
//! cycle counter split into two phases per cycle, so effects that happen
//! early and late within one cycle have a defined order. Independently
//! clocked sub-systems get their own scheduler and are kept in step by a
//! [`ClockSync`].

mod clock;
mod error;
mod observable;
mod scheduler;
mod sync;

pub use clock::MasterClock;
pub use error::SchedulerError;
pub use observable::{Observable, Value};
pub use scheduler::{EventHandler, EventScheduler, Phase, SchedulerHandle};
pub use sync::ClockSync;
