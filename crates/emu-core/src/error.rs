//! Scheduler contract violations.

use thiserror::Error;

/// A misuse of the scheduler.
///
/// These indicate a logic defect in the component that scheduled the
/// event. They propagate up through the driving loop and end the current
/// emulation step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("event {event} is already pending")]
    AlreadyPending { event: String },
    #[error("event {event} is not pending")]
    NotPending { event: String },
    #[error("event {event} due at half-cycle {at} is before current half-cycle {now}")]
    InPast { event: String, at: u64, now: u64 },
    #[error("thread-safe scheduler handle is disconnected")]
    Disconnected,
}
