//! Discrete-event scheduler with two phases per cycle.
//!
//! Time is kept in half-cycles: an even half-cycle is phase 1 (PHI1) of a
//! cycle, the following odd half-cycle is phase 2 (PHI2). Events are keyed
//! by (half-cycle, insertion sequence), so events due at the same instant
//! fire in the order they were scheduled.
//!
//! Events are plain `Copy` values, usually a small enum owned by the
//! component that schedules them. An event can be pending at most once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use crossbeam_channel::{Receiver, Sender};

use crate::SchedulerError;

/// Sub-phase within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// First half of the cycle.
    Phi1,
    /// Second half of the cycle. Fires after every PHI1 event of the cycle.
    Phi2,
}

/// Receiver of fired events.
///
/// The scheduler is handed back so the handler can schedule follow-up work,
/// including rescheduling the event that just fired.
pub trait EventHandler<E> {
    fn handle(&mut self, event: E, scheduler: &mut EventScheduler<E>)
    -> Result<(), SchedulerError>;
}

/// Queue key: (half-cycle, insertion sequence).
type Slot = (u64, u64);

/// Ordered queue of pending events for one timing domain.
pub struct EventScheduler<E> {
    /// Current half-cycle.
    now: u64,
    sequence: u64,
    queue: BTreeMap<Slot, E>,
    pending: HashMap<E, Slot>,
    fired: u64,
    inbox: Receiver<E>,
    handle: SchedulerHandle<E>,
}

/// Cloneable, `Send` hand-off for scheduling from another thread.
///
/// Events sent through a handle are scheduled at PHI1 of the current cycle
/// the next time the owning scheduler is clocked.
pub struct SchedulerHandle<E> {
    sender: Sender<E>,
}

impl<E> SchedulerHandle<E> {
    /// Queue an event for the owning scheduler without blocking.
    pub fn schedule_thread_safe(&self, event: E) -> Result<(), SchedulerError> {
        self.sender
            .send(event)
            .map_err(|_| SchedulerError::Disconnected)
    }
}

impl<E> Clone for SchedulerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E> fmt::Debug for SchedulerHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("queued", &self.sender.len())
            .finish()
    }
}

impl<E: Copy + Eq + Hash + fmt::Debug> EventScheduler<E> {
    #[must_use]
    pub fn new() -> Self {
        let (sender, inbox) = crossbeam_channel::unbounded();
        Self {
            now: 0,
            sequence: 0,
            queue: BTreeMap::new(),
            pending: HashMap::new(),
            fired: 0,
            inbox,
            handle: SchedulerHandle { sender },
        }
    }

    /// Rewind to cycle 0 and drop every pending event.
    ///
    /// Events queued through a [`SchedulerHandle`] but not yet drained are
    /// discarded as well.
    pub fn reset(&mut self) {
        self.now = 0;
        self.sequence = 0;
        self.queue.clear();
        self.pending.clear();
        self.fired = 0;
        while self.inbox.try_recv().is_ok() {}
    }

    /// Current cycle as observed from `phase`.
    ///
    /// During PHI2, asking for PHI1 time yields the next cycle: the next
    /// PHI1 instant is in the following cycle.
    #[must_use]
    pub fn time(&self, phase: Phase) -> u64 {
        (self.now + u64::from(phase == Phase::Phi1)) >> 1
    }

    /// Phase of the current instant.
    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.now & 1 == 0 {
            Phase::Phi1
        } else {
            Phase::Phi2
        }
    }

    /// Schedule `event` to fire `cycles` cycles from now in `phase`.
    ///
    /// A delay of 0 in the current phase fires later this same instant,
    /// after every event already due. A delay of 0 in PHI1 requested during
    /// PHI2 lands on PHI1 of the next cycle.
    pub fn schedule(&mut self, event: E, cycles: u64, phase: Phase) -> Result<(), SchedulerError> {
        let parity = (self.now & 1) ^ u64::from(phase == Phase::Phi2);
        self.insert(event, (cycles << 1) + self.now + parity)
    }

    /// Schedule `event` at an absolute cycle and phase.
    pub fn schedule_absolute(
        &mut self,
        event: E,
        cycle: u64,
        phase: Phase,
    ) -> Result<(), SchedulerError> {
        let at = (cycle << 1) + u64::from(phase == Phase::Phi2);
        if at < self.now {
            return Err(SchedulerError::InPast {
                event: format!("{event:?}"),
                at,
                now: self.now,
            });
        }
        self.insert(event, at)
    }

    fn insert(&mut self, event: E, at: u64) -> Result<(), SchedulerError> {
        if self.pending.contains_key(&event) {
            return Err(SchedulerError::AlreadyPending {
                event: format!("{event:?}"),
            });
        }
        let slot = (at, self.sequence);
        self.sequence += 1;
        self.queue.insert(slot, event);
        self.pending.insert(event, slot);
        Ok(())
    }

    /// Queue an event from this thread through the thread-safe hand-off.
    ///
    /// A hand-off of an event that is still pending when drained is merged
    /// into it rather than faulting.
    pub fn schedule_thread_safe(&self, event: E) -> Result<(), SchedulerError> {
        self.handle.schedule_thread_safe(event)
    }

    /// A handle other threads can use to schedule events.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle<E> {
        self.handle.clone()
    }

    /// Remove `event` if it is pending. Returns whether it was.
    ///
    /// Cancelling an event that already fired or was never scheduled is a
    /// no-op, so components can cancel unconditionally when resyncing.
    pub fn cancel(&mut self, event: E) -> bool {
        match self.pending.remove(&event) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Remove `event`, faulting if it is not pending.
    pub fn cancel_pending(&mut self, event: E) -> Result<(), SchedulerError> {
        if self.cancel(event) {
            Ok(())
        } else {
            Err(SchedulerError::NotPending {
                event: format!("{event:?}"),
            })
        }
    }

    #[must_use]
    pub fn is_pending(&self, event: E) -> bool {
        self.pending.contains_key(&event)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total events fired since construction or the last reset.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.fired
    }

    /// Advance one cycle, firing every event due before the same phase of
    /// the next cycle.
    pub fn clock<H>(&mut self, handler: &mut H) -> Result<(), SchedulerError>
    where
        H: EventHandler<E> + ?Sized,
    {
        let limit = self.now + 2;
        self.run_to(limit, handler)
    }

    /// Fire the events due at the current instant and move to the other
    /// phase. Used to park a domain at PHI2, where CPU accesses happen.
    pub fn step_phase<H>(&mut self, handler: &mut H) -> Result<(), SchedulerError>
    where
        H: EventHandler<E> + ?Sized,
    {
        let limit = self.now + 1;
        self.run_to(limit, handler)
    }

    /// Advance `cycles` cycles in one pass.
    ///
    /// Equivalent to calling [`clock`](Self::clock) `cycles` times, except
    /// that the thread-safe hand-off is drained once, up front.
    pub fn advance<H>(&mut self, cycles: u64, handler: &mut H) -> Result<(), SchedulerError>
    where
        H: EventHandler<E> + ?Sized,
    {
        if cycles == 0 {
            return Ok(());
        }
        let limit = self.now + (cycles << 1);
        self.run_to(limit, handler)
    }

    fn run_to<H>(&mut self, limit: u64, handler: &mut H) -> Result<(), SchedulerError>
    where
        H: EventHandler<E> + ?Sized,
    {
        while let Ok(event) = self.inbox.try_recv() {
            // Repeated hand-offs of one event merge into the pending one.
            if self.is_pending(event) {
                log::trace!("{event:?} already pending, hand-off merged");
                continue;
            }
            self.schedule(event, 0, Phase::Phi1)?;
        }

        while let Some((&slot, &event)) = self.queue.first_key_value() {
            if slot.0 >= limit {
                break;
            }
            self.queue.remove(&slot);
            self.pending.remove(&event);
            self.now = slot.0;
            self.fired += 1;
            handler.handle(event, self)?;
        }

        self.now = self.now.max(limit);
        Ok(())
    }
}

impl<E: Copy + Eq + Hash + fmt::Debug> Default for EventScheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventScheduler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventScheduler")
            .field("now", &self.now)
            .field("pending", &self.queue.len())
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Ev {
        A,
        B,
        C,
        Tick,
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<(Ev, u64, Phase)>,
        chain_c_from_a: bool,
        tick_period: Option<u64>,
    }

    impl EventHandler<Ev> for Recorder {
        fn handle(&mut self, event: Ev, s: &mut EventScheduler<Ev>) -> Result<(), SchedulerError> {
            self.log.push((event, s.time(Phase::Phi2), s.phase()));
            if event == Ev::A && self.chain_c_from_a {
                s.schedule(Ev::C, 0, Phase::Phi1)?;
            }
            if let (Ev::Tick, Some(period)) = (event, self.tick_period) {
                s.schedule(Ev::Tick, period, Phase::Phi1)?;
            }
            Ok(())
        }
    }

    fn names(r: &Recorder) -> Vec<Ev> {
        r.log.iter().map(|e| e.0).collect()
    }

    #[test]
    fn same_instant_events_fire_in_insertion_order() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.schedule(Ev::B, 2, Phase::Phi1).unwrap();
        s.schedule(Ev::A, 2, Phase::Phi1).unwrap();
        s.schedule(Ev::C, 2, Phase::Phi1).unwrap();
        s.advance(3, &mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::B, Ev::A, Ev::C]);
        assert!(r.log.iter().all(|e| e.1 == 2));
    }

    #[test]
    fn phi1_fires_before_phi2_of_same_cycle() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.schedule(Ev::A, 1, Phase::Phi2).unwrap();
        s.schedule(Ev::B, 1, Phase::Phi1).unwrap();
        s.advance(2, &mut r).unwrap();
        assert_eq!(
            r.log,
            vec![(Ev::B, 1, Phase::Phi1), (Ev::A, 1, Phase::Phi2)]
        );
    }

    #[test]
    fn zero_delay_fires_later_this_instant() {
        let mut s = EventScheduler::new();
        let mut r = Recorder {
            chain_c_from_a: true,
            ..Recorder::default()
        };
        s.schedule(Ev::A, 0, Phase::Phi1).unwrap();
        s.schedule(Ev::B, 0, Phase::Phi1).unwrap();
        s.clock(&mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::A, Ev::B, Ev::C]);
        assert!(r.log.iter().all(|e| e.1 == 0 && e.2 == Phase::Phi1));
    }

    #[test]
    fn phi1_request_during_phi2_lands_next_cycle() {
        struct Probe(Vec<u64>);
        impl EventHandler<Ev> for Probe {
            fn handle(&mut self, ev: Ev, s: &mut EventScheduler<Ev>) -> Result<(), SchedulerError> {
                self.0.push(s.time(Phase::Phi2));
                if ev == Ev::A {
                    assert_eq!(s.time(Phase::Phi1), 6);
                    s.schedule(Ev::B, 0, Phase::Phi1)?;
                }
                Ok(())
            }
        }
        let mut s = EventScheduler::new();
        let mut p = Probe(Vec::new());
        s.schedule(Ev::A, 5, Phase::Phi2).unwrap();
        s.advance(10, &mut p).unwrap();
        assert_eq!(p.0, vec![5, 6]);
    }

    #[test]
    fn periodic_event_reschedules_itself() {
        let mut s = EventScheduler::new();
        let mut r = Recorder {
            tick_period: Some(3),
            ..Recorder::default()
        };
        s.schedule(Ev::Tick, 0, Phase::Phi1).unwrap();
        s.advance(10, &mut r).unwrap();
        let times: Vec<u64> = r.log.iter().map(|e| e.1).collect();
        assert_eq!(times, vec![0, 3, 6, 9]);
        assert_eq!(s.fired_count(), 4);
        assert!(s.is_pending(Ev::Tick));
    }

    #[test]
    fn clock_advances_one_cycle_at_a_time() {
        let mut s: EventScheduler<Ev> = EventScheduler::new();
        let mut r = Recorder::default();
        let mut last = 0;
        for _ in 0..5 {
            s.clock(&mut r).unwrap();
            let t = s.time(Phase::Phi2);
            assert_eq!(t, last + 1);
            last = t;
        }
        assert_eq!(s.phase(), Phase::Phi1);
    }

    #[test]
    fn step_phase_parks_at_phi2() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.schedule(Ev::A, 0, Phase::Phi1).unwrap();
        s.schedule(Ev::B, 0, Phase::Phi2).unwrap();
        s.step_phase(&mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::A]);
        assert_eq!(s.phase(), Phase::Phi2);
        assert_eq!(s.time(Phase::Phi2), 0);
        assert_eq!(s.time(Phase::Phi1), 1);

        s.schedule(Ev::C, 1, Phase::Phi2).unwrap();
        s.clock(&mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::A, Ev::B]);
        assert_eq!(s.phase(), Phase::Phi2);
        s.clock(&mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::A, Ev::B, Ev::C]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.schedule(Ev::A, 1, Phase::Phi1).unwrap();
        assert!(s.cancel(Ev::A));
        assert!(!s.cancel(Ev::A));
        s.advance(5, &mut r).unwrap();
        assert!(r.log.is_empty());
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn strict_cancel_faults_when_not_pending() {
        let mut s = EventScheduler::new();
        s.schedule(Ev::A, 1, Phase::Phi1).unwrap();
        assert_eq!(s.cancel_pending(Ev::A), Ok(()));
        assert!(matches!(
            s.cancel_pending(Ev::A),
            Err(SchedulerError::NotPending { .. })
        ));
    }

    #[test]
    fn double_schedule_faults() {
        let mut s = EventScheduler::new();
        s.schedule(Ev::A, 1, Phase::Phi1).unwrap();
        let err = s.schedule(Ev::A, 4, Phase::Phi2).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::AlreadyPending {
                event: "A".to_string()
            }
        );
    }

    #[test]
    fn absolute_schedule_in_past_faults() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.advance(10, &mut r).unwrap();
        assert!(matches!(
            s.schedule_absolute(Ev::A, 9, Phase::Phi2),
            Err(SchedulerError::InPast { .. })
        ));
        s.schedule_absolute(Ev::A, 12, Phase::Phi2).unwrap();
        s.advance(5, &mut r).unwrap();
        assert_eq!(r.log, vec![(Ev::A, 12, Phase::Phi2)]);
    }

    #[test]
    fn handler_fault_stops_the_loop() {
        let mut s = EventScheduler::new();
        let mut r = Recorder {
            chain_c_from_a: true,
            ..Recorder::default()
        };
        s.schedule(Ev::C, 5, Phase::Phi1).unwrap();
        s.schedule(Ev::A, 1, Phase::Phi1).unwrap();
        assert!(s.advance(10, &mut r).is_err());
        assert_eq!(names(&r), vec![Ev::A]);
    }

    #[test]
    fn thread_safe_events_fire_on_next_clock() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.advance(3, &mut r).unwrap();

        let handle = s.handle();
        std::thread::spawn(move || handle.schedule_thread_safe(Ev::B).unwrap())
            .join()
            .unwrap();

        s.clock(&mut r).unwrap();
        assert_eq!(r.log, vec![(Ev::B, 3, Phase::Phi1)]);
    }

    #[test]
    fn repeated_hand_off_fires_once() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        let handle = s.handle();
        handle.schedule_thread_safe(Ev::B).unwrap();
        handle.schedule_thread_safe(Ev::B).unwrap();
        handle.schedule_thread_safe(Ev::C).unwrap();

        s.clock(&mut r).unwrap();
        s.clock(&mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::B, Ev::C]);
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn reset_rewinds_time_and_drops_events() {
        let mut s = EventScheduler::new();
        let mut r = Recorder::default();
        s.schedule(Ev::A, 100, Phase::Phi1).unwrap();
        s.schedule_thread_safe(Ev::B).unwrap();
        s.advance(7, &mut r).unwrap();
        s.schedule_thread_safe(Ev::C).unwrap();
        s.reset();
        assert_eq!(s.time(Phase::Phi2), 0);
        assert_eq!(s.pending_count(), 0);
        s.advance(200, &mut r).unwrap();
        assert_eq!(names(&r), vec![Ev::B]);
    }

    #[test]
    fn identical_inputs_fire_identically() {
        fn run() -> Vec<(Ev, u64, Phase)> {
            let mut s = EventScheduler::new();
            let mut r = Recorder {
                chain_c_from_a: true,
                tick_period: Some(7),
                ..Recorder::default()
            };
            s.schedule(Ev::Tick, 0, Phase::Phi2).unwrap();
            s.schedule(Ev::A, 14, Phase::Phi2).unwrap();
            s.schedule(Ev::B, 14, Phase::Phi1).unwrap();
            s.advance(50, &mut r).unwrap();
            r.log
        }
        assert_eq!(run(), run());
    }
}
