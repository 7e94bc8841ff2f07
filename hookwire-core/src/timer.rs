//! Timer state machine
//!
//! ```text
//!   Running <-> Paused
//!      |          |
//!      +--> Dead <+      (Dead is terminal)
//! ```
//!
//! A timer's id is the id of the callback entry wrapping its handler. The
//! host owns the real clock and reports each native fire through
//! [`Dispatcher::on_host_fire`](crate::Dispatcher::on_host_fire); delivery to
//! the handler always goes through the deferred queue.

use crate::dispatcher::Core;
use crate::types::{CallbackId, Repeat, TimerState};
use std::collections::HashMap;
use std::rc::Weak;

/// Book-keeping for one timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRecord {
    /// Shared with the callback entry
    pub id: CallbackId,
    /// Interval requested from the host (after clamping)
    pub interval_ms: u64,
    /// Requested repeat count
    pub repeat: Repeat,
    /// Fires left before the timer dies (None = unbounded)
    pub remaining: Option<u32>,
    /// Fires delivered so far
    pub fired: u64,
    /// Current lifecycle state
    pub state: TimerState,
}

/// What to do with a host fire notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Unknown, paused or dead timer: drop the fire
    Dropped,
    /// Queue one handler invocation; `last` means the timer just died
    Deliver { last: bool },
}

/// Table of timers keyed by callback id
///
/// Pure state: it never talks to the host or the registry. The dispatcher
/// applies the side effects of each transition.
#[derive(Debug, Default)]
pub struct TimerManager {
    timers: HashMap<CallbackId, TimerRecord>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new running timer. `Repeat::Times(0)` is treated as a single fire.
    pub fn insert(&mut self, id: CallbackId, interval_ms: u64, repeat: Repeat) -> &TimerRecord {
        let repeat = match repeat {
            Repeat::Times(0) => Repeat::Times(1),
            other => other,
        };
        let remaining = match repeat {
            Repeat::Times(n) => Some(n),
            Repeat::Forever => None,
        };
        self.timers.entry(id).or_insert(TimerRecord {
            id,
            interval_ms,
            repeat,
            remaining,
            fired: 0,
            state: TimerState::Running,
        })
    }

    /// Apply one host fire
    pub fn fire(&mut self, id: CallbackId) -> FireOutcome {
        let timer = match self.timers.get_mut(&id) {
            Some(timer) => timer,
            None => return FireOutcome::Dropped,
        };
        if timer.state != TimerState::Running {
            return FireOutcome::Dropped;
        }

        timer.fired += 1;
        if let Some(remaining) = timer.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                timer.state = TimerState::Dead;
                return FireOutcome::Deliver { last: true };
            }
        }
        FireOutcome::Deliver { last: false }
    }

    /// Running -> Paused
    pub fn pause(&mut self, id: CallbackId) -> bool {
        self.transition(id, TimerState::Running, TimerState::Paused)
    }

    /// Paused -> Running
    pub fn resume(&mut self, id: CallbackId) -> bool {
        self.transition(id, TimerState::Paused, TimerState::Running)
    }

    /// Any live state -> Dead; the record is forgotten
    pub fn stop(&mut self, id: CallbackId) -> bool {
        match self.timers.get(&id) {
            Some(timer) if timer.state != TimerState::Dead => {
                self.timers.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Forget a record regardless of state
    pub fn remove(&mut self, id: CallbackId) -> Option<TimerRecord> {
        self.timers.remove(&id)
    }

    pub fn get(&self, id: CallbackId) -> Option<&TimerRecord> {
        self.timers.get(&id)
    }

    /// Unknown timers report `Dead`
    pub fn state(&self, id: CallbackId) -> TimerState {
        self.timers.get(&id).map_or(TimerState::Dead, |t| t.state)
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Ids of timers in the given state, in ascending order
    pub fn ids_in(&self, state: TimerState) -> Vec<CallbackId> {
        let mut ids: Vec<_> = self
            .timers
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn transition(&mut self, id: CallbackId, from: TimerState, to: TimerState) -> bool {
        match self.timers.get_mut(&id) {
            Some(timer) if timer.state == from => {
                timer.state = to;
                true
            }
            _ => false,
        }
    }
}

/// Handle to a started timer
///
/// Holds the dispatcher weakly, so it can be captured inside handlers.
/// Every method is a silent no-op once the dispatcher is gone.
#[derive(Clone)]
pub struct Timer {
    id: CallbackId,
    core: Weak<Core>,
}

impl Timer {
    pub(crate) fn new(id: CallbackId, core: Weak<Core>) -> Self {
        Self { id, core }
    }

    /// The timer's id (also its callback id)
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Stop delivering fires until resumed. False if not running.
    pub fn pause(&self) -> bool {
        self.core.upgrade().map_or(false, |core| core.pause_timer(self.id))
    }

    /// Deliver fires again. False if not paused.
    pub fn resume(&self) -> bool {
        self.core.upgrade().map_or(false, |core| core.resume_timer(self.id))
    }

    /// Kill the timer; already-queued fires become no-ops. False if already dead.
    pub fn stop(&self) -> bool {
        self.core.upgrade().map_or(false, |core| core.stop_timer(self.id))
    }

    pub fn state(&self) -> TimerState {
        self.core
            .upgrade()
            .map_or(TimerState::Dead, |core| core.timer_state(self.id))
    }

    pub fn is_running(&self) -> bool {
        self.state() == TimerState::Running
    }

    /// Snapshot of the timer's record, if it is still tracked
    pub fn record(&self) -> Option<TimerRecord> {
        self.core.upgrade().and_then(|core| core.timer_record(self.id))
    }

    /// Fires left (None = unbounded or no longer tracked)
    pub fn remaining(&self) -> Option<u32> {
        self.record().and_then(|r| r.remaining)
    }

    /// Fires delivered so far (0 once no longer tracked)
    pub fn fired(&self) -> u64 {
        self.record().map_or(0, |r| r.fired)
    }

    /// Interval after clamping to the configured minimum
    pub fn interval_ms(&self) -> Option<u64> {
        self.record().map(|r| r.interval_ms)
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: CallbackId = CallbackId(1);

    #[test]
    fn test_finite_timer_dies_on_last_fire() {
        let mut timers = TimerManager::new();
        timers.insert(T, 100, Repeat::Times(3));

        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: false });
        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: false });
        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: true });
        assert_eq!(timers.state(T), TimerState::Dead);
        assert_eq!(timers.fire(T), FireOutcome::Dropped);
        assert_eq!(timers.get(T).map(|t| (t.fired, t.remaining)), Some((3, Some(0))));
    }

    #[test]
    fn test_paused_fires_are_dropped() {
        let mut timers = TimerManager::new();
        timers.insert(T, 100, Repeat::Times(3));

        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: false });
        assert!(timers.pause(T));
        assert_eq!(timers.fire(T), FireOutcome::Dropped);
        assert!(timers.resume(T));
        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: false });
        assert_eq!(timers.get(T).map(|t| t.remaining), Some(Some(1)));
    }

    #[test]
    fn test_illegal_transitions_are_noops() {
        let mut timers = TimerManager::new();
        timers.insert(T, 100, Repeat::Forever);

        assert!(!timers.resume(T));
        assert!(timers.pause(T));
        assert!(!timers.pause(T));
        assert!(timers.stop(T));
        assert!(!timers.stop(T));
        assert!(!timers.resume(T));
        assert_eq!(timers.state(T), TimerState::Dead);
        assert_eq!(timers.fire(T), FireOutcome::Dropped);
    }

    #[test]
    fn test_unbounded_timer_keeps_running() {
        let mut timers = TimerManager::new();
        timers.insert(T, 10, Repeat::Forever);
        for _ in 0..1000 {
            assert_eq!(timers.fire(T), FireOutcome::Deliver { last: false });
        }
        assert_eq!(timers.state(T), TimerState::Running);
        assert_eq!(timers.get(T).map(|t| t.fired), Some(1000));
    }

    #[test]
    fn test_zero_repeat_fires_once() {
        let mut timers = TimerManager::new();
        timers.insert(T, 10, Repeat::Times(0));
        assert_eq!(timers.fire(T), FireOutcome::Deliver { last: true });
    }

    #[test]
    fn test_ids_in_state() {
        let mut timers = TimerManager::new();
        timers.insert(CallbackId(2), 10, Repeat::Forever);
        timers.insert(CallbackId(1), 10, Repeat::Forever);
        timers.insert(CallbackId(3), 10, Repeat::Forever);
        timers.pause(CallbackId(3));

        assert_eq!(timers.ids_in(TimerState::Running), vec![CallbackId(1), CallbackId(2)]);
        assert_eq!(timers.ids_in(TimerState::Paused), vec![CallbackId(3)]);
        assert_eq!(timers.len(), 3);
    }
}
