//! Simulated host
//!
//! Stands in for the embedding application: keeps a millisecond clock and a
//! table of native repeating timers, and reports which timers are due as the
//! clock advances. The runner turns those into `on_host_fire` calls.

use hookwire_core::{CallbackId, Host, Repeat};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct NativeTimer {
    interval_ms: u64,
    next_due_ms: u64,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
pub struct SimulatedHost {
    now_ms: Cell<u64>,
    timers: RefCell<BTreeMap<CallbackId, NativeTimer>>,
    scheduled: Cell<usize>,
    cancelled: Cell<usize>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    /// Native timers still armed
    pub fn armed(&self) -> usize {
        self.timers.borrow().len()
    }

    /// (schedule requests, cancel requests) seen so far
    pub fn requests(&self) -> (usize, usize) {
        (self.scheduled.get(), self.cancelled.get())
    }

    /// Move the clock to `now_ms` and return the fires that became due, in order
    ///
    /// A timer that fell several intervals behind fires once per missed interval.
    pub fn advance_to(&self, now_ms: u64) -> Vec<CallbackId> {
        self.now_ms.set(now_ms);
        let mut due: Vec<(u64, CallbackId)> = Vec::new();
        let mut timers = self.timers.borrow_mut();

        for (id, timer) in timers.iter_mut() {
            while timer.next_due_ms <= now_ms && timer.remaining != Some(0) {
                due.push((timer.next_due_ms, *id));
                timer.next_due_ms += timer.interval_ms;
                if let Some(remaining) = timer.remaining.as_mut() {
                    *remaining -= 1;
                }
            }
        }
        timers.retain(|_, timer| timer.remaining != Some(0));

        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }
}

impl Host for SimulatedHost {
    fn schedule_native_timer(&self, interval_ms: u64, id: CallbackId, repeat: Repeat) {
        log::debug!(
            "host: arming timer {} every {}ms ({}) at t={}ms",
            id,
            interval_ms,
            repeat,
            self.now_ms()
        );
        self.scheduled.set(self.scheduled.get() + 1);
        let remaining = match repeat {
            Repeat::Times(n) => Some(n),
            Repeat::Forever => None,
        };
        self.timers.borrow_mut().insert(
            id,
            NativeTimer {
                interval_ms: interval_ms.max(1),
                next_due_ms: self.now_ms() + interval_ms.max(1),
                remaining,
            },
        );
    }

    fn cancel_native_timer(&self, id: CallbackId) {
        log::debug!("host: cancelling timer {} at t={}ms", id, self.now_ms());
        self.cancelled.set(self.cancelled.get() + 1);
        self.timers.borrow_mut().remove(&id);
    }
}
