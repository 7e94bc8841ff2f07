//! Deferred execution queue
//!
//! A single FIFO of zero-argument tasks. The host pump calls [`DeferredQueue::drain`]
//! once per loop iteration; nothing in the core drives it on its own.
//!
//! `drain` runs a snapshot: whatever was queued when it started. Tasks that
//! schedule more work while running land in the live queue and run on the
//! next drain, which bounds the work done per pump.

use crate::host::LogSink;
use crate::types::panic_message;
use log::Level;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

/// A queued unit of work
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Outcome of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Tasks taken from the snapshot and run
    pub executed: usize,
    /// Tasks that returned an error or panicked
    pub failed: usize,
}

/// FIFO of deferred tasks
#[derive(Default)]
pub struct DeferredQueue {
    tasks: RefCell<VecDeque<Task>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task; never runs it inline
    pub fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    /// Number of tasks waiting for the next drain
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Discard every pending task without running it
    pub fn clear(&self) -> usize {
        let mut tasks = self.tasks.borrow_mut();
        let dropped = tasks.len();
        tasks.clear();
        dropped
    }

    /// Run every task queued before this call, in submission order
    ///
    /// Each failure is reported to `sink` individually and does not stop the
    /// remaining tasks. When `catch_panics` is false a panicking task unwinds
    /// out of `drain`; the unrun tail of the snapshot is lost.
    pub fn drain(&self, sink: &dyn LogSink, catch_panics: bool) -> DrainStats {
        // The borrow ends here so tasks can schedule more work.
        let snapshot = std::mem::take(&mut *self.tasks.borrow_mut());
        let mut stats = DrainStats::default();

        if !snapshot.is_empty() {
            log::trace!("Draining {} deferred task(s)", snapshot.len());
        }

        for task in snapshot {
            stats.executed += 1;
            match run_guarded(catch_panics, task) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    stats.failed += 1;
                    sink.write(Level::Error, &format!("deferred task failed: {:?}", err));
                }
                Err(message) => {
                    stats.failed += 1;
                    sink.write(Level::Error, &format!("deferred task panicked: {}", message));
                }
            }
        }

        stats
    }
}

/// Run `f`, turning a panic into `Err(message)` when `catch_panics` is set
pub(crate) fn run_guarded<T>(catch_panics: bool, f: impl FnOnce() -> T) -> Result<T, String> {
    if !catch_panics {
        return Ok(f());
    }
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemorySink;
    use std::rc::Rc;

    #[test]
    fn test_drain_runs_in_submission_order() {
        let queue = DeferredQueue::new();
        let sink = MemorySink::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let order = order.clone();
            queue.schedule(Box::new(move || {
                order.borrow_mut().push(name);
                Ok(())
            }));
        }

        let stats = queue.drain(&sink, true);
        assert_eq!(stats, DrainStats { executed: 3, failed: 0 });
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_task_scheduled_during_drain_runs_next_time() {
        let queue = Rc::new(DeferredQueue::new());
        let sink = MemorySink::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let queue_inner = queue.clone();
            let order = order.clone();
            queue.schedule(Box::new(move || {
                order.borrow_mut().push("outer");
                let order = order.clone();
                queue_inner.schedule(Box::new(move || {
                    order.borrow_mut().push("inner");
                    Ok(())
                }));
                Ok(())
            }));
        }

        assert_eq!(queue.drain(&sink, true).executed, 1);
        assert_eq!(*order.borrow(), vec!["outer"]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain(&sink, true).executed, 1);
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let queue = DeferredQueue::new();
        let sink = MemorySink::new();
        let ran_last = Rc::new(RefCell::new(false));

        queue.schedule(Box::new(|| -> anyhow::Result<()> { anyhow::bail!("first fails") }));
        queue.schedule(Box::new(|| -> anyhow::Result<()> { panic!("second panics") }));
        {
            let ran_last = ran_last.clone();
            queue.schedule(Box::new(move || {
                *ran_last.borrow_mut() = true;
                Ok(())
            }));
        }

        let stats = queue.drain(&sink, true);
        assert_eq!(stats, DrainStats { executed: 3, failed: 2 });
        assert!(*ran_last.borrow());
        assert_eq!(sink.count(Level::Error), 2);
        assert!(sink.lines()[1].text.contains("second panics"));
    }

    #[test]
    fn test_uncaught_panic_abandons_rest_of_snapshot() {
        let queue = DeferredQueue::new();
        let sink = MemorySink::new();
        let ran_last = Rc::new(RefCell::new(false));

        queue.schedule(Box::new(|| -> anyhow::Result<()> { panic!("not caught") }));
        {
            let ran_last = ran_last.clone();
            queue.schedule(Box::new(move || {
                *ran_last.borrow_mut() = true;
                Ok(())
            }));
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| queue.drain(&sink, false)));
        assert!(outcome.is_err());
        assert!(!*ran_last.borrow());
        assert!(queue.is_empty());
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_clear_discards_pending() {
        let queue = DeferredQueue::new();
        queue.schedule(Box::new(|| Ok(())));
        queue.schedule(Box::new(|| Ok(())));
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.drain(&MemorySink::new(), true), DrainStats::default());
    }
}
