//! Host boundary
//!
//! The embedding application owns the real event loop. The core only needs
//! two things from it: a way to arrange (and cancel) native repeating timer
//! notifications, and somewhere to write failure text.

use crate::types::{CallbackId, Repeat};
use log::Level;
use std::cell::RefCell;

/// Native timer services provided by the embedding host
///
/// The host is expected to call [`Dispatcher::on_host_fire`](crate::Dispatcher::on_host_fire)
/// with `id` every `interval_ms` until the timer is cancelled.
pub trait Host {
    /// Start native notifications for the timer `id`
    fn schedule_native_timer(&self, interval_ms: u64, id: CallbackId, repeat: Repeat);

    /// Stop native notifications for the timer `id`
    fn cancel_native_timer(&self, id: CallbackId);
}

/// A host without native timers; timers only advance when fired by hand
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn schedule_native_timer(&self, interval_ms: u64, id: CallbackId, repeat: Repeat) {
        log::trace!("NullHost ignoring timer {} ({}ms, {})", id, interval_ms, repeat);
    }

    fn cancel_native_timer(&self, id: CallbackId) {
        log::trace!("NullHost ignoring cancel for timer {}", id);
    }
}

/// Destination for formatted failure text
pub trait LogSink {
    /// Write one formatted report
    fn write(&self, level: Level, text: &str);
}

/// Default sink: forwards everything to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn write(&self, level: Level, text: &str) {
        log::log!(target: "hookwire", level, "{}", text);
    }
}

/// A single line captured by [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Sink that keeps every report in memory and also forwards it to `log`
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: RefCell<Vec<LogLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured lines, oldest first
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.borrow().clone()
    }

    /// Number of captured lines at exactly `level`
    pub fn count(&self, level: Level) -> usize {
        self.lines.borrow().iter().filter(|l| l.level == level).count()
    }

    /// Drop all captured lines
    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl LogSink for MemorySink {
    fn write(&self, level: Level, text: &str) {
        LogCrateSink.write(level, text);
        self.lines.borrow_mut().push(LogLine {
            level,
            text: text.to_string(),
        });
    }
}
