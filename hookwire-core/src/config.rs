//! Dispatcher configuration types
//!
//! The dispatcher exposes a small, fixed set of named options with explicit
//! defaults. Embedders usually build one with the builder methods; the CLI
//! deserializes it from the `[dispatcher]` table of a scenario file.

use crate::types::DispatchMode;
use serde::{Deserialize, Serialize};

/// Configuration for a [`Dispatcher`](crate::Dispatcher)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Whether invocations against unknown ids or dropped owners are logged
    #[serde(default = "default_true")]
    pub log_stale_invocations: bool,

    /// Whether panics raised by handlers are caught and logged (false = propagate)
    ///
    /// Turning this off gives up per-task isolation: a panicking task unwinds
    /// out of `drain`, and the tasks queued behind it in the same drain are
    /// discarded without running. Meant for debugging under a test harness
    /// that wants the original panic.
    #[serde(default = "default_true")]
    pub catch_panics: bool,

    /// Dispatch mode used by `register` when the caller does not pick one
    #[serde(default)]
    pub default_dispatch: DispatchMode,

    /// Smallest interval handed to the host for native timers (default: 1ms)
    #[serde(default = "default_min_timer_interval")]
    pub min_timer_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_timer_interval() -> u64 {
    1
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            log_stale_invocations: true,
            catch_panics: true,
            default_dispatch: DispatchMode::Immediate,
            min_timer_interval_ms: default_min_timer_interval(),
        }
    }
}

impl DispatcherConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: enable or disable stale-invocation warnings
    pub fn with_stale_logging(mut self, enabled: bool) -> Self {
        self.log_stale_invocations = enabled;
        self
    }

    /// Builder method: enable or disable panic capture
    pub fn with_panic_capture(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    /// Builder method: set the default dispatch mode
    pub fn with_default_dispatch(mut self, mode: DispatchMode) -> Self {
        self.default_dispatch = mode;
        self
    }

    /// Builder method: set the minimum native timer interval
    pub fn with_min_timer_interval(mut self, interval_ms: u64) -> Self {
        self.min_timer_interval_ms = interval_ms;
        self
    }

    /// Clamp a requested timer interval to the configured minimum
    pub fn clamp_interval(&self, interval_ms: u64) -> u64 {
        interval_ms.max(self.min_timer_interval_ms)
    }
}
