//! hookwire core library
//!
//! An event-routing core for embedding inside a host application that owns a
//! single-threaded, synchronous event loop. The host calls registered
//! handlers back through opaque numeric ids; this library keeps the id table,
//! invalidates handlers whose owner has gone away, defers work onto a FIFO
//! queue the host drains, runs timer state machines, and provides named
//! publish/subscribe buses on top of the same queue.
//!
//! # Architecture
//!
//! - [`CallbackRegistry`]: id → entry table with weak-owner invalidation
//! - [`DeferredQueue`]: snapshot-drained FIFO of tasks
//! - [`TimerManager`]: Running/Paused/Dead state per timer
//! - [`Bus`]: named pub/sub, delivery through the deferred queue
//!
//! All four live inside one [`Dispatcher`], constructed once by the embedder
//! and cloned wherever registration happens.
//!
//! The library does NOT:
//! - Spawn threads or timers of its own (the host pumps [`Dispatcher::drain`])
//! - Persist anything across restarts
//! - Let a failing handler escape into the host's loop
//!
//! # Example Usage
//!
//! ```
//! use hookwire_core::{Dispatcher, Repeat, TimerState, Value};
//!
//! let dispatcher = Dispatcher::standalone();
//!
//! // The host would normally deliver these fires on its own clock.
//! let timer = dispatcher.start_timer(100, Repeat::Times(2), |_args, _| Ok(Value::Nil));
//! dispatcher.on_host_fire(timer.id());
//! dispatcher.on_host_fire(timer.id());
//! assert_eq!(timer.state(), TimerState::Dead);
//!
//! // Both deliveries run on the next pump.
//! assert_eq!(dispatcher.drain().executed, 2);
//! ```

// Public modules
pub mod bus;
pub mod config;
pub mod deferred;
pub mod dispatcher;
pub mod host;
pub mod registry;
pub mod timer;
pub mod types;

// Re-export main types for convenience
pub use bus::{Bus, Message, Subscription};
pub use config::DispatcherConfig;
pub use deferred::{DeferredQueue, DrainStats};
pub use dispatcher::Dispatcher;
pub use host::{Host, LogCrateSink, LogLine, LogSink, MemorySink, NullHost};
pub use registry::{CallbackEntry, CallbackRegistry, Handler, MethodTarget, RegisterOptions};
pub use timer::{Timer, TimerManager, TimerRecord};
pub use types::{CallbackId, DispatchMode, HookError, Kwargs, Repeat, Result, TimerState, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: a fresh dispatcher has nothing registered or queued
        let dispatcher = Dispatcher::standalone();
        assert_eq!(dispatcher.callback_count(), 0);
        assert_eq!(dispatcher.pending_tasks(), 0);
        assert!(dispatcher.bus_names().is_empty());
    }
}
