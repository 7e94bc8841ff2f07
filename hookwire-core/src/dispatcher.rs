//! Dispatcher context
//!
//! The single object an embedder constructs at start-up. It owns the
//! callback registry, the deferred queue, the timer table and the bus-name
//! table, plus the host and log-sink collaborators. Handles given out by it
//! (`Timer`, `Bus`, `Subscription`) refer back to it weakly.
//!
//! No `RefCell` borrow is ever held while user code runs, so every operation
//! may be re-entered from inside a handler, predicate, transform or task.

use crate::bus::{Bus, BusState};
use crate::config::DispatcherConfig;
use crate::deferred::{run_guarded, DeferredQueue, DrainStats, Task};
use crate::host::{Host, LogCrateSink, LogSink, NullHost};
use crate::registry::{CallbackEntry, CallbackRegistry, Handler, RegisterOptions};
use crate::timer::{FireOutcome, Timer, TimerManager, TimerRecord};
use crate::types::{CallbackId, DispatchMode, HookError, Kwargs, Repeat, Result, TimerState, Value};
use log::Level;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) struct Core {
    pub(crate) config: DispatcherConfig,
    host: Rc<dyn Host>,
    sink: Rc<dyn LogSink>,
    registry: RefCell<CallbackRegistry>,
    queue: DeferredQueue,
    timers: RefCell<TimerManager>,
    buses: RefCell<HashMap<String, Rc<BusState>>>,
}

impl Core {
    pub(crate) fn report(&self, level: Level, text: &str) {
        self.sink.write(level, text);
    }

    fn report_error(&self, err: &HookError) {
        if err.is_stale() {
            if self.config.log_stale_invocations {
                self.report(Level::Warn, &err.to_string());
            }
        } else {
            self.report(Level::Error, &err.trace());
        }
    }

    pub(crate) fn register(&self, handler: Handler, options: RegisterOptions) -> CallbackId {
        self.registry
            .borrow_mut()
            .register(handler, options, self.config.default_dispatch)
    }

    /// Releases the entry; a timer id also stops the timer
    pub(crate) fn unregister(&self, id: CallbackId) {
        if self.timers.borrow().contains(id) {
            self.stop_timer(id);
            self.timers.borrow_mut().remove(id);
        }
        self.registry.borrow_mut().unregister(id);
    }

    pub(crate) fn is_registered(&self, id: CallbackId) -> bool {
        self.registry.borrow().contains(id)
    }

    /// Registered and still owned
    pub(crate) fn is_live(&self, id: CallbackId) -> bool {
        self.registry.borrow().resolve(id).is_ok()
    }

    fn call_entry(&self, entry: &CallbackEntry, raw_args: Vec<Value>) -> Result<Value> {
        run_guarded(self.config.catch_panics, || entry.call(raw_args)).map_err(|message| {
            HookError::HandlerPanicked {
                id: entry.id,
                message,
            }
        })?
    }

    fn try_invoke(self: &Rc<Self>, id: CallbackId, raw_args: Vec<Value>) -> Result<Value> {
        let entry = self.registry.borrow().resolve(id)?;
        match entry.dispatch {
            DispatchMode::Immediate => self.call_entry(&entry, raw_args),
            DispatchMode::Deferred => {
                self.schedule_invocation(id, raw_args);
                Ok(Value::Nil)
            }
        }
    }

    fn invoke(self: &Rc<Self>, id: CallbackId, raw_args: Vec<Value>) -> Value {
        match self.try_invoke(id, raw_args) {
            Ok(value) => value,
            Err(err) => {
                self.report_error(&err);
                Value::Nil
            }
        }
    }

    /// Run a queued invocation. Invalidation since scheduling is a quiet no-op;
    /// handler failures go back to the drain loop, which logs them once.
    fn run_queued(&self, id: CallbackId, raw_args: Vec<Value>) -> anyhow::Result<()> {
        let resolved = self.registry.borrow().resolve(id);
        let entry = match resolved {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("Skipping queued call: {}", err);
                return Ok(());
            }
        };
        self.call_entry(&entry, raw_args)?;
        Ok(())
    }

    /// Queue a call to `id` for the next drain
    pub(crate) fn schedule_invocation(self: &Rc<Self>, id: CallbackId, raw_args: Vec<Value>) {
        let core = Rc::downgrade(self);
        self.queue.schedule(Box::new(move || match core.upgrade() {
            Some(core) => core.run_queued(id, raw_args),
            None => Ok(()),
        }));
    }

    fn drain(&self) -> DrainStats {
        self.queue.drain(self.sink.as_ref(), self.config.catch_panics)
    }

    fn start_timer(
        self: &Rc<Self>,
        interval_ms: u64,
        repeat: Repeat,
        handler: Handler,
    ) -> CallbackId {
        let interval_ms = self.config.clamp_interval(interval_ms);
        let id = self.register(
            handler,
            RegisterOptions::new().with_dispatch(DispatchMode::Immediate),
        );
        let repeat = self.timers.borrow_mut().insert(id, interval_ms, repeat).repeat;
        log::debug!("Started timer {} every {}ms ({})", id, interval_ms, repeat);
        self.host.schedule_native_timer(interval_ms, id, repeat);
        id
    }

    fn on_host_fire(self: &Rc<Self>, id: CallbackId) {
        let outcome = self.timers.borrow_mut().fire(id);
        let last = match outcome {
            FireOutcome::Dropped => {
                log::trace!("Dropped fire for timer {}", id);
                return;
            }
            FireOutcome::Deliver { last } => last,
        };

        if last {
            log::debug!("Timer {} exhausted", id);
            self.host.cancel_native_timer(id);
        }

        let core = Rc::downgrade(self);
        let task: Task = Box::new(move || {
            let core = match core.upgrade() {
                Some(core) => core,
                None => return Ok(()),
            };
            let outcome = core.run_queued(id, vec![Value::Integer(id.0 as i64)]);
            if last {
                core.finish_timer(id);
            }
            outcome
        });
        self.queue.schedule(task);
    }

    /// Releases an exhausted timer once its final delivery has run
    fn finish_timer(&self, id: CallbackId) {
        let finished = {
            let mut timers = self.timers.borrow_mut();
            if timers.state(id) == TimerState::Dead {
                timers.remove(id).is_some()
            } else {
                false
            }
        };
        if finished {
            self.registry.borrow_mut().unregister(id);
        }
    }

    pub(crate) fn pause_timer(&self, id: CallbackId) -> bool {
        self.timers.borrow_mut().pause(id)
    }

    /// Resume a paused timer. A finite timer is re-armed with its remaining
    /// count: the host kept counting down while the core dropped paused fires.
    pub(crate) fn resume_timer(&self, id: CallbackId) -> bool {
        let rearm = {
            let mut timers = self.timers.borrow_mut();
            if !timers.resume(id) {
                return false;
            }
            timers
                .get(id)
                .and_then(|t| t.remaining.map(|left| (t.interval_ms, left)))
        };
        if let Some((interval_ms, left)) = rearm {
            log::debug!("Re-arming timer {} for {} remaining fire(s)", id, left);
            self.host.cancel_native_timer(id);
            self.host.schedule_native_timer(interval_ms, id, Repeat::Times(left));
        }
        true
    }

    pub(crate) fn stop_timer(&self, id: CallbackId) -> bool {
        let stopped = self.timers.borrow_mut().stop(id);
        if stopped {
            log::debug!("Stopped timer {}", id);
            self.registry.borrow_mut().unregister(id);
            self.host.cancel_native_timer(id);
        }
        stopped
    }

    pub(crate) fn timer_state(&self, id: CallbackId) -> TimerState {
        self.timers.borrow().state(id)
    }

    pub(crate) fn timer_record(&self, id: CallbackId) -> Option<TimerRecord> {
        self.timers.borrow().get(id).cloned()
    }

    fn named_bus(self: &Rc<Self>, name: &str) -> Bus {
        let state = {
            let mut buses = self.buses.borrow_mut();
            match buses.get(name) {
                Some(state) => Rc::clone(state),
                None => {
                    log::debug!("Created bus '{}'", name);
                    let state = Rc::new(BusState::new(name));
                    buses.insert(name.to_string(), Rc::clone(&state));
                    state
                }
            }
        };
        Bus::new(state, Rc::downgrade(self))
    }
}

/// The event-routing context
///
/// Cheap to clone; clones share the same tables. Not `Send`: everything runs
/// on the host's single thread.
///
/// # Example
///
/// ```
/// use hookwire_core::{Dispatcher, NullHost, Value};
/// use std::rc::Rc;
///
/// let dispatcher = Dispatcher::new(Rc::new(NullHost));
/// let id = dispatcher.register(|args, _| Ok(Value::from(args.len() as i64)));
/// assert_eq!(dispatcher.invoke(id, vec![Value::from(1)]), Value::from(1));
///
/// let bus = dispatcher.named_bus("pluginA");
/// bus.subscribe("ping", |message, _bus| {
///     println!("ping {}", message.payload);
///     Ok(())
/// });
/// bus.post_simple_message("ping", vec![Value::from(1), Value::from(2)]);
/// dispatcher.drain();
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    core: Rc<Core>,
}

impl Dispatcher {
    /// Dispatcher with default configuration, logging through `log`
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_config(DispatcherConfig::default(), host, Rc::new(LogCrateSink))
    }

    /// Dispatcher with no native timer support
    pub fn standalone() -> Self {
        Self::new(Rc::new(NullHost))
    }

    pub fn with_config(
        config: DispatcherConfig,
        host: Rc<dyn Host>,
        sink: Rc<dyn LogSink>,
    ) -> Self {
        log::debug!("Creating dispatcher: {:?}", config);
        Self {
            core: Rc::new(Core {
                config,
                host,
                sink,
                registry: RefCell::new(CallbackRegistry::new()),
                queue: DeferredQueue::new(),
                timers: RefCell::new(TimerManager::new()),
                buses: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core.config
    }

    // ----- callback registry -----

    /// Register a plain function with default options
    pub fn register<F>(&self, handler: F) -> CallbackId
    where
        F: Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + 'static,
    {
        self.core.register(Handler::function(handler), RegisterOptions::new())
    }

    /// Register any handler with explicit options
    pub fn register_with(&self, handler: Handler, options: RegisterOptions) -> CallbackId {
        self.core.register(handler, options)
    }

    /// Release an entry; unknown ids are ignored. Releasing a timer's id stops it.
    pub fn unregister(&self, id: CallbackId) {
        self.core.unregister(id);
    }

    /// Host entry point. Never fails: stale ids and handler failures are
    /// logged and answered with `Value::Nil`.
    pub fn invoke(&self, id: CallbackId, raw_args: Vec<Value>) -> Value {
        self.core.invoke(id, raw_args)
    }

    /// Like [`invoke`](Self::invoke) but hands the failure back instead of logging it
    pub fn try_invoke(&self, id: CallbackId, raw_args: Vec<Value>) -> Result<Value> {
        self.core.try_invoke(id, raw_args)
    }

    pub fn is_registered(&self, id: CallbackId) -> bool {
        self.core.is_registered(id)
    }

    /// Registered and not invalidated by a dropped owner
    pub fn is_live(&self, id: CallbackId) -> bool {
        self.core.is_live(id)
    }

    /// Number of registered entries (timers and subscriptions included)
    pub fn callback_count(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// Release every entry invalidated by a dropped owner
    pub fn purge_dead(&self) -> usize {
        let purged = self.core.registry.borrow_mut().purge_dead();
        if purged > 0 {
            log::debug!("Purged {} dead callback(s)", purged);
        }
        purged
    }

    // ----- deferred queue -----

    /// Queue a task for the next drain
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.core.queue.schedule(Box::new(task));
    }

    /// Host pump: run everything queued before this call
    pub fn drain(&self) -> DrainStats {
        self.core.drain()
    }

    /// Tasks waiting for the next drain
    pub fn pending_tasks(&self) -> usize {
        self.core.queue.len()
    }

    // ----- timers -----

    /// Start a timer; the handler receives the timer id as its only host argument
    pub fn start_timer<F>(&self, interval_ms: u64, repeat: Repeat, handler: F) -> Timer
    where
        F: Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + 'static,
    {
        self.start_timer_with(interval_ms, repeat, Handler::function(handler))
    }

    pub fn start_timer_with(&self, interval_ms: u64, repeat: Repeat, handler: Handler) -> Timer {
        let id = self.core.start_timer(interval_ms, repeat, handler);
        Timer::new(id, Rc::downgrade(&self.core))
    }

    /// Host entry point for native timer notifications
    pub fn on_host_fire(&self, id: CallbackId) {
        self.core.on_host_fire(id);
    }

    /// Handle for a tracked timer
    pub fn timer(&self, id: CallbackId) -> Option<Timer> {
        if self.core.timers.borrow().contains(id) {
            Some(Timer::new(id, Rc::downgrade(&self.core)))
        } else {
            None
        }
    }

    /// Stop every running or paused timer; returns how many were stopped
    pub fn stop_all_timers(&self) -> usize {
        let ids = {
            let timers = self.core.timers.borrow();
            let mut ids = timers.ids_in(TimerState::Running);
            ids.extend(timers.ids_in(TimerState::Paused));
            ids
        };
        ids.into_iter().filter(|id| self.core.stop_timer(*id)).count()
    }

    // ----- message bus -----

    /// Create-or-get the bus called `name`
    pub fn named_bus(&self, name: &str) -> Bus {
        self.core.named_bus(name)
    }

    /// Names of every bus created so far, sorted
    pub fn bus_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.buses.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    // ----- lifecycle -----

    /// Stop all timers and discard pending tasks
    pub fn shutdown(&self) {
        let stopped = self.stop_all_timers();
        let dropped = self.core.queue.clear();

        // Exhausted timers whose final delivery was discarded above.
        let leftovers = self.core.timers.borrow().ids_in(TimerState::Dead);
        for id in leftovers {
            self.core.finish_timer(id);
        }

        log::info!(
            "Dispatcher shut down: {} timer(s) stopped, {} pending task(s) discarded",
            stopped,
            dropped
        );
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.core.registry.borrow().len())
            .field("pending_tasks", &self.core.queue.len())
            .field("timers", &self.core.timers.borrow().len())
            .field("buses", &self.core.buses.borrow().len())
            .finish()
    }
}
