//! Scenario runner
//!
//! Plays the host's role against a real [`Dispatcher`]: registers the
//! scenario's handlers, timers and subscriptions, then executes each step,
//! pumping the deferred queue the way an embedding event loop would.

use crate::config::{AppConfig, HandlerConfig, HandlerKind, Step};
use crate::host::SimulatedHost;
use hookwire_core::{
    Bus, CallbackId, Dispatcher, Handler, MemorySink, Message, RegisterOptions, Subscription,
    Timer, Value,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Errors raised while wiring up or running a scenario
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("unknown timer '{0}'")]
    UnknownTimer(String),

    #[error("unknown subscription '{0}'")]
    UnknownSubscription(String),

    #[error("unknown owner '{0}'")]
    UnknownOwner(String),
}

/// Call statistics for one scenario handler
#[derive(Debug, Clone, Default)]
pub struct HandlerStats {
    pub calls: u32,
    pub last_args: Vec<Value>,
}

/// Totals accumulated over all pumps
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpTotals {
    pub drains: usize,
    pub executed: usize,
    pub failed: usize,
}

/// Stand-in for a UI component that owns callbacks
#[derive(Debug)]
pub struct Owner {
    pub name: String,
}

type Behavior = Rc<dyn Fn(&[Value]) -> anyhow::Result<Value>>;

pub struct ScenarioRunner {
    config: AppConfig,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) host: Rc<SimulatedHost>,
    pub(crate) sink: Rc<MemorySink>,
    pub(crate) stats: Rc<RefCell<BTreeMap<String, HandlerStats>>>,
    pub(crate) timer_deliveries: Rc<RefCell<BTreeMap<String, u32>>>,
    pub(crate) handler_ids: BTreeMap<String, CallbackId>,
    pub(crate) timers: BTreeMap<String, Timer>,
    subscriptions: HashMap<String, Subscription>,
    behaviors: HashMap<String, Behavior>,
    owners: HashMap<String, Rc<Owner>>,
    pub(crate) totals: PumpTotals,
    pub(crate) steps_run: usize,
}

impl ScenarioRunner {
    /// Build the dispatcher and register everything the scenario declares
    pub fn new(config: AppConfig) -> Result<Self, ScenarioError> {
        let host = Rc::new(SimulatedHost::new());
        let sink = Rc::new(MemorySink::new());
        let dispatcher =
            Dispatcher::with_config(config.dispatcher.clone(), host.clone(), sink.clone());

        let mut runner = Self {
            config,
            dispatcher,
            host,
            sink,
            stats: Rc::new(RefCell::new(BTreeMap::new())),
            timer_deliveries: Rc::new(RefCell::new(BTreeMap::new())),
            handler_ids: BTreeMap::new(),
            timers: BTreeMap::new(),
            subscriptions: HashMap::new(),
            behaviors: HashMap::new(),
            owners: HashMap::new(),
            totals: PumpTotals::default(),
            steps_run: 0,
        };
        runner.register_all()?;
        Ok(runner)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn register_all(&mut self) -> Result<(), ScenarioError> {
        let handlers = self.config.handlers.clone();
        for handler in &handlers {
            let behavior = self.make_behavior(handler);
            self.behaviors.insert(handler.name.clone(), behavior.clone());

            let mut options = RegisterOptions::new().with_args(handler.args.clone());
            if let Some(mode) = handler.dispatch {
                options = options.with_dispatch(mode);
            }
            if let Some(owner) = &handler.owner {
                let owner = self.owner(owner);
                options = options.with_owner(&owner);
            }

            let id = self.dispatcher.register_with(
                Handler::function(move |args, _| behavior(args)),
                options,
            );
            log::info!("Registered handler '{}' as {}", handler.name, id);
            self.handler_ids.insert(handler.name.clone(), id);
        }

        let timers = self.config.timers.clone();
        for timer in &timers {
            let behavior = self.behavior(&timer.handler)?;
            let deliveries = self.timer_deliveries.clone();
            let name = timer.name.clone();
            let started = self
                .dispatcher
                .start_timer(timer.interval_ms, timer.repeat(), move |args, _| {
                    *deliveries.borrow_mut().entry(name.clone()).or_default() += 1;
                    behavior(args)
                });
            log::info!("Started timer '{}' as {}", timer.name, started.id());
            self.timers.insert(timer.name.clone(), started);
        }

        let subscriptions = self.config.subscriptions.clone();
        for sub in &subscriptions {
            let behavior = self.behavior(&sub.handler)?;
            let bus = self.dispatcher.named_bus(&sub.bus);
            let callback = move |message: &Message, _bus: &Bus| behavior(message.args()).map(drop);
            let subscription = match sub.when_first_arg.clone() {
                Some(expected) => bus.subscribe_filtered(
                    &sub.message,
                    move |message| message.args().first() == Some(&expected),
                    callback,
                ),
                None => bus.subscribe(&sub.message, callback),
            };
            log::info!(
                "Subscribed '{}' to {}/{} as {}",
                sub.name,
                sub.bus,
                sub.message,
                subscription.id()
            );
            self.subscriptions.insert(sub.name.clone(), subscription);
        }

        Ok(())
    }

    fn owner(&mut self, name: &str) -> Rc<Owner> {
        self.owners
            .entry(name.to_string())
            .or_insert_with(|| {
                Rc::new(Owner {
                    name: name.to_string(),
                })
            })
            .clone()
    }

    fn behavior(&self, handler: &str) -> Result<Behavior, ScenarioError> {
        self.behaviors
            .get(handler)
            .cloned()
            .ok_or_else(|| ScenarioError::UnknownHandler(handler.to_string()))
    }

    fn make_behavior(&self, handler: &HandlerConfig) -> Behavior {
        let name = handler.name.clone();
        let kind = handler.kind;
        let stats = self.stats.clone();
        let relay = handler
            .relay
            .as_ref()
            .map(|relay| (self.dispatcher.named_bus(&relay.bus), relay.message.clone()));

        Rc::new(move |args: &[Value]| {
            {
                let mut stats = stats.borrow_mut();
                let entry = stats.entry(name.clone()).or_default();
                entry.calls += 1;
                entry.last_args = args.to_vec();
            }
            log::info!("handler '{}' called with {}", name, Value::List(args.to_vec()));

            match kind {
                HandlerKind::Record => {}
                HandlerKind::Fail => anyhow::bail!("handler '{}' failed on purpose", name),
                HandlerKind::Panic => panic!("handler '{}' panicked on purpose", name),
            }
            if let Some((bus, message)) = &relay {
                bus.post_simple_message(message, args.to_vec());
            }
            Ok(Value::from(args.len() as i64))
        })
    }

    fn handler_id(&self, name: &str) -> Result<CallbackId, ScenarioError> {
        self.handler_ids
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownHandler(name.to_string()))
    }

    fn timer(&self, name: &str) -> Result<&Timer, ScenarioError> {
        self.timers
            .get(name)
            .ok_or_else(|| ScenarioError::UnknownTimer(name.to_string()))
    }

    /// One host pump
    fn pump(&mut self) {
        let stats = self.dispatcher.drain();
        self.totals.drains += 1;
        self.totals.executed += stats.executed;
        self.totals.failed += stats.failed;
    }

    fn maybe_pump(&mut self) {
        if self.config.host.auto_pump {
            self.pump();
        }
    }

    /// Move the clock forward tick by tick, firing due timers and pumping after each tick
    fn advance(&mut self, ms: u64) {
        let target = self.host.now_ms() + ms;
        while self.host.now_ms() < target {
            let next = (self.host.now_ms() + self.config.host.tick_ms).min(target);
            for id in self.host.advance_to(next) {
                self.dispatcher.on_host_fire(id);
            }
            self.maybe_pump();
        }
    }

    /// Execute a single step
    pub fn run_step(&mut self, step: &Step) -> Result<(), ScenarioError> {
        log::debug!("t={}ms step: {:?}", self.host.now_ms(), step);
        match step {
            Step::Invoke { handler, args } => {
                let id = self.handler_id(handler)?;
                let result = self.dispatcher.invoke(id, args.clone());
                log::info!("invoke '{}' -> {}", handler, result);
            }
            Step::InvokeId { id, args } => {
                let result = self.dispatcher.invoke(CallbackId(*id), args.clone());
                log::info!("invoke {} -> {}", CallbackId(*id), result);
            }
            Step::Advance { ms } => {
                self.advance(*ms);
                self.steps_run += 1;
                return Ok(());
            }
            Step::Fire { timer } => {
                let id = self.timer(timer)?.id();
                self.dispatcher.on_host_fire(id);
            }
            Step::Pause { timer } => {
                let paused = self.timer(timer)?.pause();
                log::info!("pause '{}' -> {}", timer, paused);
            }
            Step::Resume { timer } => {
                let resumed = self.timer(timer)?.resume();
                log::info!("resume '{}' -> {}", timer, resumed);
            }
            Step::Stop { timer } => {
                let stopped = self.timer(timer)?.stop();
                log::info!("stop '{}' -> {}", timer, stopped);
            }
            Step::Post { bus, message, args } => {
                self.dispatcher
                    .named_bus(bus)
                    .post_simple_message(message, args.clone());
            }
            Step::Unsubscribe { subscription } => {
                self.subscriptions
                    .get(subscription)
                    .ok_or_else(|| ScenarioError::UnknownSubscription(subscription.clone()))?
                    .unsubscribe();
            }
            Step::Unregister { handler } => {
                let id = self.handler_id(handler)?;
                self.dispatcher.unregister(id);
            }
            Step::DestroyOwner { owner } => {
                let removed = self
                    .owners
                    .remove(owner)
                    .ok_or_else(|| ScenarioError::UnknownOwner(owner.clone()))?;
                log::info!("destroyed owner '{}'", removed.name);
            }
            Step::Drain => {
                self.pump();
                self.steps_run += 1;
                return Ok(());
            }
        }
        self.steps_run += 1;
        self.maybe_pump();
        Ok(())
    }

    /// Execute every step in order
    pub fn run(&mut self) -> Result<(), ScenarioError> {
        let steps = self.config.steps.clone();
        for step in &steps {
            self.run_step(step)?;
        }
        Ok(())
    }

    /// Stop timers and discard anything still queued
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    pub fn timer_deliveries(&self, name: &str) -> u32 {
        self.timer_deliveries.borrow().get(name).copied().unwrap_or(0)
    }

    pub fn handler_stats(&self, name: &str) -> HandlerStats {
        self.stats.borrow().get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwire_core::TimerState;
    use log::Level;

    fn runner(toml_text: &str) -> ScenarioRunner {
        let config: AppConfig = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        ScenarioRunner::new(config).unwrap()
    }

    #[test]
    fn test_timer_fires_on_simulated_clock() {
        let mut runner = runner(
            r#"
            [[handlers]]
            name = "tick"

            [[timers]]
            name = "heartbeat"
            handler = "tick"
            interval_ms = 100
            repeat = 3

            [[steps]]
            action = "advance"
            ms = 1000
            "#,
        );
        let timer = runner.timers["heartbeat"].clone();
        let step = runner.config().steps[0].clone();
        runner.run_step(&step).unwrap();

        assert_eq!(runner.handler_stats("tick").calls, 3);
        assert_eq!(timer.state(), TimerState::Dead);
        assert_eq!(runner.host.armed(), 0);
    }

    #[test]
    fn test_paused_finite_timer_still_exhausts() {
        let mut runner = runner(
            r#"
            [[handlers]]
            name = "tick"

            [[timers]]
            name = "heartbeat"
            handler = "tick"
            interval_ms = 100
            repeat = 3

            [[steps]]
            action = "advance"
            ms = 100

            [[steps]]
            action = "pause"
            timer = "heartbeat"

            [[steps]]
            action = "advance"
            ms = 100

            [[steps]]
            action = "resume"
            timer = "heartbeat"

            [[steps]]
            action = "advance"
            ms = 10000
            "#,
        );
        let id = runner.timers["heartbeat"].id();
        runner.run().unwrap();

        // The fire at 200ms hit the pause; resume re-armed the host for the last two.
        assert_eq!(runner.handler_stats("tick").calls, 3);
        assert_eq!(runner.timer_deliveries("heartbeat"), 3);
        assert_eq!(runner.timers["heartbeat"].state(), TimerState::Dead);
        assert!(!runner.dispatcher.is_registered(id));
        assert_eq!(runner.host.armed(), 0);
        assert_eq!(runner.host.requests(), (2, 2));
    }

    #[test]
    fn test_bus_relay_and_failures() {
        let mut runner = runner(
            r#"
            [[handlers]]
            name = "forward"
            relay = { bus = "pluginA", message = "pong" }

            [[handlers]]
            name = "broken"
            kind = "fail"

            [[handlers]]
            name = "sink"

            [[subscriptions]]
            name = "ping-forward"
            bus = "pluginA"
            message = "ping"
            handler = "forward"

            [[subscriptions]]
            name = "ping-broken"
            bus = "pluginA"
            message = "ping"
            handler = "broken"

            [[subscriptions]]
            name = "pong-sink"
            bus = "pluginA"
            message = "pong"
            handler = "sink"
            when_first_arg = 1

            [[steps]]
            action = "post"
            bus = "pluginA"
            message = "ping"
            args = [1, 2, 3]

            [[steps]]
            action = "drain"
            "#,
        );
        runner.run().unwrap();

        assert_eq!(runner.handler_stats("forward").calls, 1);
        assert_eq!(runner.handler_stats("broken").calls, 1);
        assert_eq!(
            runner.handler_stats("sink").last_args,
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
        assert_eq!(runner.totals.failed, 1);
        assert_eq!(runner.sink.count(Level::Error), 1);
    }

    #[test]
    fn test_destroyed_owner_and_stale_ids() {
        let mut runner = runner(
            r#"
            [[handlers]]
            name = "on-close"
            owner = "popup"

            [[steps]]
            action = "invoke"
            handler = "on-close"

            [[steps]]
            action = "destroy_owner"
            owner = "popup"

            [[steps]]
            action = "invoke"
            handler = "on-close"

            [[steps]]
            action = "invoke_id"
            id = 999
            "#,
        );
        runner.run().unwrap();

        assert_eq!(runner.handler_stats("on-close").calls, 1);
        assert_eq!(runner.sink.count(Level::Warn), 2);
    }

    #[test]
    fn test_bundled_demo_scenario_runs() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/demo.toml");
        let config = crate::config::load_config(&path).unwrap();
        let mut runner = ScenarioRunner::new(config).unwrap();
        runner.run().unwrap();

        // Fires at 100 and 200ms, then 500ms after the resume; 300 and 400 hit the pause.
        assert_eq!(runner.timer_deliveries("heartbeat"), 3);
        assert_eq!(runner.handler_stats("popup-closed").calls, 1);
        assert_eq!(runner.handler_stats("ping-responder").calls, 2);
        assert_eq!(runner.handler_stats("pong-logger").calls, 1);
        assert_eq!(runner.handler_stats("late-save").last_args, vec![Value::from("draft")]);
        assert_eq!(runner.timers["heartbeat"].state(), TimerState::Dead);
    }

    #[test]
    fn test_unknown_owner_is_an_error() {
        let mut runner = runner("");
        let err = runner
            .run_step(&Step::DestroyOwner {
                owner: "ghost".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ScenarioError::UnknownOwner(_)));
    }
}
