//! Scenario configuration loading and parsing

use anyhow::{Context, Result};
use hookwire_core::{DispatchMode, DispatcherConfig, Repeat, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A complete scenario (loaded from a .toml file)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
    #[serde(default)]
    pub timers: Vec<TimerConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// How the simulated host drives the dispatcher
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Drain the deferred queue after every step and every clock tick
    #[serde(default = "default_true")]
    pub auto_pump: bool,
    /// Granularity of the simulated clock
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            auto_pump: true,
            tick_ms: default_tick(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tick() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Record the call and succeed
    #[default]
    Record,
    /// Record the call and return an error
    Fail,
    /// Record the call and panic
    Panic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerConfig {
    pub name: String,
    #[serde(default)]
    pub kind: HandlerKind,
    /// Prebound positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub dispatch: Option<DispatchMode>,
    /// Named owner; the handler dies with it
    pub owner: Option<String>,
    /// Re-post the call arguments as a message after running
    pub relay: Option<RelayConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub bus: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimerConfig {
    pub name: String,
    pub handler: String,
    pub interval_ms: u64,
    /// Number of fires; zero or negative means unbounded
    #[serde(default)]
    pub repeat: i64,
}

impl TimerConfig {
    pub fn repeat(&self) -> Repeat {
        Repeat::from_count(self.repeat)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub name: String,
    pub bus: String,
    pub message: String,
    pub handler: String,
    /// Only accept messages whose first argument equals this value
    pub when_first_arg: Option<Value>,
}

/// One scripted host action
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Host calls a named handler by its id
    Invoke {
        handler: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Host calls a raw id (may be stale)
    InvokeId {
        id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Move the simulated clock forward, firing due timers
    Advance { ms: u64 },
    /// Deliver one native fire regardless of the clock
    Fire { timer: String },
    Pause { timer: String },
    Resume { timer: String },
    Stop { timer: String },
    Post {
        bus: String,
        message: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Unsubscribe { subscription: String },
    Unregister { handler: String },
    /// Drop a named owner object
    DestroyOwner { owner: String },
    /// Explicit host pump
    Drain,
}

impl AppConfig {
    /// Check that every cross-reference in the scenario resolves
    pub fn validate(&self) -> Result<()> {
        let handlers: HashSet<&str> = self.handlers.iter().map(|h| h.name.as_str()).collect();
        let timers: HashSet<&str> = self.timers.iter().map(|t| t.name.as_str()).collect();
        let subscriptions: HashSet<&str> =
            self.subscriptions.iter().map(|s| s.name.as_str()).collect();

        if handlers.len() != self.handlers.len() {
            anyhow::bail!("Duplicate handler names in scenario");
        }
        for timer in &self.timers {
            if !handlers.contains(timer.handler.as_str()) {
                anyhow::bail!("Timer '{}' uses unknown handler '{}'", timer.name, timer.handler);
            }
        }
        for sub in &self.subscriptions {
            if !handlers.contains(sub.handler.as_str()) {
                anyhow::bail!("Subscription '{}' uses unknown handler '{}'", sub.name, sub.handler);
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            let missing = match step {
                Step::Invoke { handler, .. } | Step::Unregister { handler } => {
                    (!handlers.contains(handler.as_str())).then(|| format!("handler '{}'", handler))
                }
                Step::Fire { timer }
                | Step::Pause { timer }
                | Step::Resume { timer }
                | Step::Stop { timer } => {
                    (!timers.contains(timer.as_str())).then(|| format!("timer '{}'", timer))
                }
                Step::Unsubscribe { subscription } => (!subscriptions
                    .contains(subscription.as_str()))
                .then(|| format!("subscription '{}'", subscription)),
                _ => None,
            };
            if let Some(what) = missing {
                anyhow::bail!("Step {} refers to unknown {}", index + 1, what);
            }
        }
        if self.host.tick_ms == 0 {
            anyhow::bail!("host.tick_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Load a scenario from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse scenario file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid scenario: {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCENARIO: &str = r#"
        name = "heartbeat"

        [dispatcher]
        default_dispatch = "deferred"

        [[handlers]]
        name = "tick"
        args = ["pre", 1]

        [[handlers]]
        name = "broken"
        kind = "fail"

        [[timers]]
        name = "heartbeat"
        handler = "tick"
        interval_ms = 100
        repeat = 3

        [[subscriptions]]
        name = "ping-sub"
        bus = "pluginA"
        message = "ping"
        handler = "broken"
        when_first_arg = 1

        [[steps]]
        action = "advance"
        ms = 250

        [[steps]]
        action = "post"
        bus = "pluginA"
        message = "ping"
        args = [1, 2, 3]

        [[steps]]
        action = "drain"
    "#;

    #[test]
    fn test_config_deserialization() {
        let config: AppConfig = toml::from_str(SCENARIO).unwrap();
        assert_eq!(config.name.as_deref(), Some("heartbeat"));
        assert_eq!(config.dispatcher.default_dispatch, DispatchMode::Deferred);
        assert!(config.dispatcher.catch_panics);
        assert!(config.host.auto_pump);
        assert_eq!(config.handlers[0].args, vec![Value::from("pre"), Value::from(1)]);
        assert_eq!(config.handlers[1].kind, HandlerKind::Fail);
        assert_eq!(config.timers[0].repeat(), Repeat::Times(3));
        assert_eq!(config.subscriptions[0].when_first_arg, Some(Value::from(1)));
        assert_eq!(config.steps.len(), 3);
        assert!(matches!(config.steps[1], Step::Post { ref args, .. } if args.len() == 3));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_catches_unknown_references() {
        let mut config: AppConfig = toml::from_str(SCENARIO).unwrap();
        config.steps.push(Step::Pause {
            timer: "nope".to_string(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timer 'nope'"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.timers.len(), 1);
    }

    #[test]
    fn test_load_config_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[steps]]\naction = \"teleport\"\n").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse scenario file"));
    }
}
