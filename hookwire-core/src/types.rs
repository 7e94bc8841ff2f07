//! Core types for the hookwire dispatch library
//!
//! This module defines the values that cross the host boundary, the
//! identifiers the host uses to call back into the core, and the error type
//! reported for stale references and failing handlers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, HookError>;

/// Keyword arguments bound to a callback entry
pub type Kwargs = BTreeMap<String, Value>;

/// Host-visible identifier of a registered callback
///
/// Timers share this id space: a timer's id is the id of the callback entry
/// wrapping its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(pub u64);

impl CallbackId {
    /// Never issued by the registry
    pub const NONE: CallbackId = CallbackId(0);
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A dynamically typed value in the host's native representation
///
/// `Value::Nil` doubles as the benign neutral result returned to the host
/// whenever an invocation could not (or did not) produce anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value
    #[default]
    Nil,
    /// Boolean value
    Bool(bool),
    /// Signed integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered sequence of values
    List(Vec<Value>),
    /// String-keyed table of values
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// True for `Value::Nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Interpret this value as an integer if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Borrow the string contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the list contents, if this is a list
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Host truthiness: nil, false, zero and empty containers are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(v) => *v,
            Value::Integer(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:.3}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// How an entry is run when the host invokes it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Call the handler inline, inside the host's invocation
    #[default]
    Immediate,
    /// Queue the call and run it on the next drain
    Deferred,
}

/// How many times a timer fires before it dies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    /// Fire a finite number of times
    Times(u32),
    /// Fire until explicitly stopped
    Forever,
}

impl Repeat {
    /// Build from a host-style count where zero or a negative value means unbounded
    pub fn from_count(count: i64) -> Self {
        if count <= 0 {
            Repeat::Forever
        } else {
            Repeat::Times(u32::try_from(count).unwrap_or(u32::MAX))
        }
    }
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repeat::Times(n) => write!(f, "{}x", n),
            Repeat::Forever => write!(f, "forever"),
        }
    }
}

/// Lifecycle state of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    /// Host fires are delivered
    Running,
    /// Host fires are dropped
    Paused,
    /// Terminal; nothing is delivered any more
    Dead,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::Running => write!(f, "Running"),
            TimerState::Paused => write!(f, "Paused"),
            TimerState::Dead => write!(f, "Dead"),
        }
    }
}

/// Errors that can occur while resolving or running a callback
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("no callback registered for id {0}")]
    UnknownCallback(CallbackId),

    #[error("owner of callback {0} has been dropped")]
    OwnerDropped(CallbackId),

    #[error("argument transform for callback {id} failed")]
    TransformFailed {
        id: CallbackId,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler for callback {id} failed")]
    HandlerFailed {
        id: CallbackId,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler for callback {id} panicked: {message}")]
    HandlerPanicked { id: CallbackId, message: String },

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("invalid message arguments: {0}")]
    InvalidMessage(String),
}

impl HookError {
    /// True for stale references: an unknown id or a dropped owner
    pub fn is_stale(&self) -> bool {
        matches!(self, HookError::UnknownCallback(_) | HookError::OwnerDropped(_))
    }

    /// Render the error together with its full chain of causes
    pub fn trace(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str("\n  caused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
