//! Callback registry
//!
//! An arena-style table from [`CallbackId`] to [`CallbackEntry`]. Entries
//! never keep their owner alive: ownership is expressed as a weak
//! back-reference that is checked every time the entry is resolved, so an
//! owner can disappear at any point between registration and invocation.

use crate::types::{CallbackId, DispatchMode, HookError, Kwargs, Result, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Signature of a plain callback function
pub type HandlerFn = dyn Fn(&[Value], &Kwargs) -> anyhow::Result<Value>;

/// Converts raw host arguments into the values a handler expects
pub type ArgTransform = dyn Fn(Vec<Value>) -> anyhow::Result<Vec<Value>>;

/// An object whose methods can be bound by name
///
/// Bound methods hold their target weakly, which is how UI components hand
/// out callbacks without the registry keeping them alive.
pub trait MethodTarget {
    fn call_method(&self, method: &str, args: &[Value], kwargs: &Kwargs) -> anyhow::Result<Value>;
}

/// The callable part of an entry
#[derive(Clone)]
pub enum Handler {
    /// A strongly held function
    Function(Rc<HandlerFn>),
    /// A method bound by name on a weakly held target
    Method {
        target: Weak<dyn MethodTarget>,
        method: String,
    },
}

impl Handler {
    /// Wrap a closure
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + 'static,
    {
        Handler::Function(Rc::new(f))
    }

    /// Bind `method` on `target` without keeping `target` alive
    pub fn method<T: MethodTarget + 'static>(target: &Rc<T>, method: impl Into<String>) -> Self {
        let weak: Weak<T> = Rc::downgrade(target);
        Handler::Method {
            target: weak,
            method: method.into(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Handler::Function(_) => true,
            Handler::Method { target, .. } => target.strong_count() > 0,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Function(_) => write!(f, "Function(..)"),
            Handler::Method { method, .. } => write!(f, "Method({})", method),
        }
    }
}

/// Optional parts of a registration
#[derive(Clone, Default)]
pub struct RegisterOptions {
    /// Positional arguments placed before the host-supplied ones
    pub prebound_args: Vec<Value>,
    /// Keyword arguments passed on every call
    pub prebound_kwargs: Kwargs,
    /// Entry is invalid once this owner is dropped
    pub owner: Option<Weak<dyn Any>>,
    /// Applied to raw host arguments before merging
    pub transform: Option<Rc<ArgTransform>>,
    /// Overrides the dispatcher's default dispatch mode
    pub dispatch: Option<DispatchMode>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: prebind positional arguments
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.prebound_args = args;
        self
    }

    /// Builder method: prebind a keyword argument
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.prebound_kwargs.insert(key.into(), value.into());
        self
    }

    /// Builder method: tie the entry's lifetime to `owner`
    pub fn with_owner<T: Any>(mut self, owner: &Rc<T>) -> Self {
        let weak: Weak<T> = Rc::downgrade(owner);
        self.owner = Some(weak);
        self
    }

    /// Builder method: set the raw argument transform
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Vec<Value>> + 'static,
    {
        self.transform = Some(Rc::new(transform));
        self
    }

    /// Builder method: pick the dispatch mode
    pub fn with_dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = Some(mode);
        self
    }
}

/// A registered callback
pub struct CallbackEntry {
    /// Host-visible id
    pub id: CallbackId,
    /// The callable
    pub handler: Handler,
    /// Positional arguments placed before the host-supplied ones
    pub prebound_args: Vec<Value>,
    /// Keyword arguments passed on every call
    pub prebound_kwargs: Kwargs,
    /// Applied to raw host arguments before merging
    pub transform: Option<Rc<ArgTransform>>,
    /// Weak owner; the entry is invalid once it is gone
    pub owner: Option<Weak<dyn Any>>,
    /// Inline or queued
    pub dispatch: DispatchMode,
}

impl CallbackEntry {
    /// True while the owner (if any) and a bound method's target still exist
    pub fn is_alive(&self) -> bool {
        let owner_alive = self.owner.as_ref().map_or(true, |w| w.strong_count() > 0);
        owner_alive && self.handler.is_alive()
    }

    /// Transform, merge and call
    ///
    /// Liveness is checked again here: the entry may have been resolved
    /// before a queued task ran.
    pub fn call(&self, raw_args: Vec<Value>) -> Result<Value> {
        if !self.is_alive() {
            return Err(HookError::OwnerDropped(self.id));
        }

        let host_args = match &self.transform {
            Some(transform) => transform(raw_args).map_err(|source| HookError::TransformFailed {
                id: self.id,
                source,
            })?,
            None => raw_args,
        };

        let mut args = Vec::with_capacity(self.prebound_args.len() + host_args.len());
        args.extend(self.prebound_args.iter().cloned());
        args.extend(host_args);

        let outcome = match &self.handler {
            Handler::Function(f) => f(&args, &self.prebound_kwargs),
            Handler::Method { target, method } => match target.upgrade() {
                Some(target) => target.call_method(method, &args, &self.prebound_kwargs),
                None => return Err(HookError::OwnerDropped(self.id)),
            },
        };

        outcome.map_err(|source| HookError::HandlerFailed { id: self.id, source })
    }
}

impl fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("id", &self.id)
            .field("handler", &self.handler)
            .field("prebound_args", &self.prebound_args)
            .field("prebound_kwargs", &self.prebound_kwargs)
            .field("has_transform", &self.transform.is_some())
            .field("has_owner", &self.owner.is_some())
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

/// Table of live callback entries
///
/// Ids are allocated from a monotonically increasing counter and are never
/// handed out twice, so a stale id can never resolve to a newer entry.
#[derive(Debug)]
pub struct CallbackRegistry {
    entries: HashMap<CallbackId, Rc<CallbackEntry>>,
    next_id: u64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Store a new entry and return its fresh id
    pub fn register(
        &mut self,
        handler: Handler,
        options: RegisterOptions,
        default_dispatch: DispatchMode,
    ) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;

        let entry = CallbackEntry {
            id,
            handler,
            prebound_args: options.prebound_args,
            prebound_kwargs: options.prebound_kwargs,
            transform: options.transform,
            owner: options.owner,
            dispatch: options.dispatch.unwrap_or(default_dispatch),
        };
        log::debug!("Registered callback {} ({:?}, {:?})", id, entry.handler, entry.dispatch);
        self.entries.insert(id, Rc::new(entry));
        id
    }

    /// Remove an entry; unknown ids are ignored. Returns whether anything was removed.
    pub fn unregister(&mut self, id: CallbackId) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            log::debug!("Unregistered callback {}", id);
        }
        removed
    }

    /// Look up a live entry
    pub fn resolve(&self, id: CallbackId) -> Result<Rc<CallbackEntry>> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(HookError::UnknownCallback(id))?;
        if !entry.is_alive() {
            return Err(HookError::OwnerDropped(id));
        }
        Ok(Rc::clone(entry))
    }

    /// True if `id` is registered, whether or not its owner still exists
    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose owner has gone away; returns how many were removed
    pub fn purge_dead(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_alive());
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    fn echo() -> Handler {
        Handler::function(|args, _| Ok(Value::List(args.to_vec())))
    }

    #[test]
    fn test_ids_are_unique() {
        let mut registry = CallbackRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = registry.register(echo(), RegisterOptions::new(), DispatchMode::Immediate);
            assert!(seen.insert(id));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_ids_not_reused_after_release() {
        let mut registry = CallbackRegistry::new();
        let a = registry.register(echo(), RegisterOptions::new(), DispatchMode::Immediate);
        registry.unregister(a);
        let b = registry.register(echo(), RegisterOptions::new(), DispatchMode::Immediate);
        assert_ne!(a, b);
        assert!(matches!(registry.resolve(a), Err(HookError::UnknownCallback(_))));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = CallbackRegistry::new();
        let id = registry.register(echo(), RegisterOptions::new(), DispatchMode::Immediate);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(!registry.unregister(CallbackId(999)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prebound_args_come_first() {
        let mut registry = CallbackRegistry::new();
        let options = RegisterOptions::new()
            .with_args(vec![Value::from("pre")])
            .with_kwarg("mode", "n");
        let id = registry.register(
            Handler::function(|args, kwargs| {
                let mut out = args.to_vec();
                out.push(kwargs.get("mode").cloned().unwrap_or_default());
                Ok(Value::List(out))
            }),
            options,
            DispatchMode::Immediate,
        );

        let result = registry.resolve(id).unwrap().call(vec![Value::from(1)]).unwrap();
        assert_eq!(result, Value::from(vec![Value::from("pre"), Value::from(1), Value::from("n")]));
    }

    #[test]
    fn test_transform_applied_and_failure_reported() {
        let mut registry = CallbackRegistry::new();
        let doubled = registry.register(
            echo(),
            RegisterOptions::new().with_transform(|raw| {
                Ok(raw.into_iter().map(|v| Value::from(v.as_i64().unwrap_or(0) * 2)).collect())
            }),
            DispatchMode::Immediate,
        );
        let broken = registry.register(
            echo(),
            RegisterOptions::new().with_transform(|_| anyhow::bail!("bad args")),
            DispatchMode::Immediate,
        );

        let result = registry.resolve(doubled).unwrap().call(vec![Value::from(21)]).unwrap();
        assert_eq!(result, Value::from(vec![42]));

        let err = registry.resolve(broken).unwrap().call(vec![]).unwrap_err();
        assert!(matches!(err, HookError::TransformFailed { .. }));
    }

    #[test]
    fn test_dropped_owner_invalidates_entry() {
        let mut registry = CallbackRegistry::new();
        let owner = Rc::new("component".to_string());
        let id = registry.register(
            echo(),
            RegisterOptions::new().with_owner(&owner),
            DispatchMode::Immediate,
        );
        assert!(registry.resolve(id).is_ok());

        drop(owner);
        assert!(matches!(registry.resolve(id), Err(HookError::OwnerDropped(_))));
        assert!(registry.contains(id));
        assert_eq!(registry.purge_dead(), 1);
        assert!(!registry.contains(id));
    }

    struct Counter {
        hits: Cell<u32>,
    }

    impl MethodTarget for Counter {
        fn call_method(
            &self,
            method: &str,
            _args: &[Value],
            _kwargs: &Kwargs,
        ) -> anyhow::Result<Value> {
            match method {
                "bump" => {
                    self.hits.set(self.hits.get() + 1);
                    Ok(Value::from(i64::from(self.hits.get())))
                }
                other => Err(HookError::UnknownMethod(other.to_string()).into()),
            }
        }
    }

    #[test]
    fn test_bound_method_holds_target_weakly() {
        let mut registry = CallbackRegistry::new();
        let counter = Rc::new(Counter { hits: Cell::new(0) });
        let bump = registry.register(
            Handler::method(&counter, "bump"),
            RegisterOptions::new(),
            DispatchMode::Immediate,
        );
        let missing = registry.register(
            Handler::method(&counter, "missing"),
            RegisterOptions::new(),
            DispatchMode::Immediate,
        );

        assert_eq!(registry.resolve(bump).unwrap().call(vec![]).unwrap(), Value::from(1));
        assert!(matches!(
            registry.resolve(missing).unwrap().call(vec![]),
            Err(HookError::HandlerFailed { .. })
        ));
        assert_eq!(Rc::strong_count(&counter), 1);

        let entry = registry.resolve(bump).unwrap();
        drop(counter);
        assert!(matches!(entry.call(vec![]), Err(HookError::OwnerDropped(_))));
        assert!(matches!(registry.resolve(bump), Err(HookError::OwnerDropped(_))));
    }
}
