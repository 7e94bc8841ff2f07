//! Named publish/subscribe buses
//!
//! One bus exists per name for the lifetime of the dispatcher. A subscription
//! is a callback entry in the registry plus an optional predicate; posting
//! fixes the set of eligible subscribers at post time and queues one
//! delivery per subscriber, in registration order, on the deferred queue.

use crate::deferred::run_guarded;
use crate::dispatcher::Core;
use crate::registry::{Handler, RegisterOptions};
use crate::types::{CallbackId, DispatchMode, HookError, Value};
use log::Level;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Callback invoked for each delivered message
pub type BusCallback = dyn Fn(&Message, &Bus) -> anyhow::Result<()>;

/// Filter evaluated at post time
pub type Predicate = dyn Fn(&Message) -> bool;

/// A routed message: a name plus opaque payload
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Routing key
    pub name: String,
    /// Attached data
    pub payload: Value,
}

impl Message {
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Message whose payload is the list `args`
    pub fn simple(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(name, Value::List(args))
    }

    /// Payload items when the payload is a list
    pub fn args(&self) -> &[Value] {
        self.payload.as_list().unwrap_or(&[])
    }

    /// Host argument form used when the message travels through the registry
    pub fn to_args(&self) -> Vec<Value> {
        vec![Value::String(self.name.clone()), self.payload.clone()]
    }

    /// Inverse of [`Message::to_args`]
    pub fn from_args(args: &[Value]) -> Result<Self, HookError> {
        match args {
            [Value::String(name), payload] => Ok(Self::new(name.clone(), payload.clone())),
            _ => Err(HookError::InvalidMessage(format!(
                "expected (name, payload), got {} argument(s)",
                args.len()
            ))),
        }
    }
}

struct SubscriptionRecord {
    seq: u64,
    callback: CallbackId,
    predicate: Option<Rc<Predicate>>,
}

pub(crate) struct BusState {
    name: String,
    subscriptions: RefCell<HashMap<String, Vec<SubscriptionRecord>>>,
    next_seq: Cell<u64>,
}

impl BusState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
        }
    }

    /// Remove one record; returns the callback id it held
    fn remove(&self, message_name: &str, seq: u64) -> Option<CallbackId> {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let list = subscriptions.get_mut(message_name)?;
        let index = list.iter().position(|r| r.seq == seq)?;
        let record = list.remove(index);
        if list.is_empty() {
            subscriptions.remove(message_name);
        }
        Some(record.callback)
    }
}

/// Handle to a named bus
///
/// Cheap to clone. Two handles are equal when they refer to the same bus.
#[derive(Clone)]
pub struct Bus {
    state: Rc<BusState>,
    core: Weak<Core>,
}

impl Bus {
    pub(crate) fn new(state: Rc<BusState>, core: Weak<Core>) -> Self {
        Self { state, core }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Subscribe `callback` to every message named `message_name`
    pub fn subscribe<F>(&self, message_name: &str, callback: F) -> Subscription
    where
        F: Fn(&Message, &Bus) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_with(message_name, Rc::new(callback), None, RegisterOptions::new())
    }

    /// Subscribe with a predicate; rejected messages are never queued
    pub fn subscribe_filtered<P, F>(
        &self,
        message_name: &str,
        predicate: P,
        callback: F,
    ) -> Subscription
    where
        P: Fn(&Message) -> bool + 'static,
        F: Fn(&Message, &Bus) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_with(
            message_name,
            Rc::new(callback),
            Some(Rc::new(predicate)),
            RegisterOptions::new(),
        )
    }

    /// Subscribe on behalf of `owner`; delivery stops once the owner is dropped
    pub fn subscribe_owned<T, F>(
        &self,
        message_name: &str,
        owner: &Rc<T>,
        callback: F,
    ) -> Subscription
    where
        T: Any,
        F: Fn(&Message, &Bus) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_with(
            message_name,
            Rc::new(callback),
            None,
            RegisterOptions::new().with_owner(owner),
        )
    }

    fn subscribe_with(
        &self,
        message_name: &str,
        callback: Rc<BusCallback>,
        predicate: Option<Rc<Predicate>>,
        options: RegisterOptions,
    ) -> Subscription {
        let seq = self.state.next_seq.get();
        self.state.next_seq.set(seq + 1);

        let core = match self.core.upgrade() {
            Some(core) => core,
            None => {
                log::debug!("Dispatcher gone; subscription to '{}' is inert", message_name);
                return Subscription {
                    id: CallbackId::NONE,
                    message_name: message_name.to_string(),
                    seq,
                    bus: Weak::new(),
                    core: Weak::new(),
                };
            }
        };

        let bus_state = Rc::downgrade(&self.state);
        let bus_core = self.core.clone();
        let handler = Handler::function(move |args, _| {
            let message = Message::from_args(args)?;
            let state = bus_state
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("bus for '{}' no longer exists", message.name))?;
            let bus = Bus::new(state, bus_core.clone());
            callback(&message, &bus)?;
            Ok(Value::Nil)
        });
        let id = core.register(handler, options.with_dispatch(DispatchMode::Immediate));

        self.state
            .subscriptions
            .borrow_mut()
            .entry(message_name.to_string())
            .or_default()
            .push(SubscriptionRecord {
                seq,
                callback: id,
                predicate,
            });
        log::debug!(
            "Bus '{}': callback {} subscribed to '{}'",
            self.state.name,
            id,
            message_name
        );

        Subscription {
            id,
            message_name: message_name.to_string(),
            seq,
            bus: Rc::downgrade(&self.state),
            core: self.core.clone(),
        }
    }

    /// Remove a subscription made on this bus; idempotent
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Queue a delivery of `message` to each eligible subscriber
    ///
    /// Eligibility (name match, live entry, predicate) is decided now;
    /// subscribers added later never see this message.
    pub fn post(&self, message: Message) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };

        // Clone out the candidates so predicates may subscribe re-entrantly.
        let mut pruned = Vec::new();
        let candidates: Vec<(CallbackId, Option<Rc<Predicate>>)> = {
            let mut subscriptions = self.state.subscriptions.borrow_mut();
            match subscriptions.get_mut(&message.name) {
                Some(list) => {
                    list.retain(|r| {
                        let live = core.is_live(r.callback);
                        if !live {
                            pruned.push(r.callback);
                        }
                        live
                    });
                    let candidates: Vec<_> = list
                        .iter()
                        .map(|r| (r.callback, r.predicate.clone()))
                        .collect();
                    if list.is_empty() {
                        subscriptions.remove(&message.name);
                    }
                    candidates
                }
                None => Vec::new(),
            }
        };

        // Entries whose owner is gone would otherwise stay registered.
        for id in pruned {
            log::debug!("Bus '{}': releasing dead subscription {}", self.state.name, id);
            core.unregister(id);
        }

        if candidates.is_empty() {
            log::trace!("Bus '{}': no subscribers for '{}'", self.state.name, message.name);
            return;
        }

        let mut queued = 0;
        for (id, predicate) in candidates {
            if let Some(predicate) = predicate {
                match run_guarded(core.config.catch_panics, || predicate(&message)) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(panic) => {
                        core.report(
                            Level::Error,
                            &format!(
                                "predicate for callback {} on bus '{}' panicked: {}",
                                id, self.state.name, panic
                            ),
                        );
                        continue;
                    }
                }
            }
            core.schedule_invocation(id, message.to_args());
            queued += 1;
        }

        log::trace!(
            "Bus '{}': '{}' queued for {} subscriber(s)",
            self.state.name,
            message.name,
            queued
        );
    }

    /// Build a message named `name` with payload `args` and post it
    pub fn post_simple_message(&self, name: &str, args: Vec<Value>) {
        self.post(Message::simple(name, args));
    }

    /// Live subscriptions for `message_name`
    pub fn subscriber_count(&self, message_name: &str) -> usize {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return 0,
        };
        self.state
            .subscriptions
            .borrow()
            .get(message_name)
            .map_or(0, |list| list.iter().filter(|r| core.is_live(r.callback)).count())
    }

    /// Message names with at least one subscription, sorted
    pub fn message_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.subscriptions.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PartialEq for Bus {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Bus {}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").field("name", &self.state.name).finish()
    }
}

/// Handle returned by `subscribe`
#[derive(Clone)]
pub struct Subscription {
    id: CallbackId,
    message_name: String,
    seq: u64,
    bus: Weak<BusState>,
    core: Weak<Core>,
}

impl Subscription {
    /// Callback id backing this subscription
    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn message_name(&self) -> &str {
        &self.message_name
    }

    /// Registration order on the bus
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// True until unsubscribed (or until its owner is dropped)
    pub fn is_active(&self) -> bool {
        self.core
            .upgrade()
            .map_or(false, |core| core.is_live(self.id))
    }

    /// Stop future deliveries; queued ones become no-ops. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.message_name, self.seq);
        }
        if let Some(core) = self.core.upgrade() {
            core.unregister(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("message_name", &self.message_name)
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_args_round_trip() {
        let message = Message::simple("ping", vec![Value::from(1), Value::from(2)]);
        let back = Message::from_args(&message.to_args()).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.args(), &[Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_message_from_bad_args() {
        let err = Message::from_args(&[Value::from(1)]).unwrap_err();
        assert!(matches!(err, HookError::InvalidMessage(_)));
    }

    #[test]
    fn test_non_list_payload_has_no_args() {
        let message = Message::new("state", "idle");
        assert!(message.args().is_empty());
        assert_eq!(message.payload.as_str(), Some("idle"));
    }
}
