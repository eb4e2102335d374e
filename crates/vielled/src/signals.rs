//! Process-wide named pub/sub fabric.
//!
//! State mutations emit named events ("signals") that controllers, the
//! menu and the websocket fan-out subscribe to. Delivery is synchronous
//! and in registration order; the special `__all__` name receives every
//! emission after the named handlers.
//!
//! Two request-scoping mechanisms ride along with every emission:
//!
//! - a per-thread client id, so the websocket fan-out can drop echoes to
//!   the client that caused a change (async request handlers pass the id
//!   explicitly via [`Signals::emit_from`] instead);
//! - a per-thread, re-entrant suppression stack: inside
//!   [`Signals::suppressed`] nothing is delivered, emissions are collected
//!   and handed back to the caller. Bulk state loads use this to replace
//!   hundreds of field events with a single summary event.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error};

/// Broadcast subscriber role: receives every emission.
pub const ALL_EVENTS: &str = "__all__";

/// Payload of an emission. Carries a JSON object of fields plus the
/// emitting object's id (a stable path string, never an owning handle)
/// and the originating client id.
#[derive(Debug, Clone, Default)]
pub struct EventData {
    pub fields: serde_json::Map<String, Value>,
    pub sender: Option<String>,
    pub client_id: Option<String>,
}

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(name: &str, value: Value) -> Self {
        let mut data = Self::default();
        data.fields.insert(name.to_string(), value);
        data
    }

    pub fn insert(&mut self, name: &str, value: Value) -> &mut Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// JSON representation sent to websocket clients: the fields only,
    /// sender and client id are transport metadata.
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

pub type Handler = Arc<dyn Fn(&str, &EventData) + Send + Sync>;

/// Token returned by [`Signals::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registry {
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
}

/// Cheaply cloneable handle to the process signal bus.
#[derive(Clone)]
pub struct Signals {
    id: u64,
    registry: Arc<Mutex<Registry>>,
    next_handler: Arc<AtomicU64>,
}

thread_local! {
    // Keyed by bus id so independent buses in tests stay isolated.
    static SUPPRESSED: RefCell<HashMap<u64, Vec<Vec<(String, EventData)>>>> =
        RefCell::new(HashMap::new());
    static CLIENT_ID: RefCell<HashMap<u64, String>> = RefCell::new(HashMap::new());
}

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            registry: Arc::new(Mutex::new(Registry {
                handlers: HashMap::new(),
            })),
            next_handler: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Tag the current thread; subsequent emissions carry this client id.
    pub fn set_client_id(&self, client_id: Option<String>) {
        CLIENT_ID.with(|ids| {
            let mut ids = ids.borrow_mut();
            match client_id {
                Some(id) => {
                    ids.insert(self.id, id);
                }
                None => {
                    ids.remove(&self.id);
                }
            }
        });
    }

    pub fn get_client_id(&self) -> Option<String> {
        CLIENT_ID.with(|ids| ids.borrow().get(&self.id).cloned())
    }

    pub fn register<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &EventData) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock().unwrap();
        registry
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unregister(&self, event: &str, id: HandlerId) {
        let mut registry = self.registry.lock().unwrap();
        match registry.handlers.get_mut(event) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(hid, _)| *hid != id);
                if handlers.len() == before {
                    error!("handler {:?} not registered for event {}!", id, event);
                }
            }
            None => error!("event {} has no registered handlers!", event),
        }
    }

    /// Emit with the current thread's client id attached.
    pub fn emit(&self, name: &str, data: EventData) {
        self.emit_from(name, data, self.get_client_id());
    }

    /// Emit with an explicit client id, for request-scoped contexts where
    /// a thread-local tag cannot work (async HTTP handlers).
    pub fn emit_from(&self, name: &str, mut data: EventData, client_id: Option<String>) {
        if data.client_id.is_none() {
            data.client_id = client_id;
        }

        let collected = SUPPRESSED.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            if let Some(stack) = stacks.get_mut(&self.id) {
                if let Some(innermost) = stack.last_mut() {
                    innermost.push((name.to_string(), data.clone()));
                    return true;
                }
            }
            false
        });
        if collected {
            return;
        }

        let (named, all) = {
            let registry = self.registry.lock().unwrap();
            (
                registry.handlers.get(name).cloned().unwrap_or_default(),
                registry.handlers.get(ALL_EVENTS).cloned().unwrap_or_default(),
            )
        };

        let mut handled = false;
        for (_, handler) in named.iter().chain(all.iter()) {
            let result = catch_unwind(AssertUnwindSafe(|| handler(name, &data)));
            if result.is_err() {
                error!("error in handler for \"{}\" signal", name);
            } else {
                handled = true;
            }
        }
        if !handled {
            debug!("IGNORED {} ({:?})", name, data.fields);
        }
    }

    /// Run `f` with delivery suppressed on this thread. Returns `f`'s
    /// result and the emissions collected in order. Re-entrant: nested
    /// scopes collect into the innermost list.
    pub fn suppressed<R>(&self, f: impl FnOnce() -> R) -> (R, Vec<(String, EventData)>) {
        SUPPRESSED.with(|stacks| {
            stacks.borrow_mut().entry(self.id).or_default().push(Vec::new());
        });
        let result = f();
        let events = SUPPRESSED.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let stack = stacks.entry(self.id).or_default();
            let events = stack.pop().unwrap_or_default();
            if stack.is_empty() {
                stacks.remove(&self.id);
            }
            events
        });
        (result, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str, &EventData) + Send + Sync) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&log);
        (log, move |name: &str, _: &EventData| {
            inner.lock().unwrap().push(name.to_string())
        })
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let signals = Signals::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            signals.register("x:changed", move |_, _| {
                log.lock().unwrap().push(tag);
            });
        }
        signals.emit("x:changed", EventData::new());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_all_handlers_run_after_named() {
        let signals = Signals::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            signals.register(ALL_EVENTS, move |name, _| {
                log.lock().unwrap().push(format!("all:{}", name));
            });
        }
        {
            let log = Arc::clone(&log);
            signals.register("x:changed", move |name, _| {
                log.lock().unwrap().push(format!("named:{}", name));
            });
        }
        signals.emit("x:changed", EventData::new());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["named:x:changed", "all:x:changed"]
        );
    }

    #[test]
    fn test_unregister() {
        let signals = Signals::new();
        let (log, handler) = recorder();
        let id = signals.register("x", handler);
        signals.emit("x", EventData::new());
        signals.unregister("x", id);
        signals.emit("x", EventData::new());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_handler_panic_does_not_propagate() {
        let signals = Signals::new();
        signals.register("x", |_, _| panic!("boom"));
        let (log, handler) = recorder();
        signals.register("x", handler);
        signals.emit("x", EventData::new());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_suppression_collects_in_order() {
        let signals = Signals::new();
        let (log, handler) = recorder();
        signals.register("a", handler);

        let (_, events) = signals.suppressed(|| {
            signals.emit("a", EventData::with("v", json!(1)));
            signals.emit("b", EventData::with("v", json!(2)));
        });

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "a");
        assert_eq!(events[0].1.get_i64("v"), Some(1));
        assert_eq!(events[1].0, "b");
    }

    #[test]
    fn test_nested_suppression_yields_to_innermost() {
        let signals = Signals::new();
        let (_, outer_events) = signals.suppressed(|| {
            signals.emit("outer", EventData::new());
            let (_, inner_events) = signals.suppressed(|| {
                signals.emit("inner", EventData::new());
            });
            assert_eq!(inner_events.len(), 1);
            assert_eq!(inner_events[0].0, "inner");
        });
        assert_eq!(outer_events.len(), 1);
        assert_eq!(outer_events[0].0, "outer");
    }

    #[test]
    fn test_client_id_attached() {
        let signals = Signals::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            signals.register("x", move |_, data| {
                *seen.lock().unwrap() = data.client_id.clone();
            });
        }
        signals.set_client_id(Some("web-1".to_string()));
        signals.emit("x", EventData::new());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("web-1"));

        signals.set_client_id(None);
        signals.emit("x", EventData::new());
        assert_eq!(*seen.lock().unwrap(), None);
    }

    #[test]
    fn test_emit_from_overrides_thread_tag() {
        let signals = Signals::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            signals.register("x", move |_, data| {
                *seen.lock().unwrap() = data.client_id.clone();
            });
        }
        signals.emit_from("x", EventData::new(), Some("api-7".to_string()));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("api-7"));
    }
}
