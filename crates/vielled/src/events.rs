//! Typed events flowing through the dispatcher queue.
//!
//! Raw device records are mapped into these events by the input layer;
//! the dispatcher consumes them on the main thread. The `State` variant
//! carries signal-bus emissions that menu pages asked to be forwarded to
//! the dispatch thread.

use serde_json::Value;

use crate::input::InputError;
use crate::signals::EventData;

/// Physical controls of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Select,
    Back,
    Fn1,
    Fn2,
    Fn3,
    Fn4,
    Top1,
    Top2,
    Top3,
    Mod1,
    Mod2,
    Encoder,
}

impl Key {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "select" => Key::Select,
            "back" => Key::Back,
            "fn1" => Key::Fn1,
            "fn2" => Key::Fn2,
            "fn3" => Key::Fn3,
            "fn4" => Key::Fn4,
            "top1" => Key::Top1,
            "top2" => Key::Top2,
            "top3" => Key::Top3,
            "mod1" => Key::Mod1,
            "mod2" => Key::Mod2,
            "encoder" => Key::Encoder,
            _ => return None,
        })
    }
}

/// Key actions. `Down`/`Up` come straight from the key matrix; `Short`
/// and `Long` are classified by the external debouncer after release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Up,
    Down,
    Pressed,
    Short,
    Long,
}

impl Action {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "up" => Action::Up,
            "down" => Action::Down,
            "pressed" => Action::Pressed,
            "short" => Action::Short,
            "long" => Action::Long,
            _ => return None,
        })
    }
}

/// A semantic input event with the microsecond timestamp of the raw
/// device record it was mapped from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub key: Key,
    pub action: Action,
    pub value: i32,
    pub ts: u64,
}

impl InputEvent {
    pub fn new(key: Key, action: Action, value: i32) -> Self {
        Self {
            key,
            action,
            value,
            ts: 0,
        }
    }

    pub fn down(&self, key: Key) -> bool {
        self.key == key && self.action == Action::Down
    }

    pub fn up(&self, key: Key) -> bool {
        self.key == key && self.action == Action::Up
    }

    pub fn short_pressed(&self, key: Key) -> bool {
        self.key == key && self.action == Action::Short
    }

    pub fn long_pressed(&self, key: Key) -> bool {
        self.key == key && self.action == Action::Long
    }

    pub fn pressed(&self, key: Key) -> bool {
        self.short_pressed(key) || self.long_pressed(key)
    }
}

/// Everything the dispatcher queue can carry.
#[derive(Debug, Clone)]
pub enum Event {
    Input(InputEvent),
    State {
        name: String,
        data: EventData,
    },
    StateChange {
        path: String,
        value: Value,
    },
    StateAction {
        name: String,
        value: Value,
    },
    Mdev {
        action: String,
        source: String,
        subsystem: String,
        device: String,
    },
    /// Clean shutdown request, the queue-level stand-in for SIGINT.
    Shutdown,
}

impl Event {
    /// Build an event from an input-map entry, e.g.
    /// `{"type": "input", "name": "select", "action": "short"}` or
    /// `{"type": "state_change", "name": "main_volume", "value": 90}`.
    pub fn from_mapping(entry: &Value) -> Result<Event, InputError> {
        let etype = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| InputError::InvalidMap("mapping event without type".to_string()))?;
        match etype {
            "input" => {
                let name = required_str(entry, "name")?;
                let action = required_str(entry, "action")?;
                let key = Key::from_name(name)
                    .ok_or_else(|| InputError::InvalidMap(format!("unknown key \"{}\"", name)))?;
                let action = Action::from_name(action).ok_or_else(|| {
                    InputError::InvalidMap(format!("unknown action \"{}\"", action))
                })?;
                let value = entry.get("value").and_then(Value::as_i64).unwrap_or(0) as i32;
                Ok(Event::Input(InputEvent::new(key, action, value)))
            }
            "state" => Ok(Event::State {
                name: required_str(entry, "name")?.to_string(),
                data: EventData::new(),
            }),
            "state_change" => Ok(Event::StateChange {
                path: required_str(entry, "name")?.to_string(),
                value: entry.get("value").cloned().unwrap_or(Value::Null),
            }),
            "state_action" => Ok(Event::StateAction {
                name: required_str(entry, "name")?.to_string(),
                value: entry.get("value").cloned().unwrap_or(Value::Null),
            }),
            other => Err(InputError::InvalidMap(format!(
                "invalid event type \"{}\"",
                other
            ))),
        }
    }
}

fn required_str<'a>(entry: &'a Value, field: &str) -> Result<&'a str, InputError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| InputError::InvalidMap(format!("mapping event without {}", field)))
}
