//! Input layer: multiplexed non-blocking device sources.
//!
//! Every physical input (the key matrix via evdev, hardware MIDI ports,
//! the mdev hotplug fifo) implements [`InputSource`]: it exposes a raw
//! file descriptor for the poll selector, reads raw records without
//! blocking, and maps records to semantic [`Event`]s through its
//! configured mapping table. The [`manager::InputManager`] owns the
//! poll loop on a dedicated thread.

pub mod calibration;
pub mod evdev;
pub mod exprs;
pub mod manager;
pub mod mdev;
pub mod midi;

use std::os::unix::io::RawFd;

use serde_json::Value;
use thiserror::Error;

use crate::events::Event;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid input map: {0}")]
    InvalidMap(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl InputError {
    /// True when the underlying device vanished (hot-unplug).
    pub fn is_device_gone(&self) -> bool {
        matches!(self, InputError::Io(e) if e.raw_os_error() == Some(libc::ENODEV))
    }
}

/// A raw record read from a source, before semantic mapping.
#[derive(Debug, Clone)]
pub enum RawRecord {
    Ev(evdev::EvDevRecord),
    Midi(midi::MidiMessage),
    Line(String),
}

/// Capability set of an input source.
pub trait InputSource: Send {
    fn name(&self) -> &str;

    /// Identity used for (un)registration, usually the device node.
    fn filename(&self) -> &str;

    /// Log unmapped records at debug level for this source.
    fn debug(&self) -> bool {
        false
    }

    /// Open the device and return the fd for the poll selector.
    fn open(&mut self) -> Result<RawFd, InputError>;

    fn close(&mut self);

    /// Events captured before polling started (e.g. the hotplug fifo's
    /// pre-existing content). Drained once after registration.
    fn initial_events(&mut self) -> Vec<Event> {
        Vec::new()
    }

    /// Drain currently available raw records. An empty vec means the
    /// source has no more data right now.
    fn read(&mut self) -> Result<Vec<RawRecord>, InputError>;

    /// Map a raw record to a semantic event, if a mapping matches.
    fn map(&mut self, record: &RawRecord) -> Option<Event>;
}

/// Build the configured sources from an input-map JSON document: an
/// array of source descriptors with per-source mapping tables.
pub fn sources_from_config(config: &Value) -> Result<Vec<Box<dyn InputSource>>, InputError> {
    let entries = config
        .as_array()
        .ok_or_else(|| InputError::InvalidMap("input map must be an array".to_string()))?;

    let mut sources: Vec<Box<dyn InputSource>> = Vec::new();
    for entry in entries {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("UNNAMED");
        let kind = entry.get("type").and_then(Value::as_str).ok_or_else(|| {
            InputError::InvalidMap(format!("source \"{}\" has no type", name))
        })?;
        let source: Box<dyn InputSource> = match kind {
            "evdev" => Box::new(
                evdev::EvDevInput::from_config(entry)
                    .map_err(|e| InputError::InvalidMap(format!("in \"{}\": {}", name, e)))?,
            ),
            "midi" => Box::new(
                midi::MidiInput::from_config(entry)
                    .map_err(|e| InputError::InvalidMap(format!("in \"{}\": {}", name, e)))?,
            ),
            other => {
                return Err(InputError::InvalidMap(format!(
                    "source \"{}\" has unknown type \"{}\"",
                    name, other
                )))
            }
        };
        sources.push(source);
    }
    Ok(sources)
}

pub(crate) fn config_str<'a>(entry: &'a Value, key: &str) -> Result<&'a str, InputError> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| InputError::InvalidMap(format!("missing \"{}\"", key)))
}

/// Open a file in non-blocking mode and return it with its raw fd.
pub(crate) fn open_nonblocking(
    path: &str,
    write: bool,
) -> Result<(std::fs::File, RawFd), InputError> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(write)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let fd = file.as_raw_fd();
    Ok((file, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sources_from_config_rejects_unknown_type() {
        let config = json!([{"name": "x", "type": "gamepad", "device": "/dev/null", "mappings": []}]);
        let err = sources_from_config(&config).err().unwrap();
        assert!(matches!(err, InputError::InvalidMap(_)));
    }

    #[test]
    fn test_sources_from_config_builds_both_kinds() {
        let config = json!([
            {
                "name": "keys",
                "type": "evdev",
                "device": "/dev/input/event0",
                "mappings": [
                    {"input": {"type": 1, "code": 2, "value": 1},
                     "event": {"type": "input", "name": "select", "action": "down"}}
                ]
            },
            {
                "name": "ext-midi",
                "type": "midi",
                "device": "/dev/snd/midiC1D0",
                "mappings": [
                    {"input": {"name": "note_on"},
                     "event": {"type": "state_action", "name": "load_preset",
                               "expr": {"value": "arg1"}}}
                ]
            }
        ]);
        let sources = sources_from_config(&config).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name(), "keys");
        assert_eq!(sources[1].name(), "ext-midi");
    }
}
