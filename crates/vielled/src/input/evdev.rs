//! Key matrix and encoder input via the kernel event device.
//!
//! Records are the kernel's 24-byte input_event layout, little-endian:
//! seconds (i64), microseconds (i64), type (u16), code (u16),
//! value (i32). The mapping table is keyed by (type, code, value).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::RawFd;

use serde_json::Value;
use tracing::warn;

use crate::events::Event;
use crate::input::{config_str, open_nonblocking, InputError, InputSource, RawRecord};

pub const EV_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvDevRecord {
    pub secs: i64,
    pub usecs: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl EvDevRecord {
    /// Timestamp in microseconds.
    pub fn timestamp(&self) -> u64 {
        (self.secs as u64) * 1_000_000 + self.usecs as u64
    }

    pub fn from_bytes(data: &[u8; EV_SIZE]) -> Self {
        Self {
            secs: i64::from_le_bytes(data[0..8].try_into().unwrap()),
            usecs: i64::from_le_bytes(data[8..16].try_into().unwrap()),
            kind: u16::from_le_bytes(data[16..18].try_into().unwrap()),
            code: u16::from_le_bytes(data[18..20].try_into().unwrap()),
            value: i32::from_le_bytes(data[20..24].try_into().unwrap()),
        }
    }

    pub fn to_bytes(&self) -> [u8; EV_SIZE] {
        let mut out = [0u8; EV_SIZE];
        out[0..8].copy_from_slice(&self.secs.to_le_bytes());
        out[8..16].copy_from_slice(&self.usecs.to_le_bytes());
        out[16..18].copy_from_slice(&self.kind.to_le_bytes());
        out[18..20].copy_from_slice(&self.code.to_le_bytes());
        out[20..24].copy_from_slice(&self.value.to_le_bytes());
        out
    }
}

pub struct EvDevInput {
    name: String,
    filename: String,
    debug: bool,
    file: Option<File>,
    mappings: HashMap<(u16, u16, i32), Event>,
}

impl EvDevInput {
    pub fn new(filename: &str, name: &str, debug: bool) -> Self {
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            debug,
            file: None,
            mappings: HashMap::new(),
        }
    }

    pub fn from_config(entry: &Value) -> Result<Self, InputError> {
        let device = config_str(entry, "device")?;
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(device);
        let debug = entry.get("debug").and_then(Value::as_bool).unwrap_or(false);
        let mut input = Self::new(device, name, debug);
        input.set_mappings(
            entry
                .get("mappings")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        )?;
        Ok(input)
    }

    /// Build the (type, code, value) mapping table. Duplicate keys warn
    /// and the last entry wins.
    pub fn set_mappings(&mut self, mappings: &[Value]) -> Result<(), InputError> {
        self.mappings.clear();
        for mapping in mappings {
            let input = mapping
                .get("input")
                .ok_or_else(|| InputError::InvalidMap("mapping without input".to_string()))?;
            let key = (
                input.get("type").and_then(Value::as_u64).unwrap_or(0) as u16,
                input.get("code").and_then(Value::as_u64).unwrap_or(0) as u16,
                input.get("value").and_then(Value::as_i64).unwrap_or(0) as i32,
            );
            let event = Event::from_mapping(
                mapping
                    .get("event")
                    .ok_or_else(|| InputError::InvalidMap("mapping without event".to_string()))?,
            )?;
            if self.mappings.insert(key, event).is_some() {
                warn!("duplicate entry in {} map: {:?}", self.name, key);
            }
        }
        Ok(())
    }
}

impl InputSource for EvDevInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn open(&mut self) -> Result<RawFd, InputError> {
        let (file, fd) = open_nonblocking(&self.filename, false)?;
        self.file = Some(file);
        Ok(fd)
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn read(&mut self) -> Result<Vec<RawRecord>, InputError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        loop {
            let mut buf = [0u8; EV_SIZE];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) if n == EV_SIZE => {
                    records.push(RawRecord::Ev(EvDevRecord::from_bytes(&buf)));
                }
                Ok(n) => {
                    warn!("short read of {} bytes from {}", n, self.filename);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    fn map(&mut self, record: &RawRecord) -> Option<Event> {
        let RawRecord::Ev(ev) = record else {
            return None;
        };
        let event = self.mappings.get(&(ev.kind, ev.code, ev.value))?;
        let mut event = event.clone();
        if let Event::Input(input) = &mut event {
            input.ts = ev.timestamp();
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Action, Key};
    use serde_json::json;

    fn test_input() -> EvDevInput {
        let mut input = EvDevInput::new("/dev/input/event0", "keys", false);
        input
            .set_mappings(&[
                json!({
                    "input": {"type": 1, "code": 28, "value": 1},
                    "event": {"type": "input", "name": "select", "action": "down"}
                }),
                json!({
                    "input": {"type": 2, "code": 7, "value": -1},
                    "event": {"type": "input", "name": "encoder", "action": "pressed", "value": -1}
                }),
            ])
            .unwrap();
        input
    }

    #[test]
    fn test_record_roundtrip() {
        let record = EvDevRecord {
            secs: 1700000000,
            usecs: 123456,
            kind: 1,
            code: 28,
            value: 1,
        };
        let bytes = record.to_bytes();
        assert_eq!(EvDevRecord::from_bytes(&bytes), record);
        assert_eq!(record.timestamp(), 1700000000 * 1_000_000 + 123456);
    }

    #[test]
    fn test_map_attaches_timestamp() {
        let mut input = test_input();
        let record = RawRecord::Ev(EvDevRecord {
            secs: 10,
            usecs: 20,
            kind: 1,
            code: 28,
            value: 1,
        });
        match input.map(&record) {
            Some(Event::Input(ev)) => {
                assert_eq!(ev.key, Key::Select);
                assert_eq!(ev.action, Action::Down);
                assert_eq!(ev.ts, 10_000_020);
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_unmapped_record_is_none() {
        let mut input = test_input();
        let record = RawRecord::Ev(EvDevRecord {
            secs: 0,
            usecs: 0,
            kind: 1,
            code: 99,
            value: 1,
        });
        assert!(input.map(&record).is_none());
    }

    #[test]
    fn test_encoder_value_mapping() {
        let mut input = test_input();
        let record = RawRecord::Ev(EvDevRecord {
            secs: 0,
            usecs: 0,
            kind: 2,
            code: 7,
            value: -1,
        });
        match input.map(&record) {
            Some(Event::Input(ev)) => {
                assert_eq!(ev.key, Key::Encoder);
                assert_eq!(ev.value, -1);
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_mapping_last_wins() {
        let mut input = EvDevInput::new("/dev/input/event0", "keys", false);
        input
            .set_mappings(&[
                json!({
                    "input": {"type": 1, "code": 1, "value": 1},
                    "event": {"type": "input", "name": "back", "action": "down"}
                }),
                json!({
                    "input": {"type": 1, "code": 1, "value": 1},
                    "event": {"type": "input", "name": "select", "action": "down"}
                }),
            ])
            .unwrap();
        let record = RawRecord::Ev(EvDevRecord {
            secs: 0,
            usecs: 0,
            kind: 1,
            code: 1,
            value: 1,
        });
        match input.map(&record) {
            Some(Event::Input(ev)) => assert_eq!(ev.key, Key::Select),
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_read_from_regular_file() {
        // regular files never block, which makes them a handy stand-in
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let rec1 = EvDevRecord {
            secs: 1,
            usecs: 0,
            kind: 1,
            code: 28,
            value: 1,
        };
        let rec2 = EvDevRecord {
            secs: 1,
            usecs: 5,
            kind: 1,
            code: 28,
            value: 0,
        };
        let mut data = Vec::new();
        data.extend_from_slice(&rec1.to_bytes());
        data.extend_from_slice(&rec2.to_bytes());
        std::fs::write(&path, data).unwrap();

        let mut input = EvDevInput::new(path.to_str().unwrap(), "keys", false);
        input.open().unwrap();
        let records = input.read().unwrap();
        assert_eq!(records.len(), 2);
    }
}
