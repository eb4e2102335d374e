//! Hardware MIDI input: a non-blocking raw device reader, a streaming
//! channel-message parser and the mapping rules that turn messages into
//! semantic events.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::RawFd;

use serde_json::Value;

use crate::events::Event;
use crate::input::exprs::{Cond, ValueExpr};
use crate::input::{config_str, open_nonblocking, InputError, InputSource, RawRecord};

const BUFFER_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    NoteOff = 0,
    NoteOn = 1,
    Aftertouch = 2,
    ControlChange = 3,
    ProgramChange = 4,
    ChannelPressure = 5,
    PitchBend = 6,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageType::NoteOff,
            1 => MessageType::NoteOn,
            2 => MessageType::Aftertouch,
            3 => MessageType::ControlChange,
            4 => MessageType::ProgramChange,
            5 => MessageType::ChannelPressure,
            6 => MessageType::PitchBend,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NoteOff => "note_off",
            MessageType::NoteOn => "note_on",
            MessageType::Aftertouch => "aftertouch",
            MessageType::ControlChange => "control_change",
            MessageType::ProgramChange => "program_change",
            MessageType::ChannelPressure => "channel_pressure",
            MessageType::PitchBend => "pitch_bend",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "note_off" => MessageType::NoteOff,
            "note_on" => MessageType::NoteOn,
            "aftertouch" => MessageType::Aftertouch,
            "control_change" => MessageType::ControlChange,
            "program_change" => MessageType::ProgramChange,
            "channel_pressure" => MessageType::ChannelPressure,
            "pitch_bend" => MessageType::PitchBend,
            _ => return None,
        })
    }

    /// program_change and channel_pressure carry a single data byte.
    fn is_single_byte(&self) -> bool {
        matches!(self, MessageType::ProgramChange | MessageType::ChannelPressure)
    }
}

/// A channel voice message. System common messages are not represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    pub channel: u8,
    pub kind: MessageType,
    pub arg1: u8,
    pub arg2: Option<u8>,
}

impl MidiMessage {
    /// Wire encoding, used by tests feeding the parser.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0x80 | ((self.kind as u8) << 4) | (self.channel & 0x0F), self.arg1];
        if !self.kind.is_single_byte() {
            out.push(self.arg2.unwrap_or(0));
        }
        out
    }
}

/// Streaming parser for raw MIDI byte streams. Only channel voice
/// messages are produced; system common and realtime bytes pass through
/// without disturbing a message in flight. State survives across calls
/// so messages may be split at any byte boundary.
#[derive(Debug, Default)]
pub struct MidiParser {
    code: Option<MessageType>,
    channel: u8,
    arg1: Option<u8>,
}

impl MidiParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, data: &[u8]) -> Vec<MidiMessage> {
        let mut messages = Vec::new();
        for &byte in data {
            if byte & 0x80 != 0 {
                // status byte; 0xF0..=0xFF (system common and realtime,
                // including clock ticks >= 0xF8) must not touch the
                // running-status state
                let code = (byte >> 4) & 0x7;
                match MessageType::from_code(code) {
                    Some(kind) => {
                        self.code = Some(kind);
                        self.channel = byte & 0x0F;
                        self.arg1 = None;
                    }
                    None => continue,
                }
            } else {
                let Some(kind) = self.code else { continue };
                if kind.is_single_byte() {
                    self.arg1 = Some(byte);
                    messages.push(self.finish(None));
                } else if self.arg1.is_some() {
                    messages.push(self.finish(Some(byte)));
                } else {
                    self.arg1 = Some(byte);
                }
            }
        }
        messages
    }

    fn finish(&mut self, arg2: Option<u8>) -> MidiMessage {
        let msg = MidiMessage {
            channel: self.channel,
            kind: self.code.take().unwrap(),
            arg1: self.arg1.take().unwrap_or(0),
            arg2,
        };
        self.channel = 0;
        msg
    }
}

/// One mapping rule: constraints on the incoming message plus the event
/// template to instantiate. A rule without constraints is a catch-all.
struct MidiMapRule {
    kind: Option<MessageType>,
    channel: Option<u8>,
    arg1: Option<u8>,
    arg2: Option<u8>,
    cond: Option<Cond>,
    event: Value,
    exprs: Vec<(String, ValueExpr)>,
}

impl MidiMapRule {
    fn from_config(mapping: &Value) -> Result<Self, InputError> {
        let input = mapping
            .get("input")
            .ok_or_else(|| InputError::InvalidMap("mapping without input".to_string()))?;
        let mut event = mapping
            .get("event")
            .cloned()
            .ok_or_else(|| InputError::InvalidMap("mapping without event".to_string()))?;

        let kind = match input.get("name").and_then(Value::as_str) {
            Some(name) => Some(MessageType::from_name(name).ok_or_else(|| {
                InputError::InvalidMap(format!("unknown message name \"{}\"", name))
            })?),
            None => None,
        };
        let cond = match input.get("cond").and_then(Value::as_str) {
            Some(code) => Some(Cond::parse(code)?),
            None => None,
        };

        let mut exprs = Vec::new();
        if let Some(expr_obj) = event.get("expr").cloned() {
            let map = expr_obj.as_object().ok_or_else(|| {
                InputError::InvalidMap("event expr must be an object".to_string())
            })?;
            for (key, code) in map {
                let code = code.as_str().ok_or_else(|| {
                    InputError::InvalidMap(format!("expr \"{}\" must be a string", key))
                })?;
                exprs.push((key.clone(), ValueExpr::parse(code)?));
            }
            event.as_object_mut().unwrap().remove("expr");
        }

        // validate the template eagerly so a broken map fails at load
        if exprs.is_empty() {
            Event::from_mapping(&event)?;
        }

        Ok(Self {
            kind,
            channel: input.get("channel").and_then(Value::as_u64).map(|v| v as u8),
            arg1: input.get("arg1").and_then(Value::as_u64).map(|v| v as u8),
            arg2: input.get("arg2").and_then(Value::as_u64).map(|v| v as u8),
            cond,
            event,
            exprs,
        })
    }

    fn matches(&self, msg: &MidiMessage) -> bool {
        if let Some(kind) = self.kind {
            if msg.kind != kind {
                return false;
            }
        }
        if let Some(channel) = self.channel {
            if msg.channel != channel {
                return false;
            }
        }
        if let Some(arg1) = self.arg1 {
            if msg.arg1 != arg1 {
                return false;
            }
        }
        if let Some(arg2) = self.arg2 {
            if msg.arg2 != Some(arg2) {
                return false;
            }
        }
        if let Some(cond) = &self.cond {
            if !cond.eval(msg) {
                return false;
            }
        }
        true
    }

    fn create_event(&self, msg: &MidiMessage) -> Option<Event> {
        let mut event = self.event.clone();
        for (key, expr) in &self.exprs {
            event[key.as_str()] = Value::from(expr.eval(msg));
        }
        Event::from_mapping(&event).ok()
    }
}

pub struct MidiInput {
    name: String,
    filename: String,
    debug: bool,
    file: Option<File>,
    parser: MidiParser,
    rules: Vec<MidiMapRule>,
}

impl MidiInput {
    pub fn new(device: &str, name: &str, debug: bool) -> Self {
        Self {
            name: name.to_string(),
            filename: device.to_string(),
            debug,
            file: None,
            parser: MidiParser::new(),
            rules: Vec::new(),
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

    pub fn set_mappings(&mut self, mappings: &[Value]) -> Result<(), InputError> {
        self.rules.clear();
        for mapping in mappings {
            self.rules.push(MidiMapRule::from_config(mapping)?);
        }
        Ok(())
    }
}

impl InputSource for MidiInput {
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
            let mut buf = [0u8; BUFFER_SIZE];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for msg in self.parser.parse(&buf[..n]) {
                        records.push(RawRecord::Midi(msg));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    fn map(&mut self, record: &RawRecord) -> Option<Event> {
        let RawRecord::Midi(msg) = record else {
            return None;
        };
        // first matching rule wins
        self.rules
            .iter()
            .find(|rule| rule.matches(msg))
            .and_then(|rule| rule.create_event(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use serde_json::json;

    fn note_on(channel: u8, note: u8, velocity: u8) -> MidiMessage {
        MidiMessage {
            channel,
            kind: MessageType::NoteOn,
            arg1: note,
            arg2: Some(velocity),
        }
    }

    #[test]
    fn test_parse_channel_messages() {
        let mut parser = MidiParser::new();
        let messages = parser.parse(&[0x90, 60, 100, 0xC1, 5, 0xB2, 7, 64]);
        assert_eq!(
            messages,
            vec![
                note_on(0, 60, 100),
                MidiMessage {
                    channel: 1,
                    kind: MessageType::ProgramChange,
                    arg1: 5,
                    arg2: None,
                },
                MidiMessage {
                    channel: 2,
                    kind: MessageType::ControlChange,
                    arg1: 7,
                    arg2: Some(64),
                },
            ]
        );
    }

    #[test]
    fn test_split_at_any_boundary_matches_single_call() {
        let stream: Vec<u8> = vec![0x90, 60, 100, 0x80, 60, 0, 0xC0, 7, 0xE1, 0x12, 0x34];
        let expected = MidiParser::new().parse(&stream);
        assert_eq!(expected.len(), 4);

        for split in 0..=stream.len() {
            let mut parser = MidiParser::new();
            let mut messages = parser.parse(&stream[..split]);
            messages.extend(parser.parse(&stream[split..]));
            assert_eq!(messages, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_realtime_bytes_do_not_reset_state() {
        let mut parser = MidiParser::new();
        // clock ticks interleaved inside a note-on message
        let messages = parser.parse(&[0x90, 0xF8, 60, 0xFE, 100]);
        assert_eq!(messages, vec![note_on(0, 60, 100)]);
    }

    #[test]
    fn test_system_common_ignored() {
        let mut parser = MidiParser::new();
        let messages = parser.parse(&[0xF0, 1, 2, 3, 0xF7, 0x91, 62, 40]);
        // the sysex payload bytes land before any status byte we track;
        // the note-on afterwards must come through unscathed
        assert_eq!(messages, vec![note_on(1, 62, 40)]);
    }

    #[test]
    fn test_data_bytes_without_status_ignored() {
        let mut parser = MidiParser::new();
        assert!(parser.parse(&[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_message_roundtrip_through_parser() {
        let original = vec![
            note_on(3, 64, 90),
            MidiMessage {
                channel: 3,
                kind: MessageType::ChannelPressure,
                arg1: 55,
                arg2: None,
            },
        ];
        let bytes: Vec<u8> = original.iter().flat_map(|m| m.to_bytes()).collect();
        assert_eq!(MidiParser::new().parse(&bytes), original);
    }

    fn test_rules() -> MidiInput {
        let mut input = MidiInput::new("/dev/snd/midiC1D0", "ext", false);
        input
            .set_mappings(&[
                json!({
                    "input": {"name": "control_change", "arg1": 7},
                    "event": {"type": "state_change", "name": "main_volume",
                              "expr": {"value": "arg2"}}
                }),
                json!({
                    "input": {"name": "program_change", "channel": 0},
                    "event": {"type": "state_action", "name": "load_preset",
                              "expr": {"value": "arg1 plus(1)"}}
                }),
                json!({
                    "input": {"name": "note_on", "cond": "arg2 == 0"},
                    "event": {"type": "input", "name": "select", "action": "up"}
                }),
            ])
            .unwrap();
        input
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut input = test_rules();
        let volume = RawRecord::Midi(MidiMessage {
            channel: 2,
            kind: MessageType::ControlChange,
            arg1: 7,
            arg2: Some(99),
        });
        match input.map(&volume) {
            Some(Event::StateChange { path, value }) => {
                assert_eq!(path, "main_volume");
                assert_eq!(value, json!(99));
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_expr_event_values() {
        let mut input = test_rules();
        let pc = RawRecord::Midi(MidiMessage {
            channel: 0,
            kind: MessageType::ProgramChange,
            arg1: 4,
            arg2: None,
        });
        match input.map(&pc) {
            Some(Event::StateAction { name, value }) => {
                assert_eq!(name, "load_preset");
                assert_eq!(value, json!(5), "program 4 selects preset 5");
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_cond_gating() {
        let mut input = test_rules();
        let silent = RawRecord::Midi(note_on(0, 60, 0));
        assert!(matches!(input.map(&silent), Some(Event::Input(_))));
        let loud = RawRecord::Midi(note_on(0, 60, 100));
        assert!(input.map(&loud).is_none());
    }

    #[test]
    fn test_broken_map_rejected_at_load() {
        let mut input = MidiInput::new("/dev/snd/midiC1D0", "ext", false);
        let err = input.set_mappings(&[json!({
            "input": {"name": "note_on", "cond": "arg1 ** 2"},
            "event": {"type": "input", "name": "select", "action": "up"}
        })]);
        assert!(err.is_err());
    }
}
