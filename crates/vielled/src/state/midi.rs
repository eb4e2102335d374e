//! MIDI port state.
//!
//! Ports are discovered by the ALSA shim and diffed against the known
//! set on every hotplug event. Internal gadget ports (`f_midi*`) only
//! exist on the card selected by the current UDC configuration.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::signals::EventData;
use crate::state::{get_bool, get_i32, set_attr, Changes};

/// An enumerated hardware MIDI port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPortInfo {
    /// Stable port id, e.g. "usb-1.2" or "f_midi.0".
    pub id: String,
    /// ALSA card index the port lives on.
    pub card_idx: i32,
    /// Device node, e.g. "/dev/snd/midiC1D0".
    pub device: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MidiPortState {
    pub port: MidiPortInfo,

    pub input_enabled: bool,
    pub input_auto: bool,
    pub output_enabled: bool,
    pub output_auto: bool,

    // channels are 0-based, -1 means OFF
    pub melody_channel: i32,
    pub trompette_channel: i32,
    pub drone_channel: i32,

    pub program_change: bool,
    pub speed: i32,
}

impl MidiPortState {
    pub fn new(port: MidiPortInfo) -> Self {
        Self {
            port,
            input_enabled: false,
            input_auto: false,
            output_enabled: false,
            output_auto: false,
            melody_channel: 0,
            trompette_channel: 1,
            drone_channel: 2,
            program_change: false,
            speed: 0,
        }
    }

    pub(crate) fn prefix(&self) -> &'static str {
        "midi:port"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        Some(self.port.id.clone())
    }

    pub fn to_midi_dict(&self) -> Value {
        json!({
            "input_enabled": self.input_enabled,
            "input_auto": self.input_auto,
            "output_enabled": self.output_enabled,
            "output_auto": self.output_auto,
            "melody_channel": self.melody_channel,
            "drone_channel": self.drone_channel,
            "trompette_channel": self.trompette_channel,
            "program_change": self.program_change,
            "speed": self.speed,
        })
    }

    /// Restore from a `midi:<port-id>` config blob. Enabled flags are
    /// only restored when the corresponding auto flag is set; a port
    /// without auto always comes up disabled.
    pub fn from_midi_dict(&mut self, data: &Value, ch: &mut Changes) {
        if let Some(v) = get_i32(data, "melody_channel") {
            set_attr!(ch, self, melody_channel, v);
        }
        if let Some(v) = get_i32(data, "trompette_channel") {
            set_attr!(ch, self, trompette_channel, v);
        }
        if let Some(v) = get_i32(data, "drone_channel") {
            set_attr!(ch, self, drone_channel, v);
        }
        if let Some(v) = get_bool(data, "program_change") {
            set_attr!(ch, self, program_change, v);
        }
        if let Some(v) = get_i32(data, "speed") {
            set_attr!(ch, self, speed, v);
        }

        if let Some(v) = get_bool(data, "input_auto") {
            set_attr!(ch, self, input_auto, v);
        }
        if self.input_auto {
            if let Some(v) = get_bool(data, "input_enabled") {
                set_attr!(ch, self, input_enabled, v);
            }
        }

        if let Some(v) = get_bool(data, "output_auto") {
            set_attr!(ch, self, output_auto, v);
        }
        if self.output_auto {
            if let Some(v) = get_bool(data, "output_enabled") {
                set_attr!(ch, self, output_enabled, v);
            }
        }
    }

    fn event_payload(&self) -> EventData {
        let mut data = EventData::new();
        data.sender = self.sender();
        data.insert("port", json!(self.port.id));
        data.insert("device", json!(self.port.device));
        data.insert("input_enabled", json!(self.input_enabled));
        data.insert("output_enabled", json!(self.output_enabled));
        data
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MidiState {
    /// Index of the active USB gadget configuration, -1 when unknown.
    pub udc_config: i32,
    pub ports: BTreeMap<String, MidiPortState>,
}

impl MidiState {
    pub fn new() -> Self {
        Self {
            udc_config: -1,
            ports: BTreeMap::new(),
        }
    }

    pub(crate) fn prefix(&self) -> &'static str {
        "midi"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        None
    }

    /// Ports ordered by id.
    pub fn port_states(&self) -> impl Iterator<Item = &MidiPortState> {
        self.ports.values()
    }

    /// Diff the enumerated ports against the known set, emitting
    /// `midi:port:added` / `midi:port:removed` per change and one
    /// `midi:changed` when anything happened. New ports are initialised
    /// from their stored config blob via `load_config`.
    pub fn update_port_states<F>(
        &mut self,
        available: Vec<MidiPortInfo>,
        load_config: F,
        ch: &mut Changes,
    ) where
        F: Fn(&str) -> Option<Value>,
    {
        let visible: Vec<MidiPortInfo> = available
            .into_iter()
            .filter(|p| !p.id.starts_with("f_midi") || p.card_idx == self.udc_config)
            .collect();

        let visible_ids: Vec<&str> = visible.iter().map(|p| p.id.as_str()).collect();
        let to_remove: Vec<String> = self
            .ports
            .keys()
            .filter(|id| !visible_ids.contains(&id.as_str()))
            .cloned()
            .collect();
        let mut changed = false;

        for id in to_remove {
            if let Some(port_state) = self.ports.remove(&id) {
                ch.push("midi:port:removed".to_string(), port_state.event_payload());
                changed = true;
            }
        }

        for port in visible {
            if self.ports.contains_key(&port.id) {
                continue;
            }
            let id = port.id.clone();
            let mut port_state = MidiPortState::new(port);
            ch.push("midi:port:added".to_string(), port_state.event_payload());
            if let Some(config) = load_config(&id) {
                port_state.from_midi_dict(&config, ch);
            }
            self.ports.insert(id, port_state);
            changed = true;
        }

        if changed {
            let mut data = EventData::new();
            data.sender = self.sender();
            ch.push("midi:changed".to_string(), data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: &str, card: i32) -> MidiPortInfo {
        MidiPortInfo {
            id: id.to_string(),
            card_idx: card,
            device: format!("/dev/snd/midiC{}D0", card),
        }
    }

    #[test]
    fn test_add_and_remove_ports() {
        let mut midi = MidiState::new();
        let mut ch = Changes::new();

        midi.update_port_states(vec![port("usb-1", 1)], |_| None, &mut ch);
        assert_eq!(midi.ports.len(), 1);
        let names: Vec<_> = ch.events().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["midi:port:added", "midi:changed"]);

        let mut ch = Changes::new();
        midi.update_port_states(vec![], |_| None, &mut ch);
        assert!(midi.ports.is_empty());
        let names: Vec<_> = ch.events().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["midi:port:removed", "midi:changed"]);
    }

    #[test]
    fn test_no_events_when_unchanged() {
        let mut midi = MidiState::new();
        let mut ch = Changes::new();
        midi.update_port_states(vec![port("usb-1", 1)], |_| None, &mut ch);

        let mut ch = Changes::new();
        midi.update_port_states(vec![port("usb-1", 1)], |_| None, &mut ch);
        assert!(ch.events().is_empty());
    }

    #[test]
    fn test_gadget_ports_follow_udc_config() {
        let mut midi = MidiState::new();
        let mut ch = Changes::new();

        // udc_config -1: no gadget port visible
        midi.update_port_states(vec![port("f_midi.0", 0)], |_| None, &mut ch);
        assert!(midi.ports.is_empty());

        midi.udc_config = 0;
        midi.update_port_states(vec![port("f_midi.0", 0)], |_| None, &mut ch);
        assert_eq!(midi.ports.len(), 1);

        // switching configurations removes the old gadget port
        midi.udc_config = 1;
        midi.update_port_states(vec![port("f_midi.0", 0)], |_| None, &mut ch);
        assert!(midi.ports.is_empty());
    }

    #[test]
    fn test_new_port_loads_stored_config() {
        let mut midi = MidiState::new();
        let mut ch = Changes::new();
        midi.update_port_states(
            vec![port("usb-1", 1)],
            |id| {
                assert_eq!(id, "usb-1");
                Some(json!({
                    "melody_channel": 4,
                    "input_auto": true,
                    "input_enabled": true,
                    "output_enabled": true,
                }))
            },
            &mut ch,
        );
        let state = midi.ports.get("usb-1").unwrap();
        assert_eq!(state.melody_channel, 4);
        assert!(state.input_enabled, "auto input restores enabled flag");
        assert!(
            !state.output_enabled,
            "output_enabled must not restore without output_auto"
        );
    }
}
