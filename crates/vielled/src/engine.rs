//! Interface to the realtime string engine.
//!
//! The engine itself is an external collaborator; the control plane only
//! pushes parameters and brackets coherent multi-parameter updates with
//! `halt_outputs` / `resume_outputs`. The trait is implemented by the
//! native binding on the device and by recording fakes in tests.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device call failed: {0}")]
    Failed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-string engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Mute,
    Volume,
    Polyphonic,
    ChienThreshold,
    Capo,
    Panning,
    NoteOn,
    AllNotesOff,
    BaseNote,
    Reset,
    Mode,
}

impl Param {
    pub fn as_str(&self) -> &'static str {
        match self {
            Param::Mute => "mute",
            Param::Volume => "volume",
            Param::Polyphonic => "polyphonic",
            Param::ChienThreshold => "chien_threshold",
            Param::Capo => "capo",
            Param::Panning => "panning",
            Param::NoteOn => "note_on",
            Param::AllNotesOff => "all_notes_off",
            Param::BaseNote => "base_note",
            Param::Reset => "reset",
            Param::Mode => "mode",
        }
    }
}

/// One `(string, param, value)` tuple pushed to the engine.
pub type StringParam = (String, Param, i32);

/// A single point of a controller-value mapping curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRange {
    pub src: i32,
    pub dst: i32,
}

/// One key calibration entry (24 keys total).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCalibration {
    pub pressure: i32,
    pub velocity: i32,
}

impl Default for KeyCalibration {
    fn default() -> Self {
        Self {
            pressure: 1000,
            velocity: 0,
        }
    }
}

/// Metadata for one mapping exposed over the HTTP API.
#[derive(Debug, Clone, Copy)]
pub struct MappingInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub src_name: &'static str,
    pub src_min: i32,
    pub src_max: i32,
    pub dst_name: &'static str,
    pub dst_min: i32,
    pub dst_max: i32,
}

impl MappingInfo {
    /// The identity curve between the endpoint ranges.
    pub fn default_ranges(&self) -> Vec<MappingRange> {
        vec![
            MappingRange {
                src: self.src_min,
                dst: self.dst_min,
            },
            MappingRange {
                src: self.src_max,
                dst: self.dst_max,
            },
        ]
    }
}

pub const MAPPINGS: &[MappingInfo] = &[
    MappingInfo {
        id: "pressure_to_poly",
        name: "Key Pressure to Polyphonic Aftertouch",
        src_name: "Key Pressure",
        src_min: 0,
        src_max: 3000,
        dst_name: "Polyphonic Aftertouch",
        dst_min: 0,
        dst_max: 127,
    },
    MappingInfo {
        id: "pressure_to_pitch",
        name: "Key Pressure to Pitch Bend",
        src_name: "Key Pressure",
        src_min: 0,
        src_max: 3000,
        dst_name: "Pitch Bend",
        dst_min: -0x2000,
        dst_max: 0x2000,
    },
    MappingInfo {
        id: "speed_to_melody_volume",
        name: "Wheel Speed to Melody Volume",
        src_name: "Wheel Speed",
        src_min: 0,
        src_max: 5000,
        dst_name: "Melody Volume",
        dst_min: 0,
        dst_max: 127,
    },
    MappingInfo {
        id: "speed_to_drone_volume",
        name: "Wheel Speed to Drone Volume",
        src_name: "Wheel Speed",
        src_min: 0,
        src_max: 5000,
        dst_name: "Drone Volume",
        dst_min: 0,
        dst_max: 127,
    },
    MappingInfo {
        id: "speed_to_trompette_volume",
        name: "Wheel Speed to Trompette Volume",
        src_name: "Wheel Speed",
        src_min: 0,
        src_max: 5000,
        dst_name: "Trompette Volume",
        dst_min: 0,
        dst_max: 127,
    },
    MappingInfo {
        id: "speed_to_chien",
        name: "Coup Speed to Chien Volume",
        src_name: "Coup Speed",
        src_min: 0,
        src_max: 4000,
        dst_name: "Chien Volume",
        dst_min: 0,
        dst_max: 127,
    },
];

pub fn mapping_info(id: &str) -> Option<&'static MappingInfo> {
    MAPPINGS.iter().find(|m| m.id == id)
}

/// Control interface of the string engine.
pub trait StringEngine: Send + Sync {
    fn set_string_params(&self, params: &[StringParam]) -> Result<(), DeviceError>;

    /// Stop producing audio/MIDI output. Every `halt_outputs` must be
    /// paired with a `resume_outputs`, also on error paths.
    fn halt_outputs(&self);
    fn resume_outputs(&self);

    fn set_pitchbend_range(&self, cents: i32) -> Result<(), DeviceError>;
    fn set_key_on_debounce(&self, value: i32) -> Result<(), DeviceError>;
    fn set_key_off_debounce(&self, value: i32) -> Result<(), DeviceError>;
    fn set_base_note_delay(&self, value: i32) -> Result<(), DeviceError>;

    fn set_mapping_ranges(&self, name: &str, ranges: &[MappingRange]) -> Result<(), DeviceError>;
    fn reset_mapping_ranges(&self, name: &str) -> Result<(), DeviceError>;
    fn get_mapping_ranges(&self, name: &str) -> Vec<MappingRange>;

    fn set_key_calibration(&self, entries: &[KeyCalibration]) -> Result<(), DeviceError>;

    fn add_midi_output(&self, device: &str) -> Result<(), DeviceError>;
    fn remove_midi_output(&self, device: &str) -> Result<(), DeviceError>;
}

/// Guard pairing `halt_outputs` with `resume_outputs` on all exit paths.
pub struct OutputHold<'a> {
    engine: &'a dyn StringEngine,
}

impl<'a> OutputHold<'a> {
    pub fn new(engine: &'a dyn StringEngine) -> Self {
        engine.halt_outputs();
        Self { engine }
    }
}

impl Drop for OutputHold<'_> {
    fn drop(&mut self) {
        self.engine.resume_outputs();
    }
}

/// Engine stand-in used when running without instrument hardware.
#[derive(Default)]
pub struct NullEngine;

impl StringEngine for NullEngine {
    fn set_string_params(&self, params: &[StringParam]) -> Result<(), DeviceError> {
        debug!("set_string_params: {:?}", params);
        Ok(())
    }

    fn halt_outputs(&self) {
        debug!("halt_outputs");
    }

    fn resume_outputs(&self) {
        debug!("resume_outputs");
    }

    fn set_pitchbend_range(&self, _cents: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_key_on_debounce(&self, _value: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_key_off_debounce(&self, _value: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_base_note_delay(&self, _value: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_mapping_ranges(&self, _name: &str, _ranges: &[MappingRange]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn reset_mapping_ranges(&self, _name: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    fn get_mapping_ranges(&self, name: &str) -> Vec<MappingRange> {
        mapping_info(name)
            .map(|m| m.default_ranges())
            .unwrap_or_default()
    }

    fn set_key_calibration(&self, _entries: &[KeyCalibration]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn add_midi_output(&self, _device: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    fn remove_midi_output(&self, _device: &str) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Recording engine for tests: captures every call in order.
#[derive(Default)]
pub struct RecordingEngine {
    pub calls: Mutex<Vec<EngineCall>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    StringParams(Vec<(String, &'static str, i32)>),
    Halt,
    Resume,
    PitchbendRange(i32),
    KeyOnDebounce(i32),
    KeyOffDebounce(i32),
    BaseNoteDelay(i32),
    MappingRanges(String, Vec<MappingRange>),
    ResetMapping(String),
    KeyCalibration(usize),
    AddMidiOutput(String),
    RemoveMidiOutput(String),
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }

    /// All recorded string-param tuples, flattened.
    pub fn param_tuples(&self) -> Vec<(String, &'static str, i32)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                EngineCall::StringParams(params) => Some(params.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl StringEngine for RecordingEngine {
    fn set_string_params(&self, params: &[StringParam]) -> Result<(), DeviceError> {
        self.record(EngineCall::StringParams(
            params
                .iter()
                .map(|(s, p, v)| (s.clone(), p.as_str(), *v))
                .collect(),
        ));
        Ok(())
    }

    fn halt_outputs(&self) {
        self.record(EngineCall::Halt);
    }

    fn resume_outputs(&self) {
        self.record(EngineCall::Resume);
    }

    fn set_pitchbend_range(&self, cents: i32) -> Result<(), DeviceError> {
        self.record(EngineCall::PitchbendRange(cents));
        Ok(())
    }

    fn set_key_on_debounce(&self, value: i32) -> Result<(), DeviceError> {
        self.record(EngineCall::KeyOnDebounce(value));
        Ok(())
    }

    fn set_key_off_debounce(&self, value: i32) -> Result<(), DeviceError> {
        self.record(EngineCall::KeyOffDebounce(value));
        Ok(())
    }

    fn set_base_note_delay(&self, value: i32) -> Result<(), DeviceError> {
        self.record(EngineCall::BaseNoteDelay(value));
        Ok(())
    }

    fn set_mapping_ranges(&self, name: &str, ranges: &[MappingRange]) -> Result<(), DeviceError> {
        self.record(EngineCall::MappingRanges(name.to_string(), ranges.to_vec()));
        Ok(())
    }

    fn reset_mapping_ranges(&self, name: &str) -> Result<(), DeviceError> {
        self.record(EngineCall::ResetMapping(name.to_string()));
        Ok(())
    }

    fn get_mapping_ranges(&self, name: &str) -> Vec<MappingRange> {
        mapping_info(name)
            .map(|m| m.default_ranges())
            .unwrap_or_default()
    }

    fn set_key_calibration(&self, entries: &[KeyCalibration]) -> Result<(), DeviceError> {
        self.record(EngineCall::KeyCalibration(entries.len()));
        Ok(())
    }

    fn add_midi_output(&self, device: &str) -> Result<(), DeviceError> {
        self.record(EngineCall::AddMidiOutput(device.to_string()));
        Ok(())
    }

    fn remove_midi_output(&self, device: &str) -> Result<(), DeviceError> {
        self.record(EngineCall::RemoveMidiOutput(device.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_hold_resumes_on_drop() {
        let engine = RecordingEngine::new();
        {
            let _hold = OutputHold::new(&engine);
            engine.set_pitchbend_range(100).unwrap();
        }
        assert_eq!(
            engine.take_calls(),
            vec![
                EngineCall::Halt,
                EngineCall::PitchbendRange(100),
                EngineCall::Resume
            ]
        );
    }

    #[test]
    fn test_output_hold_resumes_on_panic() {
        let engine = RecordingEngine::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _hold = OutputHold::new(&engine);
            panic!("configuration failed");
        }));
        assert!(result.is_err());
        let calls = engine.take_calls();
        assert_eq!(calls.last(), Some(&EngineCall::Resume));
    }

    #[test]
    fn test_mapping_catalog() {
        let info = mapping_info("speed_to_chien").unwrap();
        assert_eq!(info.src_max, 4000);
        let ranges = info.default_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], MappingRange { src: 0, dst: 0 });
        assert!(mapping_info("nope").is_none());
    }
}
