//! Dotted state paths.
//!
//! Input maps and remote clients address state attributes with paths
//! like `preset.melody.0.volume` or `ui.brightness`. Paths resolve
//! through an explicit match over known segments; parsed paths are
//! cached by the [`StateHandle`](super::StateHandle). Integer segments
//! index voice lists.

use serde_json::Value;

use crate::state::voice::{VoiceKind, VoiceMode};
use crate::state::{set_attr, Changes, ModKeyMode, State, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootField {
    MainVolume,
    ReverbVolume,
    ReverbPanning,
    CoarseTune,
    FineTune,
    LastPresetNumber,
    PitchbendRange,
    KeyOnDebounce,
    KeyOffDebounce,
    BaseNoteDelay,
    InstrumentMode,
    StringCount,
    Mod1KeyMode,
    Mod2KeyMode,
    WrapPresets,
    WrapGroups,
    MultiChienThreshold,
    ChienSensReverse,
    PolyBaseNote,
    PolyPitchBend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiField {
    StringGroup,
    StringGroupByType,
    Brightness,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceField {
    Volume,
    Panning,
    Muted,
    BaseNote,
    Capo,
    Polyphonic,
    Mode,
    Finetune,
    ChienThreshold,
    Bank,
    Program,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatePath {
    Root(RootField),
    Ui(UiField),
    SynthGain,
    MidiUdcConfig,
    Voice {
        kind: VoiceKind,
        index: usize,
        field: VoiceField,
    },
}

impl StatePath {
    pub fn parse(path: &str) -> Result<StatePath, StateError> {
        let segments: Vec<&str> = path.split('.').collect();
        match segments.as_slice() {
            [root] => Ok(StatePath::Root(parse_root(path, root)?)),
            ["ui", field] => Ok(StatePath::Ui(match *field {
                "string_group" => UiField::StringGroup,
                "string_group_by_type" => UiField::StringGroupByType,
                "brightness" => UiField::Brightness,
                "timeout" => UiField::Timeout,
                _ => return Err(StateError::UnknownPath(path.to_string())),
            })),
            ["synth", "gain"] => Ok(StatePath::SynthGain),
            ["midi", "udc_config"] => Ok(StatePath::MidiUdcConfig),
            ["preset", kind, index, field] => {
                let kind = VoiceKind::from_name(kind)
                    .ok_or_else(|| StateError::UnknownPath(path.to_string()))?;
                let index: usize = index
                    .parse()
                    .map_err(|_| StateError::UnknownPath(path.to_string()))?;
                let max = if kind == VoiceKind::Keynoise { 1 } else { 3 };
                if index >= max {
                    return Err(StateError::UnknownPath(path.to_string()));
                }
                Ok(StatePath::Voice {
                    kind,
                    index,
                    field: parse_voice_field(path, field)?,
                })
            }
            _ => Err(StateError::UnknownPath(path.to_string())),
        }
    }

    /// Assign through the resolved path, queueing change events.
    pub fn assign(
        &self,
        state: &mut State,
        value: &Value,
        ch: &mut Changes,
    ) -> Result<(), StateError> {
        match self {
            StatePath::Root(field) => assign_root(state, *field, value, ch),
            StatePath::Ui(field) => {
                let ui = &mut state.ui;
                match field {
                    UiField::StringGroup => {
                        set_attr!(ch, ui, string_group, as_i32(self, value)?);
                    }
                    UiField::StringGroupByType => {
                        set_attr!(ch, ui, string_group_by_type, as_bool(self, value)?);
                    }
                    UiField::Brightness => {
                        set_attr!(ch, ui, brightness, as_i32(self, value)?);
                    }
                    UiField::Timeout => {
                        set_attr!(ch, ui, timeout, as_i32(self, value)?);
                    }
                }
                Ok(())
            }
            StatePath::SynthGain => {
                let synth = &mut state.synth;
                set_attr!(ch, synth, gain, as_i32(self, value)?);
                Ok(())
            }
            StatePath::MidiUdcConfig => {
                let midi = &mut state.midi;
                let config = as_i32(self, value)?;
                if midi.udc_config != config {
                    midi.udc_config = config;
                    let mut data = crate::signals::EventData::with("udc_config", value.clone());
                    data.sender = None;
                    ch.push("midi:udc_config:changed".to_string(), data);
                }
                Ok(())
            }
            StatePath::Voice { kind, index, field } => {
                let voice = state
                    .preset
                    .voices_by_kind_mut(*kind)
                    .get_mut(*index)
                    .ok_or_else(|| StateError::UnknownPath(format!("{:?}", self)))?;
                match field {
                    VoiceField::Volume => {
                        set_attr!(ch, voice, volume, as_i32(self, value)?);
                    }
                    VoiceField::Panning => {
                        set_attr!(ch, voice, panning, as_i32(self, value)?);
                    }
                    VoiceField::Muted => {
                        set_attr!(ch, voice, muted, as_bool(self, value)?);
                    }
                    VoiceField::BaseNote => {
                        set_attr!(ch, voice, base_note, as_i32(self, value)?);
                    }
                    VoiceField::Capo => {
                        set_attr!(ch, voice, capo, as_i32(self, value)?);
                    }
                    VoiceField::Polyphonic => {
                        set_attr!(ch, voice, polyphonic, as_bool(self, value)?);
                    }
                    VoiceField::Mode => {
                        let mode = value
                            .as_str()
                            .and_then(VoiceMode::from_name)
                            .ok_or_else(|| invalid(self, value))?;
                        set_attr!(ch, voice, mode, mode);
                    }
                    VoiceField::Finetune => {
                        set_attr!(ch, voice, finetune, as_i32(self, value)?);
                    }
                    VoiceField::ChienThreshold => {
                        set_attr!(ch, voice, chien_threshold, as_i32(self, value)?);
                    }
                    VoiceField::Bank => {
                        set_attr!(ch, voice, bank, as_i32(self, value)?);
                    }
                    VoiceField::Program => {
                        set_attr!(ch, voice, program, as_i32(self, value)?);
                    }
                }
                Ok(())
            }
        }
    }
}

fn parse_root(path: &str, name: &str) -> Result<RootField, StateError> {
    Ok(match name {
        "main_volume" => RootField::MainVolume,
        "reverb_volume" => RootField::ReverbVolume,
        "reverb_panning" => RootField::ReverbPanning,
        "coarse_tune" => RootField::CoarseTune,
        "fine_tune" => RootField::FineTune,
        "last_preset_number" => RootField::LastPresetNumber,
        "pitchbend_range" => RootField::PitchbendRange,
        "key_on_debounce" => RootField::KeyOnDebounce,
        "key_off_debounce" => RootField::KeyOffDebounce,
        "base_note_delay" => RootField::BaseNoteDelay,
        "instrument_mode" => RootField::InstrumentMode,
        "string_count" => RootField::StringCount,
        "mod1_key_mode" => RootField::Mod1KeyMode,
        "mod2_key_mode" => RootField::Mod2KeyMode,
        "wrap_presets" => RootField::WrapPresets,
        "wrap_groups" => RootField::WrapGroups,
        "multi_chien_threshold" => RootField::MultiChienThreshold,
        "chien_sens_reverse" => RootField::ChienSensReverse,
        "poly_base_note" => RootField::PolyBaseNote,
        "poly_pitch_bend" => RootField::PolyPitchBend,
        // structural attributes exist but cannot be assigned
        "preset" | "ui" | "synth" | "power" | "midi" => {
            return Err(StateError::NotWritable(path.to_string()))
        }
        _ => return Err(StateError::UnknownPath(path.to_string())),
    })
}

fn parse_voice_field(path: &str, name: &str) -> Result<VoiceField, StateError> {
    Ok(match name {
        "volume" => VoiceField::Volume,
        "panning" => VoiceField::Panning,
        "muted" => VoiceField::Muted,
        "base_note" => VoiceField::BaseNote,
        "capo" => VoiceField::Capo,
        "polyphonic" => VoiceField::Polyphonic,
        "mode" => VoiceField::Mode,
        "finetune" => VoiceField::Finetune,
        "chien_threshold" => VoiceField::ChienThreshold,
        "bank" => VoiceField::Bank,
        "program" => VoiceField::Program,
        // derived voice attributes are read-only
        "string" | "channel" | "number" | "kind" | "soundfont" => {
            return Err(StateError::NotWritable(path.to_string()))
        }
        _ => return Err(StateError::UnknownPath(path.to_string())),
    })
}

fn assign_root(
    state: &mut State,
    field: RootField,
    value: &Value,
    ch: &mut Changes,
) -> Result<(), StateError> {
    let path = StatePath::Root(field);
    match field {
        RootField::MainVolume => {
            set_attr!(ch, state, main_volume, as_i32(&path, value)?);
        }
        RootField::ReverbVolume => {
            set_attr!(ch, state, reverb_volume, as_i32(&path, value)?);
        }
        RootField::ReverbPanning => {
            set_attr!(ch, state, reverb_panning, as_i32(&path, value)?);
        }
        RootField::CoarseTune => {
            set_attr!(ch, state, coarse_tune, as_i32(&path, value)?);
        }
        RootField::FineTune => {
            set_attr!(ch, state, fine_tune, as_i32(&path, value)?);
        }
        RootField::LastPresetNumber => {
            set_attr!(ch, state, last_preset_number, as_i32(&path, value)? as i64);
        }
        RootField::PitchbendRange => {
            set_attr!(ch, state, pitchbend_range, as_i32(&path, value)?);
        }
        RootField::KeyOnDebounce => {
            set_attr!(ch, state, key_on_debounce, as_i32(&path, value)?);
        }
        RootField::KeyOffDebounce => {
            set_attr!(ch, state, key_off_debounce, as_i32(&path, value)?);
        }
        RootField::BaseNoteDelay => {
            set_attr!(ch, state, base_note_delay, as_i32(&path, value)?);
        }
        RootField::InstrumentMode => {
            let name = value.as_str().ok_or_else(|| invalid(&path, value))?;
            state.set_instrument_mode(name, ch);
        }
        RootField::StringCount => {
            set_attr!(ch, state, string_count, as_i32(&path, value)?);
        }
        RootField::Mod1KeyMode => {
            let mode = value
                .as_str()
                .and_then(ModKeyMode::from_name)
                .ok_or_else(|| invalid(&path, value))?;
            set_attr!(ch, state, mod1_key_mode, mode);
        }
        RootField::Mod2KeyMode => {
            let mode = value
                .as_str()
                .and_then(ModKeyMode::from_name)
                .ok_or_else(|| invalid(&path, value))?;
            set_attr!(ch, state, mod2_key_mode, mode);
        }
        RootField::WrapPresets => {
            set_attr!(ch, state, wrap_presets, as_bool(&path, value)?);
        }
        RootField::WrapGroups => {
            set_attr!(ch, state, wrap_groups, as_bool(&path, value)?);
        }
        RootField::MultiChienThreshold => {
            set_attr!(ch, state, multi_chien_threshold, as_bool(&path, value)?);
        }
        RootField::ChienSensReverse => {
            set_attr!(ch, state, chien_sens_reverse, as_bool(&path, value)?);
        }
        RootField::PolyBaseNote => {
            set_attr!(ch, state, poly_base_note, as_bool(&path, value)?);
        }
        RootField::PolyPitchBend => {
            set_attr!(ch, state, poly_pitch_bend, as_bool(&path, value)?);
        }
    }
    Ok(())
}

fn as_i32(path: &StatePath, value: &Value) -> Result<i32, StateError> {
    value
        .as_i64()
        .map(|v| v as i32)
        .ok_or_else(|| invalid(path, value))
}

fn as_bool(path: &StatePath, value: &Value) -> Result<bool, StateError> {
    value.as_bool().ok_or_else(|| invalid(path, value))
}

fn invalid(path: &StatePath, value: &Value) -> StateError {
    StateError::InvalidValue {
        path: format!("{:?}", path),
        value: value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_handle;
    use serde_json::json;

    #[test]
    fn test_scalar_assignment() {
        let handle = test_handle();
        handle.set_by_path("main_volume", &json!(90)).unwrap();
        handle.set_by_path("ui.brightness", &json!(55)).unwrap();
        handle.set_by_path("synth.gain", &json!(70)).unwrap();
        handle.with(|state| {
            assert_eq!(state.main_volume, 90);
            assert_eq!(state.ui.brightness, 55);
            assert_eq!(state.synth.gain, 70);
        });
    }

    #[test]
    fn test_voice_assignment_emits_prefixed_event() {
        let handle = test_handle();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = std::sync::Arc::clone(&seen);
            handle.signals.register(
                "active:preset:voice:base_note:changed",
                move |_, data| {
                    seen.lock()
                        .unwrap()
                        .push((data.sender.clone(), data.get_i64("base_note")));
                },
            );
        }
        handle
            .set_by_path("preset.melody.0.base_note", &json!(62))
            .unwrap();
        handle.with(|state| assert_eq!(state.preset.melody[0].base_note, 62));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some("melody1".to_string()), Some(62))]
        );
    }

    #[test]
    fn test_instrument_mode_path_applies_profile() {
        let handle = test_handle();
        handle
            .set_by_path("instrument_mode", &json!("nine_cols"))
            .unwrap();
        handle.with(|state| {
            assert_eq!(state.string_count, 3);
            assert!(state.ui.string_group_by_type);
            assert_eq!(state.ui.string_group, 1);
        });
    }

    #[test]
    fn test_unknown_and_readonly_paths() {
        let handle = test_handle();
        assert!(matches!(
            handle.set_by_path("does.not.exist", &json!(1)),
            Err(StateError::UnknownPath(_))
        ));
        assert!(matches!(
            handle.set_by_path("preset.melody.0.channel", &json!(5)),
            Err(StateError::NotWritable(_))
        ));
        assert!(matches!(
            handle.set_by_path("preset", &json!(1)),
            Err(StateError::NotWritable(_))
        ));
        assert!(matches!(
            handle.set_by_path("preset.melody.7.volume", &json!(1)),
            Err(StateError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_invalid_value_type() {
        let handle = test_handle();
        assert!(matches!(
            handle.set_by_path("main_volume", &json!("loud")),
            Err(StateError::InvalidValue { .. })
        ));
        assert!(matches!(
            handle.set_by_path("preset.melody.0.mode", &json!("dulcimer")),
            Err(StateError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_cache_reuse() {
        let handle = test_handle();
        handle.set_by_path("main_volume", &json!(10)).unwrap();
        handle.set_by_path("main_volume", &json!(20)).unwrap();
        handle.with(|state| assert_eq!(state.main_volume, 20));
    }
}
