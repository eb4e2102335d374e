//! Observable instrument state.
//!
//! The whole mutable state of the instrument lives in one tree owned by
//! a [`StateHandle`]. Mutations run through [`StateHandle::apply`]: the
//! re-entrant state lock is taken, the closure mutates the tree and
//! queues change events via the `set_attr!` helper, and the queued
//! events are emitted on the signal bus once the mutable borrow has
//! ended. Signal handlers (controllers, the menu forwarder, websocket
//! queues) may therefore re-read the tree, or mutate it again, from
//! inside their callback without deadlocking; the equality check in
//! `set_attr!` keeps write-back loops from recursing.

pub mod midi;
pub mod path;
pub mod power;
pub mod preset;
pub mod voice;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use viellestore::{PresetRow, Store, StoreError};

use crate::signals::{EventData, Signals};

pub use midi::{MidiPortInfo, MidiPortState, MidiState};
pub use path::StatePath;
pub use power::{PowerSource, PowerState};
pub use preset::PresetState;
pub use voice::{VoiceKind, VoiceMode, VoiceState};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown state path \"{0}\"")]
    UnknownPath(String),

    #[error("state path \"{0}\" is read-only")]
    NotWritable(String),

    #[error("invalid value for state path \"{path}\": {value}")]
    InvalidValue { path: String, value: Value },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Events queued during a mutation, emitted after the mutable borrow of
/// the tree has ended.
#[derive(Debug, Default)]
pub struct Changes {
    events: Vec<(String, EventData)>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, data: EventData) {
        self.events.push((name, data));
    }

    pub fn events(&self) -> &[(String, EventData)] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<(String, EventData)> {
        std::mem::take(&mut self.events)
    }
}

pub(crate) fn event_name(prefix: &str, attr: &str) -> String {
    if prefix.is_empty() {
        format!("{}:changed", attr)
    } else {
        format!("{}:{}:changed", prefix, attr)
    }
}

/// Equality-check-and-emit field assignment. Queues
/// `{prefix}:{attr}:changed` with payload `{attr: value}` and the
/// emitter's sender id when the value actually differs.
macro_rules! set_attr {
    ($ch:expr, $obj:expr, $field:ident, $value:expr) => {{
        let value = $value;
        if $obj.$field != value {
            $obj.$field = value.clone();
            let mut data =
                $crate::signals::EventData::with(stringify!($field), serde_json::json!(value));
            data.sender = $obj.sender();
            $ch.push(
                $crate::state::event_name($obj.prefix(), stringify!($field)),
                data,
            );
            true
        } else {
            false
        }
    }};
}
pub(crate) use set_attr;

pub(crate) fn get_i32(data: &Value, key: &str) -> Option<i32> {
    data.get(key).and_then(Value::as_i64).map(|v| v as i32)
}

pub(crate) fn get_bool(data: &Value, key: &str) -> Option<bool> {
    data.get(key).and_then(Value::as_bool)
}

pub(crate) fn get_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Behavior of the two physical mod keys, selected by the instrument
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModKeyMode {
    GroupPresetNext,
    GroupPresetPrev,
    PresetNext,
    PresetPrev,
    Preset,
    GroupNext,
    GroupPrev,
    Group,
    Group1,
    Group2,
}

impl ModKeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModKeyMode::GroupPresetNext => "group_preset_next",
            ModKeyMode::GroupPresetPrev => "group_preset_prev",
            ModKeyMode::PresetNext => "preset_next",
            ModKeyMode::PresetPrev => "preset_prev",
            ModKeyMode::Preset => "preset",
            ModKeyMode::GroupNext => "group_next",
            ModKeyMode::GroupPrev => "group_prev",
            ModKeyMode::Group => "group",
            ModKeyMode::Group1 => "group1",
            ModKeyMode::Group2 => "group2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "group_preset_next" => ModKeyMode::GroupPresetNext,
            "group_preset_prev" => ModKeyMode::GroupPresetPrev,
            "preset_next" => ModKeyMode::PresetNext,
            "preset_prev" => ModKeyMode::PresetPrev,
            "preset" => ModKeyMode::Preset,
            "group_next" => ModKeyMode::GroupNext,
            "group_prev" => ModKeyMode::GroupPrev,
            "group" => ModKeyMode::Group,
            "group1" => ModKeyMode::Group1,
            "group2" => ModKeyMode::Group2,
            _ => return None,
        })
    }
}

/// A named instrument-mode profile.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentProfile {
    pub name: &'static str,
    pub string_count: i32,
    pub mod1_key_mode: ModKeyMode,
    pub mod2_key_mode: ModKeyMode,
    pub wrap_presets: bool,
    pub wrap_groups: bool,
    pub string_group_by_type: bool,
}

pub const INSTRUMENT_MODES: &[InstrumentProfile] = &[
    InstrumentProfile {
        name: "simple_three",
        string_count: 1,
        mod1_key_mode: ModKeyMode::PresetPrev,
        mod2_key_mode: ModKeyMode::PresetNext,
        wrap_presets: false,
        wrap_groups: false,
        string_group_by_type: false,
    },
    InstrumentProfile {
        name: "simple_six",
        string_count: 2,
        mod1_key_mode: ModKeyMode::Preset,
        mod2_key_mode: ModKeyMode::GroupNext,
        wrap_presets: false,
        wrap_groups: true,
        string_group_by_type: false,
    },
    InstrumentProfile {
        name: "nine_rows",
        string_count: 3,
        mod1_key_mode: ModKeyMode::GroupPresetPrev,
        mod2_key_mode: ModKeyMode::GroupPresetNext,
        wrap_presets: false,
        wrap_groups: false,
        string_group_by_type: false,
    },
    InstrumentProfile {
        name: "nine_cols",
        string_count: 3,
        mod1_key_mode: ModKeyMode::Preset,
        mod2_key_mode: ModKeyMode::Group,
        wrap_presets: false,
        wrap_groups: true,
        string_group_by_type: true,
    },
    InstrumentProfile {
        name: "old_mg",
        string_count: 3,
        mod1_key_mode: ModKeyMode::Group1,
        mod2_key_mode: ModKeyMode::Group2,
        wrap_presets: false,
        wrap_groups: false,
        string_group_by_type: false,
    },
];

pub fn instrument_profile(name: &str) -> Option<&'static InstrumentProfile> {
    INSTRUMENT_MODES.iter().find(|p| p.name == name)
}

/// String rows shown when grouping by type, in display order. `group` is
/// the row each type occupies on the home screen grid.
pub const STRING_TYPES: &[(VoiceKind, &str, i32)] = &[
    (VoiceKind::Drone, "Drone", 1),
    (VoiceKind::Melody, "Melody", 0),
    (VoiceKind::Trompette, "Tromp", 2),
];

#[derive(Debug, Clone, PartialEq)]
pub struct UiState {
    pub string_group: i32,
    pub string_group_by_type: bool,
    pub brightness: i32,
    pub timeout: i32,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            string_group: 0,
            string_group_by_type: false,
            brightness: 100,
            timeout: 10,
        }
    }
}

impl UiState {
    pub(crate) fn prefix(&self) -> &'static str {
        "ui"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthState {
    pub gain: i32,
}

impl Default for SynthState {
    fn default() -> Self {
        Self { gain: 50 }
    }
}

impl SynthState {
    pub(crate) fn prefix(&self) -> &'static str {
        "synth"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        None
    }

    pub fn clear(&mut self, ch: &mut Changes) {
        set_attr!(ch, self, gain, 50);
    }
}

/// The instrument state tree.
#[derive(Debug)]
pub struct State {
    pub main_volume: i32,
    pub reverb_volume: i32,
    pub reverb_panning: i32,
    pub coarse_tune: i32,
    pub fine_tune: i32,
    pub last_preset_number: i64,
    pub pitchbend_range: i32,

    pub key_on_debounce: i32,
    pub key_off_debounce: i32,
    pub base_note_delay: i32,

    pub instrument_mode: String,
    pub string_count: i32,
    pub mod1_key_mode: ModKeyMode,
    pub mod2_key_mode: ModKeyMode,
    pub wrap_presets: bool,
    pub wrap_groups: bool,
    pub multi_chien_threshold: bool,
    pub chien_sens_reverse: bool,

    pub poly_base_note: bool,
    pub poly_pitch_bend: bool,

    pub preset: PresetState,
    pub ui: UiState,
    pub synth: SynthState,
    pub power: PowerState,
    pub midi: MidiState,

    /// Currently held mod-key group levels, top of stack wins.
    mod_levels: Vec<i32>,

    /// Where SoundFonts live; needed by voices for weak font lookups.
    pub sound_dir: PathBuf,
}

impl State {
    pub fn new(sound_dir: PathBuf, power: PowerState) -> Self {
        Self {
            main_volume: 0,
            reverb_volume: 0,
            reverb_panning: 0,
            coarse_tune: 0,
            fine_tune: 0,
            last_preset_number: 0,
            pitchbend_range: 0,
            key_on_debounce: 2,
            key_off_debounce: 10,
            base_note_delay: 20,
            instrument_mode: "simple_three".to_string(),
            string_count: 1,
            mod1_key_mode: ModKeyMode::PresetPrev,
            mod2_key_mode: ModKeyMode::PresetNext,
            wrap_presets: true,
            wrap_groups: true,
            multi_chien_threshold: false,
            chien_sens_reverse: false,
            poly_base_note: true,
            poly_pitch_bend: true,
            preset: PresetState::new(),
            ui: UiState::default(),
            synth: SynthState::default(),
            power,
            midi: MidiState::new(),
            mod_levels: Vec::new(),
            sound_dir,
        }
    }

    pub(crate) fn prefix(&self) -> &'static str {
        ""
    }

    pub(crate) fn sender(&self) -> Option<String> {
        None
    }

    /// Reset everything that a preset stores to default values.
    pub fn clear(&mut self, ch: &mut Changes) {
        set_attr!(ch, self, last_preset_number, 0i64);
        set_attr!(ch, self, main_volume, 120);
        set_attr!(ch, self, reverb_volume, 25);
        set_attr!(ch, self, reverb_panning, 64);
        set_attr!(ch, self, coarse_tune, 0);
        set_attr!(ch, self, fine_tune, 0);
        self.synth.clear(ch);
        self.preset.clear(ch);
    }

    /// Apply a named instrument profile. The mode name is stored even
    /// when unknown; returns false in that case so callers can fall back
    /// to explicit fields.
    pub fn set_instrument_mode(&mut self, name: &str, ch: &mut Changes) -> bool {
        set_attr!(ch, self, instrument_mode, name.to_string());
        let Some(profile) = instrument_profile(name) else {
            return false;
        };
        set_attr!(ch, self, string_count, profile.string_count);
        set_attr!(ch, self, mod1_key_mode, profile.mod1_key_mode);
        set_attr!(ch, self, mod2_key_mode, profile.mod2_key_mode);
        set_attr!(ch, self, wrap_presets, profile.wrap_presets);
        set_attr!(ch, self, wrap_groups, profile.wrap_groups);
        {
            let ui = &mut self.ui;
            set_attr!(ch, ui, string_group_by_type, profile.string_group_by_type);
        }
        let group = self.default_string_group();
        {
            let ui = &mut self.ui;
            set_attr!(ch, ui, string_group, group);
        }
        true
    }

    pub fn default_string_group(&self) -> i32 {
        if self.ui.string_group_by_type {
            1
        } else {
            0
        }
    }

    /// Whether a voice belongs to the currently selected string group.
    pub fn voice_is_active(&self, voice: &VoiceState) -> bool {
        if self.ui.string_group_by_type {
            let (kind, _, _) = STRING_TYPES[self.ui.string_group.clamp(0, 2) as usize];
            kind == voice.kind
        } else {
            self.ui.string_group + 1 == voice.number
        }
    }

    /// Voices shown for a string group, as (kind, index-within-kind).
    pub fn active_voice_list(
        &self,
        string_group: Option<i32>,
        string_group_by_type: Option<bool>,
    ) -> Vec<(VoiceKind, usize)> {
        let group = string_group.unwrap_or(self.ui.string_group).clamp(0, 2) as usize;
        let by_type = string_group_by_type.unwrap_or(self.ui.string_group_by_type);

        if by_type {
            let (kind, _, _) = STRING_TYPES[group];
            (0..self.string_count.clamp(0, 3) as usize)
                .map(|idx| (kind, idx))
                .collect()
        } else {
            vec![
                (VoiceKind::Drone, group),
                (VoiceKind::Melody, group),
                (VoiceKind::Trompette, group),
            ]
        }
    }

    /// Toggle mute on one voice of the active group, or on a whole group.
    pub fn toggle_voice_mute(&mut self, idx: usize, whole_group: bool, ch: &mut Changes) {
        if whole_group {
            let selector = self.active_voice_list(
                Some(idx as i32),
                Some(!self.ui.string_group_by_type),
            );
            let all_muted = selector
                .iter()
                .filter_map(|(kind, i)| self.preset.voices_by_kind(*kind).get(*i))
                .all(|v| v.muted);
            for (kind, i) in selector {
                if let Some(voice) = self.preset.voices_by_kind_mut(kind).get_mut(i) {
                    set_attr!(ch, voice, muted, !all_muted);
                }
            }
        } else {
            let selector = self.active_voice_list(None, None);
            if let Some((kind, i)) = selector.get(idx).copied() {
                if let Some(voice) = self.preset.voices_by_kind_mut(kind).get_mut(i) {
                    let muted = voice.muted;
                    set_attr!(ch, voice, muted, !muted);
                }
            }
        }
    }

    /// Mod-key group stack: `down` pushes a level, `up` pops it; the
    /// visible group always reflects the top of the stack and falls back
    /// to the profile default when empty.
    pub fn modify_string_group(&mut self, mod_level: i32, active: bool, ch: &mut Changes) {
        let group = if self.ui.string_group_by_type {
            STRING_TYPES[mod_level.clamp(0, 2) as usize].2
        } else {
            mod_level
        };

        let group = if active {
            if !self.mod_levels.contains(&group) {
                self.mod_levels.push(group);
            }
            group
        } else {
            self.mod_levels.retain(|g| *g != group);
            match self.mod_levels.last() {
                Some(top) => *top,
                None => self.default_string_group(),
            }
        };
        let ui = &mut self.ui;
        set_attr!(ch, ui, string_group, group);
    }

    /// Step the string group, clamped or wrapped per profile.
    pub fn inc_string_group(&mut self, val: i32, ch: &mut Changes) {
        let group_count = if self.ui.string_group_by_type {
            3
        } else {
            self.string_count
        };
        let mut group = self.ui.string_group + val;
        if self.wrap_groups {
            group = group.rem_euclid(group_count.max(1));
        } else {
            group = group.clamp(0, group_count - 1);
        }
        let ui = &mut self.ui;
        set_attr!(ch, ui, string_group, group);
    }

    // Preset serialization

    pub fn to_preset_dict(&self) -> Value {
        let keynoise = &self.preset.keynoise[0];
        json!({
            "main": {
                "volume": self.main_volume,
                "gain": self.synth.gain,
                "pitchbend_range": self.pitchbend_range,
            },
            "tuning": {
                "coarse": self.coarse_tune,
                "fine": self.fine_tune,
            },
            "voices": self.preset.to_voices_dict(),
            "keynoise": {
                "soundfont": keynoise.soundfont_id,
                "bank": keynoise.bank,
                "program": keynoise.program,
                "volume": keynoise.volume,
                "panning": keynoise.panning,
            },
            "reverb": {
                "volume": self.reverb_volume,
                "panning": self.reverb_panning,
            },
        })
    }

    pub fn from_preset_dict(&mut self, data: &Value, partial: bool, ch: &mut Changes) {
        let empty = json!({});
        let main = data.get("main").unwrap_or(&empty);
        if let Some(v) = get_i32(main, "volume") {
            set_attr!(ch, self, main_volume, v);
        } else if !partial {
            set_attr!(ch, self, main_volume, 120);
        }
        {
            let synth = &mut self.synth;
            if let Some(v) = get_i32(main, "gain") {
                set_attr!(ch, synth, gain, v);
            } else if !partial {
                set_attr!(ch, synth, gain, 50);
            }
        }
        if let Some(v) = get_i32(main, "pitchbend_range") {
            set_attr!(ch, self, pitchbend_range, v);
        } else if !partial {
            set_attr!(ch, self, pitchbend_range, 100);
        }

        let tuning = data.get("tuning").unwrap_or(&empty);
        if let Some(v) = get_i32(tuning, "coarse") {
            set_attr!(ch, self, coarse_tune, v);
        } else if !partial {
            set_attr!(ch, self, coarse_tune, 0);
        }
        if let Some(v) = get_i32(tuning, "fine") {
            set_attr!(ch, self, fine_tune, v);
        } else if !partial {
            set_attr!(ch, self, fine_tune, 0);
        }

        // blobs whose trompette voices carry no per-voice threshold get
        // the legacy global threshold copied down into all three voices
        let legacy_chien = data
            .get("voices")
            .and_then(|v| v.get("trompette"))
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|v| v.get("chien_threshold"))
            .is_none();

        let voices = data.get("voices").unwrap_or(&empty);
        let sound_dir = self.sound_dir.clone();
        self.preset.from_voices_dict(voices, partial, &sound_dir, ch);

        if legacy_chien {
            if let Some(threshold) = data
                .get("chien")
                .and_then(|c| c.get("chien_threshold"))
                .and_then(Value::as_i64)
            {
                let value = Some(threshold as i32);
                self.preset
                    .set_chien_thresholds(&[value, value, value], ch);
            }
        }

        let keynoise_data = data.get("keynoise").unwrap_or(&empty);
        let keynoise = &mut self.preset.keynoise[0];
        keynoise.from_dict(keynoise_data, partial, &sound_dir, ch);

        let reverb = data.get("reverb").unwrap_or(&empty);
        if let Some(v) = get_i32(reverb, "volume") {
            set_attr!(ch, self, reverb_volume, v);
        } else if !partial {
            set_attr!(ch, self, reverb_volume, 25);
        }
        if let Some(v) = get_i32(reverb, "panning") {
            set_attr!(ch, self, reverb_panning, v);
        } else if !partial {
            set_attr!(ch, self, reverb_panning, 64);
        }
    }

    // Misc settings serialization

    pub fn to_misc_dict(&self) -> Value {
        json!({
            "ui": {
                "timeout": self.ui.timeout,
                "brightness": self.ui.brightness,
                "chien_sens_reverse": self.chien_sens_reverse,
                "multi_chien_threshold": self.multi_chien_threshold,
                "mod1_key_mode": self.mod1_key_mode.as_str(),
                "mod2_key_mode": self.mod2_key_mode.as_str(),
                "wrap_groups": self.wrap_groups,
                "wrap_presets": self.wrap_presets,
                "string_group_by_type": self.ui.string_group_by_type,
            },
            "keyboard": {
                "key_on_debounce": self.key_on_debounce,
                "key_off_debounce": self.key_off_debounce,
                "base_note_delay": self.base_note_delay,
            },
            "features": {
                "poly_base_note": self.poly_base_note,
                "poly_pitch_bend": self.poly_pitch_bend,
                "string_count": self.string_count,
            },
            "instrument_mode": self.instrument_mode,
        })
    }

    pub fn from_misc_dict(&mut self, data: &Value, partial: bool, ch: &mut Changes) {
        let empty = json!({});
        let features = data.get("features").unwrap_or(&empty);
        let ui_data = data.get("ui").unwrap_or(&empty);
        let keyboard = data.get("keyboard").unwrap_or(&empty);

        if let Some(v) = get_bool(features, "poly_base_note") {
            set_attr!(ch, self, poly_base_note, v);
        } else if !partial {
            set_attr!(ch, self, poly_base_note, true);
        }
        if let Some(v) = get_bool(features, "poly_pitch_bend") {
            set_attr!(ch, self, poly_pitch_bend, v);
        } else if !partial {
            set_attr!(ch, self, poly_pitch_bend, true);
        }

        {
            let ui = &mut self.ui;
            if let Some(v) = get_i32(ui_data, "timeout") {
                set_attr!(ch, ui, timeout, v);
            } else if !partial {
                set_attr!(ch, ui, timeout, 10);
            }
            if let Some(v) = get_i32(ui_data, "brightness") {
                set_attr!(ch, ui, brightness, v);
            } else if !partial {
                set_attr!(ch, ui, brightness, 80);
            }
        }
        if let Some(v) = get_bool(ui_data, "chien_sens_reverse") {
            set_attr!(ch, self, chien_sens_reverse, v);
        } else if !partial {
            set_attr!(ch, self, chien_sens_reverse, false);
        }

        if let Some(v) = get_i32(keyboard, "key_on_debounce") {
            set_attr!(ch, self, key_on_debounce, v);
        } else if !partial {
            set_attr!(ch, self, key_on_debounce, 2);
        }
        if let Some(v) = get_i32(keyboard, "key_off_debounce") {
            set_attr!(ch, self, key_off_debounce, v);
        } else if !partial {
            set_attr!(ch, self, key_off_debounce, 10);
        }
        if let Some(v) = get_i32(keyboard, "base_note_delay") {
            set_attr!(ch, self, base_note_delay, v);
        } else if !partial {
            set_attr!(ch, self, base_note_delay, 20);
        }

        let mode = get_str(data, "instrument_mode")
            .map(str::to_string)
            .unwrap_or_else(|| {
                if partial {
                    self.instrument_mode.clone()
                } else {
                    "simple_three".to_string()
                }
            });

        if !self.set_instrument_mode(&mode, ch) {
            // unknown profile: restore the explicit fields instead
            if let Some(v) = get_i32(features, "string_count") {
                set_attr!(ch, self, string_count, v);
            } else if !partial {
                set_attr!(ch, self, string_count, 1);
            }
            if let Some(v) = get_str(ui_data, "mod1_key_mode").and_then(ModKeyMode::from_name) {
                set_attr!(ch, self, mod1_key_mode, v);
            } else if !partial {
                set_attr!(ch, self, mod1_key_mode, ModKeyMode::PresetPrev);
            }
            if let Some(v) = get_str(ui_data, "mod2_key_mode").and_then(ModKeyMode::from_name) {
                set_attr!(ch, self, mod2_key_mode, v);
            } else if !partial {
                set_attr!(ch, self, mod2_key_mode, ModKeyMode::PresetNext);
            }
            if let Some(v) = get_bool(ui_data, "wrap_presets") {
                set_attr!(ch, self, wrap_presets, v);
            } else if !partial {
                set_attr!(ch, self, wrap_presets, false);
            }
            if let Some(v) = get_bool(ui_data, "wrap_groups") {
                set_attr!(ch, self, wrap_groups, v);
            } else if !partial {
                set_attr!(ch, self, wrap_groups, false);
            }
            {
                let ui = &mut self.ui;
                if let Some(v) = get_bool(ui_data, "string_group_by_type") {
                    set_attr!(ch, ui, string_group_by_type, v);
                } else if !partial {
                    set_attr!(ch, ui, string_group_by_type, false);
                }
            }
            let group = self.default_string_group();
            let ui = &mut self.ui;
            set_attr!(ch, ui, string_group, group);
        }

        // a single-string instrument has nothing to fan out to
        if self.string_count > 1 {
            if let Some(v) = get_bool(ui_data, "multi_chien_threshold") {
                set_attr!(ch, self, multi_chien_threshold, v);
            } else if !partial {
                set_attr!(ch, self, multi_chien_threshold, false);
            }
        } else {
            set_attr!(ch, self, multi_chien_threshold, false);
        }
    }
}

/// Guard returned by [`StateHandle::lock`]. When created with a message
/// it emits `state:locked` on entry and `state:unlocked` on drop, which
/// the menu turns into a modal overlay.
pub struct StateLock<'a> {
    _guard: parking_lot::ReentrantMutexGuard<'a, RefCell<State>>,
    signals: Signals,
    unlock: Option<bool>,
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        if let Some(goto_home) = self.unlock.take() {
            self.signals.emit(
                "state:unlocked",
                EventData::with("goto_home", json!(goto_home)),
            );
        }
    }
}

/// Shared, lockable handle to the state tree.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<ReentrantMutex<RefCell<State>>>,
    pub signals: Signals,
    path_cache: Arc<Mutex<HashMap<String, StatePath>>>,
}

impl StateHandle {
    pub fn new(signals: Signals, state: State) -> Self {
        Self {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(state))),
            signals,
            path_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read access under the state lock.
    pub fn with<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.inner.lock();
        let state = guard.borrow();
        f(&state)
    }

    /// Mutate the tree and emit the queued change events afterwards,
    /// still under the state lock.
    pub fn apply<R>(&self, f: impl FnOnce(&mut State, &mut Changes) -> R) -> R {
        let guard = self.inner.lock();
        let mut changes = Changes::new();
        let result = {
            let mut state = guard.borrow_mut();
            f(&mut state, &mut changes)
        };
        for (name, data) in changes.take() {
            self.signals.emit(&name, data);
        }
        result
    }

    /// Scoped acquisition of the re-entrant state lock. With a message,
    /// `state:locked` / `state:unlocked` bracket the scope.
    pub fn lock(&self, message: Option<&str>, goto_home: bool) -> StateLock<'_> {
        let guard = self.inner.lock();
        let unlock = message.map(|message| {
            self.signals
                .emit("state:locked", EventData::with("message", json!(message)));
            goto_home
        });
        StateLock {
            _guard: guard,
            signals: self.signals.clone(),
            unlock,
        }
    }

    /// Assign a value through a dotted state path, under the state lock.
    pub fn set_by_path(&self, path: &str, value: &Value) -> Result<(), StateError> {
        let parsed = {
            let mut cache = self.path_cache.lock().unwrap();
            match cache.get(path) {
                Some(parsed) => parsed.clone(),
                None => {
                    let parsed = StatePath::parse(path)?;
                    cache.insert(path.to_string(), parsed.clone());
                    parsed
                }
            }
        };
        self.apply(|state, ch| parsed.assign(state, value, ch))
    }

    /// Load a stored preset into the active state. Signals are
    /// suppressed while the tree is populated; a single
    /// `active:preset:changed` follows, then the preset number is
    /// published.
    pub fn load_preset(&self, store: &Store, preset_id: i64) -> Result<(), StateError> {
        let row = store.get_preset(preset_id)?;
        let _lock = self.lock(None, false);
        let (_, _suppressed) = self.signals.suppressed(|| {
            self.apply(|state, ch| {
                state.from_preset_dict(&row.data, false, ch);
                state.preset.id = row.id;
                state.preset.name = row.name.clone();
                state.preset.number = row.number.unwrap_or(0);
            });
        });
        self.signals.emit("active:preset:changed", EventData::new());
        self.apply(|state, ch| {
            set_attr!(ch, state, last_preset_number, row.number.unwrap_or(0));
        });
        Ok(())
    }

    /// Serialize the active state into a stored preset. With an id the
    /// row is updated in place, otherwise a new row is appended.
    pub fn save_preset(
        &self,
        store: &Store,
        name: Option<&str>,
        preset_id: Option<i64>,
    ) -> Result<PresetRow, StateError> {
        let data = self.with(|state| state.to_preset_dict());
        let row = match preset_id {
            Some(id) => {
                let existing = store.get_preset(id)?;
                let name = name.unwrap_or(&existing.name);
                store.update_preset(id, name, &data)?
            }
            None => store.insert_preset(name.unwrap_or("Unnamed"), None, &data)?,
        };
        self.signals
            .emit("preset:changed", EventData::with("id", json!(row.id)));
        Ok(row)
    }

    /// Refresh the MIDI port set from an enumeration, loading per-port
    /// config blobs for newly appeared ports.
    pub fn update_midi_ports(&self, ports: Vec<MidiPortInfo>, store: &Store) {
        self.apply(|state, ch| {
            state.midi.update_port_states(
                ports,
                |port_id| {
                    let key = midi_config_key(port_id);
                    store.load_config(&key).ok().flatten()
                },
                ch,
            );
        });
    }

    /// Poll the power supply state.
    pub fn update_power(&self) {
        self.apply(|state, ch| state.power.update(ch));
    }
}

/// Store key for a per-port MIDI config blob, capped like any config key.
pub fn midi_config_key(port_id: &str) -> String {
    let key = format!("midi:{}", port_id);
    key.chars().take(255).collect()
}
