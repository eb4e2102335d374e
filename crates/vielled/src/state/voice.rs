//! Per-string voice state.
//!
//! A voice is one playable string (or the keynoise source). All field
//! writes go through the `set_attr!` helper so that every observable
//! change emits `active:preset:voice:<attr>:changed` with the voice's
//! string name as sender.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::signals::EventData;
use crate::sounds::{Sound, SoundFont, SoundFontMode};
use crate::state::{get_bool, get_i32, get_str, set_attr, Changes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceKind {
    Melody,
    Drone,
    Trompette,
    Keynoise,
}

impl VoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceKind::Melody => "melody",
            VoiceKind::Drone => "drone",
            VoiceKind::Trompette => "trompette",
            VoiceKind::Keynoise => "keynoise",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "melody" => VoiceKind::Melody,
            "drone" => VoiceKind::Drone,
            "trompette" => VoiceKind::Trompette,
            "keynoise" => VoiceKind::Keynoise,
            _ => return None,
        })
    }
}

/// How key events drive a string. A midigurdy-mode SoundFont always
/// forces `Midigurdy` regardless of the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    Midigurdy,
    Generic,
    Keyboard,
}

impl VoiceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceMode::Midigurdy => "midigurdy",
            VoiceMode::Generic => "generic",
            VoiceMode::Keyboard => "keyboard",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "midigurdy" => VoiceMode::Midigurdy,
            "generic" => VoiceMode::Generic,
            "keyboard" => VoiceMode::Keyboard,
            _ => return None,
        })
    }

    /// Engine parameter encoding.
    pub fn index(&self) -> i32 {
        match self {
            VoiceMode::Midigurdy => 0,
            VoiceMode::Generic => 1,
            VoiceMode::Keyboard => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceState {
    pub kind: VoiceKind,
    /// 1-based position within its kind.
    pub number: i32,
    /// Synth channel, assigned by kind and number.
    pub channel: i32,

    pub soundfont_id: Option<String>,
    pub bank: i32,
    pub program: i32,
    pub muted: bool,
    pub volume: i32,
    pub panning: i32,
    pub base_note: i32,
    pub capo: i32,
    pub polyphonic: bool,
    pub mode: VoiceMode,
    pub finetune: i32,
    pub chien_threshold: i32,
}

impl VoiceState {
    pub fn new(kind: VoiceKind, number: i32, channel: i32) -> Self {
        Self {
            kind,
            number,
            channel,
            soundfont_id: None,
            bank: 0,
            program: 0,
            muted: true,
            volume: 100,
            panning: 64,
            base_note: 60,
            capo: 0,
            polyphonic: false,
            mode: VoiceMode::Midigurdy,
            finetune: 0,
            chien_threshold: 50,
        }
    }

    /// Stable string name, e.g. "melody1" or "keynoise1".
    pub fn string(&self) -> String {
        format!("{}{}", self.kind.as_str(), self.number)
    }

    pub(crate) fn prefix(&self) -> &'static str {
        "active:preset:voice"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        Some(self.string())
    }

    pub fn clear(&mut self, ch: &mut Changes) {
        set_attr!(ch, self, soundfont_id, None::<String>);
        set_attr!(ch, self, bank, 0);
        set_attr!(ch, self, program, 0);
        set_attr!(ch, self, muted, true);
        set_attr!(ch, self, volume, 100);
        set_attr!(ch, self, panning, 64);
        set_attr!(ch, self, base_note, 60);
        set_attr!(ch, self, capo, 0);
        set_attr!(ch, self, polyphonic, false);
        set_attr!(ch, self, mode, VoiceMode::Midigurdy);
        set_attr!(ch, self, finetune, 0);
        set_attr!(ch, self, chien_threshold, 50);
    }

    /// A voice produces no audio when muted, without a sound, or with an
    /// invalid base note.
    pub fn is_silent(&self) -> bool {
        self.muted || self.soundfont_id.is_none() || self.base_note < 0
    }

    /// Assign a sound. The font/bank/program triple changes silently and
    /// is announced as one `sound:changed` event; a natural base note
    /// declared by the font updates `base_note`, and a midigurdy font
    /// resets the voice mode.
    pub fn set_sound(&mut self, font: &SoundFont, sound: &Sound, ch: &mut Changes) {
        self.soundfont_id = Some(font.id.clone());
        self.bank = sound.bank;
        self.program = sound.program;
        let mut data = EventData::new();
        data.sender = self.sender();
        ch.push(format!("{}:sound:changed", self.prefix()), data);

        if sound.base_note > -1 {
            set_attr!(ch, self, base_note, sound.base_note);
        }
        if font.mode == SoundFontMode::Midigurdy {
            set_attr!(ch, self, mode, VoiceMode::Midigurdy);
        }
    }

    /// Drop the assigned sound and return the voice to silent defaults.
    /// Emits a single `sound:changed` iff anything actually changed.
    pub fn clear_sound(&mut self, ch: &mut Changes) {
        let before = (
            self.soundfont_id.clone(),
            self.bank,
            self.program,
            self.base_note,
            self.muted,
        );
        self.soundfont_id = None;
        self.bank = 0;
        self.program = 0;
        self.base_note = 60;
        self.muted = true;
        if before != (None, 0, 0, 60, true) {
            let mut data = EventData::new();
            data.sender = self.sender();
            ch.push(format!("{}:sound:changed", self.prefix()), data);
        }
    }

    /// Look up the currently assigned sound. Weak: re-reads the font
    /// headers from disk, never holds onto the font.
    pub fn sound(&self, sound_dir: &Path) -> Option<(SoundFont, Sound)> {
        let id = self.soundfont_id.as_ref()?;
        let font = SoundFont::by_id(sound_dir, id)?;
        let sound = font.get_sound(self.bank, self.program)?.clone();
        Some((font, sound))
    }

    fn has_midigurdy_soundfont(&self, sound_dir: &Path) -> bool {
        match &self.soundfont_id {
            None => true,
            Some(id) => match SoundFont::by_id(sound_dir, id) {
                None => true,
                Some(font) => font.mode == SoundFontMode::Midigurdy,
            },
        }
    }

    /// Mode precedence: a midigurdy font always wins, then an explicit
    /// keyboard setting, otherwise generic.
    pub fn effective_mode(&self, sound_dir: &Path) -> VoiceMode {
        if self.has_midigurdy_soundfont(sound_dir) {
            VoiceMode::Midigurdy
        } else if self.mode == VoiceMode::Keyboard {
            VoiceMode::Keyboard
        } else {
            VoiceMode::Generic
        }
    }

    pub fn to_dict(&self) -> Value {
        json!({
            "soundfont": self.soundfont_id,
            "bank": self.bank,
            "program": self.program,
            "volume": self.volume,
            "panning": self.panning,
            "muted": self.muted,
            "note": self.base_note,
            "mode": self.mode.as_str(),
            "capo": self.capo,
            "polyphonic": self.polyphonic,
            "finetune": self.finetune,
            "chien_threshold": self.chien_threshold,
        })
    }

    /// Populate from a preset blob. With `partial` only keys present in
    /// the data change; otherwise missing keys reset to defaults.
    pub fn from_dict(&mut self, data: &Value, partial: bool, sound_dir: &Path, ch: &mut Changes) {
        let has_sound_keys = data.get("soundfont").is_some()
            && data.get("bank").is_some()
            && data.get("program").is_some();

        if has_sound_keys {
            let font = data
                .get("soundfont")
                .and_then(Value::as_str)
                .and_then(|id| SoundFont::by_id(sound_dir, id));
            let sound = font.as_ref().and_then(|f| {
                let bank = get_i32(data, "bank").unwrap_or(0);
                let program = get_i32(data, "program").unwrap_or(0);
                f.get_sound(bank, program).cloned()
            });
            match (font, sound) {
                (Some(font), Some(sound)) => {
                    self.set_sound(&font, &sound, ch);
                    if self.kind == VoiceKind::Keynoise {
                        set_attr!(ch, self, muted, false);
                    } else if let Some(v) = get_bool(data, "muted") {
                        set_attr!(ch, self, muted, v);
                    } else if !partial {
                        set_attr!(ch, self, muted, true);
                    }
                }
                _ => self.clear_sound(ch),
            }
        } else if !partial {
            self.clear_sound(ch);
        }

        if let Some(v) = get_i32(data, "volume") {
            set_attr!(ch, self, volume, v);
        } else if !partial {
            set_attr!(ch, self, volume, 100);
        }
        if let Some(v) = get_i32(data, "panning") {
            set_attr!(ch, self, panning, v);
        } else if !partial {
            set_attr!(ch, self, panning, 64);
        }
        if let Some(v) = get_i32(data, "note") {
            set_attr!(ch, self, base_note, v);
        } else if !partial {
            set_attr!(ch, self, base_note, 60);
        }
        if let Some(v) = get_i32(data, "capo") {
            set_attr!(ch, self, capo, v);
        } else if !partial {
            set_attr!(ch, self, capo, 0);
        }
        if let Some(v) = get_bool(data, "polyphonic") {
            set_attr!(ch, self, polyphonic, v);
        } else if !partial {
            set_attr!(ch, self, polyphonic, false);
        }
        if let Some(v) = get_str(data, "mode").and_then(VoiceMode::from_name) {
            set_attr!(ch, self, mode, v);
        } else if !partial {
            set_attr!(ch, self, mode, VoiceMode::Midigurdy);
        }
        if let Some(v) = get_i32(data, "finetune") {
            set_attr!(ch, self, finetune, v);
        } else if !partial {
            set_attr!(ch, self, finetune, 0);
        }
        if let Some(v) = get_i32(data, "chien_threshold") {
            set_attr!(ch, self, chien_threshold, v);
        } else if !partial {
            set_attr!(ch, self, chien_threshold, 50);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sounds::testdata::build_sf2;

    fn midigurdy_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mg.sf2"),
            build_sf2(
                "Gurdy",
                "MidiGurdy Sounds",
                "basenote 0:0 62",
                &[(0, 0, "Melody"), (1, 0, "Drone"), (2, 0, "Tromp")],
            ),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("gen.sf2"),
            build_sf2("Generic", "OtherVendor", "", &[(0, 0, "Lead")]),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_silence_equivalence() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Melody, 1, 0);
        let mut ch = Changes::new();

        // no sound -> silent even when unmuted
        assert!(voice.is_silent());
        voice.muted = false;
        assert!(voice.is_silent());

        let font = SoundFont::by_id(dir.path(), "mg.sf2").unwrap();
        let sound = font.get_sound(0, 0).unwrap().clone();
        voice.set_sound(&font, &sound, &mut ch);
        assert!(!voice.is_silent());

        voice.muted = true;
        assert!(voice.is_silent());
        voice.muted = false;

        voice.base_note = -1;
        assert!(voice.is_silent());
        voice.base_note = 60;
        assert!(!voice.is_silent());

        voice.clear_sound(&mut ch);
        assert!(voice.is_silent());
    }

    #[test]
    fn test_mode_precedence() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Melody, 1, 0);
        let mut ch = Changes::new();

        // no font counts as midigurdy
        assert_eq!(voice.effective_mode(dir.path()), VoiceMode::Midigurdy);

        let font = SoundFont::by_id(dir.path(), "gen.sf2").unwrap();
        let sound = font.get_sound(0, 0).unwrap().clone();
        voice.set_sound(&font, &sound, &mut ch);

        voice.mode = VoiceMode::Midigurdy;
        assert_eq!(voice.effective_mode(dir.path()), VoiceMode::Generic);
        voice.mode = VoiceMode::Generic;
        assert_eq!(voice.effective_mode(dir.path()), VoiceMode::Generic);
        voice.mode = VoiceMode::Keyboard;
        assert_eq!(voice.effective_mode(dir.path()), VoiceMode::Keyboard);

        let mg = SoundFont::by_id(dir.path(), "mg.sf2").unwrap();
        let mg_sound = mg.get_sound(0, 0).unwrap().clone();
        voice.set_sound(&mg, &mg_sound, &mut ch);
        // midigurdy font always wins; set_sound also reset the stored mode
        assert_eq!(voice.effective_mode(dir.path()), VoiceMode::Midigurdy);
        assert_eq!(voice.mode, VoiceMode::Midigurdy);
    }

    #[test]
    fn test_set_sound_applies_natural_base_note() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Melody, 1, 0);
        let mut ch = Changes::new();

        let font = SoundFont::by_id(dir.path(), "mg.sf2").unwrap();
        let sound = font.get_sound(0, 0).unwrap().clone();
        voice.set_sound(&font, &sound, &mut ch);

        assert_eq!(voice.soundfont_id.as_deref(), Some("mg.sf2"));
        assert_eq!(voice.base_note, 62);

        let names: Vec<_> = ch.events().iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"active:preset:voice:sound:changed"));
        assert!(names.contains(&"active:preset:voice:base_note:changed"));
        // the font/bank/program assignment itself must not leak as
        // individual events
        assert!(!names.iter().any(|n| n.contains("soundfont_id")));
    }

    #[test]
    fn test_clear_sound_is_single_event_and_idempotent() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Melody, 1, 0);
        let mut ch = Changes::new();

        let font = SoundFont::by_id(dir.path(), "mg.sf2").unwrap();
        let sound = font.get_sound(0, 0).unwrap().clone();
        voice.set_sound(&font, &sound, &mut ch);

        let mut ch = Changes::new();
        voice.clear_sound(&mut ch);
        assert_eq!(voice.soundfont_id, None);
        assert_eq!(voice.base_note, 60);
        assert!(voice.muted);
        assert_eq!(ch.events().len(), 1);
        assert_eq!(ch.events()[0].0, "active:preset:voice:sound:changed");

        let mut ch = Changes::new();
        voice.clear_sound(&mut ch);
        assert!(ch.events().is_empty());
    }

    #[test]
    fn test_from_dict_keynoise_unmutes() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Keynoise, 1, 9);
        let mut ch = Changes::new();
        voice.from_dict(
            &json!({"soundfont": "mg.sf2", "bank": 3, "program": 0}),
            false,
            dir.path(),
            &mut ch,
        );
        // bank 3 has no preset in the test font -> cleared
        assert!(voice.soundfont_id.is_none());

        voice.from_dict(
            &json!({"soundfont": "mg.sf2", "bank": 0, "program": 0, "muted": true}),
            false,
            dir.path(),
            &mut ch,
        );
        assert_eq!(voice.soundfont_id.as_deref(), Some("mg.sf2"));
        assert!(!voice.muted, "keynoise voices are never muted by presets");
    }

    #[test]
    fn test_from_dict_partial_keeps_missing_fields() {
        let dir = midigurdy_dir();
        let mut voice = VoiceState::new(VoiceKind::Melody, 1, 0);
        voice.volume = 80;
        voice.capo = 3;
        let mut ch = Changes::new();

        voice.from_dict(&json!({"volume": 90}), true, dir.path(), &mut ch);
        assert_eq!(voice.volume, 90);
        assert_eq!(voice.capo, 3, "partial update must not reset capo");

        voice.from_dict(&json!({"volume": 90}), false, dir.path(), &mut ch);
        assert_eq!(voice.capo, 0, "full update resets missing fields");
    }
}
