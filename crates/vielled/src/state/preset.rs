//! The active preset: ten voices plus identity of the stored preset it
//! was loaded from.

use std::path::Path;

use serde_json::{json, Value};

use crate::state::voice::{VoiceKind, VoiceState};
use crate::state::Changes;

#[derive(Debug, Clone, PartialEq)]
pub struct PresetState {
    /// Row id of the loaded preset, 0 when nothing is loaded.
    pub id: i64,
    pub name: String,
    pub number: i64,

    pub melody: Vec<VoiceState>,
    pub drone: Vec<VoiceState>,
    pub trompette: Vec<VoiceState>,
    pub keynoise: Vec<VoiceState>,
}

impl Default for PresetState {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetState {
    pub fn new() -> Self {
        let voices = |kind, count: i32, start_channel: i32| {
            (0..count)
                .map(|i| VoiceState::new(kind, i + 1, start_channel + i))
                .collect::<Vec<_>>()
        };
        Self {
            id: 0,
            name: "Unnamed".to_string(),
            number: 0,
            melody: voices(VoiceKind::Melody, 3, 0),
            drone: voices(VoiceKind::Drone, 3, 3),
            trompette: voices(VoiceKind::Trompette, 3, 6),
            keynoise: voices(VoiceKind::Keynoise, 1, 9),
        }
    }

    pub(crate) fn prefix(&self) -> &'static str {
        "active:preset"
    }

    /// All voices in channel order: melody, drone, trompette, keynoise.
    pub fn voices(&self) -> impl Iterator<Item = &VoiceState> {
        self.melody
            .iter()
            .chain(self.drone.iter())
            .chain(self.trompette.iter())
            .chain(self.keynoise.iter())
    }

    pub fn voices_mut(&mut self) -> impl Iterator<Item = &mut VoiceState> {
        self.melody
            .iter_mut()
            .chain(self.drone.iter_mut())
            .chain(self.trompette.iter_mut())
            .chain(self.keynoise.iter_mut())
    }

    /// Voice by global string number: 1-3 melody, 4-6 drone,
    /// 7-9 trompette, 10 keynoise.
    pub fn voice_by_number(&self, number: i32) -> Option<&VoiceState> {
        if number < 1 {
            return None;
        }
        self.voices().nth(number as usize - 1)
    }

    pub fn voice_by_number_mut(&mut self, number: i32) -> Option<&mut VoiceState> {
        if number < 1 {
            return None;
        }
        self.voices_mut().nth(number as usize - 1)
    }

    pub fn voices_by_kind(&self, kind: VoiceKind) -> &[VoiceState] {
        match kind {
            VoiceKind::Melody => &self.melody,
            VoiceKind::Drone => &self.drone,
            VoiceKind::Trompette => &self.trompette,
            VoiceKind::Keynoise => &self.keynoise,
        }
    }

    pub fn voices_by_kind_mut(&mut self, kind: VoiceKind) -> &mut [VoiceState] {
        match kind {
            VoiceKind::Melody => &mut self.melody,
            VoiceKind::Drone => &mut self.drone,
            VoiceKind::Trompette => &mut self.trompette,
            VoiceKind::Keynoise => &mut self.keynoise,
        }
    }

    pub fn voice_by_string(&self, string: &str) -> Option<&VoiceState> {
        self.voices().find(|v| v.string() == string)
    }

    pub fn clear(&mut self, ch: &mut Changes) {
        for voice in self.voices_mut() {
            voice.clear(ch);
        }
        // key noise is quiet by default
        if let Some(keynoise) = self.keynoise.first_mut() {
            crate::state::set_attr!(ch, keynoise, volume, 20);
        }
    }

    pub fn to_voices_dict(&self) -> Value {
        json!({
            "melody": self.melody.iter().map(|v| v.to_dict()).collect::<Vec<_>>(),
            "drone": self.drone.iter().map(|v| v.to_dict()).collect::<Vec<_>>(),
            "trompette": self.trompette.iter().map(|v| v.to_dict()).collect::<Vec<_>>(),
        })
    }

    pub fn from_voices_dict(
        &mut self,
        data: &Value,
        partial: bool,
        sound_dir: &Path,
        ch: &mut Changes,
    ) {
        for kind in [
            VoiceKind::Melody,
            VoiceKind::Drone,
            VoiceKind::Trompette,
            VoiceKind::Keynoise,
        ] {
            let voice_data = data.get(kind.as_str()).and_then(Value::as_array);
            let voices = self.voices_by_kind_mut(kind);
            for (idx, voice) in voices.iter_mut().enumerate() {
                match voice_data.and_then(|list| list.get(idx)) {
                    Some(entry) => voice.from_dict(entry, partial, sound_dir, ch),
                    None => {
                        if !partial {
                            voice.clear(ch);
                        }
                    }
                }
            }
        }
    }

    /// Per-voice chien thresholds, trompette 1..=3.
    pub fn chien_thresholds(&self) -> [i32; 3] {
        [
            self.trompette[0].chien_threshold,
            self.trompette[1].chien_threshold,
            self.trompette[2].chien_threshold,
        ]
    }

    pub fn set_chien_thresholds(&mut self, thresholds: &[Option<i32>], ch: &mut Changes) {
        for (idx, threshold) in thresholds.iter().take(3).enumerate() {
            if let Some(value) = threshold {
                let voice = &mut self.trompette[idx];
                crate::state::set_attr!(ch, voice, chien_threshold, *value);
            }
        }
    }
}
