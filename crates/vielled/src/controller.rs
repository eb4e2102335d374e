//! Controllers: passive reactors that translate state-change events
//! into device commands. They are the only parties that talk to the
//! synthesizer and the string engine; state stays authoritative, so a
//! failed device call is logged and repaired by the next full
//! reconfiguration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, warn};

use crate::alsa::Mixer;
use crate::engine::{DeviceError, OutputHold, Param, StringEngine, StringParam};
use crate::input::manager::InputManager;
use crate::input::midi::MidiInput;
use crate::signals::{EventData, Signals};
use crate::state::{StateHandle, VoiceKind, VoiceState};
use crate::synth::Synth;
use crate::util;

/// 14-bit RPN 00:01 encoding of a fine-tune offset in cents. The input
/// is the sum of the voice and global fine tune, -100..=+100 around
/// center.
pub fn fine_tune_value(cents: i32) -> u16 {
    let value = ((16384.0 / 200.0) * (cents as f64 + 100.0)).round();
    value.clamp(0.0, 16383.0) as u16
}

/// User chien sensitivity 0..=100 to engine threshold: lower user value
/// means higher threshold (less sensitive).
pub fn chien_threshold_to_engine(user: i32) -> i32 {
    (5000.0 - 5000.0 * (user.clamp(0, 100) as f64 / 100.0)) as i32
}

pub struct SynthController {
    engine: Arc<dyn StringEngine>,
    synth: Arc<dyn Synth>,
    state: StateHandle,
}

impl SynthController {
    pub const EVENTS: &'static [&'static str] = &[
        "key_on_debounce:changed",
        "key_off_debounce:changed",
        "base_note_delay:changed",
        "sound:changed",
        "sound:deleted",
        "synth:gain:changed",
        "reverb_volume:changed",
        "reverb_panning:changed",
        "coarse_tune:changed",
        "pitchbend_range:changed",
        "fine_tune:changed",
        "active:preset:changed",
        "active:preset:voice:muted:changed",
        "active:preset:voice:volume:changed",
        "active:preset:voice:base_note:changed",
        "active:preset:voice:capo:changed",
        "active:preset:voice:sound:changed",
        "active:preset:voice:mode:changed",
        "active:preset:voice:polyphonic:changed",
        "active:preset:voice:panning:changed",
        "active:preset:voice:finetune:changed",
        "active:preset:voice:chien_threshold:changed",
    ];

    pub fn new(engine: Arc<dyn StringEngine>, synth: Arc<dyn Synth>, state: StateHandle) -> Arc<Self> {
        Arc::new(Self {
            engine,
            synth,
            state,
        })
    }

    pub fn start_listening(self: &Arc<Self>, signals: &Signals) {
        for event in Self::EVENTS {
            let controller = Arc::clone(self);
            signals.register(event, move |name, data| controller.handle(name, data));
        }
    }

    fn handle(&self, name: &str, data: &EventData) {
        let result = match name {
            "key_on_debounce:changed" => self
                .engine
                .set_key_on_debounce(self.state.with(|s| s.key_on_debounce)),
            "key_off_debounce:changed" => self
                .engine
                .set_key_off_debounce(self.state.with(|s| s.key_off_debounce)),
            "base_note_delay:changed" => self
                .engine
                .set_base_note_delay(self.state.with(|s| s.base_note_delay)),
            "synth:gain:changed" => self.set_synth_gain(),
            "pitchbend_range:changed" => self
                .engine
                .set_pitchbend_range(self.state.with(|s| s.pitchbend_range)),
            "reverb_volume:changed" => self.set_reverb_volume(),
            "reverb_panning:changed" => self.set_reverb_panning(),
            "coarse_tune:changed" => self.engine.set_string_params(&self.base_note_configs()),
            "fine_tune:changed" => self.push_all_fine_tunes(),
            "active:preset:changed" => self.configure_all_voices(false),
            "sound:changed" | "sound:deleted" => self.handle_sound_library_change(data),
            "active:preset:voice:muted:changed" => {
                self.engine.set_string_params(&self.string_mute_configs())
            }
            "active:preset:voice:volume:changed" => self.with_sender_voice(data, |c, voice| {
                c.engine
                    .set_string_params(&[(voice.string(), Param::Volume, voice.volume)])
            }),
            "active:preset:voice:base_note:changed" => {
                self.engine.set_string_params(&self.base_note_configs())
            }
            "active:preset:voice:capo:changed" => {
                self.engine.set_string_params(&self.melody_capo_configs())
            }
            "active:preset:voice:sound:changed" => self.with_sender_voice(data, |c, voice| {
                c.set_string_sound(voice)?;
                c.engine.set_string_params(&c.string_mute_configs())
            }),
            "active:preset:voice:mode:changed" => self.with_sender_voice(data, |c, voice| {
                c.engine
                    .set_string_params(&[(voice.string(), Param::Mode, voice.mode.index())])
            }),
            "active:preset:voice:polyphonic:changed" => self.with_sender_voice(data, |c, voice| {
                c.engine.set_string_params(&[(
                    voice.string(),
                    Param::Polyphonic,
                    voice.polyphonic as i32,
                )])
            }),
            "active:preset:voice:panning:changed" => self.with_sender_voice(data, |c, voice| {
                c.engine
                    .set_string_params(&[(voice.string(), Param::Panning, voice.panning)])
            }),
            "active:preset:voice:finetune:changed" => {
                self.with_sender_voice(data, |c, voice| c.set_voice_fine_tune(voice))
            }
            "active:preset:voice:chien_threshold:changed" => self.push_chien_thresholds(data),
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("device call for \"{}\" failed: {}", name, e);
        }
    }

    fn with_sender_voice<F>(&self, data: &EventData, f: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&Self, &VoiceState) -> Result<(), DeviceError>,
    {
        let voice = data
            .sender
            .as_ref()
            .and_then(|string| self.state.with(|s| s.preset.voice_by_string(string).cloned()));
        match voice {
            Some(voice) => f(self, &voice),
            None => {
                warn!("voice event without resolvable sender: {:?}", data.sender);
                Ok(())
            }
        }
    }

    fn handle_sound_library_change(&self, data: &EventData) -> Result<(), DeviceError> {
        let Some(id) = data.get_str("id").map(str::to_string) else {
            return Ok(());
        };
        let in_use = self
            .synth
            .loaded_fonts()
            .iter()
            .any(|path| path.file_name().map(|n| n.to_string_lossy() == id.as_str()) == Some(true));
        if in_use {
            self.configure_all_voices(true)?;
        }
        Ok(())
    }

    /// Full synth/engine reconfiguration for the active preset. Outputs
    /// stay halted for the duration; the hold guard resumes them on
    /// every exit path.
    fn configure_all_voices(&self, clear_sounds: bool) -> Result<(), DeviceError> {
        let _hold = OutputHold::new(self.engine.as_ref());

        if clear_sounds {
            self.synth.clear_all_channel_sounds()?;
            self.synth.unload_unused_soundfonts()?;
        }

        let (voices, sound_dir) = self
            .state
            .with(|s| (s.preset.voices().cloned().collect::<Vec<_>>(), s.sound_dir.clone()));

        let mut configs: Vec<StringParam> = Vec::new();
        for voice in &voices {
            let string = voice.string();
            match voice.sound(&sound_dir) {
                None => {
                    self.synth.clear_channel_sound(voice.channel)?;
                    configs.push((string.clone(), Param::Mute, 1));
                }
                Some((font, _sound)) => {
                    self.synth.set_channel_sound(
                        voice.channel,
                        &font.filepath,
                        voice.bank,
                        voice.program,
                    )?;
                    configs.push((string.clone(), Param::Mute, voice.muted as i32));
                }
            }
            configs.push((string.clone(), Param::Volume, voice.volume));
            configs.push((string.clone(), Param::Panning, voice.panning));
            configs.push((string.clone(), Param::Mode, voice.mode.index()));
            match voice.kind {
                VoiceKind::Melody => {
                    configs.push((string.clone(), Param::BaseNote, voice.base_note));
                    configs.push((string.clone(), Param::Capo, voice.capo));
                    configs.push((string.clone(), Param::Polyphonic, voice.polyphonic as i32));
                }
                VoiceKind::Drone | VoiceKind::Trompette => {
                    configs.push((string.clone(), Param::AllNotesOff, 0));
                    configs.push((string.clone(), Param::NoteOn, voice.base_note));
                }
                VoiceKind::Keynoise => {}
            }
        }
        self.engine.set_string_params(&configs)?;
        self.synth.unload_unused_soundfonts()?;

        self.set_synth_gain()?;
        self.engine
            .set_pitchbend_range(self.state.with(|s| s.pitchbend_range))?;
        self.engine.set_string_params(&self.chien_configs())?;
        self.set_reverb_volume()?;
        self.set_reverb_panning()?;
        Ok(())
    }

    fn set_string_sound(&self, voice: &VoiceState) -> Result<(), DeviceError> {
        self.engine
            .set_string_params(&[(voice.string(), Param::Mute, 1)])?;
        let sound_dir = self.state.with(|s| s.sound_dir.clone());
        let Some((font, _sound)) = voice.sound(&sound_dir) else {
            return self.synth.clear_channel_sound(voice.channel);
        };
        self.synth
            .set_channel_sound(voice.channel, &font.filepath, voice.bank, voice.program)?;
        let mut configs = vec![
            (voice.string(), Param::Reset, 0),
            (voice.string(), Param::Mode, voice.mode.index()),
        ];
        if !voice.muted {
            configs.push((voice.string(), Param::Mute, 0));
        }
        self.engine.set_string_params(&configs)?;
        self.set_voice_fine_tune(voice)
    }

    fn string_mute_configs(&self) -> Vec<StringParam> {
        self.state.with(|s| {
            s.preset
                .voices()
                .map(|voice| {
                    let mute = if voice.soundfont_id.is_none() {
                        1
                    } else {
                        voice.muted as i32
                    };
                    (voice.string(), Param::Mute, mute)
                })
                .collect()
        })
    }

    fn base_note_configs(&self) -> Vec<StringParam> {
        self.state.with(|s| {
            let mut configs = Vec::new();
            for voice in s.preset.voices() {
                let note = voice.base_note + s.coarse_tune;
                match voice.kind {
                    VoiceKind::Melody => {
                        configs.push((voice.string(), Param::BaseNote, note));
                    }
                    VoiceKind::Drone | VoiceKind::Trompette => {
                        configs.push((voice.string(), Param::AllNotesOff, 0));
                        configs.push((voice.string(), Param::NoteOn, note));
                    }
                    VoiceKind::Keynoise => {}
                }
            }
            configs
        })
    }

    fn melody_capo_configs(&self) -> Vec<StringParam> {
        self.state.with(|s| {
            s.preset
                .melody
                .iter()
                .map(|voice| (voice.string(), Param::Capo, voice.capo))
                .collect()
        })
    }

    /// Chien threshold tuples for all trompette strings. With a single
    /// shared threshold the first trompette voice is authoritative.
    fn chien_configs(&self) -> Vec<StringParam> {
        self.state.with(|s| {
            let thresholds = s.preset.chien_thresholds();
            (0..3)
                .map(|idx| {
                    let user = if s.multi_chien_threshold {
                        thresholds[idx]
                    } else {
                        thresholds[0]
                    };
                    (
                        format!("trompette{}", idx + 1),
                        Param::ChienThreshold,
                        chien_threshold_to_engine(user),
                    )
                })
                .collect()
        })
    }

    fn push_chien_thresholds(&self, data: &EventData) -> Result<(), DeviceError> {
        let multi = self.state.with(|s| s.multi_chien_threshold);
        if multi {
            // only the changed voice
            self.with_sender_voice(data, |c, voice| {
                c.engine.set_string_params(&[(
                    voice.string(),
                    Param::ChienThreshold,
                    chien_threshold_to_engine(voice.chien_threshold),
                )])
            })
        } else {
            self.engine.set_string_params(&self.chien_configs())
        }
    }

    fn set_voice_fine_tune(&self, voice: &VoiceState) -> Result<(), DeviceError> {
        let global = self.state.with(|s| s.fine_tune);
        let value = fine_tune_value(voice.finetune + global);
        let msb = (value >> 7) as u8 & 0x7F;
        let lsb = (value & 0x7F) as u8;
        // RPN 00:01 (channel fine tuning)
        self.synth.send_cc(voice.channel, 101, 0)?;
        self.synth.send_cc(voice.channel, 100, 1)?;
        self.synth.send_cc(voice.channel, 6, msb)?;
        self.synth.send_cc(voice.channel, 38, lsb)
    }

    fn push_all_fine_tunes(&self) -> Result<(), DeviceError> {
        let voices: Vec<VoiceState> =
            self.state.with(|s| s.preset.voices().cloned().collect());
        for voice in &voices {
            self.set_voice_fine_tune(voice)?;
        }
        Ok(())
    }

    fn set_synth_gain(&self) -> Result<(), DeviceError> {
        let gain = self.state.with(|s| s.synth.gain);
        self.synth.set_gain(gain as f32 / (127.0 / 3.0))
    }

    fn set_reverb_volume(&self) -> Result<(), DeviceError> {
        let volume = self.state.with(|s| s.reverb_volume);
        if volume == 0 {
            return self.synth.deactivate_reverb();
        }
        let level = util::scale(volume as f64, 0.0, 100.0, 0.01, 1.0) as f32;
        self.synth.set_reverb_level(level)?;
        if !self.synth.is_reverb_active() {
            self.synth.activate_reverb()?;
        }
        Ok(())
    }

    fn set_reverb_panning(&self) -> Result<(), DeviceError> {
        let panning = self.state.with(|s| s.reverb_panning);
        self.synth.set_reverb_balance(
            util::balance2amp(panning, util::Side::Left),
            util::balance2amp(panning, util::Side::Right),
        )
    }
}

pub struct SystemController {
    state: StateHandle,
    mixer: Arc<dyn Mixer>,
    backlight_control: PathBuf,
    led_paths: [PathBuf; 3],
    udc_config_path: PathBuf,
}

impl SystemController {
    pub const EVENTS: &'static [&'static str] = &[
        "main_volume:changed",
        "ui:brightness:changed",
        "ui:string_group:changed",
        "active:preset:changed",
        "active:preset:voice:muted:changed",
        "active:preset:voice:sound:changed",
    ];

    pub fn new(
        state: StateHandle,
        mixer: Arc<dyn Mixer>,
        backlight_control: PathBuf,
        led_paths: [PathBuf; 3],
        udc_config_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            mixer,
            backlight_control,
            led_paths,
            udc_config_path,
        })
    }

    pub fn start_listening(self: &Arc<Self>, signals: &Signals) {
        for event in Self::EVENTS {
            let controller = Arc::clone(self);
            signals.register(event, move |name, data| controller.handle(name, data));
        }
    }

    fn handle(&self, name: &str, _data: &EventData) {
        match name {
            "main_volume:changed" => self.set_volume(self.state.with(|s| s.main_volume)),
            "ui:brightness:changed" => self.set_brightness(self.state.with(|s| s.ui.brightness)),
            "ui:string_group:changed" => self.update_string_leds(),
            "active:preset:changed" => {
                self.update_string_leds();
                self.set_volume(self.state.with(|s| s.main_volume));
                self.set_brightness(self.state.with(|s| s.ui.brightness));
            }
            "active:preset:voice:muted:changed" | "active:preset:voice:sound:changed" => {
                self.update_string_leds()
            }
            _ => {}
        }
    }

    /// String LEDs mirror audibility of the active group's voices:
    /// LED 1 trompette, LED 2 melody, LED 3 drone.
    pub fn update_string_leds(&self) {
        let silent: Vec<bool> = self.state.with(|s| {
            let group = s.ui.string_group.clamp(0, 2) as usize;
            [VoiceKind::Trompette, VoiceKind::Melody, VoiceKind::Drone]
                .iter()
                .map(|kind| {
                    s.preset
                        .voices_by_kind(*kind)
                        .get(group)
                        .map(|v| v.is_silent())
                        .unwrap_or(true)
                })
                .collect()
        });
        for (idx, is_silent) in silent.iter().enumerate() {
            self.set_string_led(idx + 1, !is_silent);
        }
    }

    pub fn set_string_led(&self, string: usize, on: bool) {
        let path = &self.led_paths[(string - 1).min(2)];
        if let Err(e) = std::fs::write(path, if on { "255" } else { "0" }) {
            warn!("unable to set string led {}: {}", string, e);
        }
    }

    fn set_brightness(&self, value: i32) {
        let raw = util::scale(value as f64, 0.0, 100.0, 0.0, 255.0) as i32;
        if let Err(e) = std::fs::write(&self.backlight_control, raw.to_string()) {
            warn!("unable to set brightness: {}", e);
        }
    }

    fn set_volume(&self, volume: i32) {
        if let Err(e) = self.mixer.set_volume_percent(util::midi2percent(volume)) {
            error!("unable to set main volume: {}", e);
        }
    }

    /// Read the current UDC configuration into the MIDI state; called
    /// once at startup, later updates arrive via mdev events.
    pub fn update_udc_configuration(&self) {
        let config = crate::alsa::read_udc_config(&self.udc_config_path);
        self.state.apply(|state, ch| {
            if state.midi.udc_config != config {
                state.midi.udc_config = config;
                let mut data = EventData::with("udc_config", serde_json::json!(config));
                data.sender = None;
                ch.push("midi:udc_config:changed".to_string(), data);
            }
        });
    }
}

pub struct MidiController {
    state: StateHandle,
    engine: Arc<dyn StringEngine>,
    input_manager: Arc<InputManager>,
    midi_map_file: Option<PathBuf>,
}

impl MidiController {
    pub const EVENTS: &'static [&'static str] = &[
        "midi:port:removed",
        "midi:port:input_enabled:changed",
        "midi:port:output_enabled:changed",
    ];

    pub fn new(
        state: StateHandle,
        engine: Arc<dyn StringEngine>,
        input_manager: Arc<InputManager>,
        midi_map_file: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            engine,
            input_manager,
            midi_map_file,
        })
    }

    pub fn start_listening(self: &Arc<Self>, signals: &Signals) {
        for event in Self::EVENTS {
            let controller = Arc::clone(self);
            signals.register(event, move |name, data| controller.handle(name, data));
        }
    }

    fn handle(&self, name: &str, data: &EventData) {
        match name {
            "midi:port:removed" => {
                let Some(device) = data.get_str("device").map(str::to_string) else {
                    return;
                };
                if data.get_bool("output_enabled").unwrap_or(false) {
                    if let Err(e) = self.engine.remove_midi_output(&device) {
                        error!("unable to remove midi output {}: {}", device, e);
                    }
                }
                if data.get_bool("input_enabled").unwrap_or(false) {
                    self.input_manager.unregister(&device);
                }
            }
            "midi:port:input_enabled:changed" => {
                let Some((enabled, device)) = self.port_from_sender(data) else {
                    return;
                };
                if enabled {
                    self.add_midi_input(&device);
                } else {
                    self.input_manager.unregister(&device);
                }
            }
            "midi:port:output_enabled:changed" => {
                let Some((enabled, device)) = self.output_port_from_sender(data) else {
                    return;
                };
                let result = if enabled {
                    self.engine.add_midi_output(&device)
                } else {
                    self.engine.remove_midi_output(&device)
                };
                if let Err(e) = result {
                    error!("unable to toggle midi output {}: {}", device, e);
                }
            }
            _ => {}
        }
    }

    fn port_from_sender(&self, data: &EventData) -> Option<(bool, String)> {
        let id = data.sender.clone()?;
        self.state.with(|s| {
            s.midi
                .ports
                .get(&id)
                .map(|p| (p.input_enabled, p.port.device.clone()))
        })
    }

    fn output_port_from_sender(&self, data: &EventData) -> Option<(bool, String)> {
        let id = data.sender.clone()?;
        self.state.with(|s| {
            s.midi
                .ports
                .get(&id)
                .map(|p| (p.output_enabled, p.port.device.clone()))
        })
    }

    fn add_midi_input(&self, device: &str) {
        let Some(map_file) = &self.midi_map_file else {
            warn!("no midi input map configured, not registering {}", device);
            return;
        };
        let config = std::fs::read_to_string(map_file)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<serde_json::Value>(&raw)?));
        let mut config = match config {
            Ok(config) => config,
            Err(e) => {
                error!("unable to open midi device config: {}", e);
                return;
            }
        };
        config["device"] = serde_json::Value::from(device);
        match MidiInput::from_config(&config) {
            Ok(input) => self.input_manager.register(Box::new(input)),
            Err(e) => error!("invalid midi input map for {}: {}", device, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, RecordingEngine};
    use crate::signals::Signals;
    use crate::state::{set_attr, PowerState, State, StateHandle};
    use crate::synth::{RecordingSynth, SynthCall};

    fn handle_with(sound_dir: PathBuf) -> StateHandle {
        let signals = Signals::new();
        let power = PowerState::new(
            PathBuf::from("/nonexistent/ac"),
            PathBuf::from("/nonexistent/usb"),
            PathBuf::from("/nonexistent/bat"),
        );
        StateHandle::new(signals, State::new(sound_dir, power))
    }

    fn wired() -> (StateHandle, Arc<RecordingEngine>, Arc<RecordingSynth>) {
        let state = handle_with(PathBuf::from("/nonexistent/sounds"));
        let engine = Arc::new(RecordingEngine::new());
        let synth = Arc::new(RecordingSynth::new());
        let controller = SynthController::new(
            engine.clone() as Arc<dyn StringEngine>,
            synth.clone() as Arc<dyn Synth>,
            state.clone(),
        );
        controller.start_listening(&state.signals);
        (state, engine, synth)
    }

    #[test]
    fn test_chien_threshold_mapping() {
        // {0,25,50,75,100} -> {5000,3750,2500,1250,0}
        assert_eq!(chien_threshold_to_engine(0), 5000);
        assert_eq!(chien_threshold_to_engine(25), 3750);
        assert_eq!(chien_threshold_to_engine(50), 2500);
        assert_eq!(chien_threshold_to_engine(75), 1250);
        assert_eq!(chien_threshold_to_engine(100), 0);
    }

    #[test]
    fn test_fine_tune_quantization() {
        assert_eq!(fine_tune_value(0), 8192);
        assert_eq!(fine_tune_value(-100), 0);
        assert_eq!(fine_tune_value(100), 16383);
        for cents in -100..=100 {
            let expected = ((16384.0 / 200.0) * (cents as f64 + 100.0))
                .round()
                .clamp(0.0, 16383.0) as u16;
            assert_eq!(fine_tune_value(cents), expected);
        }
    }

    #[test]
    fn test_multi_chien_pushes_only_changed_voice() {
        let (state, engine, _synth) = wired();
        state.apply(|s, ch| {
            set_attr!(ch, s, multi_chien_threshold, true);
        });
        engine.take_calls();

        state
            .set_by_path("preset.trompette.1.chien_threshold", &serde_json::json!(20))
            .unwrap();

        assert_eq!(
            engine.param_tuples(),
            vec![("trompette2".to_string(), "chien_threshold", 4000)]
        );
    }

    #[test]
    fn test_single_chien_fans_out_first_voice() {
        let (state, engine, _synth) = wired();
        state
            .set_by_path("preset.trompette.1.chien_threshold", &serde_json::json!(20))
            .unwrap();
        // trompette1's value (50) governs all three strings
        assert_eq!(
            engine.param_tuples(),
            vec![
                ("trompette1".to_string(), "chien_threshold", 2500),
                ("trompette2".to_string(), "chien_threshold", 2500),
                ("trompette3".to_string(), "chien_threshold", 2500),
            ]
        );
    }

    #[test]
    fn test_fine_tune_rpn_sequence() {
        let (state, _engine, synth) = wired();
        state
            .set_by_path("preset.melody.0.finetune", &serde_json::json!(50))
            .unwrap();
        let value = fine_tune_value(50);
        assert_eq!(
            synth.take_calls(),
            vec![
                SynthCall::SendCc(0, 101, 0),
                SynthCall::SendCc(0, 100, 1),
                SynthCall::SendCc(0, 6, (value >> 7) as u8),
                SynthCall::SendCc(0, 38, (value & 0x7F) as u8),
            ]
        );
    }

    #[test]
    fn test_global_fine_tune_combines_with_voice() {
        let (state, _engine, synth) = wired();
        state.apply(|s, ch| {
            let voice = &mut s.preset.melody[0];
            set_attr!(ch, voice, finetune, 30);
        });
        synth.take_calls();
        state
            .set_by_path("fine_tune", &serde_json::json!(-10))
            .unwrap();
        let calls = synth.take_calls();
        // melody1 is channel 0, its combined offset is 30 - 10 = 20
        let value = fine_tune_value(20);
        assert_eq!(calls[2], SynthCall::SendCc(0, 6, (value >> 7) as u8));
        assert_eq!(calls.len(), 4 * 10, "all ten channels get the RPN");
    }

    #[test]
    fn test_gain_scaling() {
        let (state, _engine, synth) = wired();
        state.set_by_path("synth.gain", &serde_json::json!(127)).unwrap();
        let expected = 127.0f32 / (127.0 / 3.0);
        assert_eq!(synth.take_calls(), vec![SynthCall::SetGain(expected)]);
        assert!((expected - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_volume_change_targets_one_string() {
        let (state, engine, _synth) = wired();
        state
            .set_by_path("preset.drone.2.volume", &serde_json::json!(88))
            .unwrap();
        assert_eq!(
            engine.param_tuples(),
            vec![("drone3".to_string(), "volume", 88)]
        );
    }

    #[test]
    fn test_mute_change_pushes_all_mutes() {
        let (state, engine, _synth) = wired();
        state
            .set_by_path("preset.melody.0.muted", &serde_json::json!(false))
            .unwrap();
        let tuples = engine.param_tuples();
        assert_eq!(tuples.len(), 10);
        // voices without sounds stay forced to mute
        assert!(tuples.iter().all(|(_, p, v)| *p == "mute" && *v == 1));
    }

    #[test]
    fn test_preset_change_wraps_with_halt_resume() {
        let (state, engine, _synth) = wired();
        state.signals.emit("active:preset:changed", EventData::new());
        let calls = engine.take_calls();
        assert_eq!(calls.first(), Some(&EngineCall::Halt));
        assert_eq!(calls.last(), Some(&EngineCall::Resume));
        assert!(calls.contains(&EngineCall::PitchbendRange(0)));
    }

    #[test]
    fn test_reverb_volume_zero_deactivates() {
        let (state, _engine, synth) = wired();
        state
            .set_by_path("reverb_volume", &serde_json::json!(40))
            .unwrap();
        assert_eq!(
            synth.take_calls(),
            vec![
                SynthCall::ReverbLevel(util::scale(40.0, 0.0, 100.0, 0.01, 1.0) as f32),
                SynthCall::ActivateReverb
            ]
        );
        state
            .set_by_path("reverb_volume", &serde_json::json!(0))
            .unwrap();
        assert_eq!(synth.take_calls(), vec![SynthCall::DeactivateReverb]);
    }
}
