//! Interface to the audio synthesizer.
//!
//! Like the string engine, the synthesizer is an external collaborator.
//! The control plane assigns channel sounds, pushes gain and reverb
//! levels and sends raw control change messages for the per-channel
//! fine tune RPN sequence.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::engine::DeviceError;

pub trait Synth: Send + Sync {
    /// Load (if needed) and select a font/bank/program on a channel.
    fn set_channel_sound(
        &self,
        channel: i32,
        font_file: &Path,
        bank: i32,
        program: i32,
    ) -> Result<(), DeviceError>;

    fn clear_channel_sound(&self, channel: i32) -> Result<(), DeviceError>;
    fn clear_all_channel_sounds(&self) -> Result<(), DeviceError>;

    /// Unload fonts that no channel references anymore.
    fn unload_unused_soundfonts(&self) -> Result<(), DeviceError>;

    /// Font files currently loaded.
    fn loaded_fonts(&self) -> Vec<PathBuf>;

    /// Master gain, linear 0.0..=3.0.
    fn set_gain(&self, gain: f32) -> Result<(), DeviceError>;

    /// Raw control change on a channel (used for the fine-tune RPN).
    fn send_cc(&self, channel: i32, control: u8, value: u8) -> Result<(), DeviceError>;

    // Sympathetic reverb unit
    fn activate_reverb(&self) -> Result<(), DeviceError>;
    fn deactivate_reverb(&self) -> Result<(), DeviceError>;
    fn is_reverb_active(&self) -> bool;
    fn set_reverb_level(&self, level: f32) -> Result<(), DeviceError>;
    fn set_reverb_balance(&self, left: f32, right: f32) -> Result<(), DeviceError>;
}

/// Synth stand-in used when running without audio hardware.
#[derive(Default)]
pub struct NullSynth;

impl Synth for NullSynth {
    fn set_channel_sound(
        &self,
        channel: i32,
        font_file: &Path,
        bank: i32,
        program: i32,
    ) -> Result<(), DeviceError> {
        debug!(
            "set_channel_sound ch={} font={:?} bank={} program={}",
            channel, font_file, bank, program
        );
        Ok(())
    }

    fn clear_channel_sound(&self, _channel: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn clear_all_channel_sounds(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn unload_unused_soundfonts(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn loaded_fonts(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn set_gain(&self, _gain: f32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn send_cc(&self, _channel: i32, _control: u8, _value: u8) -> Result<(), DeviceError> {
        Ok(())
    }

    fn activate_reverb(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn deactivate_reverb(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn is_reverb_active(&self) -> bool {
        false
    }

    fn set_reverb_level(&self, _level: f32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_reverb_balance(&self, _left: f32, _right: f32) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Recording synth for tests.
#[derive(Default)]
pub struct RecordingSynth {
    pub calls: Mutex<Vec<SynthCall>>,
    channels: Mutex<std::collections::HashMap<i32, PathBuf>>,
    reverb_active: Mutex<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthCall {
    SetChannelSound(i32, PathBuf, i32, i32),
    ClearChannelSound(i32),
    ClearAllChannelSounds,
    UnloadUnused,
    SetGain(f32),
    SendCc(i32, u8, u8),
    ActivateReverb,
    DeactivateReverb,
    ReverbLevel(f32),
    ReverbBalance(f32, f32),
}

impl RecordingSynth {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: SynthCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn take_calls(&self) -> Vec<SynthCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }
}

impl Synth for RecordingSynth {
    fn set_channel_sound(
        &self,
        channel: i32,
        font_file: &Path,
        bank: i32,
        program: i32,
    ) -> Result<(), DeviceError> {
        self.channels
            .lock()
            .unwrap()
            .insert(channel, font_file.to_path_buf());
        self.record(SynthCall::SetChannelSound(
            channel,
            font_file.to_path_buf(),
            bank,
            program,
        ));
        Ok(())
    }

    fn clear_channel_sound(&self, channel: i32) -> Result<(), DeviceError> {
        self.channels.lock().unwrap().remove(&channel);
        self.record(SynthCall::ClearChannelSound(channel));
        Ok(())
    }

    fn clear_all_channel_sounds(&self) -> Result<(), DeviceError> {
        self.channels.lock().unwrap().clear();
        self.record(SynthCall::ClearAllChannelSounds);
        Ok(())
    }

    fn unload_unused_soundfonts(&self) -> Result<(), DeviceError> {
        self.record(SynthCall::UnloadUnused);
        Ok(())
    }

    fn loaded_fonts(&self) -> Vec<PathBuf> {
        let mut fonts: Vec<PathBuf> = self.channels.lock().unwrap().values().cloned().collect();
        fonts.sort();
        fonts.dedup();
        fonts
    }

    fn set_gain(&self, gain: f32) -> Result<(), DeviceError> {
        self.record(SynthCall::SetGain(gain));
        Ok(())
    }

    fn send_cc(&self, channel: i32, control: u8, value: u8) -> Result<(), DeviceError> {
        self.record(SynthCall::SendCc(channel, control, value));
        Ok(())
    }

    fn activate_reverb(&self) -> Result<(), DeviceError> {
        *self.reverb_active.lock().unwrap() = true;
        self.record(SynthCall::ActivateReverb);
        Ok(())
    }

    fn deactivate_reverb(&self) -> Result<(), DeviceError> {
        *self.reverb_active.lock().unwrap() = false;
        self.record(SynthCall::DeactivateReverb);
        Ok(())
    }

    fn is_reverb_active(&self) -> bool {
        *self.reverb_active.lock().unwrap()
    }

    fn set_reverb_level(&self, level: f32) -> Result<(), DeviceError> {
        self.record(SynthCall::ReverbLevel(level));
        Ok(())
    }

    fn set_reverb_balance(&self, left: f32, right: f32) -> Result<(), DeviceError> {
        self.record(SynthCall::ReverbBalance(left, right));
        Ok(())
    }
}
