//! ALSA glue: raw MIDI port enumeration and the power-amplifier mixer.
//!
//! Both are thin shims over the sound layer. Port enumeration scans
//! `/dev/snd` for raw MIDI device nodes and derives a stable port id
//! from the owning card's id string, so the gadget port shows up as
//! `f_midi.<dev>`.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::warn;

use crate::engine::DeviceError;
use crate::state::MidiPortInfo;

/// Enumerates the currently present raw MIDI ports.
pub trait PortEnumerator: Send + Sync {
    fn ports(&self) -> Vec<MidiPortInfo>;
}

/// Enumeration over `/dev/snd/midiC<card>D<dev>` nodes.
pub struct SysfsPortEnumerator {
    dev_dir: PathBuf,
    card_id_dir: PathBuf,
}

impl Default for SysfsPortEnumerator {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev/snd"),
            card_id_dir: PathBuf::from("/sys/class/sound"),
        }
    }
}

impl SysfsPortEnumerator {
    pub fn new(dev_dir: PathBuf, card_id_dir: PathBuf) -> Self {
        Self {
            dev_dir,
            card_id_dir,
        }
    }

    fn card_id(&self, card_idx: i32) -> String {
        let path = self
            .card_id_dir
            .join(format!("card{}", card_idx))
            .join("id");
        std::fs::read_to_string(path)
            .map(|raw| raw.trim().to_string())
            .unwrap_or_else(|_| format!("card{}", card_idx))
    }
}

impl PortEnumerator for SysfsPortEnumerator {
    fn ports(&self) -> Vec<MidiPortInfo> {
        let mut ports = Vec::new();
        let entries = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(_) => return ports,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((card_idx, device_idx)) = parse_rawmidi_node(&name) {
                ports.push(MidiPortInfo {
                    id: format!("{}.{}", self.card_id(card_idx), device_idx),
                    card_idx,
                    device: entry.path().to_string_lossy().into_owned(),
                });
            }
        }
        ports.sort_by(|a, b| a.id.cmp(&b.id));
        ports
    }
}

/// Parse "midiC1D0" into (card 1, device 0).
fn parse_rawmidi_node(name: &str) -> Option<(i32, i32)> {
    let rest = name.strip_prefix("midiC")?;
    let (card, device) = rest.split_once('D')?;
    Some((card.parse().ok()?, device.parse().ok()?))
}

/// The power-amplifier volume control.
pub trait Mixer: Send + Sync {
    fn set_volume_percent(&self, percent: i32) -> Result<(), DeviceError>;
}

/// Mixer shim driving the ALSA simple mixer element via amixer.
pub struct AlsaMixer {
    element: String,
}

impl AlsaMixer {
    pub fn new(element: &str) -> Self {
        Self {
            element: element.to_string(),
        }
    }
}

impl Mixer for AlsaMixer {
    fn set_volume_percent(&self, percent: i32) -> Result<(), DeviceError> {
        let percent = percent.clamp(0, 100);
        let status = Command::new("amixer")
            .args(["sset", &self.element, &format!("{}%", percent)])
            .output()?;
        if !status.status.success() {
            warn!("amixer sset {} failed", self.element);
            return Err(DeviceError::Failed(format!(
                "amixer exited with {:?}",
                status.status.code()
            )));
        }
        Ok(())
    }
}

/// Mixer stand-in for tests and hardware-less runs.
#[derive(Default)]
pub struct NullMixer {
    pub volumes: std::sync::Mutex<Vec<i32>>,
}

impl Mixer for NullMixer {
    fn set_volume_percent(&self, percent: i32) -> Result<(), DeviceError> {
        self.volumes.lock().unwrap().push(percent);
        Ok(())
    }
}

/// Fixed port list for tests.
#[derive(Default)]
pub struct StaticPortEnumerator {
    pub list: std::sync::Mutex<Vec<MidiPortInfo>>,
}

impl StaticPortEnumerator {
    pub fn set_ports(&self, ports: Vec<MidiPortInfo>) {
        *self.list.lock().unwrap() = ports;
    }
}

impl PortEnumerator for StaticPortEnumerator {
    fn ports(&self) -> Vec<MidiPortInfo> {
        self.list.lock().unwrap().clone()
    }
}

/// Read the active USB gadget configuration index.
pub fn read_udc_config(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rawmidi_node() {
        assert_eq!(parse_rawmidi_node("midiC1D0"), Some((1, 0)));
        assert_eq!(parse_rawmidi_node("midiC12D3"), Some((12, 3)));
        assert_eq!(parse_rawmidi_node("pcmC0D0p"), None);
        assert_eq!(parse_rawmidi_node("controlC0"), None);
    }

    #[test]
    fn test_sysfs_enumeration() {
        let dev = tempfile::tempdir().unwrap();
        let sys = tempfile::tempdir().unwrap();
        std::fs::write(dev.path().join("midiC1D0"), "").unwrap();
        std::fs::write(dev.path().join("controlC1"), "").unwrap();
        std::fs::create_dir_all(sys.path().join("card1")).unwrap();
        std::fs::write(sys.path().join("card1/id"), "f_midi\n").unwrap();

        let enumerator =
            SysfsPortEnumerator::new(dev.path().to_path_buf(), sys.path().to_path_buf());
        let ports = enumerator.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].id, "f_midi.0");
        assert_eq!(ports[0].card_idx, 1);
    }

    #[test]
    fn test_read_udc_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configuration");
        assert_eq!(read_udc_config(&path), -1);
        std::fs::write(&path, "2\n").unwrap();
        assert_eq!(read_udc_config(&path), 2);
    }
}
