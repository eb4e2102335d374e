//! Power supply state, refreshed by a periodic sysfs read.

use std::path::PathBuf;

use serde::Serialize;

use crate::state::{set_attr, Changes};

const BATTERY_MAX_VOLTAGE: f64 = 12.0;
const BATTERY_MIN_VOLTAGE: f64 = 7.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Ext,
    Usb,
    Bat,
}

impl PowerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerSource::Ext => "ext",
            PowerSource::Usb => "usb",
            PowerSource::Bat => "bat",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerState {
    pub source: PowerSource,
    pub battery_voltage: f64,
    pub battery_percent: i32,

    ac_state_file: PathBuf,
    usb_state_file: PathBuf,
    battery_voltage_file: PathBuf,
}

impl PowerState {
    pub fn new(ac_state_file: PathBuf, usb_state_file: PathBuf, battery_voltage_file: PathBuf) -> Self {
        Self {
            source: PowerSource::Ext,
            battery_voltage: 0.0,
            battery_percent: 0,
            ac_state_file,
            usb_state_file,
            battery_voltage_file,
        }
    }

    pub(crate) fn prefix(&self) -> &'static str {
        "power"
    }

    pub(crate) fn sender(&self) -> Option<String> {
        None
    }

    fn read_flag(path: &PathBuf) -> bool {
        std::fs::read_to_string(path)
            .map(|raw| raw.trim() == "1")
            .unwrap_or(false)
    }

    fn read_power_source(&self) -> PowerSource {
        if Self::read_flag(&self.ac_state_file) {
            PowerSource::Ext
        } else if Self::read_flag(&self.usb_state_file) {
            PowerSource::Usb
        } else {
            PowerSource::Bat
        }
    }

    fn read_battery_voltage(&self) -> f64 {
        std::fs::read_to_string(&self.battery_voltage_file)
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|millivolts| millivolts as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Refresh from sysfs; called from the 3 s power poll timer.
    pub fn update(&mut self, ch: &mut Changes) {
        let source = self.read_power_source();
        let voltage = self.read_battery_voltage();
        let percent = (((voltage - BATTERY_MIN_VOLTAGE)
            / (BATTERY_MAX_VOLTAGE - BATTERY_MIN_VOLTAGE))
            * 100.0)
            .round()
            .clamp(0.0, 100.0) as i32;

        set_attr!(ch, self, source, source);
        set_attr!(ch, self, battery_voltage, voltage);
        set_attr!(ch, self, battery_percent, percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_files(ac: &str, usb: &str, millivolts: &str) -> (tempfile::TempDir, PowerState) {
        let dir = tempfile::tempdir().unwrap();
        let ac_path = dir.path().join("ac");
        let usb_path = dir.path().join("usb");
        let bat_path = dir.path().join("bat");
        std::fs::write(&ac_path, ac).unwrap();
        std::fs::write(&usb_path, usb).unwrap();
        std::fs::write(&bat_path, millivolts).unwrap();
        let state = PowerState::new(ac_path, usb_path, bat_path);
        (dir, state)
    }

    #[test]
    fn test_source_priority() {
        let (_dir, mut state) = state_with_files("1\n", "1\n", "9000\n");
        let mut ch = Changes::new();
        state.update(&mut ch);
        assert_eq!(state.source, PowerSource::Ext);

        let (_dir, mut state) = state_with_files("0\n", "1\n", "9000\n");
        state.update(&mut ch);
        assert_eq!(state.source, PowerSource::Usb);

        let (_dir, mut state) = state_with_files("0\n", "0\n", "9000\n");
        state.update(&mut ch);
        assert_eq!(state.source, PowerSource::Bat);
    }

    #[test]
    fn test_battery_percent_clamped() {
        let (_dir, mut state) = state_with_files("0", "0", "7500");
        let mut ch = Changes::new();
        state.update(&mut ch);
        assert_eq!(state.battery_percent, 0);
        assert_eq!(state.battery_voltage, 7.5);

        let (_dir, mut state) = state_with_files("0", "0", "13000");
        state.update(&mut ch);
        assert_eq!(state.battery_percent, 100);
    }

    #[test]
    fn test_missing_files_fall_back_to_battery() {
        let mut state = PowerState::new(
            PathBuf::from("/nonexistent/ac"),
            PathBuf::from("/nonexistent/usb"),
            PathBuf::from("/nonexistent/bat"),
        );
        let mut ch = Changes::new();
        state.update(&mut ch);
        assert_eq!(state.source, PowerSource::Bat);
        assert_eq!(state.battery_voltage, 0.0);
    }
}
