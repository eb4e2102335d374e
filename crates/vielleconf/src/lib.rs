//! Minimal configuration loading for the Vielle firmware.
//!
//! The firmware reads a single TOML file with four sections: `[core]`
//! (data and config directories), `[server]` (HTTP), `[system]` (sysfs
//! paths for power, backlight, LEDs, display and the ALSA mixer) and
//! `[logging]`. Every key has a compiled default matching the shipped
//! device image, so a minimal config file only overrides what differs.
//!
//! A missing config file is a fatal startup error: the firmware refuses
//! to guess where its data lives.
//!
//! # Example Config
//!
//! ```toml
//! [core]
//! data_dir = "/data"
//! input_config = "input.json"
//!
//! [server]
//! http_port = 80
//!
//! [logging]
//! log_method = "console"
//! log_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Data and config directories plus the input-map filename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Base directory for mutable instrument data.
    /// Default: /data
    #[serde(default = "CoreConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// SoundFont directory.
    /// Default: /data/sounds
    #[serde(default = "CoreConfig::default_sound_dir")]
    pub sound_dir: PathBuf,

    /// User config directory (input maps etc).
    /// Default: /data/config
    #[serde(default = "CoreConfig::default_config_dir")]
    pub config_dir: PathBuf,

    /// Staging directory for SoundFont uploads. Must be on the same
    /// filesystem as `sound_dir` so the final rename is atomic.
    /// Default: /data/uploads
    #[serde(default = "CoreConfig::default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Filename of the input map, looked up via [`Settings::find_config_file`].
    /// Default: input.json
    #[serde(default = "CoreConfig::default_input_config")]
    pub input_config: String,

    /// Read-only fallback config directory shipped with the firmware image.
    /// Default: /usr/share/vielle/config
    #[serde(default = "CoreConfig::default_dist_config_dir")]
    pub dist_config_dir: PathBuf,
}

impl CoreConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("/data")
    }

    fn default_sound_dir() -> PathBuf {
        PathBuf::from("/data/sounds")
    }

    fn default_config_dir() -> PathBuf {
        PathBuf::from("/data/config")
    }

    fn default_upload_dir() -> PathBuf {
        PathBuf::from("/data/uploads")
    }

    fn default_input_config() -> String {
        "input.json".to_string()
    }

    fn default_dist_config_dir() -> PathBuf {
        PathBuf::from("/usr/share/vielle/config")
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            sound_dir: Self::default_sound_dir(),
            config_dir: Self::default_config_dir(),
            upload_dir: Self::default_upload_dir(),
            input_config: Self::default_input_config(),
            dist_config_dir: Self::default_dist_config_dir(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port for the REST API and websocket.
    /// Default: 80
    #[serde(default = "ServerConfig::default_http_port")]
    pub http_port: u16,

    /// Static webroot for the browser UI.
    /// Default: /srv/www
    #[serde(default = "ServerConfig::default_webroot_dir")]
    pub webroot_dir: PathBuf,
}

impl ServerConfig {
    fn default_http_port() -> u16 {
        80
    }

    fn default_webroot_dir() -> PathBuf {
        PathBuf::from("/srv/www")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: Self::default_http_port(),
            webroot_dir: Self::default_webroot_dir(),
        }
    }
}

/// Sysfs and device paths of the instrument hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// AC power online flag.
    #[serde(default = "SystemConfig::default_power_state_ac")]
    pub power_state_ac: PathBuf,

    /// USB power online flag.
    #[serde(default = "SystemConfig::default_power_state_usb")]
    pub power_state_usb: PathBuf,

    /// Battery voltage in millivolts.
    #[serde(default = "SystemConfig::default_battery_voltage")]
    pub battery_voltage: PathBuf,

    /// Display backlight brightness control.
    #[serde(default = "SystemConfig::default_backlight_control")]
    pub backlight_control: PathBuf,

    /// Per-string LED brightness controls.
    #[serde(default = "SystemConfig::default_led_brightness_1")]
    pub led_brightness_1: PathBuf,
    #[serde(default = "SystemConfig::default_led_brightness_2")]
    pub led_brightness_2: PathBuf,
    #[serde(default = "SystemConfig::default_led_brightness_3")]
    pub led_brightness_3: PathBuf,

    /// Name of the ALSA mixer element controlling the power amplifier.
    #[serde(default = "SystemConfig::default_alsa_mixer")]
    pub alsa_mixer: String,

    /// USB device-controller gadget configuration index.
    #[serde(default = "SystemConfig::default_udc_config")]
    pub udc_config: PathBuf,

    /// Display framebuffer device.
    #[serde(default = "SystemConfig::default_display_device")]
    pub display_device: PathBuf,

    /// Whether the display device supports mmap.
    /// Default: true
    #[serde(default = "SystemConfig::default_display_mmap")]
    pub display_mmap: bool,
}

impl SystemConfig {
    fn default_power_state_ac() -> PathBuf {
        PathBuf::from("/sys/class/power_supply/axp20x-ac/online")
    }

    fn default_power_state_usb() -> PathBuf {
        PathBuf::from("/sys/class/power_supply/axp20x-usb/online")
    }

    fn default_battery_voltage() -> PathBuf {
        PathBuf::from("/sys/class/hwmon/hwmon0/in1_input")
    }

    fn default_backlight_control() -> PathBuf {
        PathBuf::from("/sys/class/backlight/ssd1307fb0/brightness")
    }

    fn default_led_brightness_1() -> PathBuf {
        PathBuf::from("/sys/class/leds/string1/brightness")
    }

    fn default_led_brightness_2() -> PathBuf {
        PathBuf::from("/sys/class/leds/string2/brightness")
    }

    fn default_led_brightness_3() -> PathBuf {
        PathBuf::from("/sys/class/leds/string3/brightness")
    }

    fn default_alsa_mixer() -> String {
        "Power Amplifier".to_string()
    }

    fn default_udc_config() -> PathBuf {
        PathBuf::from(
            "/sys/devices/platform/soc@01c00000/1c13000.usb/musb-hdrc.1.auto/gadget/configuration",
        )
    }

    fn default_display_device() -> PathBuf {
        PathBuf::from("/dev/fb0")
    }

    fn default_display_mmap() -> bool {
        true
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            power_state_ac: Self::default_power_state_ac(),
            power_state_usb: Self::default_power_state_usb(),
            battery_voltage: Self::default_battery_voltage(),
            backlight_control: Self::default_backlight_control(),
            led_brightness_1: Self::default_led_brightness_1(),
            led_brightness_2: Self::default_led_brightness_2(),
            led_brightness_3: Self::default_led_brightness_3(),
            alsa_mixer: Self::default_alsa_mixer(),
            udc_config: Self::default_udc_config(),
            display_device: Self::default_display_device(),
            display_mmap: Self::default_display_mmap(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log sink: "console", "file" or "syslog". The syslog transport is
    /// not configured by the firmware and falls back to console.
    #[serde(default = "LoggingConfig::default_log_method")]
    pub log_method: String,

    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "LoggingConfig::default_log_level")]
    pub log_level: String,

    /// Log file path, used when log_method = "file".
    #[serde(default = "LoggingConfig::default_log_file")]
    pub log_file: PathBuf,

    /// Collapse multi-line events into a single line.
    /// Default: true
    #[serde(default = "LoggingConfig::default_log_oneline")]
    pub log_oneline: bool,

    /// Per-target overrides as "target:level,target:level,...".
    #[serde(default)]
    pub log_levels: String,
}

impl LoggingConfig {
    fn default_log_method() -> String {
        "syslog".to_string()
    }

    fn default_log_level() -> String {
        "warn".to_string()
    }

    fn default_log_file() -> PathBuf {
        PathBuf::from("/dev/log")
    }

    fn default_log_oneline() -> bool {
        true
    }

    /// Build a tracing EnvFilter directive string from level + overrides.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.log_level.clone();
        for entry in self.log_levels.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((target, level)) = entry.split_once(':') {
                directives.push_str(&format!(",{}={}", target.trim(), level.trim()));
            }
        }
        directives
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_method: Self::default_log_method(),
            log_level: Self::default_log_level(),
            log_file: Self::default_log_file(),
            log_oneline: Self::default_log_oneline(),
            log_levels: String::new(),
        }
    }
}

/// Complete firmware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from a TOML file. A missing or unparsable file is an
    /// error; startup treats it as fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Create the mutable data directories if they are missing.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.core.sound_dir,
            &self.core.config_dir,
            &self.core.upload_dir,
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Locate a named config file: user config dir first, then the
    /// read-only dist directory shipped with the image.
    pub fn find_config_file(&self, name: &str) -> Option<PathBuf> {
        let user = self.core.config_dir.join(name);
        if user.is_file() {
            return Some(user);
        }
        let dist = self.core.dist_config_dir.join(name);
        if dist.is_file() {
            return Some(dist);
        }
        None
    }

    /// Per-string LED brightness path, strings numbered 1..=3.
    pub fn led_brightness(&self, string: u8) -> &Path {
        match string {
            1 => &self.system.led_brightness_1,
            2 => &self.system.led_brightness_2,
            _ => &self.system.led_brightness_3,
        }
    }
}
