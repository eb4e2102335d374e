//! Keyboard calibration persistence glue.
//!
//! The 24 melody keys each carry a pressure range and a velocity
//! adjustment. Values live in the config store and are committed to the
//! string engine at boot and whenever the calibration API writes them.

use serde_json::Value;
use viellestore::Store;

use crate::engine::{DeviceError, KeyCalibration, StringEngine};

pub const KEY_COUNT: usize = 24;

const CONFIG_KEY: &str = "key_calibration";

pub fn default_keys() -> Vec<KeyCalibration> {
    vec![KeyCalibration::default(); KEY_COUNT]
}

/// Load the stored calibration, padded and truncated to 24 entries.
pub fn load_keys(store: &Store) -> Vec<KeyCalibration> {
    let mut keys = default_keys();
    let Some(Value::Array(entries)) = store.load_config(CONFIG_KEY).ok().flatten() else {
        return keys;
    };
    for (idx, entry) in entries.iter().take(KEY_COUNT).enumerate() {
        if let Ok(parsed) = serde_json::from_value::<KeyCalibration>(entry.clone()) {
            keys[idx] = parsed;
        }
    }
    keys
}

pub fn save_keys(store: &Store, keys: &[KeyCalibration]) -> Result<(), viellestore::StoreError> {
    let value = serde_json::to_value(keys).unwrap_or(Value::Null);
    store.save_config(CONFIG_KEY, &value)
}

pub fn delete_keys(store: &Store) -> Result<(), viellestore::StoreError> {
    store.delete_config(CONFIG_KEY)
}

/// Push a calibration set into the engine.
pub fn commit_keys(engine: &dyn StringEngine, keys: &[KeyCalibration]) -> Result<(), DeviceError> {
    engine.set_key_calibration(keys)
}
