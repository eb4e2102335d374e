//! End-to-end scenarios wiring the state tree, controllers and input
//! plumbing against recording fakes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use vielled::controller::{MidiController, SynthController};
use vielled::engine::{EngineCall, RecordingEngine, StringEngine};
use vielled::events::Event;
use vielled::input::manager::InputManager;
use vielled::signals::Signals;
use vielled::sounds::testdata::build_sf2;
use vielled::state::{MidiPortInfo, PowerState, State, StateHandle};
use vielled::synth::{RecordingSynth, Synth, SynthCall};
use viellestore::Store;

fn state_with_sounds(dir: &tempfile::TempDir) -> StateHandle {
    let signals = Signals::new();
    let power = PowerState::new(
        dir.path().join("ac"),
        dir.path().join("usb"),
        dir.path().join("bat"),
    );
    StateHandle::new(signals, State::new(dir.path().to_path_buf(), power))
}

fn write_midigurdy_font(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("mg.sf2");
    std::fs::write(
        &path,
        build_sf2(
            "MidiGurdy Standard",
            "MidiGurdy Sound Set",
            "",
            &[(0, 0, "Melody"), (1, 0, "Drone"), (2, 0, "Tromp")],
        ),
    )
    .unwrap();
    path
}

/// Scenario S1: loading a stored preset must halt outputs, configure
/// the synth channels, push string params and resume, in that order.
#[test]
fn preset_load_reconfigures_synth_coherently() {
    let dir = tempfile::tempdir().unwrap();
    let font_path = write_midigurdy_font(&dir);
    let state = state_with_sounds(&dir);
    let store = Store::in_memory().unwrap();

    // preset #1 is a placeholder so the target preset gets number 2
    store.insert_preset("Empty", None, &json!({})).unwrap();
    let target = store
        .insert_preset(
            "Dance",
            None,
            &json!({
                "voices": {
                    "melody": [
                        {"soundfont": "mg.sf2", "bank": 0, "program": 0,
                         "note": 60, "muted": false}
                    ]
                }
            }),
        )
        .unwrap();

    let engine = Arc::new(RecordingEngine::new());
    let synth = Arc::new(RecordingSynth::new());
    let controller = SynthController::new(
        engine.clone() as Arc<dyn StringEngine>,
        synth.clone() as Arc<dyn Synth>,
        state.clone(),
    );
    controller.start_listening(&state.signals);

    state.load_preset(&store, target.id).unwrap();

    // ordering: halt first, resume last
    let engine_calls = engine.take_calls();
    assert_eq!(engine_calls.first(), Some(&EngineCall::Halt));
    assert_eq!(engine_calls.last(), Some(&EngineCall::Resume));

    // the font loads exactly once, on channel 0 with bank/program 0
    let synth_calls = synth.take_calls();
    let loads: Vec<_> = synth_calls
        .iter()
        .filter(|c| matches!(c, SynthCall::SetChannelSound(..)))
        .collect();
    assert_eq!(loads.len(), 1);
    assert_eq!(
        loads[0],
        &SynthCall::SetChannelSound(0, font_path.clone(), 0, 0)
    );

    // melody1 is unmuted and keeps its base note
    let tuples: Vec<(String, &str, i32)> = engine_calls
        .iter()
        .filter_map(|c| match c {
            EngineCall::StringParams(params) => Some(params.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(tuples.contains(&("melody1".to_string(), "mute", 0)));
    assert!(tuples.contains(&("melody1".to_string(), "base_note", 60)));
    // every other voice has no sound and stays muted
    assert!(tuples.contains(&("melody2".to_string(), "mute", 1)));
    assert!(tuples.contains(&("drone1".to_string(), "mute", 1)));

    assert_eq!(state.with(|s| s.last_preset_number), 2);
}

/// A device failure mid-reconfiguration must still resume outputs.
#[test]
fn preset_load_resumes_outputs_after_errors() {
    struct FailingEngine {
        inner: RecordingEngine,
    }

    impl StringEngine for FailingEngine {
        fn set_string_params(
            &self,
            _params: &[vielled::engine::StringParam],
        ) -> Result<(), vielled::engine::DeviceError> {
            Err(vielled::engine::DeviceError::Failed("bus stuck".to_string()))
        }

        fn halt_outputs(&self) {
            self.inner.halt_outputs();
        }

        fn resume_outputs(&self) {
            self.inner.resume_outputs();
        }

        fn set_pitchbend_range(&self, v: i32) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_pitchbend_range(v)
        }

        fn set_key_on_debounce(&self, v: i32) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_key_on_debounce(v)
        }

        fn set_key_off_debounce(&self, v: i32) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_key_off_debounce(v)
        }

        fn set_base_note_delay(&self, v: i32) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_base_note_delay(v)
        }

        fn set_mapping_ranges(
            &self,
            n: &str,
            r: &[vielled::engine::MappingRange],
        ) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_mapping_ranges(n, r)
        }

        fn reset_mapping_ranges(&self, n: &str) -> Result<(), vielled::engine::DeviceError> {
            self.inner.reset_mapping_ranges(n)
        }

        fn get_mapping_ranges(&self, n: &str) -> Vec<vielled::engine::MappingRange> {
            self.inner.get_mapping_ranges(n)
        }

        fn set_key_calibration(
            &self,
            e: &[vielled::engine::KeyCalibration],
        ) -> Result<(), vielled::engine::DeviceError> {
            self.inner.set_key_calibration(e)
        }

        fn add_midi_output(&self, d: &str) -> Result<(), vielled::engine::DeviceError> {
            self.inner.add_midi_output(d)
        }

        fn remove_midi_output(&self, d: &str) -> Result<(), vielled::engine::DeviceError> {
            self.inner.remove_midi_output(d)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let state = state_with_sounds(&dir);
    let store = Store::in_memory().unwrap();
    let row = store.insert_preset("P", None, &json!({})).unwrap();

    let engine = Arc::new(FailingEngine {
        inner: RecordingEngine::new(),
    });
    let synth = Arc::new(RecordingSynth::new());
    let controller = SynthController::new(
        engine.clone() as Arc<dyn StringEngine>,
        synth as Arc<dyn Synth>,
        state.clone(),
    );
    controller.start_listening(&state.signals);

    state.load_preset(&store, row.id).unwrap();

    let calls = engine.inner.take_calls();
    assert_eq!(calls.first(), Some(&EngineCall::Halt));
    assert_eq!(
        calls.last(),
        Some(&EngineCall::Resume),
        "resume must run even though param pushes failed"
    );
}

/// Scenario S4: a hotplugged MIDI port whose input gets enabled is
/// registered with the input manager, and bytes from the device surface
/// as mapped events on the queue.
#[test]
fn midi_hotplug_input_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_sounds(&dir);
    let store = Store::in_memory().unwrap();

    // the "hardware" is a fifo standing in for /dev/snd/midiC1D0
    let device = dir.path().join("midiC1D0");
    let device_str = device.to_str().unwrap().to_string();
    let cdev = std::ffi::CString::new(device_str.clone()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(cdev.as_ptr(), 0o644) }, 0);

    // input map the controller hands to new MIDI inputs
    let map_path = dir.path().join("midi.json");
    std::fs::write(
        &map_path,
        json!({
            "name": "external midi",
            "mappings": [
                {"input": {"name": "control_change", "arg1": 7},
                 "event": {"type": "state_change", "name": "main_volume",
                           "expr": {"value": "arg2"}}}
            ]
        })
        .to_string(),
    )
    .unwrap();

    let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
    let input_manager = Arc::new(InputManager::start(queue_tx));
    let engine = Arc::new(RecordingEngine::new());
    let controller = MidiController::new(
        state.clone(),
        engine.clone() as Arc<dyn StringEngine>,
        Arc::clone(&input_manager),
        Some(map_path),
    );
    controller.start_listening(&state.signals);

    // hotplug: the port appears
    state.update_midi_ports(
        vec![MidiPortInfo {
            id: "ext-1.0".to_string(),
            card_idx: 1,
            device: device_str.clone(),
        }],
        &store,
    );
    assert_eq!(state.with(|s| s.midi.ports.len()), 1);

    // enabling input registers the device with the poll loop
    state.apply(|s, ch| {
        let port = s.midi.ports.get_mut("ext-1.0").unwrap();
        port.input_enabled = true;
        let mut data = vielled::signals::EventData::with("input_enabled", json!(true));
        data.sender = Some("ext-1.0".to_string());
        ch.push("midi:port:input_enabled:changed".to_string(), data);
    });

    // give the poll thread a moment to pick the source up, then play
    std::thread::sleep(Duration::from_millis(300));
    {
        use std::io::Write;
        let mut writer = std::fs::OpenOptions::new().write(true).open(&device).unwrap();
        // CC#7 value 99 on channel 0
        writer.write_all(&[0xB0, 7, 99]).unwrap();
    }

    let event = queue_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("mapped event from hotplugged port");
    match event {
        Event::StateChange { path, value } => {
            assert_eq!(path, "main_volume");
            assert_eq!(value, json!(99));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// Saving the live state and loading it back reproduces the same tree.
#[test]
fn preset_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    write_midigurdy_font(&dir);
    let state = state_with_sounds(&dir);
    let store = Store::in_memory().unwrap();

    state.set_by_path("main_volume", &json!(101)).unwrap();
    state.set_by_path("coarse_tune", &json!(-5)).unwrap();
    state
        .set_by_path("preset.trompette.1.chien_threshold", &json!(33))
        .unwrap();
    state.set_by_path("preset.melody.0.capo", &json!(4)).unwrap();

    let row = state.save_preset(&store, Some("Roundtrip"), None).unwrap();

    // scramble, then load back
    state.apply(|s, ch| s.clear(ch));
    assert_eq!(state.with(|s| s.main_volume), 120);

    state.load_preset(&store, row.id).unwrap();
    state.with(|s| {
        assert_eq!(s.main_volume, 101);
        assert_eq!(s.coarse_tune, -5);
        assert_eq!(s.preset.trompette[1].chien_threshold, 33);
        assert_eq!(s.preset.melody[0].capo, 4);
        assert_eq!(s.preset.name, "Roundtrip");
    });
}

/// Removing a port with enabled output tears the engine route down.
#[test]
fn midi_port_removal_disables_output() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_sounds(&dir);
    let store = Store::in_memory().unwrap();

    let (queue_tx, _queue_rx) = crossbeam_channel::unbounded();
    let input_manager = Arc::new(InputManager::start(queue_tx));
    let engine = Arc::new(RecordingEngine::new());
    let controller = MidiController::new(
        state.clone(),
        engine.clone() as Arc<dyn StringEngine>,
        input_manager,
        None,
    );
    controller.start_listening(&state.signals);

    state.update_midi_ports(
        vec![MidiPortInfo {
            id: "ext-1.0".to_string(),
            card_idx: 1,
            device: "hw:1,0,0".to_string(),
        }],
        &store,
    );
    state.apply(|s, ch| {
        let port = s.midi.ports.get_mut("ext-1.0").unwrap();
        port.output_enabled = true;
        let mut data = vielled::signals::EventData::with("output_enabled", json!(true));
        data.sender = Some("ext-1.0".to_string());
        ch.push("midi:port:output_enabled:changed".to_string(), data);
    });
    assert_eq!(
        engine.take_calls(),
        vec![EngineCall::AddMidiOutput("hw:1,0,0".to_string())]
    );

    // unplug
    state.update_midi_ports(vec![], &store);
    assert_eq!(
        engine.take_calls(),
        vec![EngineCall::RemoveMidiOutput("hw:1,0,0".to_string())]
    );
}
