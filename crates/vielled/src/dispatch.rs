//! The event dispatcher: one thread consuming the typed event queue and
//! driving the menu, the state tree and the instrument actions.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde_json::Value;
use tracing::{error, info, warn};
use viellestore::Store;

use crate::alsa::PortEnumerator;
use crate::events::{Action, Event, InputEvent, Key};
use crate::state::{ModKeyMode, StateHandle};
use crate::ui::pages::main::PoweroffPage;
use crate::ui::Menu;
use crate::util::OneShotTimer;

const POWEROFF_PROMPT_DELAY: Duration = Duration::from_secs(1);
const POWEROFF_CONFIRM_DELAY: Duration = Duration::from_secs(2);

/// Actions that change the instrument state, triggered from mod keys
/// and external MIDI program changes.
pub struct StateActionHandler {
    state: StateHandle,
    store: Arc<Store>,
}

impl StateActionHandler {
    pub fn new(state: StateHandle, store: Arc<Store>) -> Self {
        Self { state, store }
    }

    pub fn handle(&self, name: &str, value: &Value) {
        match name {
            "load_preset" => self.load_preset(value),
            "load_next_preset" => self.load_next_preset(),
            "load_prev_preset" => self.load_prev_preset(),
            "toggle_string_mute" => self.toggle_string_mute(value),
            _ => error!("invalid state_action \"{}\"", name),
        }
    }

    fn load_by_row(&self, row: viellestore::PresetRow) {
        let number = row.number.unwrap_or(0);
        let _lock = self
            .state
            .lock(Some(&format!("Loading preset {}...", number)), false);
        if let Err(e) = self.state.load_preset(&self.store, row.id) {
            error!("unable to load preset {}: {}", row.id, e);
        }
    }

    /// Load by dense preset number (MIDI program change).
    fn load_preset(&self, value: &Value) {
        let Some(number) = value.as_i64() else {
            return;
        };
        match self.store.get_preset_by_number(number) {
            Ok(Some(row)) => self.load_by_row(row),
            Ok(None) => {}
            Err(e) => error!("unable to look up preset {}: {}", number, e),
        }
    }

    fn load_next_preset(&self) {
        let number = self.state.with(|s| s.last_preset_number) + 1;
        let row = match self.store.get_preset_by_number(number) {
            Ok(Some(row)) => Some(row),
            Ok(None) => {
                if self.state.with(|s| s.wrap_presets) {
                    self.store.first_preset().ok().flatten()
                } else {
                    None
                }
            }
            Err(e) => {
                error!("unable to look up preset {}: {}", number, e);
                None
            }
        };
        if let Some(row) = row {
            self.load_by_row(row);
        }
    }

    fn load_prev_preset(&self) {
        let number = self.state.with(|s| s.last_preset_number) - 1;
        let row = match self.store.get_preset_by_number(number) {
            Ok(Some(row)) => Some(row),
            Ok(None) => {
                if self.state.with(|s| s.wrap_presets) {
                    self.store.last_preset().ok().flatten()
                } else {
                    None
                }
            }
            Err(e) => {
                error!("unable to look up preset {}: {}", number, e);
                None
            }
        };
        if let Some(row) = row {
            self.load_by_row(row);
        }
    }

    /// Toggle mute by global string number: 1-3 melody, 4-6 drone,
    /// 7-9 trompette, 10 keynoise.
    fn toggle_string_mute(&self, value: &Value) {
        let Some(number) = value.as_i64() else {
            return;
        };
        self.state.apply(|state, ch| {
            if let Some(voice) = state.preset.voice_by_number_mut(number as i32) {
                let muted = voice.muted;
                crate::state::set_attr!(ch, voice, muted, !muted);
            }
        });
    }
}

/// Main loop and system-wide handler for all queued events.
pub struct Dispatcher {
    queue: Receiver<Event>,
    state: StateHandle,
    menu: Arc<Menu>,
    store: Arc<Store>,
    ports: Arc<dyn PortEnumerator>,
    actions: StateActionHandler,
    poweroff_timer: Arc<Mutex<Option<OneShotTimer>>>,
    poweroff: Arc<dyn Fn() + Send + Sync>,
}

impl Dispatcher {
    pub fn new(
        queue: Receiver<Event>,
        state: StateHandle,
        menu: Arc<Menu>,
        store: Arc<Store>,
        ports: Arc<dyn PortEnumerator>,
        poweroff: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let actions = StateActionHandler::new(state.clone(), Arc::clone(&store));
        Self {
            queue,
            state,
            menu,
            store,
            ports,
            actions,
            poweroff_timer: Arc::new(Mutex::new(None)),
            poweroff,
        }
    }

    /// Consume the queue until shutdown. Event handlers never take the
    /// loop down; panics are caught and logged.
    pub fn run(&self) {
        loop {
            let event = match self.queue.recv() {
                Ok(Event::Shutdown) | Err(_) => {
                    info!("dispatcher shutting down");
                    return;
                }
                Ok(event) => event,
            };
            let result = catch_unwind(AssertUnwindSafe(|| self.handle(event)));
            if result.is_err() {
                error!("error in event handler");
            }
        }
    }

    pub fn handle(&self, event: Event) {
        match event {
            Event::Input(ev) => self.handle_input(&ev),
            Event::State { name, data } => self.menu.handle_state_event(&name, &data),
            Event::StateChange { path, value } => {
                let _lock = self.state.lock(None, false);
                if let Err(e) = self.state.set_by_path(&path, &value) {
                    warn!("state_change failed: {}", e);
                }
            }
            Event::StateAction { name, value } => self.actions.handle(&name, &value),
            Event::Mdev {
                action,
                subsystem,
                device,
                ..
            } => self.handle_mdev(&action, &subsystem, &device),
            Event::Shutdown => {}
        }
    }

    fn handle_input(&self, ev: &InputEvent) {
        // the power key gesture runs regardless of the page stack
        if ev.key == Key::Fn4 {
            if ev.action == Action::Down {
                self.arm_poweroff_prompt();
            } else if ev.action == Action::Up {
                if let Some(timer) = self.poweroff_timer.lock().unwrap().take() {
                    timer.cancel();
                }
            }
        }

        if self.menu.handle_event(ev) {
            return;
        }

        // lid buttons toggle string mutes on the active group
        for (key, idx) in [(Key::Top1, 2usize), (Key::Top2, 1), (Key::Top3, 0)] {
            if ev.short_pressed(key) {
                self.state.apply(|s, ch| s.toggle_voice_mute(idx, false, ch));
                return;
            }
            if ev.long_pressed(key) {
                self.state.apply(|s, ch| s.toggle_voice_mute(idx, true, ch));
                return;
            }
        }

        if ev.key == Key::Mod1 {
            let mode = self.state.with(|s| s.mod1_key_mode);
            self.handle_mod_key(ev, mode);
        } else if ev.key == Key::Mod2 {
            let mode = self.state.with(|s| s.mod2_key_mode);
            self.handle_mod_key(ev, mode);
        }
    }

    fn handle_mod_key(&self, ev: &InputEvent, mode: ModKeyMode) {
        match mode {
            ModKeyMode::Group1 | ModKeyMode::Group2 => {
                let level = if mode == ModKeyMode::Group1 { 1 } else { 2 };
                if ev.action == Action::Down || ev.action == Action::Up {
                    self.state
                        .apply(|s, ch| s.modify_string_group(level, ev.action == Action::Down, ch));
                }
            }
            ModKeyMode::GroupNext => {
                if matches!(ev.action, Action::Short | Action::Long) {
                    self.state.apply(|s, ch| s.inc_string_group(1, ch));
                }
            }
            ModKeyMode::GroupPrev => {
                if matches!(ev.action, Action::Short | Action::Long) {
                    self.state.apply(|s, ch| s.inc_string_group(-1, ch));
                }
            }
            ModKeyMode::PresetNext => {
                if matches!(ev.action, Action::Short | Action::Long) {
                    self.actions.load_next_preset();
                }
            }
            ModKeyMode::PresetPrev => {
                if matches!(ev.action, Action::Short | Action::Long) {
                    self.actions.load_prev_preset();
                }
            }
            ModKeyMode::Preset => {
                if ev.action == Action::Short {
                    self.actions.load_next_preset();
                } else if ev.action == Action::Long {
                    self.actions.load_prev_preset();
                }
            }
            ModKeyMode::Group => {
                if ev.action == Action::Short {
                    self.state.apply(|s, ch| s.inc_string_group(1, ch));
                } else if ev.action == Action::Long {
                    self.state.apply(|s, ch| s.inc_string_group(-1, ch));
                }
            }
            ModKeyMode::GroupPresetNext => {
                if ev.action == Action::Short {
                    self.state.apply(|s, ch| s.inc_string_group(1, ch));
                } else if ev.action == Action::Long {
                    self.actions.load_next_preset();
                }
            }
            ModKeyMode::GroupPresetPrev => {
                if ev.action == Action::Short {
                    self.state.apply(|s, ch| s.inc_string_group(-1, ch));
                } else if ev.action == Action::Long {
                    self.actions.load_prev_preset();
                }
            }
        }
    }

    /// fn4 held: after one second the confirmation page appears and the
    /// two-second power-off countdown starts.
    fn arm_poweroff_prompt(&self) {
        let mut slot = self.poweroff_timer.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let menu = Arc::clone(&self.menu);
        let timer_slot = Arc::clone(&self.poweroff_timer);
        let poweroff = Arc::clone(&self.poweroff);
        *slot = Some(OneShotTimer::start(POWEROFF_PROMPT_DELAY, move || {
            menu.push_page(PoweroffPage::page());
            let menu2 = Arc::clone(&menu);
            let confirm = OneShotTimer::start(POWEROFF_CONFIRM_DELAY, move || {
                menu2.message("Powering off...", 0, false, true);
                poweroff();
            });
            *timer_slot.lock().unwrap() = Some(confirm);
        }));
    }

    fn handle_mdev(&self, action: &str, subsystem: &str, device: &str) {
        match subsystem {
            "midi" if action == "add" || action == "remove" => {
                self.state
                    .update_midi_ports(self.ports.ports(), &self.store);
            }
            "udc" => {
                let config: i32 = device.parse().unwrap_or(-1);
                self.state.apply(|s, ch| {
                    if s.midi.udc_config != config {
                        s.midi.udc_config = config;
                        let mut data = crate::signals::EventData::with(
                            "udc_config",
                            serde_json::json!(config),
                        );
                        data.sender = None;
                        ch.push("midi:udc_config:changed".to_string(), data);
                    }
                });
                self.state
                    .update_midi_ports(self.ports.ports(), &self.store);
            }
            _ => {}
        }
    }
}
