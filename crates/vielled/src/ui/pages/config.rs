//! The configuration deck: preset selection and saving, instrument
//! settings and MIDI port setup.

use serde_json::json;

use crate::events::{InputEvent, Key};
use crate::signals::EventData;
use crate::state::{midi_config_key, INSTRUMENT_MODES};
use crate::ui::display::{Anchor, Display};
use crate::ui::pages::{
    BoolItem, ConfigListPage, Deck, ListItem, Page, PageBox, PageCtx, TextInputPage, ValueItem,
};

pub fn preset_config_deck() -> PageBox {
    Box::new(
        Deck::new(vec![
            Box::new(PresetsPage::new()),
            instrument_settings_page(),
            Box::new(MidiPortsPage::new()),
        ])
        .with_events(&[
            "preset:added",
            "preset:changed",
            "preset:deleted",
            "preset:reordered",
            "midi:changed",
        ]),
    )
}

/// Stored presets with load on select; fn1 saves the current state as a
/// new preset through the text input page.
pub struct PresetsPage {
    /// (id, number, name)
    entries: Vec<(i64, i64, String)>,
    cursor: usize,
}

impl PresetsPage {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
        }
    }

    fn reload(&mut self, ctx: &PageCtx) {
        self.entries = ctx
            .store
            .list_presets()
            .map(|rows| {
                rows.into_iter()
                    .map(|row| (row.id, row.number.unwrap_or(0), row.name))
                    .collect()
            })
            .unwrap_or_default();
        self.cursor = self.cursor.min(self.entries.len().saturating_sub(1));
    }

    fn load_selected(&self, ctx: &mut PageCtx) {
        let Some((id, number, _)) = self.entries.get(self.cursor).cloned() else {
            return;
        };
        let _lock = ctx
            .state
            .lock(Some(&format!("Loading preset {}...", number)), false);
        if let Err(e) = ctx.state.load_preset(&ctx.store, id) {
            tracing::error!("unable to load preset {}: {}", id, e);
        }
    }

    fn save_page(&self) -> PageBox {
        Box::new(TextInputPage::new(
            "Save as:",
            "",
            Box::new(|ctx, text| {
                if let Some(name) = text {
                    match ctx.state.save_preset(&ctx.store, Some(&name), None) {
                        Ok(row) => ctx
                            .state
                            .signals
                            .emit("preset:added", EventData::with("id", json!(row.id))),
                        Err(e) => tracing::error!("unable to save preset: {}", e),
                    }
                }
                ctx.pop();
            }),
        ))
    }
}

impl Page for PresetsPage {
    fn title(&self) -> String {
        "Presets".to_string()
    }

    fn state_events(&self) -> &'static [&'static str] {
        &[
            "preset:added",
            "preset:changed",
            "preset:deleted",
            "preset:reordered",
        ]
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        self.reload(ctx);
    }

    fn handle_state_event(&mut self, _name: &str, _data: &EventData, ctx: &mut PageCtx) {
        self.reload(ctx);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.key == Key::Encoder {
            let next = self.cursor as i32 + ev.value.signum();
            self.cursor = next.clamp(0, self.entries.len().saturating_sub(1) as i32) as usize;
            return true;
        }
        if ev.pressed(Key::Select) && !self.entries.is_empty() {
            self.load_selected(ctx);
            return true;
        }
        if ev.pressed(Key::Fn1) {
            ctx.push(self.save_page());
            return true;
        }
        false
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        d.clear(None);
        d.font_size(3);
        if self.entries.is_empty() {
            d.puts_anchored(d.width() / 2, 12, "No presets", Anchor::Center);
            d.font_size(1);
            d.puts_anchored(d.width() / 2, 26, "fn1 saves current", Anchor::Center);
            d.update();
            return;
        }
        let active = ctx.state.with(|s| s.last_preset_number);
        let win_len = 3usize;
        let win_start = self
            .cursor
            .saturating_sub(1)
            .min(self.entries.len().saturating_sub(win_len));
        for (row, idx) in (win_start..(win_start + win_len).min(self.entries.len())).enumerate() {
            let (_, number, name) = &self.entries[idx];
            let y = row as i32 * 11;
            let cursor = if idx == self.cursor { ">" } else { " " };
            let marker = if *number == active { "*" } else { " " };
            d.puts(0, y, &format!("{}{}{:2} {}", cursor, marker, number, name));
        }
        d.update();
    }
}

fn instrument_settings_page() -> PageBox {
    let mut items: Vec<ListItem> = Vec::new();

    items.push(ListItem::Popup(crate::ui::pages::PopupItem {
        label: "Mode".to_string(),
        build: Box::new(|_ctx| Box::new(InstrumentModePage::new())),
    }));

    items.push(ListItem::Value(ValueItem::new(
        "Brightness",
        0,
        100,
        Box::new(|ctx| ctx.state.with(|s| s.ui.brightness)),
        Box::new(|ctx, v| {
            let _ = ctx.state.set_by_path("ui.brightness", &v.into());
        }),
    )));

    items.push(ListItem::Value(
        ValueItem::new(
            "Display Off",
            0,
            1000,
            Box::new(|ctx| ctx.state.with(|s| s.ui.timeout)),
            Box::new(|ctx, v| {
                let _ = ctx.state.set_by_path("ui.timeout", &v.into());
            }),
        )
        .formatted(Box::new(|v| {
            if v == 0 {
                "never".to_string()
            } else {
                format!("{:3}s", v)
            }
        })),
    ));

    for (label, path, max) in [
        ("Key On Delay", "key_on_debounce", 50),
        ("Key Off Delay", "key_off_debounce", 50),
        ("Note Delay", "base_note_delay", 50),
    ] {
        items.push(ListItem::Value(
            ValueItem::new(
                label,
                0,
                max,
                Box::new(move |ctx: &PageCtx| {
                    ctx.state.with(|s| match path {
                        "key_on_debounce" => s.key_on_debounce,
                        "key_off_debounce" => s.key_off_debounce,
                        _ => s.base_note_delay,
                    })
                }),
                Box::new(move |ctx: &mut PageCtx, v| {
                    let _ = ctx.state.set_by_path(path, &v.into());
                }),
            )
            .formatted(Box::new(|v| format!("{:2}ms", v))),
        ));
    }

    items.push(ListItem::Bool(BoolItem {
        label: "Multi Chien".to_string(),
        get: Box::new(|ctx| ctx.state.with(|s| s.multi_chien_threshold)),
        set: Box::new(|ctx, v| {
            let _ = ctx.state.set_by_path("multi_chien_threshold", &v.into());
        }),
    }));

    items.push(ListItem::Bool(BoolItem {
        label: "Chien Reverse".to_string(),
        get: Box::new(|ctx| ctx.state.with(|s| s.chien_sens_reverse)),
        set: Box::new(|ctx, v| {
            let _ = ctx.state.set_by_path("chien_sens_reverse", &v.into());
        }),
    }));

    items.push(ListItem::Bool(BoolItem {
        label: "Poly Base Note".to_string(),
        get: Box::new(|ctx| ctx.state.with(|s| s.poly_base_note)),
        set: Box::new(|ctx, v| {
            let _ = ctx.state.set_by_path("poly_base_note", &v.into());
        }),
    }));

    items.push(ListItem::Bool(BoolItem {
        label: "Poly Pitch Bend".to_string(),
        get: Box::new(|ctx| ctx.state.with(|s| s.poly_pitch_bend)),
        set: Box::new(|ctx, v| {
            let _ = ctx.state.set_by_path("poly_pitch_bend", &v.into());
        }),
    }));

    Box::new(ConfigListPage::new("Settings", items))
}

/// Instrument-mode chooser. Applying a profile also persists the misc
/// config so the mode survives a reboot.
pub struct InstrumentModePage {
    cursor: usize,
}

impl InstrumentModePage {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Page for InstrumentModePage {
    fn title(&self) -> String {
        "Instrument Mode".to_string()
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        let current = ctx.state.with(|s| s.instrument_mode.clone());
        self.cursor = INSTRUMENT_MODES
            .iter()
            .position(|p| p.name == current)
            .unwrap_or(0);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.key == Key::Encoder {
            let next = self.cursor as i32 + ev.value.signum();
            self.cursor = next.clamp(0, INSTRUMENT_MODES.len() as i32 - 1) as usize;
            return true;
        }
        if ev.pressed(Key::Select) {
            let name = INSTRUMENT_MODES[self.cursor].name;
            let _ = ctx.state.set_by_path("instrument_mode", &name.into());
            let misc = ctx.state.with(|s| s.to_misc_dict());
            if let Err(e) = ctx.store.save_config("misc", &misc) {
                tracing::error!("unable to persist misc config: {}", e);
            }
            ctx.pop();
            return true;
        }
        false
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        let current = ctx.state.with(|s| s.instrument_mode.clone());
        d.clear(None);
        d.font_size(3);
        let win_len = 3usize;
        let win_start = self
            .cursor
            .saturating_sub(1)
            .min(INSTRUMENT_MODES.len().saturating_sub(win_len));
        for (row, idx) in (win_start..(win_start + win_len).min(INSTRUMENT_MODES.len())).enumerate()
        {
            let profile = &INSTRUMENT_MODES[idx];
            let y = row as i32 * 11;
            let cursor = if idx == self.cursor { ">" } else { " " };
            let marker = if profile.name == current { "*" } else { " " };
            d.puts(0, y, &format!("{}{}{}", cursor, marker, profile.name));
        }
        d.update();
    }
}

/// Enable/disable MIDI input and output per enumerated port. Changes
/// are persisted as the port's config blob.
pub struct MidiPortsPage {
    inner: ConfigListPage,
}

impl MidiPortsPage {
    pub fn new() -> Self {
        Self {
            inner: ConfigListPage::new("MIDI", Vec::new()),
        }
    }

    fn rebuild(&mut self, ctx: &PageCtx) {
        let ports: Vec<String> =
            ctx.state
                .with(|s| s.midi.port_states().map(|p| p.port.id.clone()).collect());
        let mut items: Vec<ListItem> = Vec::new();
        for id in ports {
            for (what, label) in [("in", "in"), ("out", "out")] {
                let port_id = id.clone();
                let get_id = id.clone();
                items.push(ListItem::Bool(BoolItem {
                    label: format!("{} {}", id, label),
                    get: Box::new(move |ctx| {
                        ctx.state.with(|s| {
                            s.midi
                                .ports
                                .get(&get_id)
                                .map(|p| {
                                    if what == "in" {
                                        p.input_enabled
                                    } else {
                                        p.output_enabled
                                    }
                                })
                                .unwrap_or(false)
                        })
                    }),
                    set: Box::new(move |ctx, value| {
                        set_port_enabled(ctx, &port_id, what == "in", value);
                    }),
                }));
            }
        }
        self.inner.set_items(items);
    }
}

fn set_port_enabled(ctx: &mut PageCtx, port_id: &str, input: bool, value: bool) {
    ctx.state.apply(|s, ch| {
        if let Some(port) = s.midi.ports.get_mut(port_id) {
            if input {
                crate::state::set_attr!(ch, port, input_enabled, value);
            } else {
                crate::state::set_attr!(ch, port, output_enabled, value);
            }
        }
    });
    let blob = ctx
        .state
        .with(|s| s.midi.ports.get(port_id).map(|p| p.to_midi_dict()));
    if let Some(blob) = blob {
        if let Err(e) = ctx.store.save_config(&midi_config_key(port_id), &blob) {
            tracing::error!("unable to persist midi config for {}: {}", port_id, e);
        }
    }
}

impl Page for MidiPortsPage {
    fn title(&self) -> String {
        "MIDI".to_string()
    }

    fn state_events(&self) -> &'static [&'static str] {
        &["midi:changed"]
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        self.rebuild(ctx);
    }

    fn handle_state_event(&mut self, _name: &str, _data: &EventData, ctx: &mut PageCtx) {
        self.rebuild(ctx);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        self.inner.handle(ev, ctx)
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        self.inner.render(d, ctx);
    }
}
