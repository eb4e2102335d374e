//! Per-string configuration decks for melody, drone and trompette.

use crate::events::{InputEvent, Key};
use crate::sounds::SoundFont;
use crate::state::{VoiceKind, VoiceMode};
use crate::ui::display::{Anchor, Display};
use crate::ui::pages::{
    BoolItem, ConfigListPage, Deck, ListItem, Page, PageBox, PageCtx, PopupItem, ValueItem,
};
use crate::util;

pub fn melody_deck() -> PageBox {
    // pressing the deck's own key again steps to the next string
    string_deck(VoiceKind::Melody, Key::Fn2)
}

pub fn drone_deck() -> PageBox {
    string_deck(VoiceKind::Drone, Key::Fn1)
}

pub fn trompette_deck() -> PageBox {
    string_deck(VoiceKind::Trompette, Key::Fn3)
}

fn string_deck(kind: VoiceKind, next_key: Key) -> PageBox {
    let pages: Vec<PageBox> = (0..3)
        .map(|idx| Box::new(voice_page(kind, idx)) as PageBox)
        .collect();
    Box::new(
        Deck::new(pages).with_next_key(next_key).with_events(&[
            "active:preset:changed",
            "active:preset:voice:sound:changed",
            "active:preset:voice:muted:changed",
            "active:preset:voice:volume:changed",
        ]),
    )
}

fn voice_page(kind: VoiceKind, idx: usize) -> ConfigListPage {
    let title = format!("{} {}", kind.as_str(), idx + 1);
    let mut items: Vec<ListItem> = Vec::new();

    items.push(ListItem::Popup(PopupItem {
        label: "Sound".to_string(),
        build: Box::new(move |_ctx| Box::new(SoundListPage::new(kind, idx))),
    }));

    items.push(ListItem::Bool(BoolItem {
        label: "Mute".to_string(),
        get: Box::new(move |ctx| ctx.state.with(|s| s.preset.voices_by_kind(kind)[idx].muted)),
        set: Box::new(move |ctx, value| {
            let _ = ctx.state.set_by_path(
                &format!("preset.{}.{}.muted", kind.as_str(), idx),
                &value.into(),
            );
        }),
    }));

    items.push(ListItem::Value(
        ValueItem::new(
            "Volume",
            0,
            127,
            Box::new(move |ctx| ctx.state.with(|s| s.preset.voices_by_kind(kind)[idx].volume)),
            Box::new(move |ctx, value| {
                let _ = ctx.state.set_by_path(
                    &format!("preset.{}.{}.volume", kind.as_str(), idx),
                    &value.into(),
                );
            }),
        )
        .formatted(Box::new(|v| format!("{:3}%", util::midi2percent(v)))),
    ));

    items.push(ListItem::Value(
        ValueItem::new(
            "Balance",
            0,
            127,
            Box::new(move |ctx| ctx.state.with(|s| s.preset.voices_by_kind(kind)[idx].panning)),
            Box::new(move |ctx, value| {
                let _ = ctx.state.set_by_path(
                    &format!("preset.{}.{}.panning", kind.as_str(), idx),
                    &value.into(),
                );
            }),
        )
        .formatted(Box::new(format_balance))
        .with_zero(64),
    ));

    items.push(ListItem::Value(
        ValueItem::new(
            "Note",
            0,
            127,
            Box::new(move |ctx| {
                ctx.state
                    .with(|s| s.preset.voices_by_kind(kind)[idx].base_note)
            }),
            Box::new(move |ctx, value| {
                let _ = ctx.state.set_by_path(
                    &format!("preset.{}.{}.base_note", kind.as_str(), idx),
                    &value.into(),
                );
            }),
        )
        .formatted(Box::new(|v| util::midi2note(v, true))),
    ));

    items.push(ListItem::Value(
        ValueItem::new(
            "Fine Tune",
            -100,
            100,
            Box::new(move |ctx| {
                ctx.state
                    .with(|s| s.preset.voices_by_kind(kind)[idx].finetune)
            }),
            Box::new(move |ctx, value| {
                let _ = ctx.state.set_by_path(
                    &format!("preset.{}.{}.finetune", kind.as_str(), idx),
                    &value.into(),
                );
            }),
        )
        .formatted(Box::new(|v| format!("{:+4}", v)))
        .with_zero(0),
    ));

    match kind {
        VoiceKind::Melody => {
            items.push(ListItem::Value(
                ValueItem::new(
                    "Capo",
                    0,
                    23,
                    Box::new(move |ctx| {
                        ctx.state.with(|s| s.preset.voices_by_kind(kind)[idx].capo)
                    }),
                    Box::new(move |ctx, value| {
                        let _ = ctx.state.set_by_path(
                            &format!("preset.{}.{}.capo", kind.as_str(), idx),
                            &value.into(),
                        );
                    }),
                )
                .formatted(Box::new(|v| format!("{:3}", v)))
                .with_zero(0),
            ));
            items.push(ListItem::Bool(BoolItem {
                label: "Polyphonic".to_string(),
                get: Box::new(move |ctx| {
                    ctx.state
                        .with(|s| s.preset.voices_by_kind(kind)[idx].polyphonic)
                }),
                set: Box::new(move |ctx, value| {
                    let _ = ctx.state.set_by_path(
                        &format!("preset.{}.{}.polyphonic", kind.as_str(), idx),
                        &value.into(),
                    );
                }),
            }));
            items.push(ListItem::Bool(BoolItem {
                label: "Keyboard Mode".to_string(),
                get: Box::new(move |ctx| {
                    ctx.state
                        .with(|s| s.preset.voices_by_kind(kind)[idx].mode == VoiceMode::Keyboard)
                }),
                set: Box::new(move |ctx, value| {
                    let mode = if value { "keyboard" } else { "generic" };
                    let _ = ctx.state.set_by_path(
                        &format!("preset.{}.{}.mode", kind.as_str(), idx),
                        &mode.into(),
                    );
                }),
            }));
        }
        VoiceKind::Trompette => {
            items.push(ListItem::Value(ValueItem::new(
                "Chien Sens",
                0,
                100,
                Box::new(move |ctx| {
                    ctx.state
                        .with(|s| s.preset.voices_by_kind(kind)[idx].chien_threshold)
                }),
                Box::new(move |ctx, value| {
                    let _ = ctx.state.set_by_path(
                        &format!("preset.{}.{}.chien_threshold", kind.as_str(), idx),
                        &value.into(),
                    );
                }),
            )));
        }
        _ => {}
    }

    ConfigListPage::new(&title, items)
}

fn format_balance(value: i32) -> String {
    match value.cmp(&64) {
        std::cmp::Ordering::Equal => "center".to_string(),
        std::cmp::Ordering::Less => format!("L{:2}", 64 - value),
        std::cmp::Ordering::Greater => format!("R{:2}", value - 64),
    }
}

/// Cursor list of the sounds a voice can play, built from the font
/// library on show. Selecting assigns the sound and pops back.
pub struct SoundListPage {
    kind: VoiceKind,
    voice_idx: usize,
    /// (font id, bank, program, display label)
    entries: Vec<(String, i32, i32, String)>,
    cursor: usize,
}

impl SoundListPage {
    pub fn new(kind: VoiceKind, voice_idx: usize) -> Self {
        Self {
            kind,
            voice_idx,
            entries: Vec::new(),
            cursor: 0,
        }
    }

    fn reload(&mut self, ctx: &PageCtx) {
        let sound_dir = ctx.state.with(|s| s.sound_dir.clone());
        self.entries.clear();
        for font in SoundFont::load_all(&sound_dir) {
            for sound in &font.sounds {
                // midigurdy fonts sort sounds into per-type banks;
                // generic sounds are playable anywhere
                if sound.kind != self.kind.as_str() && sound.kind != "generic" {
                    continue;
                }
                self.entries.push((
                    font.id.clone(),
                    sound.bank,
                    sound.program,
                    format!("{}: {}", font.name, sound.name),
                ));
            }
        }
        self.cursor = self.cursor.min(self.entries.len().saturating_sub(1));
    }

    fn select(&self, ctx: &mut PageCtx) {
        let Some((font_id, bank, program, _)) = self.entries.get(self.cursor).cloned() else {
            return;
        };
        let sound_dir = ctx.state.with(|s| s.sound_dir.clone());
        let Some(font) = SoundFont::by_id(&sound_dir, &font_id) else {
            return;
        };
        let Some(sound) = font.get_sound(bank, program).cloned() else {
            return;
        };
        let kind = self.kind;
        let idx = self.voice_idx;
        ctx.state.apply(|s, ch| {
            if let Some(voice) = s.preset.voices_by_kind_mut(kind).get_mut(idx) {
                voice.set_sound(&font, &sound, ch);
            }
        });
        ctx.pop();
    }
}

impl Page for SoundListPage {
    fn title(&self) -> String {
        "Sounds".to_string()
    }

    fn state_events(&self) -> &'static [&'static str] {
        &["sound:added", "sound:deleted", "sound:changed"]
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        self.reload(ctx);
    }

    fn handle_state_event(
        &mut self,
        _name: &str,
        _data: &crate::signals::EventData,
        ctx: &mut PageCtx,
    ) {
        self.reload(ctx);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.key == Key::Encoder {
            let next = self.cursor as i32 + ev.value.signum();
            self.cursor = next.clamp(0, self.entries.len().saturating_sub(1) as i32) as usize;
            return true;
        }
        if ev.pressed(Key::Select) {
            self.select(ctx);
            return true;
        }
        false
    }

    fn render(&mut self, d: &mut dyn Display, _ctx: &PageCtx) {
        d.clear(None);
        d.font_size(3);
        if self.entries.is_empty() {
            d.puts_anchored(d.width() / 2, 12, "No sounds", Anchor::Center);
            d.update();
            return;
        }
        let win_len = 3usize;
        let win_start = self
            .cursor
            .saturating_sub(1)
            .min(self.entries.len().saturating_sub(win_len));
        for (row, idx) in (win_start..(win_start + win_len).min(self.entries.len())).enumerate() {
            let y = row as i32 * 11;
            let cursor = if idx == self.cursor { ">" } else { " " };
            d.puts(0, y, &format!("{}{}", cursor, self.entries[idx].3));
        }
        d.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Action;
    use crate::sounds::testdata::build_sf2;
    use crate::state::{PowerState, State, StateHandle};
    use std::path::PathBuf;
    use std::sync::Arc;
    use viellestore::Store;

    fn ctx_with_sounds() -> (tempfile::TempDir, PageCtx) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mg.sf2"),
            build_sf2(
                "Gurdy",
                "MidiGurdy Set",
                "",
                &[(0, 0, "Melody A"), (0, 1, "Melody B"), (1, 0, "Drone A")],
            ),
        )
        .unwrap();
        let signals = crate::signals::Signals::new();
        let power = PowerState::new(
            PathBuf::from("/nonexistent/ac"),
            PathBuf::from("/nonexistent/usb"),
            PathBuf::from("/nonexistent/bat"),
        );
        let state = StateHandle::new(signals, State::new(dir.path().to_path_buf(), power));
        let ctx = PageCtx::new(state, Arc::new(Store::in_memory().unwrap()));
        (dir, ctx)
    }

    #[test]
    fn test_sound_list_filters_by_kind() {
        let (_dir, mut ctx) = ctx_with_sounds();
        let mut page = SoundListPage::new(VoiceKind::Melody, 0);
        page.on_show(&mut ctx);
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries.iter().all(|(_, bank, _, _)| *bank == 0));

        let mut drone_page = SoundListPage::new(VoiceKind::Drone, 0);
        drone_page.on_show(&mut ctx);
        assert_eq!(drone_page.entries.len(), 1);
    }

    #[test]
    fn test_sound_selection_assigns_voice() {
        let (_dir, mut ctx) = ctx_with_sounds();
        let mut page = SoundListPage::new(VoiceKind::Melody, 1);
        page.on_show(&mut ctx);

        let select = InputEvent::new(Key::Select, Action::Short, 0);
        assert!(page.handle(&select, &mut ctx));

        ctx.state.with(|s| {
            let voice = &s.preset.melody[1];
            assert_eq!(voice.soundfont_id.as_deref(), Some("mg.sf2"));
            assert_eq!(voice.bank, 0);
            assert_eq!(voice.program, 0);
        });
        assert!(matches!(
            ctx.take_actions().as_slice(),
            [crate::ui::pages::MenuAction::Pop]
        ));
    }

    #[test]
    fn test_balance_formatting() {
        assert_eq!(format_balance(64), "center");
        assert_eq!(format_balance(0), "L64");
        assert_eq!(format_balance(127), "R63");
    }

    #[test]
    fn test_voice_page_has_kind_specific_items() {
        let melody = voice_page(VoiceKind::Melody, 0);
        let trompette = voice_page(VoiceKind::Trompette, 0);
        // melody carries capo/polyphonic/keyboard extras, trompette the
        // chien sensitivity
        assert_eq!(melody.title(), "melody 1");
        assert_eq!(trompette.title(), "trompette 1");
    }
}
