//! Home screen, volume deck, chien sensitivity and the power-off
//! prompt.

use crate::events::InputEvent;
use crate::state::STRING_TYPES;
use crate::ui::display::{Anchor, Display};
use crate::ui::pages::{
    ConfigListPage, Deck, ListItem, Page, PageBox, PageCtx, SliderPage, SliderSpec, ValueItem,
};
use crate::util;

/// The home screen: the string grid with mute markers, the active group
/// cursor and the loaded preset.
pub struct HomePage;

impl HomePage {
    pub fn page() -> PageBox {
        Box::new(HomePage)
    }
}

impl Page for HomePage {
    fn title(&self) -> String {
        "Home".to_string()
    }

    fn state_events(&self) -> &'static [&'static str] {
        &[
            "active:preset:changed",
            "active:preset:voice:muted:changed",
            "active:preset:voice:sound:changed",
            "ui:string_group:changed",
            "last_preset_number:changed",
            "main_volume:changed",
            "power:source:changed",
            "power:battery_percent:changed",
        ]
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        ctx.state.with(|s| {
            d.clear(None);
            d.font_size(3);

            d.puts(0, 0, &format!("{:2}", s.last_preset_number));
            d.font_size(1);
            d.puts(20, 2, &s.preset.name);

            // one row per string type, columns are string numbers
            d.font_size(2);
            for (row, (kind, label, _)) in STRING_TYPES.iter().enumerate() {
                let y = 10 + row as i32 * 7;
                d.puts(0, y, label);
                let voices = s.preset.voices_by_kind(*kind);
                for (col, voice) in voices.iter().take(s.string_count as usize).enumerate() {
                    let x = 52 + col as i32 * 26;
                    d.rect(x, y, x + 20, y + 5, !voice.is_silent());
                }
                if s.ui.string_group_by_type && s.ui.string_group == row as i32 {
                    d.puts(46, y, ">");
                }
            }
            // in column layout the active group underlines a column
            if !s.ui.string_group_by_type {
                let x = 52 + s.ui.string_group * 26;
                d.line(x, 31, x + 20, 31);
            }

            d.font_size(1);
            d.puts_anchored(
                127,
                0,
                &format!("{}%", util::midi2percent(s.main_volume)),
                Anchor::Right,
            );
            d.update();
        });
    }
}

struct MainVolumeSpec;

impl SliderSpec for MainVolumeSpec {
    fn title(&self) -> String {
        "Volume".to_string()
    }

    fn range(&self) -> (i32, i32) {
        (0, 127)
    }

    fn get(&self, ctx: &PageCtx) -> i32 {
        ctx.state.with(|s| s.main_volume)
    }

    fn set(&self, ctx: &mut PageCtx, value: i32) {
        let _ = ctx.state.set_by_path("main_volume", &value.into());
    }

    fn percent(&self, value: i32) -> i32 {
        util::midi2percent(value)
    }
}

struct ReverbVolumeSpec;

impl SliderSpec for ReverbVolumeSpec {
    fn title(&self) -> String {
        "Reverb".to_string()
    }

    fn range(&self) -> (i32, i32) {
        (0, 127)
    }

    fn get(&self, ctx: &PageCtx) -> i32 {
        ctx.state.with(|s| s.reverb_volume)
    }

    fn set(&self, ctx: &mut PageCtx, value: i32) {
        let _ = ctx.state.set_by_path("reverb_volume", &value.into());
    }

    fn percent(&self, value: i32) -> i32 {
        util::midi2percent(value)
    }
}

struct KeynoiseVolumeSpec;

impl SliderSpec for KeynoiseVolumeSpec {
    fn title(&self) -> String {
        "Key Noise".to_string()
    }

    fn range(&self) -> (i32, i32) {
        (0, 127)
    }

    fn get(&self, ctx: &PageCtx) -> i32 {
        ctx.state.with(|s| s.preset.keynoise[0].volume)
    }

    fn set(&self, ctx: &mut PageCtx, value: i32) {
        let _ = ctx
            .state
            .set_by_path("preset.keynoise.0.volume", &value.into());
    }

    fn percent(&self, value: i32) -> i32 {
        util::midi2percent(value)
    }
}

pub fn volume_deck() -> PageBox {
    Box::new(
        Deck::new(vec![
            Box::new(SliderPage::new(Box::new(MainVolumeSpec))),
            Box::new(SliderPage::new(Box::new(ReverbVolumeSpec))),
            Box::new(SliderPage::new(Box::new(KeynoiseVolumeSpec))),
        ])
        .with_events(&["main_volume:changed", "reverb_volume:changed"]),
    )
}

/// Single chien sensitivity: edits all three trompette thresholds as
/// one value (the first voice is authoritative for the shared mode).
struct ChienSpec;

impl SliderSpec for ChienSpec {
    fn title(&self) -> String {
        "Chien Sens".to_string()
    }

    fn get(&self, ctx: &PageCtx) -> i32 {
        ctx.state.with(|s| s.preset.chien_thresholds()[0])
    }

    fn set(&self, ctx: &mut PageCtx, value: i32) {
        ctx.state.apply(|s, ch| {
            let value = Some(value);
            s.preset.set_chien_thresholds(&[value, value, value], ch);
        });
    }

    fn reversed(&self, ctx: &PageCtx) -> bool {
        ctx.state.with(|s| s.chien_sens_reverse)
    }
}

pub fn chien_threshold_page() -> PageBox {
    let page = SliderPage::new(Box::new(ChienSpec))
        .with_events(&["active:preset:voice:chien_threshold:changed"]);
    Box::new(ChienPageWrapper { inner: page })
}

/// Chien pages close themselves after a few idle seconds, since they
/// open implicitly from any encoder turn.
struct ChienPageWrapper {
    inner: SliderPage,
}

impl Page for ChienPageWrapper {
    fn title(&self) -> String {
        self.inner.title()
    }

    fn idle_timeout(&self, _ctx: &PageCtx) -> u64 {
        3
    }

    fn state_events(&self) -> &'static [&'static str] {
        self.inner.state_events()
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        self.inner.on_show(ctx);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        self.inner.handle(ev, ctx)
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        self.inner.render(d, ctx);
    }
}

pub fn multi_chien_threshold_page() -> PageBox {
    let items = (0..3usize)
        .map(|idx| {
            ListItem::Value(ValueItem::new(
                &format!("Tromp {}", idx + 1),
                0,
                100,
                Box::new(move |ctx: &PageCtx| {
                    ctx.state.with(|s| s.preset.chien_thresholds()[idx])
                }),
                Box::new(move |ctx: &mut PageCtx, value| {
                    let _ = ctx.state.set_by_path(
                        &format!("preset.trompette.{}.chien_threshold", idx),
                        &value.into(),
                    );
                }),
            ))
        })
        .collect();
    Box::new(
        ConfigListPage::new("Chien Sens", items)
            .with_events(&["active:preset:voice:chien_threshold:changed"])
            .with_timeout(3),
    )
}

/// Pushed after holding the power key for one second; the dispatcher
/// invokes the actual power-off two seconds later unless released.
pub struct PoweroffPage;

impl PoweroffPage {
    pub fn page() -> PageBox {
        Box::new(PoweroffPage)
    }
}

impl Page for PoweroffPage {
    fn handle(&mut self, _ev: &InputEvent, _ctx: &mut PageCtx) -> bool {
        true
    }

    fn render(&mut self, d: &mut dyn Display, _ctx: &PageCtx) {
        d.clear(None);
        d.font_size(3);
        d.puts_anchored(d.width() / 2, 5, "Hold 2s to", Anchor::Center);
        d.puts_anchored(d.width() / 2, 17, "power off", Anchor::Center);
        d.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Action, Key};
    use crate::state::tests::test_handle;
    use crate::ui::display::MemoryDisplay;
    use std::sync::Arc;
    use viellestore::Store;

    fn ctx() -> PageCtx {
        PageCtx::new(test_handle(), Arc::new(Store::in_memory().unwrap()))
    }

    #[test]
    fn test_home_renders_preset_name() {
        let mut ctx = ctx();
        ctx.state.apply(|s, _| {
            s.preset.name = "Saturday Dance".to_string();
        });
        let mut d = MemoryDisplay::new(128, 32);
        HomePage.render(&mut d, &ctx);
        assert!(d.contains_text("Saturday Dance"));
    }

    #[test]
    fn test_chien_slider_sets_all_three() {
        let mut ctx = ctx();
        let mut page = chien_threshold_page();
        let ev = InputEvent {
            key: Key::Encoder,
            action: Action::Pressed,
            value: 1,
            ts: 1_000_000,
        };
        assert!(page.handle(&ev, &mut ctx));
        assert_eq!(
            ctx.state.with(|s| s.preset.chien_thresholds()),
            [51, 51, 51]
        );
    }

    #[test]
    fn test_chien_reverse_direction() {
        let mut ctx = ctx();
        ctx.state
            .set_by_path("chien_sens_reverse", &serde_json::json!(true))
            .unwrap();
        let mut page = chien_threshold_page();
        let ev = InputEvent {
            key: Key::Encoder,
            action: Action::Pressed,
            value: 1,
            ts: 1_000_000,
        };
        page.handle(&ev, &mut ctx);
        assert_eq!(
            ctx.state.with(|s| s.preset.chien_thresholds()),
            [49, 49, 49]
        );
    }

    #[test]
    fn test_poweroff_page_is_modal() {
        let mut ctx = ctx();
        let mut page = PoweroffPage;
        let ev = InputEvent::new(Key::Back, Action::Short, 0);
        assert!(page.handle(&ev, &mut ctx));
    }

    #[test]
    fn test_volume_deck_cycles_on_select() {
        let mut ctx = ctx();
        let mut deck = volume_deck();
        deck.on_show(&mut ctx);
        assert_eq!(deck.title(), "Volume");
        let select = InputEvent::new(Key::Select, Action::Short, 0);
        deck.handle(&select, &mut ctx);
        assert_eq!(deck.title(), "Reverb");
        deck.handle(&select, &mut ctx);
        assert_eq!(deck.title(), "Key Noise");
        deck.handle(&select, &mut ctx);
        assert_eq!(deck.title(), "Volume");
    }
}
