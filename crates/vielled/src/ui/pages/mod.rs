//! Page library for the menu state machine.
//!
//! Pages never call back into the menu directly; they queue
//! [`MenuAction`]s on the [`PageCtx`] and the menu applies them once the
//! page call returns. State mutations go straight through the
//! [`StateHandle`], whose change events come back to the dispatcher as
//! queued state events.

pub mod config;
pub mod main;
pub mod strings;

use std::sync::Arc;

use viellestore::Store;

use crate::events::{InputEvent, Key};
use crate::signals::EventData;
use crate::state::StateHandle;
use crate::ui::display::{Anchor, Display};

pub type PageBox = Box<dyn Page>;

/// Deferred menu operations queued by a page.
pub enum MenuAction {
    Push(PageBox),
    PushNamed(String),
    Pop,
    GotoNamed(String),
    Message {
        text: String,
        timeout: u64,
        popup: bool,
        modal: bool,
    },
}

/// Context handed to page callbacks.
pub struct PageCtx {
    pub state: StateHandle,
    pub store: Arc<Store>,
    actions: Vec<MenuAction>,
}

impl PageCtx {
    pub fn new(state: StateHandle, store: Arc<Store>) -> Self {
        Self {
            state,
            store,
            actions: Vec::new(),
        }
    }

    pub fn push(&mut self, page: PageBox) {
        self.actions.push(MenuAction::Push(page));
    }

    pub fn push_named(&mut self, name: &str) {
        self.actions.push(MenuAction::PushNamed(name.to_string()));
    }

    pub fn pop(&mut self) {
        self.actions.push(MenuAction::Pop);
    }

    pub fn goto_named(&mut self, name: &str) {
        self.actions.push(MenuAction::GotoNamed(name.to_string()));
    }

    pub fn message(&mut self, text: &str, timeout: u64, popup: bool, modal: bool) {
        self.actions.push(MenuAction::Message {
            text: text.to_string(),
            timeout,
            popup,
            modal,
        });
    }

    pub fn take_actions(&mut self) -> Vec<MenuAction> {
        std::mem::take(&mut self.actions)
    }
}

pub trait Page: Send {
    fn title(&self) -> String {
        String::new()
    }

    /// Seconds of inactivity before [`Page::timeout`] fires; 0 disables.
    fn idle_timeout(&self, _ctx: &PageCtx) -> u64 {
        0
    }

    /// Signal names this page wants forwarded to the dispatch thread
    /// while it is shown.
    fn state_events(&self) -> &'static [&'static str] {
        &[]
    }

    fn on_show(&mut self, _ctx: &mut PageCtx) {}

    fn on_hide(&mut self, _ctx: &mut PageCtx) {}

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx);

    /// Returns true when the event was consumed.
    fn handle(&mut self, _ev: &InputEvent, _ctx: &mut PageCtx) -> bool {
        false
    }

    fn handle_state_event(&mut self, _name: &str, _data: &EventData, _ctx: &mut PageCtx) {}

    fn timeout(&mut self, ctx: &mut PageCtx) {
        ctx.pop();
    }
}

/// Encoder acceleration: repeated same-direction pulses in quick
/// succession scale the increment.
pub struct Accel {
    prev_ts: u64,
    prev_dir: i32,
    fast_us: u64,
    medium_us: u64,
}

impl Accel {
    pub fn new(fast_us: u64, medium_us: u64) -> Self {
        Self {
            prev_ts: 0,
            prev_dir: 0,
            fast_us,
            medium_us,
        }
    }

    /// Sliders: x5 within 30 ms, x2 within 50 ms.
    pub fn slider() -> Self {
        Self::new(30_000, 50_000)
    }

    /// List value items: tighter fast window.
    pub fn list_item() -> Self {
        Self::new(10_000, 50_000)
    }

    pub fn reset(&mut self) {
        self.prev_ts = 0;
        self.prev_dir = 0;
    }

    /// Scale a +-1 encoder pulse at the given microsecond timestamp.
    pub fn scale(&mut self, ts: u64, direction: i32) -> i32 {
        let mut inc = direction;
        if self.prev_dir == direction && self.prev_ts != 0 {
            let diff = ts.saturating_sub(self.prev_ts);
            if diff < self.fast_us {
                inc *= 5;
            } else if diff < self.medium_us {
                inc *= 2;
            }
        }
        self.prev_ts = ts;
        self.prev_dir = direction;
        inc
    }
}

/// A single-value page rendered as a bar.
pub trait SliderSpec: Send {
    fn title(&self) -> String;

    fn range(&self) -> (i32, i32) {
        (0, 100)
    }

    fn get(&self, ctx: &PageCtx) -> i32;
    fn set(&self, ctx: &mut PageCtx, value: i32);

    /// Bar percentage for a value.
    fn percent(&self, value: i32) -> i32 {
        value
    }

    fn reversed(&self, _ctx: &PageCtx) -> bool {
        false
    }
}

pub struct SliderPage {
    spec: Box<dyn SliderSpec>,
    accel: Accel,
    events: &'static [&'static str],
}

impl SliderPage {
    pub fn new(spec: Box<dyn SliderSpec>) -> Self {
        Self {
            spec,
            accel: Accel::slider(),
            events: &[],
        }
    }

    pub fn with_events(mut self, events: &'static [&'static str]) -> Self {
        self.events = events;
        self
    }
}

impl Page for SliderPage {
    fn title(&self) -> String {
        self.spec.title()
    }

    fn state_events(&self) -> &'static [&'static str] {
        self.events
    }

    fn on_show(&mut self, _ctx: &mut PageCtx) {
        self.accel.reset();
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.key == Key::Encoder {
            let mut direction = ev.value.signum();
            if self.spec.reversed(ctx) {
                direction = -direction;
            }
            let inc = self.accel.scale(ev.ts, direction);
            let (minval, maxval) = self.spec.range();
            let value = (self.spec.get(ctx) + inc).clamp(minval, maxval);
            self.spec.set(ctx, value);
            return true;
        }
        if ev.pressed(Key::Select) {
            ctx.pop();
            return true;
        }
        false
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        let value = self.spec.percent(self.spec.get(ctx)).clamp(0, 100);
        d.clear(None);
        d.font_size(3);
        d.puts(13, 5, &self.spec.title());
        d.puts_anchored(116, 5, &format!("{}%", value), Anchor::Right);
        d.rect(13, 17, 115, 25, false);
        if value > 0 {
            d.rect(14, 18, 14 + value, 24, true);
        }
        d.update();
    }
}

/// One entry of a [`ConfigListPage`].
pub enum ListItem {
    Value(ValueItem),
    Bool(BoolItem),
    Popup(PopupItem),
}

impl ListItem {
    fn label(&self) -> &str {
        match self {
            ListItem::Value(item) => &item.label,
            ListItem::Bool(item) => &item.label,
            ListItem::Popup(item) => &item.label,
        }
    }

    fn value_text(&self, ctx: &PageCtx, active: bool) -> Option<String> {
        match self {
            ListItem::Value(item) => {
                let value = (item.get)(ctx);
                let text = match &item.format {
                    Some(format) => format(value),
                    None => format!("{:3}%", value),
                };
                Some(if active { format!(">{}", text) } else { text })
            }
            ListItem::Bool(item) => Some(if (item.get)(ctx) { "On" } else { "Off" }.to_string()),
            ListItem::Popup(_) => None,
        }
    }
}

pub struct ValueItem {
    pub label: String,
    pub minval: i32,
    pub maxval: i32,
    pub zero_value: Option<i32>,
    pub get: Box<dyn Fn(&PageCtx) -> i32 + Send>,
    pub set: Box<dyn Fn(&mut PageCtx, i32) + Send>,
    pub format: Option<Box<dyn Fn(i32) -> String + Send>>,
    accel: Accel,
}

impl ValueItem {
    pub fn new(
        label: &str,
        minval: i32,
        maxval: i32,
        get: Box<dyn Fn(&PageCtx) -> i32 + Send>,
        set: Box<dyn Fn(&mut PageCtx, i32) + Send>,
    ) -> Self {
        Self {
            label: label.to_string(),
            minval,
            maxval,
            zero_value: None,
            get,
            set,
            format: None,
            accel: Accel::list_item(),
        }
    }

    pub fn formatted(mut self, format: Box<dyn Fn(i32) -> String + Send>) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_zero(mut self, zero: i32) -> Self {
        self.zero_value = Some(zero);
        self
    }

    fn adjust(&mut self, ev: &InputEvent, ctx: &mut PageCtx) {
        let inc = self.accel.scale(ev.ts, ev.value.signum());
        let value = ((self.get)(ctx) + inc).clamp(self.minval, self.maxval);
        (self.set)(ctx, value);
    }
}

pub struct BoolItem {
    pub label: String,
    pub get: Box<dyn Fn(&PageCtx) -> bool + Send>,
    pub set: Box<dyn Fn(&mut PageCtx, bool) + Send>,
}

pub struct PopupItem {
    pub label: String,
    pub build: Box<dyn Fn(&PageCtx) -> PageBox + Send>,
}

/// Scrolling list of config items with a cursor, windowed rendering and
/// in-place value editing.
pub struct ConfigListPage {
    title: String,
    items: Vec<ListItem>,
    events: &'static [&'static str],
    pos: usize,
    win_start: usize,
    win_len: usize,
    editing: bool,
    timeout_secs: u64,
}

impl ConfigListPage {
    pub fn new(title: &str, items: Vec<ListItem>) -> Self {
        Self {
            title: title.to_string(),
            items,
            events: &[],
            pos: 0,
            win_start: 0,
            win_len: 3,
            editing: false,
            timeout_secs: 0,
        }
    }

    pub fn with_events(mut self, events: &'static [&'static str]) -> Self {
        self.events = events;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn set_items(&mut self, items: Vec<ListItem>) {
        self.items = items;
        self.pos = 0;
        self.win_start = 0;
        self.editing = false;
    }

    fn set_pos(&mut self, pos: i32) {
        if self.items.is_empty() {
            return;
        }
        let pos = pos.clamp(0, self.items.len() as i32 - 1) as usize;
        if pos == self.pos {
            return;
        }
        self.pos = pos;
        // keep one item of context visible around the cursor
        if self.pos <= self.win_start {
            self.win_start = self.pos.saturating_sub(1);
        } else if self.pos + 1 >= self.win_start + self.win_len {
            self.win_start = (self.pos + 2).saturating_sub(self.win_len);
        }
        let max_start = self.items.len().saturating_sub(self.win_len);
        self.win_start = self.win_start.min(max_start);
    }

    fn activate(&mut self, ctx: &mut PageCtx) {
        match &mut self.items[self.pos] {
            ListItem::Value(_) => self.editing = true,
            ListItem::Bool(item) => {
                let value = (item.get)(ctx);
                (item.set)(ctx, !value);
            }
            ListItem::Popup(item) => {
                let page = (item.build)(ctx);
                ctx.push(page);
            }
        }
    }
}

impl Page for ConfigListPage {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn idle_timeout(&self, _ctx: &PageCtx) -> u64 {
        self.timeout_secs
    }

    fn state_events(&self) -> &'static [&'static str] {
        self.events
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if self.items.is_empty() {
            return false;
        }
        if self.editing {
            if let ListItem::Value(item) = &mut self.items[self.pos] {
                if ev.key == Key::Encoder {
                    item.adjust(ev, ctx);
                    return true;
                }
                if ev.long_pressed(Key::Select) {
                    if let Some(zero) = item.zero_value {
                        (item.set)(ctx, zero);
                        return true;
                    }
                }
                if ev.pressed(Key::Back) || ev.pressed(Key::Select) {
                    self.editing = false;
                    return true;
                }
            }
            return true;
        }

        if ev.key == Key::Encoder {
            self.set_pos(self.pos as i32 + ev.value.signum());
            return true;
        }
        if ev.pressed(Key::Select) {
            self.activate(ctx);
            return true;
        }
        false
    }

    fn timeout(&mut self, ctx: &mut PageCtx) {
        self.editing = false;
        self.set_pos(0);
        ctx.pop();
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        d.clear(None);
        d.font_size(3);
        let line_height = 11;
        let win_end = (self.win_start + self.win_len).min(self.items.len());
        for (row, idx) in (self.win_start..win_end).enumerate() {
            let y = row as i32 * line_height;
            let item = &self.items[idx];
            if idx == self.pos && !(self.editing && matches!(item, ListItem::Value(_))) {
                d.puts(0, y, ">");
            }
            d.puts(6, y, item.label());
            if let Some(value) = item.value_text(ctx, self.editing && idx == self.pos) {
                d.puts_anchored(123, y, &value, Anchor::Right);
            }
        }
        if self.items.len() > self.win_len {
            let per_item = d.height() as f64 / self.items.len() as f64;
            let top = (self.win_start as f64 * per_item) as i32;
            let bottom = top + (per_item * self.win_len as f64).ceil() as i32;
            d.rect(126, top, 126, bottom.min(d.height() - 1), false);
            d.line(127, 0, 127, d.height() - 1);
        }
        d.update();
    }
}

/// Character-wheel text input with DEL / cursor / SAVE buttons.
pub struct TextInputPage {
    title: String,
    chars: Vec<char>,
    input: Vec<usize>,
    cursor: usize,
    max_length: usize,
    callback: Box<dyn FnMut(&mut PageCtx, Option<String>) + Send>,
}

impl TextInputPage {
    pub fn new(
        title: &str,
        text: &str,
        callback: Box<dyn FnMut(&mut PageCtx, Option<String>) + Send>,
    ) -> Self {
        let chars: Vec<char> =
            " ABCDEFGHIJKLMNOPQRSTUVWXYZ abcdefghijklmnopqrstuvwxyz 0123456789 !()#"
                .chars()
                .collect();
        let max_length = 20;
        let mut input = vec![0; max_length];
        for (idx, c) in text.chars().take(max_length).enumerate() {
            input[idx] = chars.iter().position(|x| *x == c).unwrap_or(0);
        }
        Self {
            title: title.to_string(),
            chars,
            input,
            cursor: 0,
            max_length,
            callback,
        }
    }

    pub fn text(&self) -> String {
        let text: String = self.input.iter().map(|idx| self.chars[*idx]).collect();
        text.trim_end().to_string()
    }

    fn move_cursor(&mut self, offset: i32, carry_char: bool) {
        let cursor = (self.cursor as i32 + offset).clamp(0, self.max_length as i32 - 1) as usize;
        if cursor != self.cursor {
            if carry_char && self.input[cursor] == 0 {
                self.input[cursor] = self.input[self.cursor];
            }
            self.cursor = cursor;
        }
    }

    fn change_char(&mut self, offset: i32) {
        let len = self.chars.len() as i32;
        let current = self.input[self.cursor] as i32;
        self.input[self.cursor] = current.checked_add(offset).unwrap_or(0).rem_euclid(len) as usize;
    }

    fn del_char(&mut self) {
        if self.cursor == self.max_length - 1 {
            self.input[self.cursor] = 0;
        } else {
            self.input.remove(self.cursor);
            self.input.push(0);
        }
    }
}

impl Page for TextInputPage {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.pressed(Key::Fn2) {
            self.move_cursor(-1, false);
        } else if ev.pressed(Key::Fn3) {
            self.move_cursor(1, false);
        } else if ev.pressed(Key::Select) {
            self.move_cursor(1, true);
        } else if ev.pressed(Key::Fn1) {
            self.del_char();
        } else if ev.key == Key::Encoder {
            self.change_char(ev.value.signum());
        } else if ev.pressed(Key::Back) {
            (self.callback)(ctx, None);
        } else if ev.down(Key::Fn4) {
            let text = self.text();
            (self.callback)(ctx, Some(text));
        }
        true
    }

    fn render(&mut self, d: &mut dyn Display, _ctx: &PageCtx) {
        d.clear(None);
        d.font_size(3);
        let char_width = 6;
        let num_chars = self.max_length.min((d.width() / char_width) as usize);
        let x_offset = (d.width() - num_chars as i32 * char_width) / 2;
        let input_line_y = 20;
        let input_y = input_line_y - 8;

        d.puts(x_offset, input_y, &self.text());

        // cursor block with the char under it inverted
        let char_x = x_offset + self.cursor as i32 * char_width;
        d.rect(
            char_x - 1,
            input_y - 1,
            char_x + char_width - 1,
            input_line_y,
            true,
        );
        d.puts(char_x, input_y, &self.chars[self.input[self.cursor]].to_string());

        for i in 0..num_chars as i32 {
            d.line(
                x_offset + i * char_width,
                input_line_y,
                x_offset + (i + 1) * char_width - 2,
                input_line_y,
            );
        }

        d.font_size(1);
        d.puts(x_offset, 0, &self.title);
        for (x, label) in [(15, "DEL"), (47, "<"), (80, ">"), (112, "SAVE")] {
            d.puts_anchored(x, 25, label, Anchor::Center);
        }
        d.update();
    }
}

/// A collection of pages cycled through with a key, like a deck of
/// cards. The volume deck cycles on select; the string decks reuse
/// their own function key so select stays free for the child lists.
pub struct Deck {
    pages: Vec<PageBox>,
    index: usize,
    next_key: Key,
    events: &'static [&'static str],
}

impl Deck {
    pub fn new(pages: Vec<PageBox>) -> Self {
        Self {
            pages,
            index: 0,
            next_key: Key::Select,
            events: &[],
        }
    }

    pub fn with_next_key(mut self, key: Key) -> Self {
        self.next_key = key;
        self
    }

    pub fn with_events(mut self, events: &'static [&'static str]) -> Self {
        self.events = events;
        self
    }

    fn next_child(&mut self, ctx: &mut PageCtx) {
        self.pages[self.index].on_hide(ctx);
        self.index = (self.index + 1) % self.pages.len();
        self.pages[self.index].on_show(ctx);
    }
}

impl Page for Deck {
    fn title(&self) -> String {
        self.pages[self.index].title()
    }

    fn idle_timeout(&self, ctx: &PageCtx) -> u64 {
        self.pages[self.index].idle_timeout(ctx)
    }

    fn state_events(&self) -> &'static [&'static str] {
        self.events
    }

    fn on_show(&mut self, ctx: &mut PageCtx) {
        self.index = 0;
        self.pages[self.index].on_show(ctx);
    }

    fn on_hide(&mut self, ctx: &mut PageCtx) {
        self.pages[self.index].on_hide(ctx);
    }

    fn handle(&mut self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.pressed(self.next_key) {
            self.next_child(ctx);
            return true;
        }
        self.pages[self.index].handle(ev, ctx)
    }

    fn handle_state_event(&mut self, name: &str, data: &EventData, ctx: &mut PageCtx) {
        self.pages[self.index].handle_state_event(name, data, ctx);
    }

    fn render(&mut self, d: &mut dyn Display, ctx: &PageCtx) {
        self.pages[self.index].render(d, ctx);
    }
}

/// Plain text page, optionally modal (swallows all input).
pub struct MessagePage {
    pub text: String,
    pub modal: bool,
    pub font_size: u8,
    pub timeout_secs: u64,
}

impl MessagePage {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            modal: false,
            font_size: 3,
            timeout_secs: 0,
        }
    }

    pub fn modal(text: &str) -> Self {
        Self {
            modal: true,
            ..Self::new(text)
        }
    }
}

impl Page for MessagePage {
    fn idle_timeout(&self, _ctx: &PageCtx) -> u64 {
        self.timeout_secs
    }

    fn handle(&mut self, _ev: &InputEvent, _ctx: &mut PageCtx) -> bool {
        self.modal
    }

    fn render(&mut self, d: &mut dyn Display, _ctx: &PageCtx) {
        d.clear(None);
        d.font_size(self.font_size);
        let y = d.height() / 2 - 5;
        d.puts_anchored(d.width() / 2, y, &self.text, Anchor::Center);
        d.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Action;
    use crate::state::tests::test_handle;
    use crate::ui::display::MemoryDisplay;

    fn ctx() -> PageCtx {
        PageCtx::new(test_handle(), Arc::new(Store::in_memory().unwrap()))
    }

    fn encoder(value: i32, ts: u64) -> InputEvent {
        InputEvent {
            key: Key::Encoder,
            action: Action::Pressed,
            value,
            ts,
        }
    }

    #[test]
    fn test_encoder_acceleration_windows() {
        // same sign within 30 ms -> x5, within 50 ms -> x2
        let mut accel = Accel::slider();
        assert_eq!(accel.scale(1_000_000, 1), 1);
        assert_eq!(accel.scale(1_020_000, 1), 5);
        assert_eq!(accel.scale(1_060_000, 1), 2);
        assert_eq!(accel.scale(1_200_000, 1), 1);
        // direction change resets
        assert_eq!(accel.scale(1_210_000, -1), -1);
        assert_eq!(accel.scale(1_220_000, -1), -5);
    }

    struct VolumeSpec;

    impl SliderSpec for VolumeSpec {
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
            ctx.state
                .set_by_path("main_volume", &serde_json::json!(value))
                .unwrap();
        }
    }

    #[test]
    fn test_slider_clamps_and_pops() {
        let mut page = SliderPage::new(Box::new(VolumeSpec));
        let mut ctx = ctx();

        assert!(page.handle(&encoder(-1, 1_000_000), &mut ctx));
        assert_eq!(ctx.state.with(|s| s.main_volume), 0, "clamped at minimum");

        assert!(page.handle(&encoder(1, 2_000_000), &mut ctx));
        assert_eq!(ctx.state.with(|s| s.main_volume), 1);

        let select = InputEvent::new(Key::Select, Action::Short, 0);
        assert!(page.handle(&select, &mut ctx));
        assert!(matches!(ctx.take_actions().as_slice(), [MenuAction::Pop]));
    }

    #[test]
    fn test_config_list_navigation_and_edit() {
        let items = vec![
            ListItem::Value(ValueItem::new(
                "Brightness",
                0,
                100,
                Box::new(|ctx: &PageCtx| ctx.state.with(|s| s.ui.brightness)),
                Box::new(|ctx: &mut PageCtx, v| {
                    ctx.state
                        .set_by_path("ui.brightness", &serde_json::json!(v))
                        .unwrap();
                }),
            )),
            ListItem::Bool(BoolItem {
                label: "Wrap".to_string(),
                get: Box::new(|ctx| ctx.state.with(|s| s.wrap_groups)),
                set: Box::new(|ctx, v| {
                    ctx.state
                        .set_by_path("wrap_groups", &serde_json::json!(v))
                        .unwrap();
                }),
            }),
        ];
        let mut page = ConfigListPage::new("Settings", items);
        let mut ctx = ctx();

        ctx.state
            .set_by_path("ui.brightness", &serde_json::json!(50))
            .unwrap();

        // activate the value item and turn the encoder
        let select = InputEvent::new(Key::Select, Action::Short, 0);
        assert!(page.handle(&select, &mut ctx));
        assert!(page.handle(&encoder(1, 1_000_000), &mut ctx));
        assert_eq!(ctx.state.with(|s| s.ui.brightness), 51);

        // leave edit mode, move to the bool, toggle it
        let back = InputEvent::new(Key::Back, Action::Short, 0);
        assert!(page.handle(&back, &mut ctx));
        assert!(page.handle(&encoder(1, 2_000_000), &mut ctx));
        let before = ctx.state.with(|s| s.wrap_groups);
        assert!(page.handle(&select, &mut ctx));
        assert_eq!(ctx.state.with(|s| s.wrap_groups), !before);
    }

    #[test]
    fn test_text_input_editing() {
        let saved = std::sync::Arc::new(std::sync::Mutex::new(None));
        let saved2 = std::sync::Arc::clone(&saved);
        let mut page = TextInputPage::new(
            "Save as:",
            "Ab",
            Box::new(move |_ctx, text| {
                *saved2.lock().unwrap() = text;
            }),
        );
        let mut ctx = ctx();

        assert_eq!(page.text(), "Ab");

        // wheel the first char one step forward: 'A' -> 'B'
        page.handle(&encoder(1, 0), &mut ctx);
        assert_eq!(page.text(), "Bb");

        // delete the first char
        let del = InputEvent::new(Key::Fn1, Action::Short, 0);
        page.handle(&del, &mut ctx);
        assert_eq!(page.text(), "b");

        // save via fn4 down
        let save = InputEvent::new(Key::Fn4, Action::Down, 0);
        page.handle(&save, &mut ctx);
        assert_eq!(saved.lock().unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_message_page_modality() {
        let mut modal = MessagePage::modal("Loading...");
        let mut plain = MessagePage::new("Done");
        let mut ctx = ctx();
        let ev = InputEvent::new(Key::Back, Action::Short, 0);
        assert!(modal.handle(&ev, &mut ctx));
        assert!(!plain.handle(&ev, &mut ctx));
    }

    #[test]
    fn test_message_page_renders_text() {
        let mut page = MessagePage::new("Powering off...");
        let mut d = MemoryDisplay::new(128, 32);
        let ctx = ctx();
        page.render(&mut d, &ctx);
        assert!(d.contains_text("Powering off..."));
        assert_eq!(d.update_count(), 1);
    }
}
