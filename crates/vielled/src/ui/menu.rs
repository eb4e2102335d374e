//! The page stack.
//!
//! The menu owns the display and a stack of pages. Input events offered
//! by the dispatcher walk the stack top-down; unclaimed events fall
//! through to the global key bindings. Pages subscribe their declared
//! state events while shown; the subscriptions enqueue the events onto
//! the dispatcher queue, so page callbacks always run on the dispatch
//! thread and the display has a single writer.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use parking_lot::ReentrantMutex;
use tracing::warn;
use viellestore::Store;

use crate::events::{Action, Event, InputEvent, Key};
use crate::signals::{EventData, HandlerId, Signals};
use crate::state::StateHandle;
use crate::ui::display::Display;
use crate::ui::pages::{self, MenuAction, MessagePage, Page, PageBox, PageCtx};

struct Entry {
    page: PageBox,
    subscriptions: Vec<(String, HandlerId)>,
}

struct MenuInner {
    display: Box<dyn Display>,
    stack: Vec<Entry>,
}

pub struct Menu {
    inner: ReentrantMutex<RefCell<MenuInner>>,
    state: StateHandle,
    store: Arc<Store>,
    queue: Sender<Event>,
    signals: Signals,
    registry: HashMap<&'static str, fn() -> PageBox>,
    /// Epoch seconds of the last handled input.
    last_input: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Menu {
    pub fn new(
        display: Box<dyn Display>,
        state: StateHandle,
        store: Arc<Store>,
        queue: Sender<Event>,
        signals: Signals,
    ) -> Arc<Self> {
        let mut registry: HashMap<&'static str, fn() -> PageBox> = HashMap::new();
        registry.insert("home", pages::main::HomePage::page);
        registry.insert("volume", pages::main::volume_deck);
        registry.insert("chien_threshold", pages::main::chien_threshold_page);
        registry.insert(
            "multi_chien_threshold",
            pages::main::multi_chien_threshold_page,
        );
        registry.insert("melody", pages::strings::melody_deck);
        registry.insert("drone", pages::strings::drone_deck);
        registry.insert("trompette", pages::strings::trompette_deck);
        registry.insert("config", pages::config::preset_config_deck);

        let menu = Arc::new(Self {
            inner: ReentrantMutex::new(RefCell::new(MenuInner {
                display,
                stack: Vec::new(),
            })),
            state,
            store,
            queue: queue.clone(),
            signals: signals.clone(),
            registry,
            last_input: AtomicU64::new(now_secs()),
        });

        // lock/unlock modal transitions arrive through the queue like
        // any other page state event
        for name in ["state:locked", "state:unlocked"] {
            let queue = queue.clone();
            signals.register(name, move |name, data| {
                let _ = queue.send(Event::State {
                    name: name.to_string(),
                    data: data.clone(),
                });
            });
        }

        menu
    }

    fn ctx(&self) -> PageCtx {
        PageCtx::new(self.state.clone(), Arc::clone(&self.store))
    }

    pub fn stamp_input(&self) {
        self.last_input.store(now_secs(), Ordering::Relaxed);
    }

    /// Offer an input event to the page stack, falling back to the
    /// global bindings. Returns true when consumed.
    pub fn handle_event(&self, ev: &InputEvent) -> bool {
        let mut ctx = self.ctx();
        let handled = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let mut handled = false;
            for entry in inner.stack.iter_mut().rev() {
                if entry.page.handle(ev, &mut ctx) {
                    handled = true;
                    break;
                }
            }
            handled
        };

        let handled = handled || self.handle_global(ev, &mut ctx);
        let actions = ctx.take_actions();
        self.apply_actions(actions);
        if handled {
            self.stamp_input();
            self.render_current();
        }
        handled
    }

    fn handle_global(&self, ev: &InputEvent, ctx: &mut PageCtx) -> bool {
        if ev.short_pressed(Key::Back) {
            ctx.pop();
            return true;
        }
        if ev.long_pressed(Key::Back) {
            ctx.goto_named("home");
            return true;
        }
        if ev.pressed(Key::Fn1) {
            ctx.goto_named("drone");
            return true;
        }
        if ev.pressed(Key::Fn2) {
            ctx.goto_named("melody");
            return true;
        }
        if ev.pressed(Key::Fn3) {
            ctx.goto_named("trompette");
            return true;
        }
        if ev.key == Key::Fn4 && ev.action == Action::Down {
            ctx.goto_named("config");
            return true;
        }
        if ev.pressed(Key::Select) {
            ctx.goto_named("volume");
            return true;
        }
        if ev.key == Key::Encoder {
            // turning the encoder anywhere opens the chien sensitivity
            let multi = self.state.with(|s| s.multi_chien_threshold);
            ctx.push_named(if multi {
                "multi_chien_threshold"
            } else {
                "chien_threshold"
            });
            return true;
        }
        false
    }

    /// Deliver a forwarded state event to the current page; lock and
    /// unlock events manage the modal overlay.
    pub fn handle_state_event(&self, name: &str, data: &EventData) {
        match name {
            "state:locked" => {
                let message = data.get_str("message").unwrap_or("Working...");
                self.push_page(Box::new(MessagePage::modal(message)));
                return;
            }
            "state:unlocked" => {
                self.pop();
                if data.get_bool("goto_home").unwrap_or(false) {
                    self.goto_named("home");
                }
                return;
            }
            _ => {}
        }

        let mut ctx = self.ctx();
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            if let Some(entry) = inner.stack.last_mut() {
                entry.page.handle_state_event(name, data, &mut ctx);
            }
        }
        let actions = ctx.take_actions();
        self.apply_actions(actions);
        self.render_current();
    }

    /// 1 Hz idle sweep: fire the current page's timeout when the screen
    /// has been untouched long enough.
    pub fn check_idle(&self) {
        let mut ctx = self.ctx();
        let fired = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let Some(entry) = inner.stack.last_mut() else {
                return;
            };
            let timeout = entry.page.idle_timeout(&ctx);
            if timeout == 0 {
                return;
            }
            let idle = now_secs().saturating_sub(self.last_input.load(Ordering::Relaxed));
            if idle <= timeout {
                return;
            }
            entry.page.timeout(&mut ctx);
            true
        };
        if fired {
            let actions = ctx.take_actions();
            self.apply_actions(actions);
            self.render_current();
        }
    }

    pub fn push_named(&self, name: &str) {
        match self.registry.get(name) {
            Some(build) => self.push_page(build()),
            None => warn!("unknown page \"{}\"", name),
        }
    }

    pub fn goto_named(&self, name: &str) {
        match self.registry.get(name) {
            Some(build) => {
                self.clear_stack();
                self.push_page(build());
            }
            None => warn!("unknown page \"{}\"", name),
        }
    }

    pub fn push_page(&self, page: PageBox) {
        let mut ctx = self.ctx();
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            if let Some(top) = inner.stack.last_mut() {
                top.page.on_hide(&mut ctx);
            }
            let subscriptions = self.subscribe(page.state_events());
            inner.stack.push(Entry {
                page,
                subscriptions,
            });
            let entry = inner.stack.last_mut().unwrap();
            entry.page.on_show(&mut ctx);
        }
        let actions = ctx.take_actions();
        self.apply_actions(actions);
        self.render_current();
    }

    pub fn pop(&self) {
        let mut ctx = self.ctx();
        let empty = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            if let Some(mut entry) = inner.stack.pop() {
                entry.page.on_hide(&mut ctx);
                self.unsubscribe(entry.subscriptions);
            }
            if let Some(top) = inner.stack.last_mut() {
                top.page.on_show(&mut ctx);
            }
            inner.stack.is_empty()
        };
        let actions = ctx.take_actions();
        self.apply_actions(actions);
        if empty {
            self.goto_named("home");
        } else {
            self.render_current();
        }
    }

    fn clear_stack(&self) {
        let mut ctx = self.ctx();
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let mut first = true;
        while let Some(mut entry) = inner.stack.pop() {
            if first {
                entry.page.on_hide(&mut ctx);
                first = false;
            }
            self.unsubscribe(entry.subscriptions);
        }
    }

    /// Show a message page: popup pushes on top, otherwise it replaces
    /// the whole stack.
    pub fn message(&self, text: &str, timeout: u64, popup: bool, modal: bool) {
        let mut page = if modal {
            MessagePage::modal(text)
        } else {
            MessagePage::new(text)
        };
        if timeout > 0 {
            self.stamp_input();
            page.timeout_secs = timeout;
        }
        if popup {
            self.push_page(Box::new(page));
        } else {
            self.clear_stack();
            self.push_page(Box::new(page));
        }
    }

    pub fn render_current(&self) {
        let ctx = self.ctx();
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let MenuInner { display, stack } = &mut *inner;
        if let Some(entry) = stack.last_mut() {
            entry.page.render(display.as_mut(), &ctx);
        }
    }

    /// Pixel snapshot for the screenshot endpoint.
    pub fn screenshot(&self) -> (i32, i32, Vec<u8>) {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.display.snapshot()
    }

    pub fn current_title(&self) -> Option<String> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.stack.last().map(|entry| entry.page.title())
    }

    pub fn stack_depth(&self) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.stack.len()
    }

    fn subscribe(&self, events: &'static [&'static str]) -> Vec<(String, HandlerId)> {
        events
            .iter()
            .map(|name| {
                let queue = self.queue.clone();
                let id = self.signals.register(name, move |name, data| {
                    let _ = queue.send(Event::State {
                        name: name.to_string(),
                        data: data.clone(),
                    });
                });
                (name.to_string(), id)
            })
            .collect()
    }

    fn unsubscribe(&self, subscriptions: Vec<(String, HandlerId)>) {
        for (name, id) in subscriptions {
            self.signals.unregister(&name, id);
        }
    }

    fn apply_actions(&self, actions: Vec<MenuAction>) {
        let mut work: VecDeque<MenuAction> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                MenuAction::Push(page) => self.push_page(page),
                MenuAction::PushNamed(name) => self.push_named(&name),
                MenuAction::Pop => self.pop(),
                MenuAction::GotoNamed(name) => self.goto_named(&name),
                MenuAction::Message {
                    text,
                    timeout,
                    popup,
                    modal,
                } => self.message(&text, timeout, popup, modal),
            }
        }
    }
}
