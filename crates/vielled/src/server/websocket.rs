//! Websocket fan-out.
//!
//! Each connected client gets a queue subscribed to every signal-bus
//! emission. Events in the policy table are either delivered on first
//! emission and coalesced within the throttle window (`Default`) or
//! only ever delivered by the periodic pending flush (`Always`), which
//! carries the latest payload. Events originating from the connected
//! client itself are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use crate::server::{Ctx, PRODUCT_NAME};
use crate::signals::{EventData, ALL_EVENTS};

pub const THROTTLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// First emission per window goes out immediately, the rest
    /// coalesce into the pending slot.
    Default,
    /// Never immediate; the flush timer delivers the latest payload.
    Always,
}

/// The event vocabulary forwarded to websocket clients.
pub fn event_policy(name: &str) -> Option<Throttle> {
    match name {
        "active:preset:changed"
        | "preset:added"
        | "preset:deleted"
        | "preset:changed"
        | "preset:reordered"
        | "sound:added"
        | "sound:deleted"
        | "sound:changed" => Some(Throttle::Default),
        "main_volume:changed"
        | "reverb_volume:changed"
        | "chien_threshold:changed"
        | "coarse_tune:changed"
        | "pitchbend_range:changed"
        | "fine_tune:changed"
        | "synth:gain:changed" => Some(Throttle::Always),
        _ => None,
    }
}

struct ThrottleState {
    last_sent: HashMap<String, Instant>,
    pending: HashMap<String, (Instant, Value)>,
}

/// Per-connection queue with throttling and echo suppression.
pub struct WsQueue {
    client_id: String,
    tx: UnboundedSender<Value>,
    inner: Mutex<ThrottleState>,
    window: Duration,
}

impl WsQueue {
    pub fn new(client_id: String, tx: UnboundedSender<Value>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            tx,
            inner: Mutex::new(ThrottleState {
                last_sent: HashMap::new(),
                pending: HashMap::new(),
            }),
            window: THROTTLE_WINDOW,
        })
    }

    /// Signal-bus entry point, runs on the emitting thread.
    pub fn handle_event(&self, name: &str, data: &EventData) {
        self.handle_event_at(name, data, Instant::now());
    }

    fn handle_event_at(&self, name: &str, data: &EventData, now: Instant) {
        // events outside the table that concern the active preset are
        // summarized into a single preset-changed notification
        let (name, payload) = match event_policy(name) {
            Some(_) => (name.to_string(), data.to_json()),
            None if name.starts_with("active:preset:") => {
                ("active:preset:changed".to_string(), json!({}))
            }
            None => return,
        };
        let policy = event_policy(&name).expect("coerced name is always in the table");

        // never echo a change back to the client that made it
        if data.client_id.as_deref() == Some(self.client_id.as_str()) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        match policy {
            Throttle::Default => {
                let fresh = match inner.last_sent.get(&name) {
                    Some(last) => now.duration_since(*last) > self.window,
                    None => true,
                };
                if fresh {
                    inner.last_sent.insert(name.clone(), now);
                    inner.pending.remove(&name);
                    drop(inner);
                    self.send(&name, payload);
                } else {
                    inner.pending.insert(name, (now, payload));
                }
            }
            Throttle::Always => {
                inner.pending.insert(name, (now, payload));
            }
        }
    }

    /// Periodic flush: deliver pending entries. `Always` entries go out
    /// on every tick, `Default` entries once their age exceeds the
    /// window.
    pub fn flush_pending(&self) {
        self.flush_pending_at(Instant::now());
    }

    fn flush_pending_at(&self, now: Instant) {
        let ready: Vec<(String, Value)> = {
            let mut inner = self.inner.lock().unwrap();
            let names: Vec<String> = inner
                .pending
                .iter()
                .filter(|(name, (ts, _))| match event_policy(name) {
                    Some(Throttle::Always) => true,
                    _ => now.duration_since(*ts) > self.window,
                })
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| {
                    inner.last_sent.insert(name.clone(), now);
                    inner.pending.remove(&name).map(|(_, data)| (name, data))
                })
                .collect()
        };
        for (name, data) in ready {
            self.send(&name, data);
        }
    }

    fn send(&self, name: &str, data: Value) {
        let frame = json!({ "name": name, "data": data });
        if self.tx.send(frame).is_err() {
            debug!("websocket client {} gone", self.client_id);
        }
    }
}

pub async fn handler(State(ctx): State<Ctx>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| connection(ctx, socket))
}

async fn connection(ctx: Ctx, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // the client introduces itself with {data: {id}}
    let client_id = match stream.next().await {
        Some(Ok(Message::Text(raw))) => serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|msg| {
                msg.get("data")
                    .and_then(|d| d.get("id"))
                    .map(|id| match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
            }),
        _ => None,
    };
    let Some(client_id) = client_id else {
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = WsQueue::new(client_id.clone(), tx);

    let subscriber = Arc::clone(&queue);
    let handler_id = ctx.signals.register(ALL_EVENTS, move |name, data| {
        subscriber.handle_event(name, data);
    });

    let flusher = Arc::clone(&queue);
    let flush_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(THROTTLE_WINDOW);
        loop {
            ticker.tick().await;
            flusher.flush_pending();
        }
    });

    let hello = json!({
        "name": "sysinfo",
        "data": { "name": PRODUCT_NAME, "version": ctx.version },
    });
    let _ = sink.send(Message::Text(hello.to_string().into())).await;

    debug!("websocket client {} connected", client_id);
    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    flush_task.abort();
    ctx.signals.unregister(ALL_EVENTS, handler_id);
    debug!("websocket client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (Arc<WsQueue>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WsQueue::new("client-1".to_string(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn data_with_client(client: &str) -> EventData {
        let mut data = EventData::new();
        data.client_id = Some(client.to_string());
        data
    }

    #[test]
    fn test_default_event_first_is_immediate() {
        let (queue, mut rx) = queue();
        let t0 = Instant::now();
        queue.handle_event_at("preset:added", &EventData::new(), t0);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["name"], "preset:added");
    }

    #[test]
    fn test_default_event_coalesces_within_window() {
        let (queue, mut rx) = queue();
        let t0 = Instant::now();
        queue.handle_event_at("preset:added", &EventData::new(), t0);
        queue.handle_event_at("preset:added", &EventData::new(), t0 + Duration::from_millis(100));
        queue.handle_event_at("preset:added", &EventData::new(), t0 + Duration::from_millis(200));
        assert_eq!(drain(&mut rx).len(), 1, "only the first goes out");

        // pending flushes once aged past the window
        queue.flush_pending_at(t0 + Duration::from_millis(300));
        assert_eq!(drain(&mut rx).len(), 0);
        queue.flush_pending_at(t0 + Duration::from_millis(800));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_always_event_never_immediate_carries_last_payload() {
        let (queue, mut rx) = queue();
        let t0 = Instant::now();
        for volume in [10, 20, 30] {
            queue.handle_event_at(
                "main_volume:changed",
                &EventData::with("main_volume", json!(volume)),
                t0 + Duration::from_millis(volume as u64),
            );
        }
        assert!(drain(&mut rx).is_empty(), "ALWAYS events are never immediate");

        queue.flush_pending_at(t0 + Duration::from_millis(500));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["main_volume"], 30);

        // nothing left on the next tick
        queue.flush_pending_at(t0 + Duration::from_millis(1000));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_echo_suppression() {
        let (queue, mut rx) = queue();
        let t0 = Instant::now();
        queue.handle_event_at("preset:added", &data_with_client("client-1"), t0);
        assert!(drain(&mut rx).is_empty(), "own events are dropped");

        queue.handle_event_at("preset:added", &data_with_client("client-2"), t0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_active_preset_coercion() {
        let (queue, mut rx) = queue();
        let t0 = Instant::now();
        let mut data = EventData::with("volume", json!(90));
        data.sender = Some("melody1".to_string());
        queue.handle_event_at("active:preset:voice:volume:changed", &data, t0);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["name"], "active:preset:changed");
        // the payload is reduced to a bare notification
        assert_eq!(frames[0]["data"], json!({}));
    }

    #[test]
    fn test_unlisted_events_ignored() {
        let (queue, mut rx) = queue();
        queue.handle_event_at("ui:brightness:changed", &EventData::new(), Instant::now());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_sender_not_serialized() {
        let (queue, mut rx) = queue();
        let mut data = EventData::with("id", json!(5));
        data.sender = Some("melody1".to_string());
        queue.handle_event_at("preset:added", &data, Instant::now());
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["data"], json!({"id": 5}));
        assert!(frames[0]["data"].get("sender").is_none());
    }
}
