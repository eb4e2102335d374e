//! Control-plane firmware for the Vielle digital hurdy-gurdy.
//!
//! The daemon sits between the physical instrument (key matrix,
//! encoder, wheel sensor) and two black-box collaborators: the audio
//! synthesizer and the realtime string engine. Raw device bytes flow
//! through the input layer onto a single typed event queue; the
//! dispatcher drives the menu state machine and the observable state
//! tree; controllers translate state-change signals into synth/engine
//! commands; the HTTP/websocket plane mirrors the same state to remote
//! clients.

pub mod alsa;
pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod input;
pub mod server;
pub mod signals;
pub mod sounds;
pub mod state;
pub mod synth;
pub mod ui;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
