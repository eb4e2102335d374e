//! Menu system: display shims, the page stack and the page library.

pub mod display;
pub mod menu;
pub mod pages;

pub use display::{Display, FbDisplay, MemoryDisplay};
pub use menu::Menu;
