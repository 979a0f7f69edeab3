//! ptyloop-vt: terminal state model for an embedded PTY session.
//!
//! Wraps `alacritty_terminal` behind a small API: feed decoded child output,
//! read back the grid, and receive status-report replies through a write-back
//! function supplied by whoever owns the child's input stream.

pub mod cell;
pub mod screen;
pub mod terminal;

pub use cell::{CellFlags, Rgb, VtCell};
pub use screen::{CursorShape, CursorState, ScreenSnapshot, ScreenView};
pub use terminal::{TerminalState, WriteBack, DEFAULT_SCROLLBACK};
