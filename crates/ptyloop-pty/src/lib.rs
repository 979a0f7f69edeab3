//! ptyloop-pty: PTY process lifecycle and I/O for one embedded terminal.
//!
//! This crate sits between the child process and the terminal model. It
//! reads child output, feeds it into [`ptyloop_vt::TerminalState`], and
//! writes user input (and the model's status replies) back to the child.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: owns the PTY master and the child (spawn, read, write,
//!   resize, close).
//! - [`IoMultiplexer`]: two tokio tasks moving bytes between the handle and a
//!   pair of ordered channels.
//! - [`Session`]: wires the multiplexer to a terminal model and exposes
//!   start/stop/resize/send-input to the host.

pub mod command;
pub mod config;
pub mod decode;
pub mod error;
pub mod keys;
pub mod message;
pub mod multiplexer;
pub mod pty;
pub mod session;
pub mod size;

pub use command::{default_shell, PtyCommand, DEFAULT_TERM};
pub use config::SessionConfig;
pub use decode::Utf8Accumulator;
pub use error::{ConfigError, PtyError, SessionError};
pub use keys::{translate, Key, Modifiers, UnknownKey};
pub use message::{InputMessage, InputSender, OutputMessage, OutputReceiver, WeakInputSender};
pub use multiplexer::{IoMultiplexer, MuxState};
pub use pty::{PtyHandle, READ_CHUNK};
pub use session::{Session, SessionSignal};
pub use size::WindowSize;
