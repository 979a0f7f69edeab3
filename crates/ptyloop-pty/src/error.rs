//! Error types for PTY, session and config operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::multiplexer::MuxState;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to allocate PTY: {0}")]
    Allocate(#[source] nix::Error),

    #[error("failed to fork child process: {0}")]
    Fork(#[source] nix::Error),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("PTY is not open")]
    NotOpen,

    #[error("failed to resize PTY: {0}")]
    Resize(#[source] io::Error),

    #[error("failed to watch PTY for readiness: {0}")]
    Watch(#[source] io::Error),

    #[error("cannot {action} a multiplexer that is {state:?}")]
    InvalidState {
        action: &'static str,
        state: MuxState,
    },

    #[error("input channel is closed")]
    Closed,

    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    Spawn(#[source] PtyError),

    #[error("session has already been started")]
    AlreadyStarted,

    #[error("session has not been started")]
    NotStarted,

    #[error(transparent)]
    Pty(#[from] PtyError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
