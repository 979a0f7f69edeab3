//! Messages exchanged between a session and its I/O loops.
//!
//! Both directions are unbounded FIFO channels: a fast producer never drops
//! data and order is preserved end to end.

use tokio::sync::{mpsc, oneshot};

use crate::error::PtyError;

/// Work for the input loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMessage {
    /// Raw bytes for the child's stdin.
    Stdin(Vec<u8>),
    /// New window size for the PTY driver.
    Resize { rows: u16, cols: u16 },
}

/// Events produced by the output loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMessage {
    /// Decoded child output.
    Stdout(String),
    /// The child hung up. Always the last message.
    Disconnected,
}

pub type OutputReceiver = mpsc::UnboundedReceiver<OutputMessage>;

pub(crate) type Ack = oneshot::Sender<Result<(), PtyError>>;

pub(crate) struct Queued {
    pub(crate) message: InputMessage,
    pub(crate) ack: Option<Ack>,
}

pub(crate) type QueueReceiver = mpsc::UnboundedReceiver<Queued>;

/// Sending half of the input queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<Queued>,
}

impl InputSender {
    pub(crate) fn channel() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a message without waiting for it to be carried out.
    pub fn send(&self, message: InputMessage) -> Result<(), PtyError> {
        self.tx
            .send(Queued { message, ack: None })
            .map_err(|_| PtyError::Closed)
    }

    /// Queue bytes for the child.
    pub fn stdin(&self, data: impl Into<Vec<u8>>) -> Result<(), PtyError> {
        self.send(InputMessage::Stdin(data.into()))
    }

    /// Queue a window-size change.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.send(InputMessage::Resize { rows, cols })
    }

    /// Enqueue `data` and wait until the input loop has written all of it,
    /// returning the write error if there was one.
    ///
    /// Ordering relative to [`stdin`](Self::stdin) is preserved.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), PtyError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Queued {
                message: InputMessage::Stdin(data.into()),
                ack: Some(ack),
            })
            .map_err(|_| PtyError::Closed)?;
        done.await.map_err(|_| PtyError::Closed)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle that does not keep the queue alive.
    pub fn downgrade(&self) -> WeakInputSender {
        WeakInputSender {
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning counterpart of [`InputSender`].
///
/// Used where holding a strong sender would form a cycle, such as the
/// terminal model's reply path.
#[derive(Clone, Debug)]
pub struct WeakInputSender {
    tx: mpsc::WeakUnboundedSender<Queued>,
}

impl WeakInputSender {
    /// Enqueue stdin bytes. Returns `false` if the queue is gone.
    pub fn stdin(&self, data: impl Into<Vec<u8>>) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(Queued {
            message: InputMessage::Stdin(data.into()),
            ack: None,
        })
        .is_ok()
    }
}
