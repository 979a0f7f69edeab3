//! Output and input loops between a [`PtyHandle`] and its two channels.

use std::io;
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decode::Utf8Accumulator;
use crate::error::PtyError;
use crate::message::{
    InputMessage, InputSender, OutputMessage, OutputReceiver, QueueReceiver, Queued,
};
use crate::pty::{read_master, PtyHandle, READ_CHUNK};
use crate::size::WindowSize;

/// Lifecycle of an [`IoMultiplexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Pending {
    pty: PtyHandle,
    input_rx: QueueReceiver,
    output_tx: mpsc::UnboundedSender<OutputMessage>,
}

struct Running {
    input_stop: mpsc::Sender<()>,
    output_stop: mpsc::Sender<()>,
    /// The input loop owns the handle while running and gives it back on exit.
    input_task: JoinHandle<PtyHandle>,
    output_task: JoinHandle<()>,
    watch: Arc<AsyncFd<OwnedFd>>,
    fd: Option<RawFd>,
    pid: Option<Pid>,
}

enum Stage {
    Created(Pending),
    Running(Running),
    Stopping,
    Stopped(Option<PtyHandle>),
}

impl Stage {
    fn state(&self) -> MuxState {
        match self {
            Stage::Created(_) => MuxState::Created,
            Stage::Running(_) => MuxState::Running,
            Stage::Stopping => MuxState::Stopping,
            Stage::Stopped(_) => MuxState::Stopped,
        }
    }
}

/// Moves bytes between one PTY and a pair of ordered channels.
///
/// The output loop turns master readability into [`OutputMessage`]s; the input
/// loop carries out [`InputMessage`]s against the handle. Both run as tokio
/// tasks between [`start`](Self::start) and [`stop`](Self::stop).
pub struct IoMultiplexer {
    stage: Stage,
    input: InputSender,
}

impl IoMultiplexer {
    /// Wrap `pty`. Returns the multiplexer and the receiving end of its output
    /// channel.
    pub fn new(pty: PtyHandle) -> (Self, OutputReceiver) {
        let (input, input_rx) = InputSender::channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mux = Self {
            stage: Stage::Created(Pending {
                pty,
                input_rx,
                output_tx,
            }),
            input,
        };
        (mux, output_rx)
    }

    /// Sender for the input channel. Messages queued before `start` are
    /// processed once the loops run.
    pub fn input(&self) -> InputSender {
        self.input.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MuxState {
        self.stage.state()
    }

    /// Master descriptor while the PTY is open.
    pub fn master_fd(&self) -> Option<RawFd> {
        match &self.stage {
            Stage::Created(pending) => pending.pty.master_fd(),
            Stage::Running(running) => running.fd,
            Stage::Stopping => None,
            Stage::Stopped(pty) => pty.as_ref().and_then(PtyHandle::master_fd),
        }
    }

    /// Child pid while the PTY is open.
    pub fn child_pid(&self) -> Option<Pid> {
        match &self.stage {
            Stage::Created(pending) => pending.pty.pid(),
            Stage::Running(running) => running.pid,
            Stage::Stopping => None,
            Stage::Stopped(pty) => pty.as_ref().and_then(PtyHandle::pid),
        }
    }

    /// The handle, when no loop currently owns it.
    pub fn pty(&self) -> Option<&PtyHandle> {
        match &self.stage {
            Stage::Created(pending) => Some(&pending.pty),
            Stage::Stopped(pty) => pty.as_ref(),
            Stage::Running(_) | Stage::Stopping => None,
        }
    }

    /// Spawn the output and input loops. Only valid once, from `Created`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), PtyError> {
        let pending = match std::mem::replace(&mut self.stage, Stage::Stopping) {
            Stage::Created(pending) => pending,
            other => {
                let state = other.state();
                self.stage = other;
                return Err(PtyError::InvalidState {
                    action: "start",
                    state,
                });
            }
        };

        match watch_master(&pending.pty) {
            Ok(watch) => {
                self.stage = Stage::Running(spawn_loops(pending, watch));
                log::debug!("multiplexer running");
                Ok(())
            }
            Err(e) => {
                self.stage = Stage::Created(pending);
                Err(e)
            }
        }
    }

    /// Cancel both loops, drop the readiness registration, then close the
    /// handle. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.stage, Stage::Stopping) {
            Stage::Created(mut pending) => {
                pending.pty.close();
                self.stage = Stage::Stopped(Some(pending.pty));
            }
            Stage::Running(running) => {
                let pty = shutdown(running).await;
                self.stage = Stage::Stopped(pty);
            }
            // A previous stop was cancelled midway; the loops were detached
            // and release the handle when they exit.
            Stage::Stopping => self.stage = Stage::Stopped(None),
            stopped @ Stage::Stopped(_) => {
                self.stage = stopped;
                return;
            }
        }
        log::debug!("multiplexer stopped");
    }
}

fn watch_master(pty: &PtyHandle) -> Result<AsyncFd<OwnedFd>, PtyError> {
    pty.set_nonblocking(true)?;
    let fd = pty.try_clone_master()?;
    AsyncFd::new(fd).map_err(PtyError::Watch)
}

fn spawn_loops(pending: Pending, watch: AsyncFd<OwnedFd>) -> Running {
    let Pending {
        pty,
        input_rx,
        output_tx,
    } = pending;

    let fd = pty.master_fd();
    let pid = pty.pid();
    let watch = Arc::new(watch);
    let (input_stop, input_stop_rx) = mpsc::channel::<()>(1);
    let (output_stop, output_stop_rx) = mpsc::channel::<()>(1);

    let output_task = tokio::spawn(output_loop(Arc::clone(&watch), output_tx, output_stop_rx));
    let input_task = tokio::spawn(input_loop(pty, Arc::clone(&watch), input_rx, input_stop_rx));

    Running {
        input_stop,
        output_stop,
        input_task,
        output_task,
        watch,
        fd,
        pid,
    }
}

async fn shutdown(running: Running) -> Option<PtyHandle> {
    let Running {
        input_stop,
        output_stop,
        input_task,
        output_task,
        watch,
        ..
    } = running;

    let _ = output_stop.try_send(());
    let _ = input_stop.try_send(());

    if let Err(e) = output_task.await {
        log::warn!("output loop ended abnormally: {e}");
    }
    let pty = match input_task.await {
        Ok(pty) => Some(pty),
        Err(e) => {
            log::warn!("input loop ended abnormally: {e}");
            None
        }
    };

    // Both loops are done, so this is the last reference. `into_inner`
    // removes the descriptor from the reactor before it is closed.
    match Arc::try_unwrap(watch) {
        Ok(watch) => drop(watch.into_inner()),
        Err(_) => log::debug!("readiness watch still referenced at shutdown"),
    }

    pty.map(|mut pty| {
        pty.close();
        pty
    })
}

async fn output_loop(
    watch: Arc<AsyncFd<OwnedFd>>,
    tx: mpsc::UnboundedSender<OutputMessage>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Accumulator::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = stop_rx.recv() => return,
            read = read_chunk(&watch, &mut buf) => read,
        };

        match read {
            Ok(0) => {
                log::debug!("pty reached EOF");
                break;
            }
            Ok(n) => {
                let text = decoder.accumulate(&buf[..n]);
                if !text.is_empty() && tx.send(OutputMessage::Stdout(text)).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::debug!("pty read failed, treating as disconnect: {e}");
                break;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(OutputMessage::Stdout(tail));
    }
    let _ = tx.send(OutputMessage::Disconnected);
}

async fn read_chunk(watch: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = watch.readable().await?;
        match guard.try_io(|fd| read_master(fd.get_ref().as_fd(), buf)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn input_loop(
    mut pty: PtyHandle,
    watch: Arc<AsyncFd<OwnedFd>>,
    mut rx: QueueReceiver,
    mut stop_rx: mpsc::Receiver<()>,
) -> PtyHandle {
    loop {
        let queued = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            queued = rx.recv() => queued,
        };
        let Some(Queued { message, ack }) = queued else {
            break;
        };

        let result = match message {
            InputMessage::Stdin(data) => {
                let written = tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    written = write_all(&pty, &watch, &data) => written,
                };
                if let Err(e) = &written {
                    log::warn!("failed to write {} bytes to pty: {e}", data.len());
                }
                written
            }
            InputMessage::Resize { rows, cols } => {
                let resized = pty.resize(WindowSize::new(rows, cols));
                if let Err(e) = &resized {
                    log::warn!("failed to resize pty to {cols}x{rows}: {e}");
                }
                resized
            }
        };

        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }
    pty
}

async fn write_all(pty: &PtyHandle, watch: &AsyncFd<OwnedFd>, mut data: &[u8]) -> Result<(), PtyError> {
    while !data.is_empty() {
        let mut guard = watch.writable().await?;
        match guard.try_io(|_| pty.write_some(data)) {
            Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PtyCommand;
    use std::time::Duration;
    use tokio::time::timeout;

    fn open(command: PtyCommand) -> (IoMultiplexer, OutputReceiver) {
        let pty = PtyHandle::open(&command, WindowSize::new(24, 80)).unwrap();
        IoMultiplexer::new(pty)
    }

    /// Collect `Stdout` text until `needle` appears or `Disconnected` arrives.
    /// The flag reports whether the child disconnected.
    async fn collect_until(rx: &mut OutputReceiver, needle: Option<&str>) -> (String, bool) {
        let mut text = String::new();
        let result = timeout(Duration::from_secs(10), async {
            while let Some(message) = rx.recv().await {
                match message {
                    OutputMessage::Stdout(chunk) => {
                        text.push_str(&chunk);
                        if needle.is_some_and(|n| text.contains(n)) {
                            return false;
                        }
                    }
                    OutputMessage::Disconnected => return true,
                }
            }
            false
        })
        .await;
        (text, result.unwrap_or(false))
    }

    #[tokio::test]
    async fn test_echo_through_loops() {
        let (mut mux, mut rx) = open(PtyCommand::new("/bin/sh"));
        mux.start().unwrap();
        mux.input().stdin("echo PTY_TEST_OUTPUT\n").unwrap();

        let (text, _) = collect_until(&mut rx, Some("PTY_TEST_OUTPUT")).await;
        assert!(text.contains("PTY_TEST_OUTPUT"), "got: {text}");
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (mut mux, _rx) = open(PtyCommand::new("/bin/sh"));
        assert_eq!(mux.state(), MuxState::Created);
        assert!(mux.pty().is_some());

        mux.start().unwrap();
        assert_eq!(mux.state(), MuxState::Running);
        assert!(mux.pty().is_none());
        assert!(matches!(
            mux.start(),
            Err(PtyError::InvalidState {
                action: "start",
                state: MuxState::Running
            })
        ));

        mux.stop().await;
        assert_eq!(mux.state(), MuxState::Stopped);
        assert!(mux.start().is_err());
    }

    #[tokio::test]
    async fn test_stop_twice_clears_handle() {
        let (mut mux, _rx) = open(PtyCommand::new("/bin/sh"));
        mux.start().unwrap();
        assert!(mux.master_fd().is_some());
        assert!(mux.child_pid().is_some());

        mux.stop().await;
        assert!(mux.master_fd().is_none());
        assert!(mux.child_pid().is_none());
        let pty = mux.pty().unwrap();
        assert!(pty.master_fd().is_none());
        assert!(pty.pid().is_none());

        mux.stop().await;
        assert_eq!(mux.state(), MuxState::Stopped);
        assert!(mux.master_fd().is_none());
        assert!(mux.child_pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_closes_handle() {
        let (mut mux, mut rx) = open(PtyCommand::new("/bin/sh"));
        mux.stop().await;

        assert_eq!(mux.state(), MuxState::Stopped);
        assert!(mux.master_fd().is_none());
        assert!(mux.child_pid().is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_last_message() {
        let (mut mux, mut rx) = open(PtyCommand::new("/bin/sh").args(["-c", "echo done"]));
        mux.start().unwrap();

        let (text, disconnected) = collect_until(&mut rx, None).await;
        assert!(disconnected, "expected Disconnected, got: {text}");
        assert!(text.contains("done"));

        let next = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(next.is_none());
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_last_resize_wins() {
        let (mut mux, mut rx) = open(PtyCommand::new("/bin/sh"));
        mux.start().unwrap();

        let input = mux.input();
        input.resize(30, 100).unwrap();
        input.resize(40, 120).unwrap();
        input.stdin("stty size\n").unwrap();

        let (text, _) = collect_until(&mut rx, Some("40 120")).await;
        assert!(text.contains("40 120"), "got: {text}");
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_acknowledged_write() {
        let (mut mux, _rx) = open(PtyCommand::new("/bin/sh"));
        let input = mux.input();
        mux.start().unwrap();

        input.write("true\n").await.unwrap();
        mux.stop().await;

        assert!(matches!(input.write("true\n").await, Err(PtyError::Closed)));
    }

    #[tokio::test]
    async fn test_large_input_is_fully_written() {
        let (mut mux, mut rx) = open(PtyCommand::new("/bin/sh").args(["-c", "wc -c"]));
        mux.start().unwrap();

        let input = mux.input();
        input.write("x".repeat(3000)).await.unwrap();
        // First ^D hands the pending line to `wc`, the second is end-of-file.
        input.write(vec![0x04, 0x04]).await.unwrap();

        let (text, _) = collect_until(&mut rx, Some("3000")).await;
        assert!(text.contains("3000"), "got: {text}");
        mux.stop().await;
    }
}
