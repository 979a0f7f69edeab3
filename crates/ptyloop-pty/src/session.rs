use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::unistd::Pid;
use ptyloop_vt::{ScreenSnapshot, TerminalState, WriteBack, DEFAULT_SCROLLBACK};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::command::PtyCommand;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::keys::{Key, Modifiers};
use crate::message::{InputSender, OutputMessage, OutputReceiver};
use crate::multiplexer::{IoMultiplexer, MuxState};
use crate::pty::PtyHandle;
use crate::size::WindowSize;

/// Most queued output chunks applied under one lock before notifying.
const MAX_BATCH: usize = 64;

/// Change notification published by a [`Session`].
///
/// `frame` increases every time the screen model changed. Receivers only see
/// the latest value, so a slow renderer skips frames instead of queueing them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSignal {
    pub frame: u64,
    /// Set once the child has hung up. Nothing changes after that.
    pub disconnected: bool,
}

type SharedTerminal = Arc<Mutex<TerminalState>>;

struct Active {
    mux: IoMultiplexer,
    input: InputSender,
    terminal: SharedTerminal,
    consumer: Option<(JoinHandle<()>, mpsc::Sender<()>)>,
}

/// One embedded terminal: a child on a PTY, its I/O loops, and the screen
/// model fed by its output.
///
/// Status-report replies produced by the model are written back to the child
/// through the same input queue as keystrokes.
pub struct Session {
    command: PtyCommand,
    scrollback: usize,
    signal: Arc<watch::Sender<SessionSignal>>,
    active: Option<Active>,
}

impl Session {
    /// A session that will run `command` once started.
    pub fn new(command: PtyCommand) -> Self {
        let (signal, _) = watch::channel(SessionSignal::default());
        Self {
            command,
            scrollback: DEFAULT_SCROLLBACK,
            signal: Arc::new(signal),
            active: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let mut session = Self::new(config.command());
        session.scrollback = config.scrollback;
        session
    }

    /// Receiver for change notifications. Can be taken before `start`.
    pub fn subscribe(&self) -> watch::Receiver<SessionSignal> {
        self.signal.subscribe()
    }

    /// Spawn the child at `rows` x `cols` (floored to 2x2) and start moving
    /// its output into the screen model.
    ///
    /// A spawn failure leaves nothing running. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        let size = WindowSize::from_content(rows, cols);
        let pty = PtyHandle::open(&self.command, size).map_err(SessionError::Spawn)?;
        let (mut mux, output_rx) = IoMultiplexer::new(pty);
        let input = mux.input();

        let terminal = Arc::new(Mutex::new(TerminalState::with_scrollback(
            size.rows,
            size.cols,
            self.scrollback,
            reply_writer(&input),
        )));

        mux.start().map_err(SessionError::Spawn)?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let consumer = tokio::spawn(consume_output(
            output_rx,
            Arc::clone(&terminal),
            Arc::clone(&self.signal),
            stop_rx,
        ));

        self.active = Some(Active {
            mux,
            input,
            terminal,
            consumer: Some((consumer, stop_tx)),
        });
        Ok(())
    }

    /// Stop consuming output, then stop the I/O loops and close the PTY.
    ///
    /// Does nothing if the session never started; safe to call repeatedly.
    /// The last screen stays readable through [`snapshot`](Self::snapshot).
    pub async fn stop(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if let Some((task, stop_tx)) = active.consumer.take() {
            let _ = stop_tx.try_send(());
            if let Err(e) = task.await {
                log::warn!("output consumer ended abnormally: {e}");
            }
        }
        active.mux.stop().await;
    }

    /// Queue bytes for the child. A no-op before `start`.
    pub fn send_input(&self, data: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        match &self.active {
            Some(active) => Ok(active.input.stdin(data)?),
            None => Ok(()),
        }
    }

    /// Queue bytes and wait until they have been written to the PTY.
    pub async fn write_input(&self, data: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotStarted)?;
        Ok(active.input.write(data).await?)
    }

    /// Send the bytes an xterm would send for `key`.
    pub fn send_key(&self, key: Key, modifiers: Modifiers) -> Result<(), SessionError> {
        match key.to_bytes(modifiers) {
            Some(bytes) => self.send_input(bytes),
            None => {
                log::debug!("no encoding for key {key}");
                Ok(())
            }
        }
    }

    /// Resize the screen model and the PTY to a host content area of `rows`
    /// x `cols` (floored to 2x2).
    ///
    /// Returns `false` without doing anything if the geometry is unchanged or
    /// the session is not running.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<bool, SessionError> {
        let Some(active) = &self.active else {
            return Ok(false);
        };
        if active.mux.state() != MuxState::Running {
            return Ok(false);
        }

        let size = WindowSize::from_content(rows, cols);
        {
            let mut terminal = lock(&active.terminal);
            if terminal.size() == (size.rows, size.cols) {
                return Ok(false);
            }
            active.input.resize(size.rows, size.cols)?;
            terminal.resize(size.rows, size.cols);
        }
        self.signal.send_modify(|signal| signal.frame += 1);
        Ok(true)
    }

    /// Owned copy of the screen, taken under the model lock.
    pub fn snapshot(&self) -> Option<ScreenSnapshot> {
        self.with_terminal(|terminal| terminal.snapshot())
    }

    /// Run `f` with exclusive access to the screen model.
    ///
    /// `f` must not block: output processing waits on the same lock.
    pub fn with_terminal<R>(&self, f: impl FnOnce(&mut TerminalState) -> R) -> Option<R> {
        let active = self.active.as_ref()?;
        let mut terminal = lock(&active.terminal);
        Some(f(&mut terminal))
    }

    /// Window title set by the child, if any.
    pub fn title(&self) -> Option<String> {
        self.with_terminal(|terminal| terminal.title()).flatten()
    }

    /// Whether the bell rang since the last call.
    pub fn take_bell(&self) -> bool {
        self.with_terminal(TerminalState::take_bell).unwrap_or(false)
    }

    /// A sender for the input queue, for hosts that feed input from another
    /// task.
    pub fn input_sender(&self) -> Option<InputSender> {
        self.active.as_ref().map(|active| active.input.clone())
    }

    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.signal.borrow().disconnected
    }

    /// Multiplexer state, or `None` before `start`.
    pub fn state(&self) -> Option<MuxState> {
        self.active.as_ref().map(|active| active.mux.state())
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        self.active.as_ref().and_then(|active| active.mux.master_fd())
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.active.as_ref().and_then(|active| active.mux.child_pid())
    }
}

fn lock(terminal: &SharedTerminal) -> MutexGuard<'_, TerminalState> {
    terminal.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply child output to the model until the child disconnects or the
/// session stops.
async fn consume_output(
    mut rx: OutputReceiver,
    terminal: SharedTerminal,
    signal: Arc<watch::Sender<SessionSignal>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop_rx.recv() => return,
            message = rx.recv() => message,
        };

        let mut disconnected = false;
        match message {
            Some(OutputMessage::Stdout(text)) => {
                let mut terminal = lock(&terminal);
                terminal.feed(&text);
                for _ in 0..MAX_BATCH {
                    match rx.try_recv() {
                        Ok(OutputMessage::Stdout(more)) => terminal.feed(&more),
                        Ok(OutputMessage::Disconnected) => {
                            disconnected = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
            Some(OutputMessage::Disconnected) | None => disconnected = true,
        }

        signal.send_modify(|signal| {
            signal.frame += 1;
            signal.disconnected |= disconnected;
        });
        if disconnected {
            log::info!("session child disconnected");
            return;
        }
    }
}

/// Write-back for the screen model: replies join the input queue behind
/// whatever was queued before them.
///
/// Holds a weak sender so the model does not keep the queue open after stop.
fn reply_writer(input: &InputSender) -> WriteBack {
    let replies = input.downgrade();
    Arc::new(move |data: &[u8]| {
        if !replies.stdin(data) {
            log::debug!("dropping {} byte terminal reply: input closed", data.len());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PtyError;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh() -> Session {
        Session::new(PtyCommand::new("/bin/sh"))
    }

    fn screen_text(session: &Session) -> String {
        session.snapshot().map(|s| s.text()).unwrap_or_default()
    }

    /// Wait until some screen line satisfies `matches` or the session ends.
    async fn wait_for_line(
        session: &Session,
        signals: &mut watch::Receiver<SessionSignal>,
        matches: impl Fn(&str) -> bool,
    ) -> String {
        let _ = timeout(Duration::from_secs(10), async {
            loop {
                if screen_text(session).lines().any(|line| matches(line.trim())) {
                    return;
                }
                let disconnected = signals.borrow().disconnected;
                if disconnected || signals.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        screen_text(session)
    }

    #[tokio::test]
    async fn test_echo_reaches_screen() {
        let mut session = sh();
        let mut signals = session.subscribe();
        session.start(24, 80).unwrap();
        session.send_input("echo PTY_TEST_OUTPUT\n").unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line == "PTY_TEST_OUTPUT").await;
        assert!(
            text.lines().any(|line| line.trim() == "PTY_TEST_OUTPUT"),
            "got: {text}"
        );
        assert!(signals.borrow().frame > 0);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_clears_handle() {
        let mut session = sh();
        session.start(24, 80).unwrap();
        assert!(session.master_fd().is_some());
        assert!(session.child_pid().is_some());

        session.stop().await;
        assert!(session.master_fd().is_none());
        assert!(session.child_pid().is_none());
        assert_eq!(session.state(), Some(MuxState::Stopped));

        session.stop().await;
        assert!(session.master_fd().is_none());
        assert!(session.child_pid().is_none());
        assert!(session.snapshot().is_some());
    }

    #[tokio::test]
    async fn test_unstarted_session() {
        let mut session = sh();
        session.stop().await;
        assert!(!session.is_started());
        assert!(session.master_fd().is_none());
        assert!(session.send_input("ignored").is_ok());
        assert!(!session.resize(10, 10).unwrap());
        assert!(session.snapshot().is_none());
        assert!(matches!(
            session.write_input("x").await,
            Err(SessionError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let mut session = sh();
        session.start(24, 80).unwrap();
        assert!(matches!(
            session.start(24, 80),
            Err(SessionError::AlreadyStarted)
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_running() {
        let mut session = Session::new(PtyCommand::new("ptyloop-missing-xyz"));
        let err = session.start(24, 80).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Spawn(PtyError::CommandNotFound(_))
        ));
        assert!(!session.is_started());
        assert!(session.child_pid().is_none());
    }

    #[tokio::test]
    async fn test_last_resize_reaches_child() {
        let mut session = sh();
        let mut signals = session.subscribe();
        session.start(24, 80).unwrap();

        assert!(session.resize(30, 100).unwrap());
        assert!(session.resize(40, 120).unwrap());
        assert!(!session.resize(40, 120).unwrap());
        session.send_input("stty size\n").unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line == "40 120").await;
        assert!(text.lines().any(|line| line.trim() == "40 120"), "got: {text}");
        assert_eq!(session.with_terminal(|t| t.size()), Some((40, 120)));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_resize_is_floored() {
        let mut session = sh();
        session.start(0, 0).unwrap();
        assert_eq!(session.with_terminal(|t| t.size()), Some((2, 2)));
        assert!(!session.resize(1, 1).unwrap());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_child_environment() {
        let mut session = sh();
        let mut signals = session.subscribe();
        session.start(24, 200).unwrap();
        session.send_input("echo \"T=$TERM\"; echo \"H=$HOME\"\n").unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line.starts_with("H=")).await;
        assert!(
            text.lines().any(|line| line.trim() == "T=xterm-256color"),
            "got: {text}"
        );
        if let Ok(home) = std::env::var("HOME") {
            let expected = format!("H={home}");
            assert!(text.lines().any(|line| line.trim() == expected), "got: {text}");
        }
        session.stop().await;
    }

    #[tokio::test]
    async fn test_cursor_report_round_trip() {
        let script = r#"stty raw -echo; printf 'Q\033[6n'; reply=$(dd bs=1 count=6 2>/dev/null | tr '\033' E); printf '\r\nGOT %s\r\n' "$reply""#;
        let mut session = Session::new(PtyCommand::new("/bin/sh").args(["-c", script]));
        let mut signals = session.subscribe();
        session.start(24, 80).unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line.starts_with("GOT")).await;
        assert!(text.lines().any(|line| line.trim() == "GOT E[1;2R"), "got: {text}");
        session.stop().await;
    }

    #[test]
    fn test_replies_queue_between_keystrokes() {
        use crate::message::InputMessage;

        let (input, mut rx) = InputSender::channel();
        let mut terminal = TerminalState::new(24, 80, reply_writer(&input));

        input.stdin(b"A".to_vec()).unwrap();
        terminal.feed("\x1b[6n");
        input.stdin(b"B".to_vec()).unwrap();

        let mut queued = Vec::new();
        while let Ok(item) = rx.try_recv() {
            queued.push(item.message);
        }
        assert_eq!(
            queued,
            vec![
                InputMessage::Stdin(b"A".to_vec()),
                InputMessage::Stdin(b"\x1b[1;1R".to_vec()),
                InputMessage::Stdin(b"B".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_resize_after_stop_changes_nothing() {
        let mut session = sh();
        session.start(24, 80).unwrap();
        session.stop().await;

        assert!(!session.resize(40, 120).unwrap());
        let snapshot = session.snapshot().unwrap();
        assert_eq!((snapshot.rows, snapshot.cols), (24, 80));
    }

    #[tokio::test]
    async fn test_disconnect_is_signalled() {
        let mut session = Session::new(PtyCommand::new("/bin/sh").args(["-c", "echo bye"]));
        let mut signals = session.subscribe();
        session.start(24, 80).unwrap();

        let disconnected = timeout(Duration::from_secs(10), signals.wait_for(|s| s.disconnected))
            .await
            .unwrap()
            .is_ok();
        assert!(disconnected);
        assert!(session.is_disconnected());
        assert!(screen_text(&session).contains("bye"));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_keys_and_acknowledged_writes() {
        let mut session = sh();
        let mut signals = session.subscribe();
        session.start(24, 80).unwrap();

        session.write_input("echo KEYS_OK").await.unwrap();
        session.send_key(Key::Enter, Modifiers::empty()).unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line == "KEYS_OK").await;
        assert!(text.lines().any(|line| line.trim() == "KEYS_OK"), "got: {text}");
        session.stop().await;

        assert!(matches!(
            session.write_input("late").await,
            Err(SessionError::Pty(PtyError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = SessionConfig::from_json(
            r#"{ "command": "/bin/sh", "args": ["-c", "echo \"$PTYLOOP_CFG\""], "env": { "PTYLOOP_CFG": "from-config" } }"#,
        )
        .unwrap();
        let mut session = Session::from_config(&config);
        let mut signals = session.subscribe();
        session.start(config.rows, config.cols).unwrap();

        let text = wait_for_line(&session, &mut signals, |line| line == "from-config").await;
        assert!(text.contains("from-config"), "got: {text}");
        session.stop().await;
    }
}
