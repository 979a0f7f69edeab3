//! 30Hz render pump that mirrors the session screen onto stdout.
//!
//! The pump ticks at a fixed rate and only redraws when the session has
//! published a new frame since the last tick, so bursts of output collapse
//! into one redraw.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use ptyloop_pty::{Session, SessionSignal};
use ptyloop_vt::ScreenSnapshot;

pub const FRAME_INTERVAL: Duration = Duration::from_micros(33_333);

/// Why the pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Disconnected,
    Interrupted,
}

/// Run until the child disconnects or Ctrl-C is pressed.
///
/// With `live` unset nothing is drawn; the caller prints the final screen.
pub async fn run(
    session: &Session,
    mut signals: watch::Receiver<SessionSignal>,
    live: bool,
) -> PumpExit {
    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut drawn_frame = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => return PumpExit::Interrupted,
        }

        let signal = *signals.borrow_and_update();
        if live && signal.frame != drawn_frame {
            if let Some(snapshot) = session.snapshot() {
                if let Err(e) = draw(&snapshot, session.take_bell()) {
                    log::warn!("failed to draw frame: {e}");
                }
            }
        }
        drawn_frame = signal.frame;

        if signal.disconnected {
            return PumpExit::Disconnected;
        }
    }
}

fn draw(snapshot: &ScreenSnapshot, bell: bool) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(b"\x1b[H\x1b[2J")?;
    stdout.write_all(render_frame(snapshot).as_bytes())?;
    if bell {
        stdout.write_all(b"\x07")?;
    }
    stdout.flush()
}

/// Plain-text frame: optional title bar, then the screen rows.
pub fn render_frame(snapshot: &ScreenSnapshot) -> String {
    let mut frame = String::new();
    if let Some(title) = &snapshot.title {
        frame.push_str(&format!("[ {title} ]\r\n"));
    }
    for row in 0..snapshot.rows {
        frame.push_str(&snapshot.row_text(row));
        if row + 1 < snapshot.rows {
            frame.push_str("\r\n");
        }
    }
    frame
}
