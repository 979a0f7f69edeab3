//! Forwards our own stdin to the child, one line at a time.
//!
//! Reading stdin blocks, so it gets a dedicated OS thread that is never
//! joined; the process exits without waiting for a read to return.

use std::io::{self, BufRead};

use ptyloop_pty::InputSender;

/// End-of-transmission, sent when our stdin closes so the child sees EOF too.
const EOT: u8 = 0x04;

pub fn start_stdin_thread(input: InputSender) -> io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-forward".to_string())
        .spawn(move || forward_lines(io::stdin().lock(), &input))?;
    Ok(())
}

fn forward_lines(reader: impl BufRead, input: &InputSender) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("stopped reading stdin: {e}");
                return;
            }
        };
        if input.stdin(format!("{line}\n")).is_err() {
            return;
        }
    }
    let _ = input.stdin(vec![EOT]);
}
