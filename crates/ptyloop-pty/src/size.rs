//! Window geometry and the ioctls that carry it to the terminal driver.

use std::io;
use std::os::fd::RawFd;

use nix::libc;
use serde::{Deserialize, Serialize};

/// Smallest geometry handed to the child; anything below is floored.
pub const MIN_ROWS: u16 = 2;
pub const MIN_COLS: u16 = 2;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Geometry for a host area of `rows` x `cols` cells, floored at 2x2 so a
    /// collapsed or not-yet-laid-out host never produces a degenerate terminal.
    pub fn from_content(rows: u16, cols: u16) -> Self {
        Self::new(rows.max(MIN_ROWS), cols.max(MIN_COLS))
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }

    /// Set this size on a PTY descriptor (TIOCSWINSZ). The kernel delivers
    /// SIGWINCH to the foreground process group of the slave.
    pub(crate) fn apply(self, fd: RawFd) -> io::Result<()> {
        let ws = self.to_winsize();
        // SAFETY: TIOCSWINSZ reads a `winsize` from the pointer, which lives
        // for the duration of the call.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &ws) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Read the size currently recorded by the driver (TIOCGWINSZ).
    pub(crate) fn query(fd: RawFd) -> io::Result<Self> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes a `winsize` through the pointer.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Self::new(ws.ws_row, ws.ws_col))
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_content_applies_floor() {
        assert_eq!(WindowSize::from_content(0, 0), WindowSize::new(2, 2));
        assert_eq!(WindowSize::from_content(1, 120), WindowSize::new(2, 120));
        assert_eq!(WindowSize::from_content(40, 132), WindowSize::new(40, 132));
    }

    #[test]
    fn test_default_is_classic_geometry() {
        assert_eq!(WindowSize::default(), WindowSize::new(24, 80));
    }

    #[test]
    fn test_apply_on_invalid_fd_fails() {
        assert!(WindowSize::new(24, 80).apply(-1).is_err());
    }
}
