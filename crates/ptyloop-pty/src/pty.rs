use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::command::{PreparedCommand, PtyCommand};
use crate::error::PtyError;
use crate::size::WindowSize;

/// Bytes requested per read from the master.
pub const READ_CHUNK: usize = 64 * 1024;

/// Master descriptor and child pid. Either both exist or neither does.
struct Child {
    master: OwnedFd,
    pid: Pid,
}

/// Owns one PTY master and the child process attached to its slave.
///
/// After [`close`](Self::close) the descriptor and pid read as `None`; the
/// handle cannot be reopened.
pub struct PtyHandle {
    child: Option<Child>,
    size: WindowSize,
}

impl PtyHandle {
    /// Allocate a PTY pair sized `size` and run `command` on the slave.
    ///
    /// The window size is set before the child exists, so the program sees the
    /// right geometry from its first `TIOCGWINSZ`. If `exec` fails the child
    /// exits with status 127 and the parent sees EOF on the master.
    pub fn open(command: &PtyCommand, size: WindowSize) -> Result<Self, PtyError> {
        let prepared = command.prepare()?;
        let argv = prepared.argv_ptrs();
        let envp = prepared.envp_ptrs();

        let pty = openpty(Some(&size.to_winsize()), None).map_err(PtyError::Allocate)?;
        set_cloexec(pty.master.as_fd());
        set_cloexec(pty.slave.as_fd());

        // SAFETY: the child branch only calls async-signal-safe libc functions
        // on memory prepared before the fork, then execs or exits.
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => unsafe {
                exec_child(
                    &prepared,
                    &argv,
                    &envp,
                    pty.master.as_raw_fd(),
                    pty.slave.as_raw_fd(),
                )
            },
            ForkResult::Parent { child } => {
                drop(pty.slave);
                log::info!(
                    "spawned {:?} as pid {child} ({}x{})",
                    command.program(),
                    size.cols,
                    size.rows
                );
                Ok(Self {
                    child: Some(Child {
                        master: pty.master,
                        pid: child,
                    }),
                    size,
                })
            }
        }
    }

    /// Raw master descriptor, or `None` once closed.
    pub fn master_fd(&self) -> Option<RawFd> {
        self.child.as_ref().map(|child| child.master.as_raw_fd())
    }

    /// Child pid, or `None` once closed.
    pub fn pid(&self) -> Option<Pid> {
        self.child.as_ref().map(|child| child.pid)
    }

    /// Whether [`close`](Self::close) has not run yet.
    pub fn is_open(&self) -> bool {
        self.child.is_some()
    }

    /// Last size requested through [`open`](Self::open) or [`resize`](Self::resize).
    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// Size as currently recorded by the terminal driver.
    pub fn window_size(&self) -> Result<WindowSize, PtyError> {
        WindowSize::query(self.master()?.as_raw_fd()).map_err(PtyError::Io)
    }

    /// Send a window-size change to the driver. The child receives SIGWINCH.
    pub fn resize(&mut self, size: WindowSize) -> Result<(), PtyError> {
        let fd = self.master()?.as_raw_fd();
        size.apply(fd).map_err(PtyError::Resize)?;
        log::debug!("pty resized to {}x{}", size.cols, size.rows);
        self.size = size;
        Ok(())
    }

    /// Write all of `data` to the child, retrying partial writes.
    ///
    /// Works whether or not the master is in non-blocking mode; a full
    /// buffer is waited out with `poll`.
    pub fn write(&self, mut data: &[u8]) -> Result<(), PtyError> {
        let fd = self.master()?.as_fd();
        while !data.is_empty() {
            match write_master(fd, data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => data = &data[n..],
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => wait_writable(fd)?,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
        Ok(())
    }

    /// A single `write(2)` on the master. May write fewer bytes than given.
    pub fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        let master = self.master().map_err(|_| io::Error::from(Errno::EBADF))?;
        write_master(master.as_fd(), data).map_err(io::Error::from)
    }

    /// Read whatever output is available. `Ok(0)` means the child is gone.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        read_master(self.master()?.as_fd(), buf).map_err(PtyError::Io)
    }

    /// Toggle `O_NONBLOCK` on the master. Shared with any duplicated descriptor.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), PtyError> {
        let fd = self.master()?.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags - OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(())
    }

    /// Duplicate the master descriptor (close-on-exec).
    pub fn try_clone_master(&self) -> Result<OwnedFd, PtyError> {
        Ok(self.master()?.try_clone()?)
    }

    /// Close the master, send SIGTERM, and reap the child.
    ///
    /// Every step tolerates the child or descriptor already being gone, and a
    /// second call does nothing. A child that has not exited by the time we
    /// look is reaped on a background thread so this never blocks.
    pub fn close(&mut self) {
        let Some(Child { master, pid }) = self.child.take() else {
            return;
        };

        drop(master);

        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::debug!("SIGTERM to pid {pid} failed: {e}"),
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => spawn_reaper(pid),
            Ok(status) => log::debug!("pid {pid} reaped: {status:?}"),
            Err(Errno::ECHILD) => {}
            Err(e) => log::debug!("waitpid({pid}) failed: {e}"),
        }
    }

    fn master(&self) -> Result<&OwnedFd, PtyError> {
        self.child
            .as_ref()
            .map(|child| &child.master)
            .ok_or(PtyError::NotOpen)
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read from a master descriptor, mapping `EIO` (slave side gone) to EOF.
pub(crate) fn read_master(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    match nix::unistd::read(fd.as_raw_fd(), buf) {
        Ok(n) => Ok(n),
        Err(Errno::EIO) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn write_master(fd: BorrowedFd<'_>, data: &[u8]) -> nix::Result<usize> {
    nix::unistd::write(fd, data)
}

fn wait_writable(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn set_cloexec(fd: BorrowedFd<'_>) {
    if let Err(e) = fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        log::warn!("failed to set FD_CLOEXEC on {}: {e}", fd.as_raw_fd());
    }
}

fn spawn_reaper(pid: Pid) {
    let spawned = std::thread::Builder::new()
        .name(format!("pty-reap-{pid}"))
        .spawn(move || loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(status) => {
                    log::debug!("pid {pid} reaped: {status:?}");
                    break;
                }
                Err(_) => break,
            }
        });
    if let Err(e) = spawned {
        log::warn!("could not start reaper for pid {pid}: {e}");
    }
}

/// Child half of [`PtyHandle::open`]. Never returns.
///
/// Only async-signal-safe calls are allowed here: the parent may be
/// multi-threaded and any lock held at fork time stays held in the child.
unsafe fn exec_child(
    prepared: &PreparedCommand,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    master: RawFd,
    slave: RawFd,
) -> ! {
    libc::close(master);

    if libc::setsid() == -1 {
        libc::_exit(1);
    }
    // Not fatal: some platforms attach the controlling terminal on open.
    libc::ioctl(slave, libc::TIOCSCTTY as _, 0);

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(slave, target) == -1 {
            libc::_exit(1);
        }
    }
    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    }

    // The Rust runtime ignores SIGPIPE, and ignored signals survive exec.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    libc::execve(prepared.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    libc::_exit(127)
}
