//! Description of the program to run inside the PTY.
//!
//! Everything the forked child needs (resolved path, argv, envp) is built
//! here, in the parent, so the child does no allocation between `fork` and
//! `exec`.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::libc::c_char;

use crate::error::PtyError;

/// `TERM` value given to children unless overridden.
pub const DEFAULT_TERM: &str = "xterm-256color";

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Program, arguments and environment for a PTY child.
///
/// The child inherits the parent's environment unchanged apart from `TERM`,
/// which is always set to [`term`](Self::term), and any variables added with
/// [`env`](Self::env).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    term: String,
}

impl PtyCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            term: DEFAULT_TERM.to_string(),
        }
    }

    /// The user's shell (`$SHELL`), falling back to `/bin/sh`.
    pub fn default_shell() -> Self {
        Self::new(default_shell())
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable for the child, replacing an earlier value for `key`.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        let (key, value) = (key.into(), value.into());
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// `TERM` advertised to the child. Always wins over `env("TERM", ..)`.
    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub(crate) fn prepare(&self) -> Result<PreparedCommand, PtyError> {
        if self.program.is_empty() {
            return Err(PtyError::InvalidCommand("empty program".to_string()));
        }

        let path = resolve_program(&self.program)?;
        let program = cstring(path.as_os_str())?;

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(cstring(&self.program)?);
        for arg in &self.args {
            argv.push(cstring(arg)?);
        }

        let overridden = |key: &OsStr| key == "TERM" || self.env.iter().any(|(k, _)| k == key);
        let mut envp = Vec::new();
        for (key, value) in std::env::vars_os().filter(|(key, _)| !overridden(key.as_os_str())) {
            envp.push(env_entry(&key, &value)?);
        }
        for (key, value) in &self.env {
            if key != "TERM" {
                envp.push(env_entry(key, value)?);
            }
        }
        envp.push(env_entry(OsStr::new("TERM"), OsStr::new(&self.term))?);

        Ok(PreparedCommand {
            program,
            argv,
            envp,
        })
    }
}

impl Default for PtyCommand {
    fn default() -> Self {
        Self::default_shell()
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// A command in the exact shape `execve` wants.
pub(crate) struct PreparedCommand {
    pub(crate) program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl PreparedCommand {
    /// NULL-terminated argv pointers. Valid while `self` is alive.
    pub(crate) fn argv_ptrs(&self) -> Vec<*const c_char> {
        null_terminated(&self.argv)
    }

    /// NULL-terminated envp pointers. Valid while `self` is alive.
    pub(crate) fn envp_ptrs(&self) -> Vec<*const c_char> {
        null_terminated(&self.envp)
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn cstring(value: &OsStr) -> Result<CString, PtyError> {
    CString::new(value.as_bytes())
        .map_err(|_| PtyError::InvalidCommand(format!("{value:?} contains a NUL byte")))
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString, PtyError> {
    let mut entry = key.as_bytes().to_vec();
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    CString::new(entry)
        .map_err(|_| PtyError::InvalidCommand(format!("environment entry {key:?} contains a NUL byte")))
}

/// Resolve `program` the way `execvp` would: names containing a slash are
/// used as-is, bare names are searched for on `PATH`.
fn resolve_program(program: &OsStr) -> Result<PathBuf, PtyError> {
    if program.as_bytes().contains(&b'/') {
        return Ok(PathBuf::from(program));
    }

    let search = std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into());
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| PtyError::CommandNotFound(program.to_string_lossy().into_owned()))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
