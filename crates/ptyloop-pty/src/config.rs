//! Session configuration loaded from JSON.
//!
//! Every field is optional in the file; missing ones take the defaults below.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{PtyCommand, DEFAULT_TERM};
use crate::error::ConfigError;
use crate::size::WindowSize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to run. `None` means the user's shell.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// `TERM` advertised to the child.
    pub term: String,
    /// Extra environment variables, applied over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Geometry used until the host reports a real content size.
    pub rows: u16,
    pub cols: u16,
    /// Lines of scrollback kept by the terminal model.
    pub scrollback: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let size = WindowSize::default();
        Self {
            command: None,
            args: Vec::new(),
            term: DEFAULT_TERM.to_string(),
            env: BTreeMap::new(),
            rows: size.rows,
            cols: size.cols,
            scrollback: ptyloop_vt::DEFAULT_SCROLLBACK,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&contents)?;
        log::debug!("loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The command this config describes.
    pub fn command(&self) -> PtyCommand {
        let command = match &self.command {
            Some(program) => PtyCommand::new(program),
            None => PtyCommand::default_shell(),
        };
        self.env
            .iter()
            .fold(command.args(&self.args).term(&self.term), |cmd, (k, v)| cmd.env(k, v))
    }

    pub fn size(&self) -> WindowSize {
        WindowSize::from_content(self.rows, self.cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.term, "xterm-256color");
        assert_eq!(config.size(), WindowSize::new(24, 80));
        assert_eq!(config.scrollback, 10_000);
        assert!(config.command.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{ "command": "/bin/sh", "rows": 40 }"#).unwrap();
        assert_eq!(config.command.as_deref(), Some("/bin/sh"));
        assert_eq!(config.rows, 40);
        assert_eq!(config.cols, 80);
        assert_eq!(config.term, "xterm-256color");
    }

    #[test]
    fn test_size_is_floored() {
        let config = SessionConfig::from_json(r#"{ "rows": 0, "cols": 1 }"#).unwrap();
        assert_eq!(config.size(), WindowSize::new(2, 2));
    }

    #[test]
    fn test_invalid_json() {
        let err = SessionConfig::from_json("{ rows: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "command": "/bin/sh", "args": ["-c", "true"], "env": {{ "A": "1" }} }}"#
        )
        .unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.args, ["-c", "true"]);
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(
            config.command(),
            PtyCommand::new("/bin/sh").args(["-c", "true"]).env("A", "1")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
