use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ptyloop_pty::SessionConfig;

/// CLI arguments for ptyloop
#[derive(Parser, Debug, Clone)]
#[command(name = "ptyloop")]
#[command(version)]
#[command(about = "Run a command on a pseudo-terminal and mirror its screen as text", long_about = None)]
pub struct CliArgs {
    /// Path to a JSON session config
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Initial rows
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Initial columns
    #[arg(long, value_name = "COLS")]
    pub cols: Option<u16>,

    /// TERM value advertised to the child
    #[arg(long, value_name = "TERM")]
    pub term: Option<String>,

    /// Number of scrollback lines
    #[arg(long, value_name = "LINES")]
    pub scrollback: Option<usize>,

    /// Extra environment variable for the child
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Redraw the screen on stdout while the child runs
    #[arg(long)]
    pub live: bool,

    /// Command and arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl CliArgs {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("could not load {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some((program, args)) = self.command.split_first() {
            config.command = Some(program.clone());
            config.args = args.to_vec();
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(term) = &self.term {
            config.term = term.clone();
        }
        if let Some(scrollback) = self.scrollback {
            config.scrollback = scrollback;
        }
        config.env.extend(self.env.iter().cloned());

        Ok(config)
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}
