//! ptyloop - run a command on a PTY and print what its screen shows.
//!
//! Lines read from stdin are typed into the child. When the child exits (or
//! on Ctrl-C) the final screen is printed as plain text.

mod cli;
mod render_pump;
mod stdin_thread;

use anyhow::Context;
use clap::Parser;

use ptyloop_pty::Session;

use crate::cli::CliArgs;
use crate::render_pump::PumpExit;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = CliArgs::parse();
    let config = args.session_config()?;
    let size = config.size();

    let mut session = Session::from_config(&config);
    let signals = session.subscribe();
    session
        .start(size.rows, size.cols)
        .context("failed to start session")?;
    log::info!("session started at {}x{}", size.cols, size.rows);

    let input = session
        .input_sender()
        .context("session has no input queue")?;
    stdin_thread::start_stdin_thread(input).context("failed to start stdin thread")?;

    match render_pump::run(&session, signals, args.live).await {
        PumpExit::Disconnected => log::info!("child disconnected"),
        PumpExit::Interrupted => log::info!("interrupted, stopping session"),
    }

    session.stop().await;

    if args.live {
        print!("\x1b[H\x1b[2J");
    }
    if let Some(snapshot) = session.snapshot() {
        println!("{}", snapshot.text());
    }
    Ok(())
}
