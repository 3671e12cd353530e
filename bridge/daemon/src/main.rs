//! Bridge Daemon - Session endpoint for the host bridge
//!
//! Runs one child process and relays the daemon's own stdin/stdout to it,
//! with flow control in both directions. Logs go to stderr so stdout stays
//! byte-transparent.
//!
//! # Usage
//!
//! ```bash
//! # Pipe mode
//! echo hello | bridge-daemon -- cat
//!
//! # Interactive shell on a PTY sized like our terminal
//! bridge-daemon --pty -- bash -l
//!
//! # From a session file
//! bridge-daemon --config /etc/bridge/session.toml
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-daemon -- cat
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM` / `SIGHUP`: forwarded to the child
//! - `SIGWINCH`: copies our terminal size to the child's PTY
//!
//! The exit status is the child's, or `128 + signal` if it was killed.

mod relay;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_core::event_loop;
use bridge_core::transport::{
    StderrMode, SubprocessConfig, TransportConfig, WatcherStrategy, WindowSize, WriteLimits,
};
use clap::Parser;
use serde::Deserialize;
use tracing::{debug, info};

/// Bridge Daemon - relay stdio to a child process
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run the child on a pseudo-terminal
    #[arg(long)]
    pty: bool,

    /// Initial PTY rows (defaults to our terminal's size)
    #[arg(long, requires = "cols")]
    rows: Option<u16>,

    /// Initial PTY columns
    #[arg(long, requires = "rows")]
    cols: Option<u16>,

    /// Capture the child's stderr and log it on exit
    #[arg(long)]
    capture_stderr: bool,

    /// Working directory for the child
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Extra environment for the child
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Exit watcher (auto, pidfd, signal)
    #[arg(long, env = "BRIDGE_EXIT_WATCHER")]
    watcher: Option<WatcherStrategy>,

    /// Session configuration file (TOML)
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Program and arguments to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// On-disk session configuration (`--config`)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionFile {
    /// Child to run and how
    child: SubprocessConfig,
    /// Watermarks for our own stdout
    stdio_limits: Option<WriteLimits>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn load_session_file(path: &Path) -> Result<SessionFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {path:?}"))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file: {path:?}"))
}

/// Merge defaults, environment, the session file and the command line.
fn build_config(args: &Args) -> Result<(SubprocessConfig, WriteLimits)> {
    let defaults = TransportConfig::from_env();
    let (mut config, stdio_limits) = match &args.config {
        Some(path) => {
            let file = load_session_file(path)?;
            (file.child, file.stdio_limits.unwrap_or(defaults.write_limits))
        }
        None => (
            SubprocessConfig::default().with_transport_config(&defaults),
            defaults.write_limits,
        ),
    };

    if !args.command.is_empty() {
        config.args = args.command.clone();
    }
    if config.args.is_empty() {
        anyhow::bail!("no command given (pass one after `--` or set child.args in --config)");
    }
    if args.pty {
        config.pty = true;
    }
    if let (Some(rows), Some(cols)) = (args.rows, args.cols) {
        config.window = Some(WindowSize::new(rows, cols));
    }
    if config.pty && config.window.is_none() {
        config.window = relay::terminal_size();
    }
    if args.capture_stderr {
        config.stderr = StderrMode::Capture;
    }
    if let Some(cwd) = &args.cwd {
        config.cwd = Some(cwd.clone());
    }
    config.env.extend(args.env.iter().cloned());
    if let Some(watcher) = args.watcher {
        config.watcher = watcher;
    }

    config.validate()?;
    stdio_limits.validate()?;
    Ok((config, stdio_limits))
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_daemon={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Undo the non-blocking mode the transports put on our stdio, which is
/// shared with whatever started us.
fn restore_blocking() {
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO] {
        // SAFETY: F_GETFL/F_SETFL on our own standard descriptors.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 && flags & libc::O_NONBLOCK != 0 {
                libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let (config, stdio_limits) = build_config(&args)?;
    info!(args = ?config.args, pty = config.pty, "bridge daemon starting");

    let outcome = event_loop::block_on(relay::run(config, stdio_limits))
        .context("Failed to start event loop")?;
    restore_blocking();

    let returncode = outcome?;
    let status = relay::exit_status(returncode);
    debug!(?returncode, status, "bridge daemon finished");
    std::process::exit(status);
}
