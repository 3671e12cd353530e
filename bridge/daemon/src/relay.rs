//! Stdio <-> child relay
//!
//! One `Relay` serves as the protocol for both transports. Bytes read on
//! one side are written to the other, and backpressure is coupled: when one
//! side's write backlog crosses its high watermark, reading stops on the
//! side feeding it until the backlog drains.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use anyhow::{Context, Result};
use bridge_core::transport::{
    EofAction, Protocol, StdioTransport, SubprocessConfig, SubprocessTransport, Transport,
    WindowSize, WriteLimits,
};
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Shared relay state.
#[derive(Default)]
pub struct Relay {
    child: RefCell<Option<SubprocessTransport>>,
    stdio: RefCell<Option<StdioTransport>>,
    child_lost: Cell<bool>,
    stdio_lost: Cell<bool>,
    /// Last byte relayed to the child ended a line
    mid_line: Cell<bool>,
    done: Notify,
}

impl Relay {
    fn child(&self) -> Option<SubprocessTransport> {
        self.child.borrow().clone()
    }

    fn stdio(&self) -> Option<StdioTransport> {
        self.stdio.borrow().clone()
    }

    fn check_done(&self) {
        if self.child_lost.get() && self.stdio_lost.get() {
            self.done.notify_one();
        }
    }

    /// Forward a signal the bridge received to the child.
    fn forward(&self, signal: Signal) {
        let Some(child) = self.child() else {
            return;
        };
        info!(?signal, pid = child.pid(), "forwarding signal to child");
        if let Err(err) = child.send_signal(signal) {
            warn!(error = %err, "failed to forward signal");
        }
    }

    /// Copy our terminal's size to the child's PTY.
    fn resize(&self) {
        let Some(child) = self.child() else {
            return;
        };
        if !child.is_pty() || child.is_closing() {
            return;
        }
        if let Some(size) = terminal_size() {
            if let Err(err) = child.set_window_size(size) {
                debug!(error = %err, "failed to resize child terminal");
            }
        }
    }
}

impl Protocol<SubprocessTransport> for Relay {
    fn connection_made(&self, transport: SubprocessTransport) {
        *self.child.borrow_mut() = Some(transport);
    }

    fn data_received(&self, data: &[u8]) {
        if let Some(stdio) = self.stdio() {
            stdio.write(data);
        }
    }

    fn eof_received(&self) -> EofAction {
        debug!("child closed its output");
        EofAction::Close
    }

    fn pause_writing(&self) {
        if let Some(stdio) = self.stdio() {
            stdio.pause_reading();
        }
    }

    fn resume_writing(&self) {
        if let Some(stdio) = self.stdio() {
            stdio.resume_reading();
        }
    }

    fn connection_lost(&self, error: Option<io::Error>) {
        if let Some(err) = error {
            warn!(error = %err, "child transport failed");
        }
        self.child_lost.set(true);
        // Flush whatever output is still queued, then finish
        match self.stdio() {
            Some(stdio) => stdio.close(),
            None => self.stdio_lost.set(true),
        }
        self.check_done();
    }

    fn process_exited(&self) {
        if let Some(child) = self.child() {
            info!(pid = child.pid(), returncode = ?child.returncode(), "child exited");
        }
    }
}

impl Protocol<StdioTransport> for Relay {
    fn connection_made(&self, transport: StdioTransport) {
        *self.stdio.borrow_mut() = Some(transport);
    }

    fn data_received(&self, data: &[u8]) {
        if let Some(child) = self.child() {
            child.write(data);
        }
        if let Some(&last) = data.last() {
            self.mid_line.set(last != b'\n' && last != b'\r');
        }
    }

    fn eof_received(&self) -> EofAction {
        debug!("stdin closed");
        if let Some(child) = self.child() {
            if child.can_write_eof() {
                if let Err(err) = child.write_eof() {
                    debug!(error = %err, "failed to half-close child");
                }
            } else if let Some(eof) = child.terminal_eof() {
                // The first EOF character only flushes a partial line
                let eofs = if self.mid_line.get() { 2 } else { 1 };
                debug!(eofs, "sending terminal EOF to child");
                child.write(&vec![eof; eofs]);
            }
        }
        // Keep stdout open for the rest of the child's output
        EofAction::KeepOpen
    }

    fn pause_writing(&self) {
        if let Some(child) = self.child() {
            child.pause_reading();
        }
    }

    fn resume_writing(&self) {
        if let Some(child) = self.child() {
            child.resume_reading();
        }
    }

    fn connection_lost(&self, error: Option<io::Error>) {
        if let Some(err) = error {
            warn!(error = %err, "stdio transport failed");
        }
        self.stdio_lost.set(true);
        if !self.child_lost.get() {
            // Nobody is listening any more
            if let Some(child) = self.child() {
                if let Err(err) = child.terminate() {
                    debug!(error = %err, "failed to terminate child");
                }
            }
        }
        self.check_done();
    }
}

/// Run `config` with our stdio attached. Returns the child's status.
pub async fn run(config: SubprocessConfig, stdio_limits: WriteLimits) -> Result<Option<i32>> {
    let program = config.args.first().cloned().unwrap_or_default();
    let relay = Rc::new(Relay::default());

    let child = SubprocessTransport::spawn(relay.clone(), config)
        .with_context(|| format!("failed to start '{program}'"))?;
    if let Err(err) = StdioTransport::from_process_stdio(relay.clone(), stdio_limits) {
        if let Err(kill_err) = child.kill() {
            debug!(error = %kill_err, "failed to kill child");
        }
        return Err(err).context("failed to attach to stdio");
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigwinch = signal(SignalKind::window_change())?;

    loop {
        tokio::select! {
            _ = relay.done.notified() => break,
            _ = sigint.recv() => relay.forward(Signal::SIGINT),
            _ = sigterm.recv() => relay.forward(Signal::SIGTERM),
            _ = sighup.recv() => relay.forward(Signal::SIGHUP),
            _ = sigwinch.recv() => relay.resize(),
        }
    }

    let stderr = child.stderr(true);
    if !stderr.is_empty() {
        warn!(stderr = %stderr.trim_end(), "child wrote to stderr");
    }
    Ok(child.returncode())
}

/// Size of the terminal on our stdin, if it is one.
pub fn terminal_size() -> Option<WindowSize> {
    use std::io::IsTerminal;
    use std::os::fd::AsRawFd;

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return None;
    }
    // SAFETY: winsize is plain old data; zero is a valid bit pattern.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: ws is a valid, writable winsize for the duration of the call.
    if unsafe { libc::ioctl(stdin.as_raw_fd(), libc::TIOCGWINSZ, &mut ws as *mut libc::winsize) } < 0 {
        return None;
    }
    Some(WindowSize::new(ws.ws_row, ws.ws_col))
}

/// Process exit status for a child return code: the code itself, or
/// `128 + signal` for a signal death.
pub fn exit_status(returncode: Option<i32>) -> i32 {
    match returncode {
        Some(code) if code >= 0 => code,
        Some(signal) => 128 - signal,
        None => 1,
    }
}
