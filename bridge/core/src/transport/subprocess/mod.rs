//! Subprocess Transport
//!
//! Runs a child process and connects its stdin/stdout (or a pseudo-terminal)
//! to a [`Protocol`]. On top of the base transport contract it:
//!
//! - watches for child exit and reports it through `process_exited`
//! - records the exit status (exit code, or minus the terminating signal)
//! - forwards signals to the child
//! - optionally captures stderr into a [`Spooler`]
//! - resizes the PTY window
//!
//! # Closing
//!
//! When stdout reaches EOF and the protocol asks to close, closing waits for
//! the child to exit as well, so `connection_lost` always comes after both.
//! `close()` itself never kills the child.

mod spawn;
pub mod watcher;

use std::cell::Cell;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::rc::Rc;

use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcgetattr, SpecialCharacterIndices};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::base::{open_duplex, ReadSource, TransportCore, WriteSink};
use super::config::{StderrMode, SubprocessConfig, WindowSize};
use super::flow_control::{FlowStats, WriteLimits};
use super::spooler::Spooler;
use super::traits::{Protocol, Transport, TransportError};

pub use watcher::{pidfd_supported, ChildWatcher, PidFdWatcher, SignalWatcher};

struct Inner {
    core: Rc<TransportCore<SubprocessTransport>>,
    pid: Pid,
    returncode: Cell<Option<i32>>,
    stderr: Option<Spooler>,
    pty: bool,
    window: Cell<Option<WindowSize>>,
    watcher: &'static str,
}

/// Handle to a running (or exited) child process.
///
/// Cheap to clone; every clone refers to the same transport.
#[derive(Clone)]
pub struct SubprocessTransport {
    inner: Rc<Inner>,
}

impl SubprocessTransport {
    /// Spawn the child described by `config` and connect it to `protocol`.
    ///
    /// `connection_made` is delivered before this returns. Spawn failures
    /// (including a missing program) are returned here and leave nothing
    /// behind: a child that was already started is killed and reaped.
    pub fn spawn<P>(protocol: Rc<P>, config: SubprocessConfig) -> Result<Self, TransportError>
    where
        P: Protocol<SubprocessTransport> + 'static,
    {
        config.validate()?;
        let spawned = spawn::spawn_child(&config)?;

        let (source, sink) = match spawned.master {
            Some(master) => open_duplex(master)?,
            None => {
                let stdout = spawned.stdout.ok_or_else(|| missing("stdout"))?;
                let stdin = spawned.stdin.ok_or_else(|| missing("stdin"))?;
                (ReadSource::open(stdout)?, WriteSink::open(stdin)?)
            }
        };
        let stderr = match (config.stderr, spawned.stderr) {
            (StderrMode::Capture, Some(fd)) => Some(Spooler::new(fd.as_raw_fd())?),
            _ => None,
        };
        let watcher = watcher::select(config.watcher);

        let protocol: Rc<dyn Protocol<SubprocessTransport>> = protocol;
        let core = TransportCore::new("subprocess", protocol.clone(), Some(sink), config.write_limits);
        core.hold_close();

        // Nothing below can fail: the child is ours from here on
        let pid = spawned.guard.disarm();
        info!(pid = pid.as_raw(), pty = config.pty, watcher = watcher.name(), "subprocess transport started");

        let transport = Self {
            inner: Rc::new(Inner {
                core: core.clone(),
                pid,
                returncode: Cell::new(None),
                stderr,
                pty: config.pty,
                window: Cell::new(config.window),
                watcher: watcher.name(),
            }),
        };

        protocol.connection_made(transport.clone());
        core.start_reading(source);

        let inner = transport.inner.clone();
        let exit = watcher.wait(pid);
        tokio::task::spawn_local(async move {
            match exit.await {
                Ok(code) => inner.on_exited(code),
                Err(err) => {
                    warn!(pid = inner.pid.as_raw(), error = %err, "lost track of child");
                    inner.core.release_close();
                }
            }
        });

        Ok(transport)
    }

    /// Process id of the child.
    pub fn pid(&self) -> u32 {
        self.inner.pid.as_raw() as u32
    }

    /// Exit status once known: the exit code, or minus the signal number
    /// that killed the child.
    pub fn returncode(&self) -> Option<i32> {
        self.inner.returncode.get()
    }

    /// Name of the exit-watching strategy in use ("pidfd" or "signal").
    pub fn watcher(&self) -> &'static str {
        self.inner.watcher
    }

    /// Deliver `signal` to the child. A no-op once the child has been
    /// reaped, since its pid may already belong to another process.
    pub fn send_signal(&self, signal: Signal) -> Result<(), TransportError> {
        let pid = self.inner.pid;
        if self.returncode().is_some() {
            debug!(pid = pid.as_raw(), ?signal, "child already exited, not signalling");
            return Ok(());
        }
        debug!(pid = pid.as_raw(), ?signal, "signalling child");
        kill(pid, signal).map_err(|source| TransportError::Signal {
            signal,
            pid: pid.as_raw(),
            source,
        })
    }

    /// Send `SIGTERM`.
    pub fn terminate(&self) -> Result<(), TransportError> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Send `SIGKILL`.
    pub fn kill(&self) -> Result<(), TransportError> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Captured stderr, decoded lossily. With `reset`, the capture buffer is
    /// cleared after reading. Empty when stderr is not captured.
    pub fn stderr(&self, reset: bool) -> String {
        let Some(spooler) = &self.inner.stderr else {
            return String::new();
        };
        let bytes = if reset { spooler.take() } else { spooler.get() };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Whether the child runs on a pseudo-terminal.
    pub fn is_pty(&self) -> bool {
        self.inner.pty
    }

    /// Last window size set on the PTY.
    pub fn window_size(&self) -> Option<WindowSize> {
        self.inner.window.get()
    }

    /// Resize the child's terminal. The child sees `SIGWINCH`.
    pub fn set_window_size(&self, size: WindowSize) -> Result<(), TransportError> {
        if !self.inner.pty {
            return Err(TransportError::InvalidOperation(
                "set_window_size() requires a PTY".into(),
            ));
        }
        let fd = self
            .inner
            .core
            .sink_fd()
            .ok_or_else(|| TransportError::InvalidOperation("PTY is closed".into()))?;
        let winsize = nix::pty::Winsize::from(size);
        // SAFETY: fd is the open PTY master and winsize outlives the call.
        if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize as *const libc::winsize) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        debug!(pid = self.inner.pid.as_raw(), rows = size.rows, cols = size.cols, "window resized");
        self.inner.window.set(Some(size));
        Ok(())
    }

    /// The PTY's end-of-file character (`VEOF`, normally `^D`).
    ///
    /// A terminal cannot be half-closed; writing this character at the start
    /// of a line is how a reader on the child's side sees end-of-file.
    /// `None` for pipe transports and once the PTY is closed.
    pub fn terminal_eof(&self) -> Option<u8> {
        if !self.inner.pty {
            return None;
        }
        let fd = self.inner.core.sink_fd()?;
        // SAFETY: the master stays open while the core holds the sink.
        let master = unsafe { BorrowedFd::borrow_raw(fd) };
        match tcgetattr(master) {
            Ok(termios) => Some(termios.control_chars[SpecialCharacterIndices::VEOF as usize]),
            Err(errno) => {
                debug!(pid = self.inner.pid.as_raw(), %errno, "tcgetattr failed");
                None
            }
        }
    }

    /// Flow-control counters.
    pub fn stats(&self) -> FlowStats {
        self.inner.core.stats()
    }
}

impl Inner {
    fn on_exited(&self, code: i32) {
        self.returncode.set(Some(code));
        info!(pid = self.pid.as_raw(), returncode = code, "child exited");
        if !self.core.is_closing() {
            if let Some(protocol) = self.core.protocol() {
                protocol.process_exited();
            }
        }
        self.core.release_close();
    }
}

fn missing(stream: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("child {stream} was not piped"),
    ))
}

impl Transport for SubprocessTransport {
    fn write(&self, data: &[u8]) {
        self.inner.core.write(data);
    }

    fn write_eof(&self) -> Result<(), TransportError> {
        if self.inner.pty {
            return Err(TransportError::InvalidOperation(
                "write_eof() is not supported on a PTY".into(),
            ));
        }
        self.inner.core.write_eof();
        Ok(())
    }

    fn can_write_eof(&self) -> bool {
        !self.inner.pty
    }

    fn close(&self) {
        self.inner.core.close();
    }

    fn abort(&self) {
        self.inner.core.abort();
    }

    fn is_closing(&self) -> bool {
        self.inner.core.is_closing()
    }

    fn pause_reading(&self) {
        self.inner.core.pause_reading();
    }

    fn resume_reading(&self) {
        self.inner.core.resume_reading();
    }

    fn is_reading(&self) -> bool {
        self.inner.core.is_reading()
    }

    fn write_buffer_size(&self) -> usize {
        self.inner.core.write_buffer_size()
    }

    fn set_write_buffer_limits(
        &self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<(), TransportError> {
        self.inner.core.set_write_limits(WriteLimits::new(high, low)?);
        Ok(())
    }

    fn write_buffer_limits(&self) -> (usize, usize) {
        let limits = self.inner.core.write_limits();
        (limits.low, limits.high)
    }
}

impl fmt::Debug for SubprocessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubprocessTransport")
            .field("pid", &self.inner.pid.as_raw())
            .field("returncode", &self.returncode())
            .field("pty", &self.inner.pty)
            .field("closing", &self.is_closing())
            .finish()
    }
}
