//! Child process creation
//!
//! Builds a `std::process::Command` from a [`SubprocessConfig`], wiring the
//! child to pipes or to the slave side of a new pseudo-terminal, and hands
//! back the parent's descriptors. A [`SpawnGuard`] kills and reaps the
//! child unless the caller finishes setting it up.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{setsid, Pid};
use tracing::{debug, warn};

use crate::transport::config::{StderrMode, SubprocessConfig, WindowSize};
use crate::transport::fd;
use crate::transport::traits::TransportError;

impl From<WindowSize> for Winsize {
    fn from(size: WindowSize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Parent-side handles of a freshly spawned child.
pub(super) struct SpawnedChild {
    pub guard: SpawnGuard,
    /// Pipe mode only
    pub stdin: Option<OwnedFd>,
    /// Pipe mode only
    pub stdout: Option<OwnedFd>,
    /// Present with `StderrMode::Capture`
    pub stderr: Option<OwnedFd>,
    /// PTY mode only
    pub master: Option<OwnedFd>,
}

/// Kills and reaps the child on drop unless disarmed.
pub(super) struct SpawnGuard {
    pid: Pid,
    armed: bool,
}

impl SpawnGuard {
    fn new(pid: Pid) -> Self {
        Self { pid, armed: true }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Hand responsibility for the child to the caller.
    pub fn disarm(mut self) -> Pid {
        self.armed = false;
        self.pid
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(pid = self.pid.as_raw(), "transport setup failed, killing child");
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

/// Start the child described by `config`.
pub(super) fn spawn_child(config: &SubprocessConfig) -> Result<SpawnedChild, TransportError> {
    let (program, args) = config
        .args
        .split_first()
        .ok_or_else(|| TransportError::InvalidConfig("argument vector must not be empty".into()))?;

    let mut command = Command::new(program);
    command.args(args);
    if config.env_clear {
        command.env_clear();
    }
    command.envs(&config.env);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    command.stderr(match config.stderr {
        StderrMode::Discard => Stdio::null(),
        StderrMode::Inherit => Stdio::inherit(),
        StderrMode::Capture => Stdio::piped(),
    });

    let master = if config.pty {
        Some(attach_pty(&mut command, config.window, config.stderr)?)
    } else {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        None
    };

    let spawned = command.spawn();
    // Releases the parent's copies of the PTY slave
    drop(command);
    let mut child = spawned.map_err(|source| TransportError::Spawn {
        program: program.clone(),
        source,
    })?;

    let guard = SpawnGuard::new(Pid::from_raw(child.id() as i32));
    debug!(pid = guard.pid().as_raw(), program = %program, pty = config.pty, "spawned child");

    Ok(SpawnedChild {
        stdin: child.stdin.take().map(OwnedFd::from),
        stdout: child.stdout.take().map(OwnedFd::from),
        stderr: child.stderr.take().map(OwnedFd::from),
        master,
        guard,
    })
}

/// Open a PTY and make its slave the child's stdin, stdout and controlling
/// terminal. An inherited stderr goes to the terminal as well. Returns the
/// master.
fn attach_pty(
    command: &mut Command,
    window: Option<WindowSize>,
    stderr: StderrMode,
) -> io::Result<OwnedFd> {
    let winsize = window.map(Winsize::from);
    let pty = openpty(winsize.as_ref(), None).map_err(io::Error::from)?;
    fd::set_cloexec(&pty.master)?;
    fd::set_cloexec(&pty.slave)?;

    if stderr == StderrMode::Inherit {
        command.stderr(Stdio::from(pty.slave.try_clone()?));
    }
    command.stdin(Stdio::from(pty.slave.try_clone()?));
    command.stdout(Stdio::from(pty.slave));

    // SAFETY: the hook runs between fork and exec and only makes
    // async-signal-safe system calls.
    unsafe {
        command.pre_exec(|| {
            setsid()?;
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(pty.master)
}
