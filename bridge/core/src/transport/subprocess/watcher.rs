//! Child exit watching
//!
//! Two strategies behind one trait:
//! - `PidFdWatcher`: waits for readiness on a process descriptor
//!   (`pidfd_open`, Linux 5.3+), then reaps
//! - `SignalWatcher`: waits for `SIGCHLD` and reaps with `WNOHANG`
//!
//! Either way the child is reaped exactly once, by `waitpid` on its own pid,
//! so children spawned elsewhere in the process are never stolen.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::OnceLock;

use futures::future::{FutureExt, LocalBoxFuture};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;

use crate::transport::config::WatcherStrategy;

/// Waits for a child to exit and returns its encoded status: the exit code,
/// or minus the signal number for a signal death.
pub trait ChildWatcher {
    fn name(&self) -> &'static str;

    fn wait(&self, pid: Pid) -> LocalBoxFuture<'static, io::Result<i32>>;
}

/// Pick the watcher for `strategy`.
pub(crate) fn select(strategy: WatcherStrategy) -> Rc<dyn ChildWatcher> {
    match strategy {
        WatcherStrategy::PidFd => Rc::new(PidFdWatcher::default()),
        WatcherStrategy::Signal => Rc::new(SignalWatcher),
        WatcherStrategy::Auto if pidfd_supported() => Rc::new(PidFdWatcher::default()),
        WatcherStrategy::Auto => Rc::new(SignalWatcher),
    }
}

/// Whether this kernel supports `pidfd_open`. Probed once per process.
pub fn pidfd_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let supported = pidfd_open(nix::unistd::getpid()).is_ok();
        debug!(supported, "probed pidfd support");
        supported
    })
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: Pid) -> io::Result<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and touches no memory.
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the syscall returned a fresh descriptor (always close-on-exec).
    Ok(unsafe { OwnedFd::from_raw_fd(rc as RawFd) })
}

#[cfg(not(target_os = "linux"))]
fn pidfd_open(_pid: Pid) -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// Map a wait status to the encoded return code; `None` while still running.
pub(crate) fn decode_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(-(signal as i32)),
        _ => None,
    }
}

/// Reap `pid` if it has exited.
fn try_reap(pid: Pid) -> io::Result<Option<i32>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => Ok(decode_status(status)),
        Err(Errno::EINTR) => Ok(None),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Opens a process descriptor for a pid
pub type PidFdOpener = fn(Pid) -> io::Result<OwnedFd>;

/// Exit watching through a process descriptor. Falls back to `SIGCHLD`
/// for a child whose descriptor cannot be opened.
#[derive(Debug, Clone, Copy)]
pub struct PidFdWatcher {
    open: PidFdOpener,
}

impl PidFdWatcher {
    /// Watcher opening descriptors with `open` instead of `pidfd_open(2)`.
    pub fn with_opener(open: PidFdOpener) -> Self {
        Self { open }
    }
}

impl Default for PidFdWatcher {
    fn default() -> Self {
        Self { open: pidfd_open }
    }
}

impl ChildWatcher for PidFdWatcher {
    fn name(&self) -> &'static str {
        "pidfd"
    }

    fn wait(&self, pid: Pid) -> LocalBoxFuture<'static, io::Result<i32>> {
        let open = self.open;
        async move {
            let pidfd = match open(pid) {
                Ok(fd) => fd,
                Err(err) => {
                    debug!(pid = pid.as_raw(), error = %err, "pidfd unavailable, falling back to SIGCHLD");
                    return SignalWatcher.wait(pid).await;
                }
            };
            let pidfd = AsyncFd::with_interest(pidfd, Interest::READABLE)?;
            loop {
                let mut guard = pidfd.readable().await?;
                if let Some(code) = try_reap(pid)? {
                    return Ok(code);
                }
                guard.clear_ready();
            }
        }
        .boxed_local()
    }
}

/// Exit watching through `SIGCHLD`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalWatcher;

impl ChildWatcher for SignalWatcher {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn wait(&self, pid: Pid) -> LocalBoxFuture<'static, io::Result<i32>> {
        async move {
            // Register before the first reap attempt so no exit slips between
            let mut sigchld = signal(SignalKind::child())?;
            loop {
                if let Some(code) = try_reap(pid)? {
                    return Ok(code);
                }
                if sigchld.recv().await.is_none() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "SIGCHLD stream closed",
                    ));
                }
            }
        }
        .boxed_local()
    }
}
