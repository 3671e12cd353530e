//! Spooler
//!
//! Reads a descriptor to end-of-file from a dedicated worker thread. Used
//! for captured stderr, and by the base transport for descriptors readiness
//! polling refuses (regular files, `/dev/null`).
//!
//! The Spooler duplicates the descriptor it is given, so the caller keeps
//! ownership of its own copy. The worker thread owns the duplicate and
//! closes it at end-of-file; chunks travel to the loop thread over a tokio
//! channel, whose closure doubles as the end-of-file signal.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use super::fd;

/// Bytes read per `read(2)` call
const SPOOL_CHUNK_SIZE: usize = 64 * 1024;

/// Accumulates everything readable from a descriptor until EOF.
pub struct Spooler {
    /// Number of the duplicate, or -1 once EOF has been observed
    fd: Cell<RawFd>,
    contents: RefCell<Vec<u8>>,
    chunks: RefCell<UnboundedReceiver<Vec<u8>>>,
    /// Dropping the write end wakes the worker for cancellation
    cancel: Option<OwnedFd>,
}

impl Spooler {
    /// Start spooling from a duplicate of `fd`.
    ///
    /// Fails with `EBADF` for an invalid descriptor, before any other
    /// resource is created.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let source = fd::dup_cloexec(fd)?;
        let raw = source.as_raw_fd();
        let (wake, cancel) = fd::pipe_cloexec()?;
        let (tx, rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("bridge-spooler".into())
            .spawn(move || spool(source, wake, tx))?;

        debug!(fd = raw, "spooler started");
        Ok(Self {
            fd: Cell::new(raw),
            contents: RefCell::new(Vec::new()),
            chunks: RefCell::new(rx),
            cancel: Some(cancel),
        })
    }

    /// Everything spooled so far. Never blocks.
    pub fn get(&self) -> Vec<u8> {
        self.drain();
        self.contents.borrow().clone()
    }

    /// Everything spooled so far, resetting the accumulator.
    pub fn take(&self) -> Vec<u8> {
        self.drain();
        std::mem::take(&mut *self.contents.borrow_mut())
    }

    /// The spooled descriptor's number, or -1 once EOF has been observed.
    pub fn fd(&self) -> RawFd {
        self.drain();
        self.fd.get()
    }

    /// Whether the source reached EOF and every chunk has been collected.
    pub fn is_finished(&self) -> bool {
        self.fd() < 0
    }

    /// Wait for the next chunk, bypassing the accumulator.
    ///
    /// Returns `None` at end-of-file. Meant for a single streaming consumer
    /// that never calls [`Spooler::get`].
    pub(crate) async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.get_mut().recv().await;
        if chunk.is_none() {
            self.fd.set(-1);
        }
        chunk
    }

    fn drain(&self) {
        let mut chunks = self.chunks.borrow_mut();
        let mut contents = self.contents.borrow_mut();
        loop {
            match chunks.try_recv() {
                Ok(chunk) => contents.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fd.set(-1);
                    break;
                }
            }
        }
    }
}

impl Drop for Spooler {
    fn drop(&mut self) {
        // Closing the write end raises POLLHUP on the worker's wake-up pipe
        drop(self.cancel.take());
    }
}

impl std::fmt::Debug for Spooler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spooler")
            .field("fd", &self.fd.get())
            .field("buffered", &self.contents.borrow().len())
            .finish()
    }
}

/// Worker: read `source` until EOF, error, or cancellation.
fn spool(source: OwnedFd, wake: OwnedFd, tx: UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; SPOOL_CHUNK_SIZE];
    let mut total = 0usize;
    loop {
        let mut fds = [
            libc::pollfd {
                fd: source.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a valid array of two pollfd structs.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            debug!(error = %err, "spooler poll failed");
            break;
        }
        if fds[1].revents != 0 {
            debug!(bytes = total, "spooler cancelled");
            break;
        }
        if fds[0].revents == 0 {
            continue;
        }
        match fd::read(source.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                trace!(bytes = n, "spooled chunk");
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                debug!(error = %err, "spooler read failed, treating as EOF");
                break;
            }
        }
    }
    debug!(fd = source.as_raw_fd(), bytes = total, "spooler finished");
    // `source` and `tx` drop here: descriptor closed, EOF visible to the loop
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_finished(spooler: &Spooler) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !spooler.is_finished() {
            assert!(Instant::now() < deadline, "spooler did not finish");
            thread::yield_now();
        }
    }

    #[test]
    fn test_bad_fd() {
        let err = Spooler::new(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_take_resets() {
        let (reader, writer) = fd::pipe_cloexec().unwrap();
        let spooler = Spooler::new(reader.as_raw_fd()).unwrap();
        drop(reader);

        fd::write(writer.as_raw_fd(), b"abc").unwrap();
        drop(writer);
        wait_finished(&spooler);

        assert_eq!(spooler.take(), b"abc");
        assert_eq!(spooler.take(), b"");
        assert_eq!(spooler.fd(), -1);
    }

    #[test]
    fn test_drop_before_eof_stops_worker() {
        let (reader, writer) = fd::pipe_cloexec().unwrap();
        let spooler = Spooler::new(reader.as_raw_fd()).unwrap();
        drop(reader);
        drop(spooler);

        // Once the worker exits, the last read end is gone
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match fd::write(writer.as_raw_fd(), b"x") {
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => break,
                _ => {
                    assert!(Instant::now() < deadline, "spooler kept the pipe open");
                    thread::yield_now();
                }
            }
        }
    }
}
