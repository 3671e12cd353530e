//! Base transport
//!
//! The machinery shared by the subprocess and stdio transports:
//!
//! - a read loop delivering `data_received`/`eof_received`, honouring
//!   `pause_reading`/`resume_reading`
//! - a write path that writes immediately when it can and otherwise queues
//!   into a backlog drained by a flush task, with watermark flow control
//! - half-close (`write_eof`), `close` after drain, and `abort`
//! - exactly-once, always-deferred delivery of `connection_lost`
//!
//! Descriptors that readiness polling refuses fall back to a [`Spooler`] on
//! the read side and to direct writes on the write side (such files are
//! always writable).
//!
//! # Borrow discipline
//!
//! State lives in a `RefCell`. Every method takes what it needs from the
//! state, releases the borrow, and only then runs protocol callbacks, so
//! protocols can re-enter the transport from any callback.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::fd;
use super::flow_control::{FlowControl, FlowStats, WriteLimits};
use super::spooler::Spooler;
use super::traits::{EofAction, Protocol};
use crate::event_loop::call_soon;

/// Bytes requested per `read(2)` on pollable descriptors
const READ_CHUNK_SIZE: usize = 256 * 1024;

/// Backoff for direct writes that hit `EAGAIN`
const DIRECT_RETRY_DELAY: Duration = Duration::from_millis(10);

// =============================================================================
// Descriptor plumbing
// =============================================================================

/// Read side of a transport.
pub(crate) enum ReadSource {
    Poll(Rc<AsyncFd<OwnedFd>>),
    Spool(Spooler),
}

impl ReadSource {
    /// Register `fd` for readiness, or spool it when it cannot be polled.
    pub(crate) fn open(fd: OwnedFd) -> io::Result<Self> {
        match AsyncFd::with_interest(fd.try_clone()?, Interest::READABLE) {
            Ok(afd) => {
                fd::set_nonblocking(afd.get_ref(), true)?;
                Ok(Self::Poll(Rc::new(afd)))
            }
            Err(err) if fd::is_unpollable(&err) => {
                debug!(fd = fd.as_raw_fd(), "read side not pollable, spooling");
                Ok(Self::Spool(Spooler::new(fd.as_raw_fd())?))
            }
            Err(err) => Err(err),
        }
    }
}

/// Write side of a transport.
pub(crate) enum WriteSink {
    Poll(Rc<AsyncFd<OwnedFd>>),
    Direct(OwnedFd),
}

impl WriteSink {
    /// Register `fd` for readiness, or write directly when it cannot be
    /// polled.
    pub(crate) fn open(fd: OwnedFd) -> io::Result<Self> {
        match AsyncFd::with_interest(fd.try_clone()?, Interest::WRITABLE) {
            Ok(afd) => {
                fd::set_nonblocking(afd.get_ref(), true)?;
                Ok(Self::Poll(Rc::new(afd)))
            }
            Err(err) if fd::is_unpollable(&err) => {
                debug!(fd = fd.as_raw_fd(), "write side not pollable, writing directly");
                Ok(Self::Direct(fd))
            }
            Err(err) => Err(err),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Poll(afd) => afd.as_raw_fd(),
            Self::Direct(fd) => fd.as_raw_fd(),
        }
    }
}

/// Register a descriptor used for both directions (a PTY master).
///
/// The same descriptor cannot be registered twice, so both sides share one
/// registration.
pub(crate) fn open_duplex(fd: OwnedFd) -> io::Result<(ReadSource, WriteSink)> {
    fd::set_nonblocking(&fd, true)?;
    let afd = Rc::new(AsyncFd::with_interest(
        fd,
        Interest::READABLE | Interest::WRITABLE,
    )?);
    Ok((ReadSource::Poll(afd.clone()), WriteSink::Poll(afd)))
}

// =============================================================================
// Core
// =============================================================================

#[derive(Default)]
struct CoreState {
    sink: Option<WriteSink>,
    flow: FlowControl,
    /// `write_eof` was requested; the write side shuts once drained
    eof_requested: bool,
    closing: bool,
    /// `connection_lost` has been scheduled
    lost: bool,
    reading: bool,
    read_eof: bool,
    reader: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

/// Shared base of every transport. `T` is the handle type the protocol
/// receives in `connection_made`.
pub(crate) struct TransportCore<T> {
    state: RefCell<CoreState>,
    protocol: RefCell<Option<Rc<dyn Protocol<T>>>>,
    resume: Notify,
    /// While held, an EOF-triggered close waits for `release_close`
    close_held: Cell<bool>,
    close_pending: Cell<bool>,
    name: &'static str,
}

impl<T: 'static> TransportCore<T> {
    pub(crate) fn new(
        name: &'static str,
        protocol: Rc<dyn Protocol<T>>,
        sink: Option<WriteSink>,
        limits: WriteLimits,
    ) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(CoreState {
                sink,
                flow: FlowControl::new(limits),
                reading: true,
                ..CoreState::default()
            }),
            protocol: RefCell::new(Some(protocol)),
            resume: Notify::new(),
            close_held: Cell::new(false),
            close_pending: Cell::new(false),
            name,
        })
    }

    pub(crate) fn protocol(&self) -> Option<Rc<dyn Protocol<T>>> {
        self.protocol.borrow().clone()
    }

    /// Spawn the read loop on `source`.
    pub(crate) fn start_reading(self: &Rc<Self>, source: ReadSource) {
        let handle = tokio::task::spawn_local(read_loop(self.clone(), source));
        let mut st = self.state.borrow_mut();
        if st.lost {
            handle.abort();
        } else {
            st.reader = Some(handle);
        }
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    pub(crate) fn pause_reading(&self) {
        let mut st = self.state.borrow_mut();
        if st.closing || st.read_eof || !st.reading {
            return;
        }
        st.reading = false;
        trace!(transport = self.name, "reading paused");
    }

    pub(crate) fn resume_reading(&self) {
        {
            let mut st = self.state.borrow_mut();
            if st.closing || st.read_eof || st.reading {
                return;
            }
            st.reading = true;
        }
        trace!(transport = self.name, "reading resumed");
        self.resume.notify_one();
    }

    pub(crate) fn is_reading(&self) -> bool {
        let st = self.state.borrow();
        st.reading && !st.read_eof && !st.closing
    }

    async fn wait_until_reading(&self) {
        while !self.is_reading() {
            self.resume.notified().await;
        }
    }

    fn deliver_data(&self, data: &[u8]) {
        self.state.borrow_mut().flow.record_read(data.len());
        trace!(transport = self.name, bytes = data.len(), "data received");
        if let Some(protocol) = self.protocol() {
            protocol.data_received(data);
        }
    }

    fn deliver_eof(&self) {
        {
            let mut st = self.state.borrow_mut();
            if st.lost || st.read_eof {
                return;
            }
            st.read_eof = true;
            st.reading = false;
        }
        debug!(transport = self.name, "EOF on read side");
        let Some(protocol) = self.protocol() else {
            return;
        };
        match protocol.eof_received() {
            EofAction::Close => self.close_after_eof(),
            EofAction::KeepOpen => debug!(transport = self.name, "protocol keeps transport open after EOF"),
        }
    }

    fn close_after_eof(&self) {
        if self.close_held.get() {
            debug!(transport = self.name, "close deferred until child exits");
            self.close_pending.set(true);
        } else {
            self.close();
        }
    }

    /// Defer EOF-triggered closing until [`TransportCore::release_close`].
    pub(crate) fn hold_close(&self) {
        self.close_held.set(true);
    }

    /// Lift the hold, performing a deferred close if one is pending.
    pub(crate) fn release_close(&self) {
        self.close_held.set(false);
        if self.close_pending.replace(false) {
            self.close();
        }
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    pub(crate) fn write(self: &Rc<Self>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let (start_flush, pause) = {
            let mut st = self.state.borrow_mut();
            if st.closing {
                debug!(transport = self.name, bytes = data.len(), "ignoring write on closing transport");
                return;
            }
            if st.eof_requested {
                warn!(transport = self.name, bytes = data.len(), "ignoring write after write_eof");
                return;
            }
            let Some(raw) = st.sink.as_ref().map(WriteSink::raw_fd) else {
                return;
            };

            if st.flow.buffer.is_empty() {
                let written = match fd::write(raw, data) {
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(err) => {
                        drop(st);
                        debug!(transport = self.name, error = %err, "write failed");
                        self.abort_with(Some(err));
                        return;
                    }
                };
                st.flow.written_direct(written);
                if written == data.len() {
                    return;
                }
                // Backlog was empty, so no flush task is running
                (true, st.flow.enqueue(&data[written..]))
            } else {
                (false, st.flow.enqueue(data))
            }
        };

        if start_flush {
            let handle = tokio::task::spawn_local(flush_loop(self.clone()));
            self.state.borrow_mut().flusher = Some(handle);
        }
        if pause {
            debug!(transport = self.name, size = self.write_buffer_size(), "pausing protocol writes");
            if let Some(protocol) = self.protocol() {
                protocol.pause_writing();
            }
        }
    }

    /// Write as much of the backlog's front as the OS takes.
    fn write_front(&self, raw: RawFd) -> io::Result<bool> {
        let mut st = self.state.borrow_mut();
        let n = fd::write(raw, st.flow.buffer.front())?;
        Ok(st.flow.written(n))
    }

    /// Post-write bookkeeping: resume the protocol, finish a requested
    /// half-close or close once drained. Returns true when drained.
    fn settle_after_flush(&self, resume: bool) -> bool {
        let (drained, eof_requested, closing) = {
            let st = self.state.borrow();
            (st.flow.buffer.is_empty(), st.eof_requested, st.closing)
        };
        if drained && eof_requested {
            self.shutdown_write();
        }
        if resume {
            debug!(transport = self.name, "resuming protocol writes");
            if let Some(protocol) = self.protocol() {
                protocol.resume_writing();
            }
        }
        if drained && closing {
            self.abort_with(None);
        }
        drained
    }

    pub(crate) fn write_eof(&self) {
        let drained = {
            let mut st = self.state.borrow_mut();
            if st.closing || st.eof_requested {
                return;
            }
            st.eof_requested = true;
            st.flow.buffer.is_empty()
        };
        if drained {
            self.shutdown_write();
        } else {
            debug!(transport = self.name, size = self.write_buffer_size(), "write_eof deferred until backlog drains");
        }
    }

    fn shutdown_write(&self) {
        let sink = self.state.borrow_mut().sink.take();
        if let Some(sink) = sink {
            debug!(transport = self.name, fd = sink.raw_fd(), "write side shut down");
        }
    }

    /// Raw descriptor of the write side, while it is open.
    pub(crate) fn sink_fd(&self) -> Option<RawFd> {
        self.state.borrow().sink.as_ref().map(WriteSink::raw_fd)
    }

    pub(crate) fn write_buffer_size(&self) -> usize {
        self.state.borrow().flow.buffer.len()
    }

    pub(crate) fn write_limits(&self) -> WriteLimits {
        self.state.borrow().flow.limits()
    }

    pub(crate) fn set_write_limits(&self, limits: WriteLimits) {
        let pause = self.state.borrow_mut().flow.set_limits(limits);
        if pause {
            if let Some(protocol) = self.protocol() {
                protocol.pause_writing();
            }
        }
    }

    pub(crate) fn stats(&self) -> FlowStats {
        self.state.borrow().flow.stats()
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    pub(crate) fn is_closing(&self) -> bool {
        self.state.borrow().closing
    }

    /// Stop reading; close once the backlog has drained.
    pub(crate) fn close(&self) {
        let (drained, reader) = {
            let mut st = self.state.borrow_mut();
            if st.closing {
                return;
            }
            st.closing = true;
            st.reading = false;
            (st.flow.buffer.is_empty(), st.reader.take())
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        if drained {
            self.abort_with(None);
        } else {
            debug!(transport = self.name, size = self.write_buffer_size(), "close deferred until backlog drains");
        }
    }

    pub(crate) fn abort(&self) {
        self.abort_with(None);
    }

    /// Tear everything down now and schedule `connection_lost(error)`.
    pub(crate) fn abort_with(&self, error: Option<io::Error>) {
        let (sink, reader, flusher) = {
            let mut st = self.state.borrow_mut();
            if st.lost {
                return;
            }
            st.lost = true;
            st.closing = true;
            st.reading = false;
            (st.sink.take(), st.reader.take(), st.flusher.take())
        };
        drop(sink);
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(flusher) = flusher {
            flusher.abort();
        }
        match &error {
            Some(err) => debug!(transport = self.name, error = %err, "transport aborted"),
            None => debug!(transport = self.name, "transport closed"),
        }

        let protocol = self.protocol.borrow_mut().take();
        call_soon(move || {
            if let Some(protocol) = protocol {
                protocol.connection_lost(error);
            }
        });
    }
}

// =============================================================================
// Tasks
// =============================================================================

enum ReadOutcome {
    Data(usize),
    Eof,
    Paused,
}

async fn read_loop<T: 'static>(core: Rc<TransportCore<T>>, mut source: ReadSource) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut held: Option<Vec<u8>> = None;
    loop {
        core.wait_until_reading().await;

        match &mut source {
            ReadSource::Poll(afd) => match poll_read(afd, &core, &mut buf).await {
                ReadOutcome::Data(n) => core.deliver_data(&buf[..n]),
                ReadOutcome::Eof => {
                    core.deliver_eof();
                    break;
                }
                ReadOutcome::Paused => continue,
            },
            ReadSource::Spool(spooler) => {
                let chunk = match held.take() {
                    Some(chunk) => Some(chunk),
                    None => spooler.next_chunk().await,
                };
                match chunk {
                    Some(chunk) if !core.is_reading() => held = Some(chunk),
                    Some(chunk) => core.deliver_data(&chunk),
                    None if !core.is_reading() => continue,
                    None => {
                        core.deliver_eof();
                        break;
                    }
                }
            }
        }

        if core.is_closing() {
            break;
        }
    }
    trace!(transport = core.name, "read loop finished");
}

async fn poll_read<T: 'static>(
    afd: &AsyncFd<OwnedFd>,
    core: &TransportCore<T>,
    buf: &mut [u8],
) -> ReadOutcome {
    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                debug!(transport = core.name, error = %err, "readiness failed, treating as EOF");
                return ReadOutcome::Eof;
            }
        };
        if !core.is_reading() {
            return ReadOutcome::Paused;
        }
        match guard.try_io(|inner| fd::read(inner.as_raw_fd(), buf)) {
            Ok(Ok(0)) => return ReadOutcome::Eof,
            Ok(Ok(n)) => return ReadOutcome::Data(n),
            // EIO from a PTY master whose slave is gone lands here too
            Ok(Err(err)) => {
                debug!(transport = core.name, error = %err, "read failed, treating as EOF");
                return ReadOutcome::Eof;
            }
            Err(_would_block) => continue,
        }
    }
}

async fn flush_loop<T: 'static>(core: Rc<TransportCore<T>>) {
    loop {
        let target = {
            let st = core.state.borrow();
            match &st.sink {
                Some(WriteSink::Poll(afd)) => FlushTarget::Poll(afd.clone()),
                Some(WriteSink::Direct(fd)) => FlushTarget::Direct(fd.as_raw_fd()),
                None => return,
            }
        };

        let result = match target {
            FlushTarget::Poll(afd) => {
                let mut guard = match afd.writable().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        core.abort_with(Some(err));
                        return;
                    }
                };
                match guard.try_io(|inner| core.write_front(inner.as_raw_fd())) {
                    Ok(result) => result,
                    Err(_would_block) => continue,
                }
            }
            FlushTarget::Direct(raw) => match core.write_front(raw) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(DIRECT_RETRY_DELAY).await;
                    continue;
                }
                other => other,
            },
        };

        match result {
            Ok(resume) => {
                if core.settle_after_flush(resume) {
                    return;
                }
            }
            Err(err) => {
                debug!(transport = core.name, error = %err, "flush failed");
                core.abort_with(Some(err));
                return;
            }
        }
    }
}

enum FlushTarget {
    Poll(Rc<AsyncFd<OwnedFd>>),
    Direct(RawFd),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::block_on;
    use std::os::fd::AsRawFd;

    #[derive(Default)]
    struct Events {
        log: RefCell<Vec<String>>,
    }

    impl Protocol<()> for Events {
        fn connection_made(&self, _transport: ()) {}
        fn data_received(&self, data: &[u8]) {
            self.log
                .borrow_mut()
                .push(format!("data:{}", String::from_utf8_lossy(data)));
        }
        fn eof_received(&self) -> EofAction {
            self.log.borrow_mut().push("eof".into());
            EofAction::KeepOpen
        }
        fn pause_writing(&self) {
            self.log.borrow_mut().push("pause".into());
        }
        fn resume_writing(&self) {
            self.log.borrow_mut().push("resume".into());
        }
        fn connection_lost(&self, error: Option<io::Error>) {
            let kind = error.map_or("none".to_string(), |e| format!("{:?}", e.kind()));
            self.log.borrow_mut().push(format!("lost:{kind}"));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_close_defers_connection_lost() {
        block_on(async {
            let events = Rc::new(Events::default());
            let core = TransportCore::<()>::new("test", events.clone(), None, WriteLimits::default());

            core.close();
            core.close();
            assert!(core.is_closing());
            assert!(events.log.borrow().is_empty());

            settle().await;
            assert_eq!(*events.log.borrow(), vec!["lost:none"]);
            assert!(core.protocol().is_none());
        })
        .unwrap();
    }

    #[test]
    fn test_pipe_read_then_eof() {
        block_on(async {
            let (reader, writer) = fd::pipe_cloexec().unwrap();
            let events = Rc::new(Events::default());
            let core = TransportCore::<()>::new("test", events.clone(), None, WriteLimits::default());
            core.start_reading(ReadSource::open(reader).unwrap());

            fd::write(writer.as_raw_fd(), b"hi").unwrap();
            drop(writer);

            for _ in 0..100 {
                if events.log.borrow().iter().any(|e| e == "eof") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(*events.log.borrow(), vec!["data:hi", "eof"]);
            assert!(!core.is_reading());
            assert!(!core.is_closing());
        })
        .unwrap();
    }

    #[test]
    fn test_backlog_pauses_and_broken_pipe_aborts() {
        block_on(async {
            let (reader, writer) = fd::pipe_cloexec().unwrap();
            let events = Rc::new(Events::default());
            let sink = WriteSink::open(writer).unwrap();
            let core = TransportCore::<()>::new(
                "test",
                events.clone(),
                Some(sink),
                WriteLimits { high: 1024, low: 256 },
            );

            // Nobody reads: the pipe fills, then the backlog crosses `high`
            while !events.log.borrow().iter().any(|e| e == "pause") {
                core.write(&[b'x'; 4096]);
            }
            assert!(core.write_buffer_size() > 1024);

            drop(reader);
            for _ in 0..100 {
                if events.log.borrow().iter().any(|e| e.starts_with("lost")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(events.log.borrow().last().unwrap(), "lost:BrokenPipe");
            assert_eq!(core.stats().pauses(), 1);
        })
        .unwrap();
    }

    #[test]
    fn test_write_after_eof_is_ignored() {
        block_on(async {
            let (reader, writer) = fd::pipe_cloexec().unwrap();
            let events = Rc::new(Events::default());
            let sink = WriteSink::open(writer).unwrap();
            let core = TransportCore::<()>::new("test", events, Some(sink), WriteLimits::default());

            core.write(b"a");
            core.write_eof();
            core.write(b"b");
            assert!(core.sink_fd().is_none());

            let mut buf = [0u8; 8];
            assert_eq!(fd::read(reader.as_raw_fd(), &mut buf).unwrap(), 1);
            assert_eq!(fd::read(reader.as_raw_fd(), &mut buf).unwrap(), 0);
        })
        .unwrap();
    }
}
