//! Stdio Transport
//!
//! Connects a pair of already-open descriptors (normally the bridge's own
//! stdin and stdout, often both ends of its session terminal) to a
//! [`Protocol`]. A terminal session cannot half-close, so `write_eof` is a
//! usage error; the peer going away shows up as `eof_received`.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use tracing::debug;

use super::base::{ReadSource, TransportCore, WriteSink};
use super::flow_control::{FlowStats, WriteLimits};
use super::traits::{Protocol, Transport, TransportError};

/// Handle to a stdin/stdout transport. Cheap to clone.
#[derive(Clone)]
pub struct StdioTransport {
    core: Rc<TransportCore<StdioTransport>>,
}

impl StdioTransport {
    /// Wrap `stdin` (read side) and `stdout` (write side).
    ///
    /// `connection_made` is delivered before this returns.
    pub fn new<P>(protocol: Rc<P>, stdin: OwnedFd, stdout: OwnedFd) -> Result<Self, TransportError>
    where
        P: Protocol<StdioTransport> + 'static,
    {
        Self::with_limits(protocol, stdin, stdout, WriteLimits::default())
    }

    /// Like [`StdioTransport::new`] with explicit write watermarks.
    pub fn with_limits<P>(
        protocol: Rc<P>,
        stdin: OwnedFd,
        stdout: OwnedFd,
        limits: WriteLimits,
    ) -> Result<Self, TransportError>
    where
        P: Protocol<StdioTransport> + 'static,
    {
        limits.validate()?;
        let source = ReadSource::open(stdin)?;
        let sink = WriteSink::open(stdout)?;

        let protocol: Rc<dyn Protocol<StdioTransport>> = protocol;
        let core = TransportCore::new("stdio", protocol.clone(), Some(sink), limits);
        let transport = Self { core: core.clone() };
        debug!("stdio transport started");

        protocol.connection_made(transport.clone());
        core.start_reading(source);
        Ok(transport)
    }

    /// Wrap duplicates of this process's fds 0 and 1.
    pub fn from_process_stdio<P>(protocol: Rc<P>, limits: WriteLimits) -> Result<Self, TransportError>
    where
        P: Protocol<StdioTransport> + 'static,
    {
        let stdin = io::stdin().as_fd().try_clone_to_owned()?;
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        Self::with_limits(protocol, stdin, stdout, limits)
    }

    /// Flow-control counters.
    pub fn stats(&self) -> FlowStats {
        self.core.stats()
    }
}

impl Transport for StdioTransport {
    fn write(&self, data: &[u8]) {
        self.core.write(data);
    }

    fn write_eof(&self) -> Result<(), TransportError> {
        Err(TransportError::InvalidOperation(
            "write_eof() is not supported on a stdio transport".into(),
        ))
    }

    fn can_write_eof(&self) -> bool {
        false
    }

    fn close(&self) {
        self.core.close();
    }

    fn abort(&self) {
        self.core.abort();
    }

    fn is_closing(&self) -> bool {
        self.core.is_closing()
    }

    fn pause_reading(&self) {
        self.core.pause_reading();
    }

    fn resume_reading(&self) {
        self.core.resume_reading();
    }

    fn is_reading(&self) -> bool {
        self.core.is_reading()
    }

    fn write_buffer_size(&self) -> usize {
        self.core.write_buffer_size()
    }

    fn set_write_buffer_limits(
        &self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<(), TransportError> {
        self.core.set_write_limits(WriteLimits::new(high, low)?);
        Ok(())
    }

    fn write_buffer_limits(&self) -> (usize, usize) {
        let limits = self.core.write_limits();
        (limits.low, limits.high)
    }
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("closing", &self.is_closing())
            .field("reading", &self.is_reading())
            .field("write_buffer_size", &self.write_buffer_size())
            .finish()
    }
}
