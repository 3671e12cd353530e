//! Transport Traits
//!
//! The two sides of every byte stream in the bridge:
//! - `Protocol`: the consumer, notified through callbacks
//! - `Transport`: the producer/sink the protocol drives
//!
//! A concrete transport hands a cloneable handle of itself to
//! [`Protocol::connection_made`]; the type parameter `T` of `Protocol` is
//! that handle type, so a protocol for a subprocess also gets access to
//! subprocess-only operations (signals, PTY resize, stderr).

use std::io;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

// =============================================================================
// Protocol
// =============================================================================

/// What the transport should do after [`Protocol::eof_received`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EofAction {
    /// Close the transport (after the child exits, for subprocesses).
    #[default]
    Close,
    /// Keep the transport open; the protocol will close it explicitly.
    KeepOpen,
}

/// Callback set a transport delivers events to.
///
/// Ordering guarantees:
/// - `connection_made` is the first callback
/// - `data_received` is never called after `eof_received`
/// - `eof_received` is delivered at most once
/// - `connection_lost` is the last callback, delivered exactly once, and
///   never from inside a transport method (always on a later loop turn)
///
/// Callbacks run with no transport state borrowed, so implementations may
/// call back into the transport from any of them.
pub trait Protocol<T> {
    /// The transport is ready. `transport` is a cheap handle to it.
    fn connection_made(&self, transport: T);

    /// Bytes arrived on the read side. `data` is never empty.
    fn data_received(&self, data: &[u8]);

    /// The read side reached end-of-file.
    fn eof_received(&self) -> EofAction {
        EofAction::Close
    }

    /// The write backlog grew above the high watermark.
    fn pause_writing(&self) {}

    /// The write backlog drained to the low watermark.
    fn resume_writing(&self) {}

    /// The transport is gone. `None` means an orderly close.
    fn connection_lost(&self, error: Option<io::Error>);

    /// The child process exited. Only subprocess transports deliver this.
    fn process_exited(&self) {}
}

// =============================================================================
// Transport
// =============================================================================

/// Operations common to every transport.
///
/// All methods are non-blocking. Operational I/O failures are never returned
/// from here; they close the transport and arrive through
/// [`Protocol::connection_lost`].
pub trait Transport {
    /// Queue `data` for writing. Ignored once the transport is closing.
    fn write(&self, data: &[u8]);

    /// Half-close the write side once the backlog has drained.
    fn write_eof(&self) -> Result<(), TransportError>;

    /// Whether [`Transport::write_eof`] is supported.
    fn can_write_eof(&self) -> bool;

    /// Close after the backlog drains. Idempotent.
    fn close(&self);

    /// Close immediately, abandoning the backlog.
    fn abort(&self);

    fn is_closing(&self) -> bool;

    fn pause_reading(&self);

    fn resume_reading(&self);

    fn is_reading(&self) -> bool;

    /// Bytes accepted by `write` that the OS has not taken yet.
    fn write_buffer_size(&self) -> usize;

    /// Set the watermarks; `None` picks the defaults. Rejects `low > high`.
    fn set_write_buffer_limits(
        &self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<(), TransportError>;

    /// Current watermarks as `(low, high)`.
    fn write_buffer_limits(&self) -> (usize, usize);
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned synchronously by construction and usage calls.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error while setting a transport up
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The child could not be started (including exec failures)
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The operation is not valid for this transport or its current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Rejected configuration values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Delivering a signal to the child failed
    #[error("failed to send {signal:?} to pid {pid}: {source}")]
    Signal {
        signal: Signal,
        pid: i32,
        #[source]
        source: Errno,
    },
}

impl TransportError {
    /// The underlying OS error number, if there is one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) | Self::Spawn { source: err, .. } => err.raw_os_error(),
            Self::Signal { source, .. } => Some(*source as i32),
            Self::InvalidOperation(_) | Self::InvalidConfig(_) => None,
        }
    }

    /// Whether this is a usage error rather than an OS failure.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidOperation(_) | Self::InvalidConfig(_))
    }
}
