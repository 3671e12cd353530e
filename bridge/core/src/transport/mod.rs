//! Transport Layer for the Host Bridge
//!
//! Byte-transparent, non-blocking endpoints driving a [`Protocol`]:
//! - `SubprocessTransport`: a child process over pipes or a PTY
//! - `StdioTransport`: an already-open descriptor pair (the bridge's session)
//! - `Spooler`: background reader for descriptors readiness polling refuses
//!
//! # Design Philosophy
//!
//! Transports own their descriptors and report everything through protocol
//! callbacks. Construction and usage errors are returned synchronously;
//! I/O failures during operation close the transport and arrive as the
//! payload of `connection_lost`, which is delivered exactly once and never
//! from inside a transport call.
//!
//! # Concurrency
//!
//! All transports are single-threaded and must be used inside a tokio
//! `LocalSet` (see [`crate::event_loop`]). The only other execution context
//! is the Spooler's worker thread, which shares nothing but a channel.

mod base;
pub mod config;
mod fd;
pub mod flow_control;
pub mod spooler;
pub mod stdio;
pub mod subprocess;
pub mod traits;

// Re-exports for convenience
pub use config::{StderrMode, SubprocessConfig, TransportConfig, WatcherStrategy, WindowSize};
pub use flow_control::{FlowStats, WriteLimits, DEFAULT_HIGH_WATER};
pub use spooler::Spooler;
pub use stdio::StdioTransport;
pub use subprocess::SubprocessTransport;
pub use traits::{EofAction, Protocol, Transport, TransportError};
