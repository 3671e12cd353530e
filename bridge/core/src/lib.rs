//! Bridge Core - Transport layer for the host bridge
//!
//! Moves bytes between the bridge and the processes it runs, with
//! backpressure and a strict callback ordering contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Protocol (consumer)                    │
//! │  connection_made · data_received · eof_received · ...    │
//! └───────────────┬───────────────────────────▲──────────────┘
//!          write / close / pause        callbacks (same thread)
//! ┌───────────────▼───────────────────────────┴──────────────┐
//! │  SubprocessTransport            StdioTransport           │
//! │  (spawn, exit watch, signals,   (session stdin/stdout)   │
//! │   stderr capture, PTY resize)                            │
//! │  ─────────────────── base transport ──────────────────── │
//! │  read loop · write backlog + watermarks · close/abort    │
//! └───────┬──────────────────────────────────┬───────────────┘
//!     AsyncFd readiness                 Spooler thread
//!     (pipes, PTYs, sockets)            (regular files, /dev/null)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::io;
//! use std::rc::Rc;
//!
//! use bridge_core::event_loop;
//! use bridge_core::transport::{Protocol, SubprocessConfig, SubprocessTransport, Transport};
//!
//! #[derive(Default)]
//! struct Echo {
//!     output: RefCell<Vec<u8>>,
//! }
//!
//! impl Protocol<SubprocessTransport> for Echo {
//!     fn connection_made(&self, transport: SubprocessTransport) {
//!         transport.write(b"hello\n");
//!         let _ = transport.write_eof();
//!     }
//!     fn data_received(&self, data: &[u8]) {
//!         self.output.borrow_mut().extend_from_slice(data);
//!     }
//!     fn connection_lost(&self, _error: Option<io::Error>) {}
//! }
//!
//! event_loop::block_on(async {
//!     let echo = Rc::new(Echo::default());
//!     SubprocessTransport::spawn(echo.clone(), SubprocessConfig::new(["cat"])).unwrap();
//! })
//! .unwrap();
//! ```

pub mod event_loop;
pub mod transport;

pub use transport::{
    EofAction, Protocol, Spooler, StdioTransport, SubprocessConfig, SubprocessTransport,
    Transport, TransportError,
};
