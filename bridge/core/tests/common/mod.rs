//! Shared fixtures for transport integration tests

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::time::Duration;

use bridge_core::transport::{EofAction, Protocol, Transport};

/// Upper bound for any single wait in these tests
pub const TIMEOUT: Duration = Duration::from_secs(20);

/// Run `test` on a fresh loop.
pub fn run<F: Future<Output = ()>>(test: F) {
    bridge_core::event_loop::block_on(async move {
        tokio::time::timeout(TIMEOUT, test)
            .await
            .expect("test timed out");
    })
    .expect("failed to build runtime");
}

/// Poll `condition` until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Protocol that records every callback.
pub struct Recorder<T> {
    pub transport: RefCell<Option<T>>,
    pub events: RefCell<Vec<&'static str>>,
    pub output: RefCell<Vec<u8>>,
    pub error: RefCell<Option<io::Error>>,
    pub paused: Cell<bool>,
    pub close_on_eof: Cell<bool>,
    pub sent: Cell<usize>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            transport: RefCell::new(None),
            events: RefCell::new(Vec::new()),
            output: RefCell::new(Vec::new()),
            error: RefCell::new(None),
            paused: Cell::new(false),
            close_on_eof: Cell::new(true),
            sent: Cell::new(0),
        }
    }
}

impl<T: Transport + Clone> Recorder<T> {
    pub fn keeping_open() -> Self {
        let recorder = Self::default();
        recorder.close_on_eof.set(false);
        recorder
    }

    pub fn transport(&self) -> T {
        self.transport
            .borrow()
            .clone()
            .expect("connection_made not delivered")
    }

    pub fn saw(&self, event: &str) -> bool {
        self.events.borrow().iter().any(|e| *e == event)
    }

    pub fn received(&self) -> usize {
        self.output.borrow().len()
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }

    pub fn write(&self, data: &[u8]) {
        self.transport().write(data);
        self.sent.set(self.sent.get() + data.len());
    }

    /// Write until the transport asks us to stop.
    pub fn write_until_backlogged(&self) {
        while !self.paused.get() {
            self.write(&[b'a'; 4096]);
        }
    }

    /// Push 20 MiB past a backlog that is already there.
    pub fn write_a_lot(&self) {
        self.write_until_backlogged();
        for _ in 0..20 {
            self.write(&vec![b'b'; 1024 * 1024]);
        }
        assert!(self.transport().write_buffer_size() > 20 * 1024 * 1024);
    }

    pub async fn wait_lost(&self) {
        wait_for(|| self.saw("lost")).await;
    }

    /// Every callback was delivered in contract order.
    pub fn assert_ordering(&self) {
        let events = self.events.borrow();
        assert_eq!(events.first(), Some(&"made"), "events: {events:?}");
        assert!(events.iter().filter(|e| **e == "eof").count() <= 1);
        assert!(events.iter().filter(|e| **e == "exited").count() <= 1);
        if let Some(lost) = events.iter().position(|e| *e == "lost") {
            assert_eq!(lost, events.len() - 1, "events: {events:?}");
        }
        if let Some(eof) = events.iter().position(|e| *e == "eof") {
            assert!(!events[eof..].contains(&"data"), "events: {events:?}");
        }
    }
}

impl<T: Transport + Clone> Protocol<T> for Recorder<T> {
    fn connection_made(&self, transport: T) {
        self.events.borrow_mut().push("made");
        *self.transport.borrow_mut() = Some(transport);
    }

    fn data_received(&self, data: &[u8]) {
        let mut events = self.events.borrow_mut();
        if events.last() != Some(&"data") {
            events.push("data");
        }
        self.output.borrow_mut().extend_from_slice(data);
    }

    fn eof_received(&self) -> EofAction {
        self.events.borrow_mut().push("eof");
        if self.close_on_eof.get() {
            EofAction::Close
        } else {
            EofAction::KeepOpen
        }
    }

    fn pause_writing(&self) {
        assert!(!self.paused.get(), "paused twice");
        self.events.borrow_mut().push("pause");
        self.paused.set(true);
    }

    fn resume_writing(&self) {
        assert!(self.paused.get(), "resumed without pause");
        self.events.borrow_mut().push("resume");
        self.paused.set(false);
    }

    fn connection_lost(&self, error: Option<io::Error>) {
        assert!(!self.saw("lost"), "connection_lost delivered twice");
        self.events.borrow_mut().push("lost");
        *self.error.borrow_mut() = error;
    }

    fn process_exited(&self) {
        self.events.borrow_mut().push("exited");
    }
}
