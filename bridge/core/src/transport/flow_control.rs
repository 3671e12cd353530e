//! Write Backpressure
//!
//! Watermark flow control for the write side of a transport:
//!
//! - `WriteBuffer` holds bytes accepted by `write()` that the OS has not
//!   taken yet, as a queue of chunks with an offset into the front chunk
//! - `WriteLimits` holds the high/low watermarks
//! - `FlowControl` ties the two together and decides when the protocol must
//!   be told to pause or resume writing
//!
//! # Design
//!
//! The protocol is paused once when the backlog grows above `high`, and
//! resumed once when it drains to `low` or below. Between those two edges no
//! further notifications are sent, so a protocol never sees two pauses in a
//! row.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::traits::TransportError;

// =============================================================================
// Limits
// =============================================================================

/// Default high watermark (64 KiB)
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

/// Small writes are appended to the last queued chunk up to this size
const COALESCE_LIMIT: usize = 64 * 1024;

/// High/low watermarks for the write backlog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteLimits {
    /// Pause the protocol when the backlog grows above this many bytes
    pub high: usize,
    /// Resume the protocol when the backlog drains to this many bytes
    pub low: usize,
}

impl Default for WriteLimits {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATER,
            low: DEFAULT_HIGH_WATER / 4,
        }
    }
}

impl WriteLimits {
    /// Build limits the way `set_write_buffer_limits` does: a missing `high`
    /// is 64 KiB (or `4 * low` when only `low` is given), a missing `low` is
    /// `high / 4`.
    pub fn new(high: Option<usize>, low: Option<usize>) -> Result<Self, TransportError> {
        let high = match (high, low) {
            (Some(high), _) => high,
            (None, Some(low)) => low.saturating_mul(4),
            (None, None) => DEFAULT_HIGH_WATER,
        };
        let low = low.unwrap_or(high / 4);
        let limits = Self { high, low };
        limits.validate()?;
        Ok(limits)
    }

    /// Reject `low > high`.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.low > self.high {
            return Err(TransportError::InvalidConfig(format!(
                "low watermark ({}) must not exceed high watermark ({})",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Backlog
// =============================================================================

/// Bytes waiting to be written, in order.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already written
    offset: usize,
    len: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` at the back.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.chunks.back_mut() {
            Some(last) if last.len() + data.len() <= COALESCE_LIMIT => last.extend_from_slice(data),
            _ => self.chunks.push_back(data.to_vec()),
        }
        self.len += data.len();
    }

    /// The unwritten part of the front chunk (empty when the buffer is).
    pub fn front(&self) -> &[u8] {
        self.chunks
            .front()
            .map_or(&[][..], |chunk| &chunk[self.offset..])
    }

    /// Drop `n` bytes from the front after the OS accepted them.
    pub fn consume(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let remaining = front.len() - self.offset;
            if n >= remaining {
                self.chunks.pop_front();
                self.offset = 0;
                n -= remaining;
            } else {
                self.offset += n;
                n = 0;
            }
        }
    }

    /// Total unwritten bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// =============================================================================
// Flow control
// =============================================================================

/// Per-transport I/O counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Bytes handed to the OS on the write side
    pub bytes_written: u64,
    /// Bytes delivered to `data_received`
    pub bytes_read: u64,
    /// Number of `pause_writing` notifications sent
    pauses: u64,
}

impl FlowStats {
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

/// Write backlog plus the pause/resume state machine around it.
#[derive(Debug, Default)]
pub struct FlowControl {
    pub buffer: WriteBuffer,
    limits: WriteLimits,
    paused: bool,
    stats: FlowStats,
}

impl FlowControl {
    pub fn new(limits: WriteLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> WriteLimits {
        self.limits
    }

    /// Replace the limits. Returns true when the protocol must now be paused.
    pub fn set_limits(&mut self, limits: WriteLimits) -> bool {
        self.limits = limits;
        self.check_pause()
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queue bytes. Returns true when the protocol must be paused.
    pub fn enqueue(&mut self, data: &[u8]) -> bool {
        self.buffer.push(data);
        self.check_pause()
    }

    /// Account for `n` bytes the OS took from the front of the backlog.
    /// Returns true when the protocol must be resumed.
    pub fn written(&mut self, n: usize) -> bool {
        self.buffer.consume(n);
        self.stats.bytes_written += n as u64;
        self.check_resume()
    }

    /// Account for bytes written straight through, bypassing the backlog.
    pub fn written_direct(&mut self, n: usize) {
        self.stats.bytes_written += n as u64;
    }

    pub fn record_read(&mut self, n: usize) {
        self.stats.bytes_read += n as u64;
    }

    fn check_pause(&mut self) -> bool {
        if !self.paused && self.buffer.len() > self.limits.high {
            self.paused = true;
            self.stats.pauses += 1;
            return true;
        }
        false
    }

    fn check_resume(&mut self) -> bool {
        if self.paused && self.buffer.len() <= self.limits.low {
            self.paused = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_limits() {
        let limits = WriteLimits::default();
        assert_eq!(limits.high, 64 * 1024);
        assert_eq!(limits.low, 16 * 1024);
    }

    #[test]
    fn test_limits_derivation() {
        assert_eq!(WriteLimits::new(None, None).unwrap(), WriteLimits::default());
        assert_eq!(
            WriteLimits::new(Some(1000), None).unwrap(),
            WriteLimits { high: 1000, low: 250 }
        );
        assert_eq!(
            WriteLimits::new(None, Some(100)).unwrap(),
            WriteLimits { high: 400, low: 100 }
        );
        assert_eq!(
            WriteLimits::new(Some(0), Some(0)).unwrap(),
            WriteLimits { high: 0, low: 0 }
        );
    }

    #[test]
    fn test_limits_reject_low_above_high() {
        let err = WriteLimits::new(Some(10), Some(11)).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_buffer_partial_consume() {
        let mut buffer = WriteBuffer::new();
        buffer.push(b"hello ");
        buffer.push(b"world");
        assert_eq!(buffer.len(), 11);

        buffer.consume(3);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.front(), b"lo world");

        buffer.consume(8);
        assert!(buffer.is_empty());
        assert_eq!(buffer.front(), b"");
    }

    #[test]
    fn test_buffer_keeps_large_chunks_separate() {
        let mut buffer = WriteBuffer::new();
        buffer.push(&vec![b'a'; COALESCE_LIMIT]);
        buffer.push(b"b");
        assert_eq!(buffer.front().len(), COALESCE_LIMIT);

        buffer.consume(COALESCE_LIMIT);
        assert_eq!(buffer.front(), b"b");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_buffer_consume_more_than_len() {
        let mut buffer = WriteBuffer::new();
        buffer.push(b"abc");
        buffer.consume(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pause_and_resume_edges() {
        let mut flow = FlowControl::new(WriteLimits { high: 10, low: 4 });

        assert!(!flow.enqueue(&[0; 10]));
        assert!(flow.enqueue(&[0; 1]));
        assert!(flow.is_paused());
        // Already paused: no second notification
        assert!(!flow.enqueue(&[0; 5]));

        assert!(!flow.written(8));
        assert!(flow.written(4));
        assert!(!flow.is_paused());
        assert_eq!(flow.buffer.len(), 4);

        let stats = flow.stats();
        assert_eq!(stats.bytes_written, 12);
        assert_eq!(stats.pauses(), 1);
    }

    #[test]
    fn test_lowering_limits_can_pause() {
        let mut flow = FlowControl::new(WriteLimits::default());
        assert!(!flow.enqueue(&[0; 100]));
        assert!(flow.set_limits(WriteLimits { high: 50, low: 10 }));
    }
}
