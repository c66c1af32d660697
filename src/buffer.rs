//! Offline send buffer.
//!
//! Outbound frames produced while the socket is down land here and are
//! flushed in FIFO order when the connection (re)opens. The buffer is
//! bounded; at capacity the oldest entry is dropped to make room.
//!
//! There is no per-entry expiry. Ordering is strict FIFO: new entries enter
//! at the tail, flush consumes from the head.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::events::{BusEvent, EventBus};
use crate::protocol::frame::now_ms;

// ============================================================================
// Constants
// ============================================================================

/// Default buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

// ============================================================================
// BufferedFrame
// ============================================================================

/// A serialized frame waiting for a connection.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    /// Wire text of the frame.
    pub content: String,

    /// When the frame was buffered, milliseconds since epoch.
    pub timestamp: u64,

    /// Successful write attempts for this entry.
    pub attempts: u32,
}

// ============================================================================
// SendBuffer
// ============================================================================

/// Bounded FIFO of outbound frames, flushed on connect.
pub struct SendBuffer {
    entries: VecDeque<BufferedFrame>,
    capacity: usize,
    bus: EventBus,
}

impl SendBuffer {
    /// Creates an empty buffer.
    ///
    /// A zero capacity is bumped to one so the drop-oldest policy stays
    /// well-defined.
    #[must_use]
    pub fn new(capacity: usize, bus: EventBus) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            bus,
        }
    }

    /// Appends a serialized frame, dropping the oldest entry when full.
    pub fn add(&mut self, content: String) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            debug!(capacity = self.capacity, "send buffer full, dropped oldest");
            self.bus.emit(&BusEvent::BufferFull {
                capacity: self.capacity,
            });
        }

        self.entries.push_back(BufferedFrame {
            content,
            timestamp: now_ms(),
            attempts: 0,
        });
        trace!(len = self.entries.len(), "frame buffered");
        self.bus.emit(&BusEvent::BufferAdded {
            len: self.entries.len(),
        });
    }

    /// Removes and returns all entries in FIFO order.
    ///
    /// The connection event loop drains the buffer, writes each entry, and
    /// hands back the failures via [`restore`](Self::restore).
    #[must_use]
    pub fn drain(&mut self) -> Vec<BufferedFrame> {
        self.entries.drain(..).collect()
    }

    /// Puts entries that failed to write back at the head, preserving their
    /// original order ahead of anything buffered meanwhile.
    pub fn restore(&mut self, retained: Vec<BufferedFrame>) {
        for entry in retained.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Records the outcome of a flush pass.
    pub fn record_flush(&self, flushed: usize, retained: usize) {
        debug!(flushed, retained, "send buffer flushed");
        self.bus.emit(&BusEvent::BufferFlushed { flushed, retained });
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        let dropped = self.entries.len();
        self.entries.clear();
        if dropped > 0 {
            debug!(dropped, "send buffer cleared");
        }
        self.bus.emit(&BusEvent::BufferCleared { dropped });
    }

    /// Number of buffered frames.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the buffer holds no frames.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn buffer(capacity: usize) -> SendBuffer {
        SendBuffer::new(capacity, EventBus::new())
    }

    #[test]
    fn test_fifo_order() {
        let mut buf = buffer(10);
        for i in 0..5 {
            buf.add(format!("frame-{i}"));
        }

        let drained = buf.drain();
        let contents: Vec<_> = drained.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["frame-0", "frame-1", "frame-2", "frame-3", "frame-4"]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drop_oldest_keeps_last_capacity() {
        let mut buf = buffer(3);
        for i in 0..7 {
            buf.add(format!("frame-{i}"));
        }

        assert_eq!(buf.len(), 3);
        let contents: Vec<_> = buf.drain().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["frame-4", "frame-5", "frame-6"]);
    }

    #[test]
    fn test_full_event_emitted_per_drop() {
        let bus = EventBus::new();
        let drops = Arc::new(Mutex::new(0usize));
        let d = Arc::clone(&drops);
        bus.on("buffer:full", move |_| *d.lock() += 1);

        let mut buf = SendBuffer::new(2, bus);
        for i in 0..5 {
            buf.add(format!("frame-{i}"));
        }

        assert_eq!(*drops.lock(), 3);
    }

    #[test]
    fn test_restore_preserves_order_ahead_of_new_entries() {
        let mut buf = buffer(10);
        buf.add("a".into());
        buf.add("b".into());

        let mut drained = buf.drain();
        // "a" written fine, "b" failed
        let failed = drained.split_off(1);
        buf.add("c".into());
        buf.restore(failed);

        let contents: Vec<_> = buf.drain().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[test]
    fn test_clear_reports_dropped_count() {
        let bus = EventBus::new();
        let dropped = Arc::new(Mutex::new(None));
        let d = Arc::clone(&dropped);
        bus.on("buffer:cleared", move |event| {
            if let BusEvent::BufferCleared { dropped } = event {
                *d.lock() = Some(*dropped);
            }
        });

        let mut buf = SendBuffer::new(10, bus);
        buf.add("x".into());
        buf.add("y".into());
        buf.clear();

        assert_eq!(*dropped.lock(), Some(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_zero_capacity_bumped() {
        let buf = buffer(0);
        assert_eq!(buf.capacity(), 1);
    }
}
