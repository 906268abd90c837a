//! In-memory buffering for output units.
//!
//! An output plugin encodes each event into a [`Sizer`] — a sized, already
//! serialized item — and the exec unit accumulates those items in a
//! [`MemoryBuffer`] until a chunk is due, at which point the whole chunk is
//! handed to the plugin's `write` in one call. Chunks become due when the
//! item count reaches `chunk_limit`, when the periodic flush interval fires,
//! or when the unit shuts down.
//!
//! The buffer itself never performs I/O; the exec unit owns the plugin and
//! drives `write`, so the buffer stays a plain accumulator.

use std::time::Duration;

use thiserror::Error;

use crate::message::BufferOptions;

/// Buffer errors.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Accepting the item would exceed the configured byte ceiling.
    #[error("buffer full: {pending} bytes pending, limit {limit}")]
    Full { pending: usize, limit: usize },
}

/// A sized, serialized item produced by an output plugin's `encode`.
pub trait Sizer: Send + std::fmt::Debug {
    /// Size of the item in bytes, used for buffer accounting.
    fn size(&self) -> usize;

    /// The serialized form, as the output's `write` will transmit it.
    fn as_bytes(&self) -> &[u8];
}

/// The simplest `Sizer`: an owned byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesItem(pub Vec<u8>);

impl Sizer for BytesItem {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Accumulates encoded items until a chunk is due.
pub struct MemoryBuffer {
    opts: BufferOptions,
    items: Vec<Box<dyn Sizer>>,
    pending_bytes: usize,
}

impl MemoryBuffer {
    /// Create a buffer with the parent-supplied tuning.
    pub fn new(opts: BufferOptions) -> Self {
        Self {
            opts,
            items: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Append an item.
    ///
    /// Returns `Ok(Some(chunk))` when the append filled the chunk and it
    /// should be written out now, `Ok(None)` when the item was merely
    /// queued. Fails without queueing when the byte ceiling would be
    /// exceeded.
    pub fn push(&mut self, item: Box<dyn Sizer>) -> Result<Option<Vec<Box<dyn Sizer>>>, BufferError> {
        let size = item.size();
        if self.pending_bytes + size > self.opts.max_pending_bytes {
            return Err(BufferError::Full {
                pending: self.pending_bytes,
                limit: self.opts.max_pending_bytes,
            });
        }
        self.pending_bytes += size;
        self.items.push(item);
        if self.items.len() >= self.opts.chunk_limit {
            Ok(self.take_chunk())
        } else {
            Ok(None)
        }
    }

    /// Take everything pending as one chunk, or `None` when empty.
    ///
    /// Used by the interval flush and by shutdown.
    pub fn take_chunk(&mut self) -> Option<Vec<Box<dyn Sizer>>> {
        if self.items.is_empty() {
            return None;
        }
        self.pending_bytes = 0;
        Some(std::mem::take(&mut self.items))
    }

    /// The configured cadence for periodic flushes.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.opts.flush_interval_secs.max(1))
    }

    /// Number of items currently pending.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(bytes: &[u8]) -> Box<dyn Sizer> {
        Box::new(BytesItem(bytes.to_vec()))
    }

    #[test]
    fn test_push_queues_until_chunk_limit() {
        let mut buf = MemoryBuffer::new(BufferOptions {
            chunk_limit: 3,
            ..Default::default()
        });

        assert!(buf.push(item(b"a")).unwrap().is_none());
        assert!(buf.push(item(b"b")).unwrap().is_none());
        let chunk = buf.push(item(b"c")).unwrap().expect("chunk due");
        assert_eq!(chunk.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_chunk_drains_everything() {
        let mut buf = MemoryBuffer::new(BufferOptions::default());
        buf.push(item(b"one")).unwrap();
        buf.push(item(b"two")).unwrap();

        let chunk = buf.take_chunk().expect("pending items");
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk[0].as_bytes(), b"one");
        assert!(buf.take_chunk().is_none());
    }

    #[test]
    fn test_push_rejects_past_byte_ceiling() {
        let mut buf = MemoryBuffer::new(BufferOptions {
            max_pending_bytes: 8,
            ..Default::default()
        });
        buf.push(item(b"12345")).unwrap();

        let err = buf.push(item(b"123456")).unwrap_err();
        assert!(matches!(err, BufferError::Full { pending: 5, limit: 8 }));
        // The rejected item must not count against the ceiling.
        assert_eq!(buf.len(), 1);
        assert!(buf.push(item(b"123")).unwrap().is_none());
    }

    #[test]
    fn test_flush_interval_has_floor_of_one_second() {
        let buf = MemoryBuffer::new(BufferOptions {
            flush_interval_secs: 0,
            ..Default::default()
        });
        assert_eq!(buf.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_bytes_item_reports_size() {
        let i = BytesItem(b"hello".to_vec());
        assert_eq!(i.size(), 5);
        assert_eq!(i.as_bytes(), b"hello");
    }
}
