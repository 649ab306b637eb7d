//! Flow-controlled output buffering.
//!
//! [`OutputQueue`] sits between whoever produces whole messages (the packet
//! encoder, or a channel writing into a local consumer) and a non-blocking
//! byte sink. Messages are kept in a FIFO and coalesced into one bounded
//! write buffer; every flushed byte is reported to an optional flow-control
//! sink so the channel layer can reopen its receive window.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::output::OutputQueue;
//!
//! let mut queue = OutputQueue::new(1024);
//! queue.enqueue(&b"hello "[..]);
//! queue.enqueue(&b"world"[..]);
//!
//! let mut out = Vec::new();
//! let written = queue.drain(&mut out, usize::MAX).unwrap();
//! assert_eq!(written, 11);
//! assert_eq!(out, b"hello world");
//! assert!(queue.is_empty());
//! ```

use std::collections::VecDeque;
use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

type FlowSink = Box<dyn FnMut(usize) + Send>;

/// Ordered byte output with a bounded coalescing buffer.
pub struct OutputQueue {
    pending: VecDeque<Bytes>,
    buffer: BytesMut,
    buffer_limit: usize,
    queued: usize,
    closed: bool,
    flushed: u64,
    dropped: u64,
    sink: Option<FlowSink>,
}

impl std::fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputQueue")
            .field("queued", &self.queued)
            .field("pending", &self.pending.len())
            .field("buffered", &self.buffer.len())
            .field("closed", &self.closed)
            .field("flushed", &self.flushed)
            .finish()
    }
}

impl OutputQueue {
    /// Creates a queue whose write buffer coalesces up to `buffer_limit`
    /// bytes. A single message larger than the limit is written on its own.
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            buffer: BytesMut::with_capacity(buffer_limit),
            buffer_limit: buffer_limit.max(1),
            queued: 0,
            closed: false,
            flushed: 0,
            dropped: 0,
            sink: None,
        }
    }

    /// Registers the callback told how many bytes each flush wrote.
    pub fn set_flow_sink(&mut self, sink: impl FnMut(usize) + Send + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Appends one message.
    ///
    /// Returns `false` (and drops the bytes) once the queue is closed.
    pub fn enqueue(&mut self, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        if self.closed {
            self.dropped += data.len() as u64;
            warn!(len = data.len(), "write after close dropped");
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.queued += data.len();
        self.pending.push_back(data);
        true
    }

    /// Bytes waiting to be written, across the buffer and the FIFO.
    pub fn len(&self) -> usize {
        self.queued
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Whether the writer should wait for the sink to become writable.
    pub fn wants_write(&self) -> bool {
        !self.is_empty()
    }

    /// Total bytes flushed since creation.
    pub fn total_flushed(&self) -> u64 {
        self.flushed
    }

    /// Total bytes dropped because they arrived after [`close`](Self::close).
    pub fn total_dropped(&self) -> u64 {
        self.dropped
    }

    /// Refuses further writes. Queued bytes still drain.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closed and fully drained: the transport underneath can be shut down.
    pub fn is_finished(&self) -> bool {
        self.closed && self.is_empty()
    }

    fn fill(&mut self) {
        while let Some(front) = self.pending.front() {
            if !self.buffer.is_empty() && self.buffer.len() + front.len() > self.buffer_limit {
                break;
            }
            if let Some(next) = self.pending.pop_front() {
                self.buffer.extend_from_slice(&next);
            }
        }
    }

    /// The next contiguous bytes to write, coalesced from the FIFO.
    pub fn chunk(&mut self) -> &[u8] {
        if self.buffer.is_empty() {
            self.fill();
        }
        &self.buffer
    }

    /// Marks `n` bytes of the current chunk as written.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        if n == 0 {
            return;
        }
        self.buffer.advance(n);
        self.queued -= n;
        self.flushed += n as u64;
        trace!(written = n, queued = self.queued, "output flushed");
        if let Some(sink) = self.sink.as_mut() {
            sink(n);
        }
    }

    /// Writes up to `max_bytes` into a non-blocking writer.
    ///
    /// Stops early on `WouldBlock`. The flow-control sink hears about each
    /// successful write.
    ///
    /// # Errors
    ///
    /// Any I/O error other than `WouldBlock` and `Interrupted`, or
    /// `WriteZero` if the writer accepts nothing.
    pub fn drain<W: Write + ?Sized>(&mut self, writer: &mut W, max_bytes: usize) -> io::Result<usize> {
        let mut written = 0;
        while written < max_bytes && !self.is_empty() {
            let chunk = self.chunk();
            let take = chunk.len().min(max_bytes - written);
            match writer.write(&chunk[..take]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Accepts `budget` bytes, then reports WouldBlock.
    struct Throttled {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_coalesces_small_writes() {
        let mut queue = OutputQueue::new(8);
        queue.enqueue(&b"abc"[..]);
        queue.enqueue(&b"def"[..]);
        queue.enqueue(&b"ghi"[..]);
        assert_eq!(queue.chunk(), b"abcdef");
        queue.advance(6);
        assert_eq!(queue.chunk(), b"ghi");
    }

    #[test]
    fn test_oversized_message_written_alone() {
        let mut queue = OutputQueue::new(4);
        queue.enqueue(vec![7u8; 10]);
        assert_eq!(queue.chunk().len(), 10);
    }

    #[test]
    fn test_partial_writes_keep_order() {
        let mut queue = OutputQueue::new(16);
        queue.enqueue(&b"0123456789"[..]);
        queue.enqueue(&b"abcdef"[..]);
        let mut writer = Throttled {
            out: Vec::new(),
            budget: 4,
        };

        assert_eq!(queue.drain(&mut writer, usize::MAX).unwrap(), 4);
        assert_eq!(queue.len(), 12);
        writer.budget = 100;
        assert_eq!(queue.drain(&mut writer, usize::MAX).unwrap(), 12);
        assert_eq!(writer.out, b"0123456789abcdef");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_len_matches_unconsumed_bytes() {
        let mut queue = OutputQueue::new(5);
        for part in [&b"aaa"[..], &b"bbbb"[..], &b"cc"[..]] {
            queue.enqueue(part);
        }
        assert_eq!(queue.len(), 9);
        queue.chunk();
        queue.advance(2);
        assert_eq!(queue.len(), 7);
        let mut out = Vec::new();
        queue.drain(&mut out, 3).unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(out, b"abb");
    }

    #[test]
    fn test_flow_sink_sees_flushed_bytes() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut queue = OutputQueue::new(64);
        queue.set_flow_sink(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });
        queue.enqueue(vec![1u8; 30]);
        let mut writer = Throttled {
            out: Vec::new(),
            budget: 20,
        };
        queue.drain(&mut writer, usize::MAX).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_enqueue_after_close_is_dropped() {
        let mut queue = OutputQueue::new(64);
        assert!(queue.enqueue(&b"last"[..]));
        queue.close();
        assert!(!queue.enqueue(&b"late"[..]));
        assert_eq!(queue.total_dropped(), 4);
        assert!(!queue.is_finished());

        let mut out = Vec::new();
        queue.drain(&mut out, usize::MAX).unwrap();
        assert_eq!(out, b"last");
        assert!(queue.is_finished());
    }

    #[test]
    fn test_write_zero_is_error() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut queue = OutputQueue::new(8);
        queue.enqueue(&b"x"[..]);
        let err = queue.drain(&mut Full, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
