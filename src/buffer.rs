//! Input and output byte buffers for one connection.
//!
//! [`DuplexBuffers`] performs exactly one `read` or `write` per call, so it
//! can be driven by readiness notifications without ever blocking.  The
//! caller decides when to arm or disarm the writability watch using the
//! return values.

use std::io::{self, Read, Write};

/// Output is compacted once this many flushed bytes sit at its front.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Raw byte buffers owned by a connection.
#[derive(Debug)]
pub struct DuplexBuffers {
    input: Vec<u8>,
    /// Bytes at the front of `input` the codec already consumed.
    read: usize,
    output: Vec<u8>,
    /// Bytes at the front of `output` that the OS already accepted.
    written: usize,
    read_chunk: usize,
}

impl DuplexBuffers {
    /// Create empty buffers that read at most `read_chunk` bytes per call.
    pub fn new(read_chunk: usize) -> Self {
        Self {
            input: Vec::new(),
            read: 0,
            output: Vec::new(),
            written: 0,
            read_chunk: read_chunk.max(1),
        }
    }

    // ── Output ──

    /// Append `bytes` to the output.
    ///
    /// Returns `true` if the output was empty beforehand, i.e. the caller
    /// must start watching for writability.
    pub fn enqueue_write(&mut self, bytes: &[u8]) -> bool {
        let was_empty = !self.has_pending_output();
        self.output.extend_from_slice(bytes);
        was_empty && !bytes.is_empty()
    }

    /// Whether unflushed bytes remain.
    pub fn has_pending_output(&self) -> bool {
        self.written < self.output.len()
    }

    /// Perform one write of everything pending.
    ///
    /// Returns the number of bytes still pending afterwards; `0` means the
    /// caller can disarm its writability watch.  Partial writes are normal
    /// under backpressure.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if !self.has_pending_output() {
            return Ok(0);
        }
        let n = writer.write(&self.output[self.written..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted zero bytes",
            ));
        }
        self.written += n;

        if self.written == self.output.len() {
            self.output.clear();
            self.written = 0;
        } else if self.written >= COMPACT_THRESHOLD && self.written * 2 >= self.output.len() {
            self.output.drain(..self.written);
            self.written = 0;
        }
        Ok(self.output.len() - self.written)
    }

    // ── Input ──

    /// Perform one read and append whatever arrived to the input.
    ///
    /// Returns the number of bytes read; `0` is end-of-stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();
        let start = self.input.len();
        self.input.resize(start + self.read_chunk, 0);
        match reader.read(&mut self.input[start..]) {
            Ok(n) => {
                self.input.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.input.truncate(start);
                Err(e)
            }
        }
    }

    /// Bytes received but not yet consumed by the codec.
    pub fn input(&self) -> &[u8] {
        &self.input[self.read..]
    }

    /// Drop `n` bytes from the front of the input.
    ///
    /// Only a cursor moves; the storage is reclaimed by
    /// [`compact`](Self::compact), so a decode loop consuming many small
    /// frames does not shift the remainder once per frame.
    pub fn consume(&mut self, n: usize) {
        self.read = (self.read + n).min(self.input.len());
    }

    /// Release consumed input.  Call once after a decode loop.
    pub fn compact(&mut self) {
        if self.read == self.input.len() {
            self.input.clear();
        } else if self.read > 0 {
            self.input.drain(..self.read);
        }
        self.read = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A writer that accepts at most `limit` bytes per call.
    struct Trickle {
        limit: usize,
        accepted: Vec<u8>,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Blocked;

    impl Write for Blocked {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_enqueue_requests_write_watch() {
        let mut b = DuplexBuffers::new(16);
        assert!(b.enqueue_write(b"abc"));
        assert!(!b.enqueue_write(b"def"), "already armed");
        let mut w = Trickle {
            limit: 64,
            accepted: Vec::new(),
        };
        assert_eq!(b.flush_to(&mut w).unwrap(), 0);
        assert_eq!(w.accepted, b"abcdef");
    }

    #[test]
    fn empty_enqueue_does_not_arm() {
        let mut b = DuplexBuffers::new(16);
        assert!(!b.enqueue_write(b""));
        assert!(!b.has_pending_output());
    }

    #[test]
    fn partial_writes_advance_cursor_in_order() {
        let mut b = DuplexBuffers::new(16);
        b.enqueue_write(b"hello ");
        b.enqueue_write(b"world");
        let mut w = Trickle {
            limit: 4,
            accepted: Vec::new(),
        };

        assert_eq!(b.flush_to(&mut w).unwrap(), 7);
        assert_eq!(b.flush_to(&mut w).unwrap(), 3);
        // More output queued mid-flush lands after what is pending.
        assert!(!b.enqueue_write(b"!"));
        assert_eq!(b.flush_to(&mut w).unwrap(), 0);
        assert_eq!(w.accepted, b"hello world!");
        assert!(!b.has_pending_output());
        assert!(b.enqueue_write(b"x"), "drained buffer re-arms");
    }

    #[test]
    fn would_block_leaves_output_untouched() {
        let mut b = DuplexBuffers::new(16);
        b.enqueue_write(b"abc");
        let err = b.flush_to(&mut Blocked).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(b.has_pending_output());
        let mut w = Trickle {
            limit: 64,
            accepted: Vec::new(),
        };
        assert_eq!(b.flush_to(&mut w).unwrap(), 0);
        assert_eq!(w.accepted, b"abc");
    }

    #[test]
    fn fill_reads_at_most_one_chunk() {
        let mut b = DuplexBuffers::new(4);
        let mut src: &[u8] = b"0123456789";
        assert_eq!(b.fill_from(&mut src).unwrap(), 4);
        assert_eq!(b.fill_from(&mut src).unwrap(), 4);
        assert_eq!(b.input(), b"01234567");
        b.consume(5);
        assert_eq!(b.input(), b"567");
        assert_eq!(b.fill_from(&mut src).unwrap(), 2);
        assert_eq!(b.fill_from(&mut src).unwrap(), 0, "eof");
        assert_eq!(b.input(), b"56789");
    }

    #[test]
    fn consume_past_end_is_clamped() {
        let mut b = DuplexBuffers::new(8);
        let mut src: &[u8] = b"ab";
        b.fill_from(&mut src).unwrap();
        b.consume(10);
        assert!(b.input().is_empty());
    }

    #[test]
    fn consume_moves_a_cursor_until_compacted() {
        let mut b = DuplexBuffers::new(64);
        let mut src: &[u8] = b"a: 1\nb: 2\nc: 3\nOK\n";
        b.fill_from(&mut src).unwrap();
        b.consume(5);
        b.consume(5);
        assert_eq!(b.input(), b"c: 3\nOK\n");
        assert_eq!(b.input.len(), 18, "storage untouched before compaction");

        b.compact();
        assert_eq!(b.input.len(), 8);
        assert_eq!(b.input(), b"c: 3\nOK\n");
        b.consume(8);
        b.compact();
        assert!(b.input.is_empty());
    }

    #[test]
    fn fill_after_partial_consume_keeps_unread_bytes() {
        let mut b = DuplexBuffers::new(4);
        let mut src: &[u8] = b"abcdef";
        b.fill_from(&mut src).unwrap();
        b.consume(3);
        b.fill_from(&mut src).unwrap();
        assert_eq!(b.input(), b"def");
    }
}
