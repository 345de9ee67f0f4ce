//! Line-oriented reading with lookahead over a source that cannot seek, like a pipe.
//!
//! Data is read into one growable buffer. Consumed bytes are dropped from the front only when
//! more room is needed, so a peek never costs a copy and a long line costs O(log n) reads.

use std::io::{self, ErrorKind, Read};

/// The buffer size we start with.
const INITIAL_CAPACITY: usize = 4096;

/// Reads lines or byte counts from `R`, with the ability to look at what comes next without
/// consuming it.
///
/// After end of stream, `read_line` returns the final unterminated piece (if any) once, and then
/// `None` forever. A blank line is `Some(b"\n")`, never `None`.
pub struct LineReader<R> {
    source: R,
    buf: Vec<u8>,
    /// Start of unconsumed data in `buf`.
    start: usize,
    /// End of valid data in `buf`.
    end: usize,
    /// The source reported end of stream. It is never read again.
    eof: bool,
    /// Length of the next line (including its newline), if already found.
    line_len: Option<usize>,
    /// How far past `start` we have searched for a newline without finding one.
    scanned: usize,
}

impl<R: Read> LineReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(INITIAL_CAPACITY, source)
    }

    pub fn with_capacity(capacity: usize, source: R) -> Self {
        LineReader {
            source,
            buf: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
            eof: false,
            line_len: None,
            scanned: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.source
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    /// Whether the source has reported end of stream. Buffered data may remain.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Make room for at least one more byte at the end of the buffer: first by moving unconsumed
    /// data to the front, otherwise by doubling.
    fn make_room(&mut self) {
        if self.end < self.buf.len() {
            return;
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        } else {
            let new_len = self.buf.len() * 2;
            FLOG!(reader, "Growing buffer to", new_len, "bytes");
            self.buf.resize(new_len, 0);
        }
    }

    /// Read once from the source into the free space. Returns the number of bytes added; 0 means
    /// end of stream.
    fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.make_room();
        loop {
            match self.source.read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    FLOG!(reader, "End of stream");
                    self.eof = true;
                    return Ok(0);
                }
                Ok(amt) => {
                    self.end += amt;
                    return Ok(amt);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    FLOG!(reader, "Read failed:", err);
                    return Err(err);
                }
            }
        }
    }

    /// Ensure at least `n` bytes are buffered, or the source is at end of stream.
    fn fill_to(&mut self, n: usize) -> io::Result<()> {
        while self.end - self.start < n && !self.eof {
            self.fill()?;
        }
        Ok(())
    }

    /// Find the length of the next line, reading as needed. None means no more data.
    fn next_line_len(&mut self) -> io::Result<Option<usize>> {
        if let Some(len) = self.line_len {
            return Ok(Some(len));
        }
        loop {
            let pending = self.buffered();
            if let Some(pos) = pending[self.scanned..].iter().position(|&b| b == b'\n') {
                let len = self.scanned + pos + 1;
                self.line_len = Some(len);
                return Ok(Some(len));
            }
            self.scanned = pending.len();
            if self.fill()? == 0 {
                // End of stream: whatever is left is the last line.
                let len = self.end - self.start;
                if len == 0 {
                    return Ok(None);
                }
                self.line_len = Some(len);
                return Ok(Some(len));
            }
        }
    }

    /// Drop `n` bytes from the front of the buffered data.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.end - self.start);
        self.start += n;
        self.line_len = None;
        self.scanned = 0;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Read the next line including its newline, or the final unterminated piece. Returns None
    /// at end of stream, and keeps doing so.
    pub fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(len) = self.next_line_len()? else {
            return Ok(None);
        };
        let line = self.buffered()[..len].to_vec();
        self.consume(len);
        Ok(Some(line))
    }

    /// Return what the next read_line() will, without consuming it.
    pub fn peek_line(&mut self) -> io::Result<Option<&[u8]>> {
        match self.next_line_len()? {
            Some(len) => Ok(Some(&self.buffered()[..len])),
            None => Ok(None),
        }
    }

    /// Read up to `n` bytes. Fewer are returned only at end of stream; an empty result means the
    /// stream is exhausted.
    pub fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.fill_to(n)?;
        let amt = n.min(self.end - self.start);
        let data = self.buffered()[..amt].to_vec();
        self.consume(amt);
        Ok(data)
    }

    /// Return what read(n) would, without consuming it.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill_to(n)?;
        let amt = n.min(self.end - self.start);
        Ok(&self.buffered()[..amt])
    }

    /// The number of bytes buffered and not yet consumed. Never reads.
    pub fn peek_size(&self) -> usize {
        self.end - self.start
    }

    /// Discard up to `n` already-buffered bytes, typically after a peek. Never reads. Returns the
    /// number discarded.
    pub fn peek_skip(&mut self, n: usize) -> usize {
        let amt = n.min(self.end - self.start);
        self.consume(amt);
        amt
    }
}

impl<R> std::fmt::Debug for LineReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader")
            .field("buffered", &(self.end - self.start))
            .field("capacity", &self.buf.len())
            .field("eof", &self.eof)
            .finish()
    }
}
