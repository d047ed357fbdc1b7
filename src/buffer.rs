//! Byte buffers used on both sides of a connection.
//!
//! A [`Buffer`] accumulates inbound bytes until the handler consumes them, and
//! is also the unit queued for output. [`OutQueue`] keeps outbound buffers in
//! strict append order.

use std::collections::VecDeque;
use std::fmt;
use std::io;

// Compacting below this cursor is not worth the copy.
const COMPACT_THRESHOLD: usize = 4 * 1024;

/// Growable byte region with a consume cursor.
///
/// Bytes before the cursor have already been consumed (decoded or written)
/// and are dropped lazily; [`Buffer::as_slice`] only ever exposes the
/// unconsumed region.
///
/// # Example
/// ```
/// use std::fmt::Write;
/// use evnet::Buffer;
///
/// let mut buf = Buffer::new();
/// write!(buf, "GET /{} HTTP/1.1\r\n", "foo").unwrap();
/// buf.append(b"\r\n");
/// assert!(buf.as_slice().ends_with(b"\r\n\r\n"));
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Appends bytes after the current contents.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Replaces the whole contents with a copy of `bytes`.
    pub fn copy_from(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.pos = 0;
        self.data.extend_from_slice(bytes);
    }

    /// The unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Marks the first `n` unconsumed bytes as consumed.
    ///
    /// `n` is clamped to [`Buffer::len`].
    pub fn consume(&mut self, n: usize) {
        self.pos += n.min(self.len());

        if self.pos == self.data.len() {
            self.clear();
        } else if self.pos >= COMPACT_THRESHOLD && self.pos * 2 >= self.data.len() {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Reads at most `chunk` bytes at the tail through `read`.
    ///
    /// The buffer grows as needed and is never truncated below what it held
    /// before the call.
    pub(crate) fn fill_with<F>(&mut self, chunk: usize, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let start = self.data.len();
        self.data.resize(start + chunk, 0);

        let result = read(&mut self.data[start..]);
        let filled = match &result {
            Ok(n) => (*n).min(chunk),
            Err(_) => 0,
        };
        self.data.truncate(start + filled);

        result
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("consumed", &self.pos)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Buffer {
    fn from(bytes: &[u8; N]) -> Self {
        Self::from(&bytes[..])
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<String> for Buffer {
    fn from(s: String) -> Self {
        Self::from(s.into_bytes())
    }
}

/// FIFO of outbound buffers.
///
/// The head may be partially written; its cursor records how far.
#[derive(Debug, Default)]
pub(crate) struct OutQueue {
    buffers: VecDeque<Buffer>,
    bytes: usize,
}

impl OutQueue {
    pub(crate) fn push(&mut self, buffer: Buffer) {
        if buffer.is_empty() {
            return;
        }

        self.bytes += buffer.len();
        self.buffers.push_back(buffer);
    }

    /// Unwritten bytes of the head buffer.
    pub(crate) fn head(&self) -> Option<&[u8]> {
        self.buffers.front().map(Buffer::as_slice)
    }

    /// Records `n` written bytes, releasing the head once it is drained.
    pub(crate) fn advance(&mut self, n: usize) {
        let Some(head) = self.buffers.front_mut() else {
            return;
        };

        let n = n.min(head.len());
        head.consume(n);
        self.bytes -= n;

        if head.is_empty() {
            self.buffers.pop_front();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued buffers.
    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
        self.bytes = 0;
    }
}
