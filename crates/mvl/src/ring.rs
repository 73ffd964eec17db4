//! Growable byte ring used as a channel's staging buffer.
//!
//! Writes are partial: `write` stores at most the free space and reports
//! how much it took. Capacity only ever grows (`grow_to`), so a channel's
//! buffer never thrashes between sizes.

use crate::error::{LogError, Result};

#[derive(Debug)]
pub(crate) struct StagingRing {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl StagingRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Append up to `free()` bytes; returns the number actually stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let tail = (self.head + self.len) % self.buf.len();
        let first = n.min(self.buf.len() - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.len += n;
        n
    }

    /// Pop up to `len()` bytes into `out`; returns the number copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let first = n.min(self.buf.len() - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.head = (self.head + n) % self.buf.len();
        self.len -= n;
        n
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Grow to at least `new_capacity`, preserving buffered bytes. Never
    /// shrinks. Allocation failure is reported, not aborted on.
    pub fn grow_to(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.buf.len() {
            return Ok(());
        }
        let mut new_buf = Vec::new();
        new_buf
            .try_reserve_exact(new_capacity)
            .map_err(|_| LogError::OutOfMemory { len: new_capacity })?;
        new_buf.resize(new_capacity, 0);

        let n = self.len;
        let first = n.min(self.buf.len() - self.head);
        new_buf[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        new_buf[first..n].copy_from_slice(&self.buf[..n - first]);

        self.buf = new_buf;
        self.head = 0;
        self.len = n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_wraps_around() {
        let mut ring = StagingRing::with_capacity(8);
        assert_eq!(ring.write(b"abcdef"), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        // Tail now wraps past the end of the backing buffer.
        assert_eq!(ring.write(b"ghijkl"), 6);
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
        assert!(ring.is_empty());
    }

    #[test]
    fn write_is_partial_when_full() {
        let mut ring = StagingRing::with_capacity(4);
        assert_eq!(ring.write(b"abcdef"), 4);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(b"gh"), 0);
    }

    #[test]
    fn grow_preserves_contents_and_never_shrinks() {
        let mut ring = StagingRing::with_capacity(4);
        ring.write(b"abcd");
        let mut out = [0u8; 2];
        ring.read(&mut out);
        ring.write(b"ef"); // wrapped
        ring.grow_to(16).unwrap();
        assert_eq!(ring.capacity(), 16);
        ring.grow_to(8).unwrap();
        assert_eq!(ring.capacity(), 16, "capacity must be monotonic");
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }
}
