//! Receive buffer with bounded growth and shrink-back.

use bytes::BytesMut;

use crate::error::{NetError, Result};
use crate::options::Limits;

/// Growable receive buffer.
///
/// `data()` is always the unconsumed prefix; freshly read bytes land right
/// after it. Growth doubles up to the hard cap; after a consume the buffer
/// shrinks back to the shrink threshold when it is at least 1.5 times that
/// size and the leftover fits in half of it.
pub(crate) struct RecvBuffer {
    buf: BytesMut,
    len: usize,
    shrink: usize,
    hard: usize,
}

impl RecvBuffer {
    pub(crate) fn new(limits: &Limits) -> Self {
        Self {
            buf: BytesMut::zeroed(limits.initial_pack_size()),
            len: 0,
            shrink: limits.shrink_threshold(),
            hard: limits.hard_limit(),
        }
    }

    /// Current allocated size
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Free space to read into, growing first when full
    pub(crate) fn spare(&mut self) -> Result<&mut [u8]> {
        if self.len == self.buf.len() {
            if self.buf.len() >= self.hard {
                return Err(NetError::RecvOverflow);
            }
            let grown = (self.buf.len() * 2).min(self.hard);
            self.buf.resize(grown, 0);
        }
        Ok(&mut self.buf[self.len..])
    }

    /// Mark `n` bytes of [`RecvBuffer::spare`] as filled
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len += n;
    }

    /// Drop the leading `n` bytes and compact the rest to the front
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n > 0 {
            self.buf.copy_within(n..self.len, 0);
            self.len -= n;
        }
        self.maybe_shrink();
    }

    /// Discard everything (raw mode)
    pub(crate) fn clear(&mut self) {
        self.consume(self.len);
    }

    fn maybe_shrink(&mut self) {
        if self.buf.len() < self.shrink + self.shrink / 2 || self.len > self.shrink / 2 {
            return;
        }
        let mut smaller = BytesMut::zeroed(self.shrink);
        smaller[..self.len].copy_from_slice(&self.buf[..self.len]);
        self.buf = smaller;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(pack: usize, shrink: usize, hard: usize) -> Limits {
        Limits {
            max_pack_size: pack,
            max_pack_size_shrink: shrink,
            max_pack_size_hard: hard,
            ..Limits::default()
        }
    }

    fn fill(buf: &mut RecvBuffer, bytes: &[u8]) -> Result<()> {
        let spare = buf.spare()?;
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        buf.commit(n);
        Ok(())
    }

    #[test]
    fn test_consume_all_keeps_configured_size() {
        let mut buf = RecvBuffer::new(&limits(16, 0, 64));
        for _ in 0..100 {
            fill(&mut buf, &[7u8; 16]).unwrap();
            buf.consume(buf.data().len());
            assert_eq!(buf.capacity(), 16);
        }
    }

    #[test]
    fn test_consume_nothing_grows_until_overflow() {
        let mut buf = RecvBuffer::new(&limits(16, 0, 100));
        let mut sizes = Vec::new();
        let err = loop {
            match fill(&mut buf, &[1u8; 64]) {
                Ok(()) => {
                    buf.consume(0);
                    sizes.push(buf.capacity());
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(err, NetError::RecvOverflow));
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.data().len(), 100);
        assert!(sizes.contains(&32) && sizes.contains(&64));
    }

    #[test]
    fn test_unconsumed_tail_moves_to_front() {
        let mut buf = RecvBuffer::new(&limits(8, 0, 8));
        fill(&mut buf, b"abcdef").unwrap();
        buf.consume(4);
        assert_eq!(buf.data(), b"ef");
        fill(&mut buf, b"gh").unwrap();
        assert_eq!(buf.data(), b"efgh");
    }

    #[test]
    fn test_shrinks_back_after_growth() {
        let mut buf = RecvBuffer::new(&limits(8, 0, 64));
        fill(&mut buf, &[0u8; 8]).unwrap();
        fill(&mut buf, &[0u8; 8]).unwrap();
        assert_eq!(buf.capacity(), 16);

        // Leftover too large to shrink
        buf.consume(10);
        assert_eq!(buf.capacity(), 16);

        buf.consume(3);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.data().len(), 3);
    }

    #[test]
    fn test_clear_discards() {
        let mut buf = RecvBuffer::new(&limits(8, 0, 8));
        fill(&mut buf, b"raw").unwrap();
        buf.clear();
        assert!(buf.data().is_empty());
    }
}
