//! Output buffers
//!
//! A `Buffer` holds bytes a client could not write immediately. Buffers are
//! chained FIFO per client and their storage is recycled through the
//! owning generation's `BufferPool`.

/// Storage vectors kept for reuse per pool.
pub const MAX_POOLED: usize = 64;

/// Pooled vectors larger than this are dropped instead of kept.
pub const MAX_POOLED_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    offset: usize,
}

impl Buffer {
    /// Bytes not yet written.
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Mark `n` more bytes as written.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.offset >= self.data.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Free list of buffer storage.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding a copy of `bytes`.
    pub fn take(&mut self, bytes: &[u8]) -> Buffer {
        let mut data = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(bytes.len()));
        data.clear();
        data.extend_from_slice(bytes);
        Buffer { data, offset: 0 }
    }

    /// Return a buffer's storage.
    pub fn put(&mut self, buffer: Buffer) {
        let mut data = buffer.data;
        if self.free.len() < MAX_POOLED && data.capacity() <= MAX_POOLED_CAPACITY {
            data.clear();
            self.free.push(data);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_consumption() {
        let mut pool = BufferPool::new();
        let mut buf = pool.take(b"hello world");
        assert_eq!(buf.size(), 11);
        buf.advance(6);
        assert_eq!(buf.remaining(), b"world");
        assert!(!buf.is_consumed());
        buf.advance(100);
        assert!(buf.is_consumed());
        assert_eq!(buf.offset(), 11);
    }

    #[test]
    fn test_storage_is_reused() {
        let mut pool = BufferPool::new();
        let buf = pool.take(&[1u8; 128]);
        pool.put(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.take(b"ab");
        assert_eq!(pool.pooled(), 0);
        assert_eq!(buf.remaining(), b"ab");
        assert!(buf.data.capacity() >= 128);
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut pool = BufferPool::new();
        for _ in 0..MAX_POOLED + 10 {
            let buf = Buffer {
                data: Vec::with_capacity(8),
                offset: 0,
            };
            pool.put(buf);
        }
        assert_eq!(pool.pooled(), MAX_POOLED);

        let mut big = BufferPool::new();
        big.put(big_buffer());
        assert_eq!(big.pooled(), 0);
    }

    fn big_buffer() -> Buffer {
        Buffer {
            data: Vec::with_capacity(MAX_POOLED_CAPACITY + 1),
            offset: 0,
        }
    }
}
