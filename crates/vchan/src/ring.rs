//! Fixed-capacity circular byte store for one transfer direction.
//!
//! Absorbs timing mismatch between facade calls and socket I/O. Offsets wrap
//! modulo capacity; `filled() + available() == capacity()` at all times.
//! The contiguous-run accessors exist so the I/O loop can hand slices
//! straight to nonblocking socket reads and writes.

pub(crate) struct Ring {
    data: Box<[u8]>,
    start: usize,
    len: usize,
}

impl Ring {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently occupying the ring.
    pub fn filled(&self) -> usize {
        self.len
    }

    /// Free space remaining.
    pub fn available(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    fn end(&self) -> usize {
        (self.start + self.len) % self.data.len()
    }

    /// Copy as much of `src` as fits, in order, starting at the tail.
    ///
    /// Returns the number of bytes accepted; a short count means the ring
    /// filled up and the caller decides whether to retry later.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let mut total = 0;
        while total < src.len() {
            let chunk = self.tail_slice_mut();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len().min(src.len() - total);
            chunk[..n].copy_from_slice(&src[total..total + n]);
            self.advance_tail(n);
            total += n;
        }
        total
    }

    /// Move up to `dst.len()` bytes out from the head, in arrival order.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            let chunk = self.head_slice();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len().min(dst.len() - total);
            dst[total..total + n].copy_from_slice(&chunk[..n]);
            self.advance_head(n);
            total += n;
        }
        total
    }

    /// Contiguous free run at the tail; empty when the ring is full.
    pub fn tail_slice_mut(&mut self) -> &mut [u8] {
        if self.is_full() {
            return &mut [];
        }
        let cap = self.data.len();
        let end = self.end();
        let run = if end >= self.start {
            cap - end
        } else {
            self.start - end
        };
        &mut self.data[end..end + run]
    }

    /// Record `n` bytes written into the slice from [`Ring::tail_slice_mut`].
    pub fn advance_tail(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.len += n;
    }

    /// Contiguous filled run at the head; empty when the ring is empty.
    pub fn head_slice(&self) -> &[u8] {
        let cap = self.data.len();
        let run = if self.start + self.len <= cap {
            self.len
        } else {
            cap - self.start
        };
        &self.data[self.start..self.start + run]
    }

    /// Discard `n` consumed bytes from the head.
    pub fn advance_head(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.start = (self.start + n) % self.data.len();
        self.len -= n;
    }
}
