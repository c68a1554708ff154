//! Fixed-capacity circular byte buffer for scrollback replay.
//! New bytes overwrite the oldest once full; `read()` returns chronological order.
//! No interior locking: the session's screen mutex keeps it in step with the emulator.

/// Circular byte buffer with a head index and a length.
pub struct RingBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes. Capacity must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity],
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

    /// Append bytes, overwriting the oldest once the buffer is full.
    /// Input longer than the capacity keeps only its trailing `capacity` bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        let cap = self.buf.len();
        let bytes = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };
        for &b in bytes {
            if self.len < cap {
                let at = (self.head + self.len) % cap;
                self.buf[at] = b;
                self.len += 1;
            } else {
                self.buf[self.head] = b;
                self.head = (self.head + 1) % cap;
            }
        }
    }

    /// Copy out the contents in chronological order (oldest byte first).
    pub fn read(&self) -> Vec<u8> {
        let cap = self.buf.len();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.buf[(self.head + i) % cap]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_below_capacity() {
        let mut ring = RingBuffer::new(8);
        ring.append(b"abc");
        ring.append(b"de");
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.read(), b"abcde");
    }

    #[test]
    fn empty_ring_reads_empty() {
        let ring = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.read(), Vec::<u8>::new());
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut ring = RingBuffer::new(4);
        ring.append(b"abcd");
        ring.append(b"ef");
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.read(), b"cdef");
    }

    #[test]
    fn wraps_repeatedly() {
        let mut ring = RingBuffer::new(3);
        for chunk in [b"ab".as_ref(), b"cd", b"ef", b"g"] {
            ring.append(chunk);
        }
        assert_eq!(ring.read(), b"efg");
    }

    #[test]
    fn oversized_input_keeps_trailing_bytes() {
        let mut ring = RingBuffer::new(4);
        ring.append(b"0123456789");
        assert_eq!(ring.read(), b"6789");
        ring.append(b"x");
        assert_eq!(ring.read(), b"789x");
    }

    #[test]
    fn exact_capacity_roundtrip() {
        let mut ring = RingBuffer::new(5);
        ring.append(b"hello");
        assert_eq!(ring.read(), b"hello");
        ring.append(b"world");
        assert_eq!(ring.read(), b"world");
    }
}
