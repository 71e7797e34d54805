// Growable byte buffer with a read cursor, for incremental parsers
//
// Consuming bytes only moves the cursor; the consumed prefix is dropped in one
// move when it dominates the allocation, so each byte is copied O(1) times.

const COMPACT_THRESHOLD: usize = 512;

#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: Vec<u8>,
    start: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes available to consume.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && (self.start >= COMPACT_THRESHOLD || self.start == self.data.len()) {
            self.compact();
        }
        self.data.extend_from_slice(bytes);
    }

    /// Drops `count` bytes from the front.
    pub fn consume(&mut self, count: usize) {
        self.start = (self.start + count).min(self.data.len());
        if self.start == self.data.len() {
            self.clear();
        }
    }

    /// Removes and returns up to `count` bytes from the front.
    pub fn take(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.len());
        let out = self.data[self.start..self.start + count].to_vec();
        self.consume(count);
        out
    }

    /// Position of `needle` in the unconsumed bytes, searching from `from`.
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        let haystack = self.as_slice();
        if needle.is_empty() || from >= haystack.len() {
            return None;
        }
        haystack[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| pos + from)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    fn compact(&mut self) {
        self.data.drain(..self.start);
        self.start = 0;
    }
}
