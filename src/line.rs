use std::collections::VecDeque;

/// Hard cap on a single captured line. Content that would grow past this is
/// split: the accumulated prefix is committed as a finished line and a fresh
/// one starts.
pub const MAX_LINE_SIZE: usize = 0xffff;

/// Minimum growth granularity, keeps short reads from reallocating per byte.
const GROW_CHUNK: usize = 40;

/// One captured line: a byte buffer plus a consumed/cursor position.
///
/// `done` is overloaded the same way throughout the crate: for a reader's
/// working line it is the classified watermark, for an edit line it is the
/// caret position. Invariant: `done <= buf.len() <= MAX_LINE_SIZE`.
pub struct Line {
    pub buf: Vec<u8>,
    pub done: usize,
    pub err: bool,
    pub stamp: u64,
}

impl Line {
    pub fn new() -> Self {
        Self { buf: Vec::new(), done: 0, err: false, stamp: 0 }
    }

    /// Fresh stamped line holding a tight copy of `bytes`.
    pub fn tight(bytes: &[u8]) -> Self {
        Self { buf: bytes.to_vec(), done: 0, err: false, stamp: stamp_ms() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn size(&self) -> usize {
        self.buf.capacity()
    }

    /// Ensure at least `count` spare bytes, growing by at least GROW_CHUNK.
    /// Returns true when growth would cross MAX_LINE_SIZE; the caller must
    /// split the line first.
    pub fn reserve(&mut self, count: usize) -> bool {
        let count = count.max(GROW_CHUNK);
        if self.buf.len() + count > MAX_LINE_SIZE {
            return true;
        }
        self.buf.reserve(count);
        false
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a fresh tight line from `bytes` and append it to the queue tail.
pub fn add(q: &mut VecDeque<Line>, bytes: &[u8]) {
    q.push_back(Line::tight(bytes));
}

/// Detach the classified prefix (`..done`) into the queue as a finished line
/// and reset the working line in place.
pub fn split(q: &mut VecDeque<Line>, line: &mut Line) {
    let upto = line.done.min(line.buf.len());
    q.push_back(Line::tight(&line.buf[..upto]));
    line.buf.drain(..upto);
    line.done = 0;
}

/// Epoch milliseconds, the stamp every line carries.
pub fn stamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_grows_by_chunk() {
        let mut l = Line::new();
        assert!(!l.reserve(1));
        assert!(l.size() >= GROW_CHUNK);
    }

    #[test]
    fn reserve_signals_split_at_cap() {
        let mut l = Line::new();
        l.buf = vec![b'x'; MAX_LINE_SIZE - 10];
        assert!(l.reserve(80));
        // content untouched by the refusal
        assert_eq!(l.len(), MAX_LINE_SIZE - 10);
    }

    #[test]
    fn split_detaches_prefix_and_resets() {
        let mut q = VecDeque::new();
        let mut l = Line::new();
        l.buf.extend_from_slice(b"hello\nwor");
        l.done = 6;
        split(&mut q, &mut l);
        assert_eq!(q.len(), 1);
        assert_eq!(&q[0].buf, b"hello\n");
        assert_eq!(&l.buf, b"wor");
        assert_eq!(l.done, 0);
    }

    #[test]
    fn add_stamps() {
        let mut q = VecDeque::new();
        add(&mut q, b"abc");
        assert_eq!(&q[0].buf, b"abc");
        assert!(q[0].stamp > 0);
        assert_eq!(q[0].done, 0);
    }
}
