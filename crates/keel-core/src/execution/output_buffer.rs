use std::collections::VecDeque;

/// Byte buffer that keeps only the most recent `capacity` bytes.
#[derive(Debug)]
pub struct BoundedBuffer {
    capacity: usize,
    data: VecDeque<u8>,
    dropped: u64,
}

impl BoundedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: VecDeque::with_capacity(capacity.min(8 * 1024)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            let keep_from = chunk.len() - self.capacity;
            self.dropped += (self.data.len() + keep_from) as u64;
            self.data.clear();
            self.data.extend(&chunk[keep_from..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn snapshot(&self) -> CapturedStream {
        CapturedStream {
            bytes: self.data.iter().copied().collect(),
            truncated_bytes: self.dropped,
        }
    }
}

/// Captured tail of one output stream plus how much was dropped ahead of it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated_bytes: u64,
}

impl CapturedStream {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            truncated_bytes: 0,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated_bytes > 0
    }

    pub fn lossy_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Text with a leading truncation marker when bytes were dropped.
    pub fn render(&self) -> String {
        let text = self.lossy_text();
        if self.is_truncated() {
            format!("[... {} earlier bytes truncated ...]\n{text}", self.truncated_bytes)
        } else {
            text
        }
    }
}
