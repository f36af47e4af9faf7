//! Bounded byte accumulator with front eviction.

/// Keeps at most `maximum_length` of the most recently pushed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingBuffer {
    data: Vec<u8>,
    maximum_length: usize,
}

impl FramingBuffer {
    pub fn new(maximum_length: usize) -> Self {
        Self {
            data: Vec::with_capacity(maximum_length),
            maximum_length,
        }
    }

    /// Append one byte, dropping the oldest byte if the buffer is full.
    pub fn push(&mut self, byte: u8) {
        if self.maximum_length == 0 {
            return;
        }
        if self.data.len() == self.maximum_length {
            self.data.remove(0);
        }
        self.data.push(byte);
    }

    /// Append a run of bytes, dropping exactly the oldest excess.
    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.maximum_length {
            self.data.clear();
            self.data
                .extend_from_slice(&bytes[bytes.len() - self.maximum_length..]);
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.maximum_length);
        self.data.drain(..overflow);
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn maximum_length(&self) -> usize {
        self.maximum_length
    }
}
