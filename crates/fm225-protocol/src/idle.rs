//! Quiescent-gap message assembly
//!
//! The module does not delimit its messages, so a message ends when the
//! line goes quiet. The reader feeds bytes as they arrive and calls
//! [`IdleGapAssembler::on_idle`] when a read times out.

use bytes::BytesMut;

/// Default receive capacity, matching the module-side receive buffer
pub const DEFAULT_CAPACITY: usize = 128;

/// Collects bytes between idle gaps
#[derive(Debug)]
pub struct IdleGapAssembler {
    buffer: BytesMut,
    capacity: usize,
}

impl Default for IdleGapAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl IdleGapAssembler {
    /// Create an assembler that emits at most `capacity` bytes per message
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed received bytes
    ///
    /// Returns any messages forced out because the buffer filled up.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let room = self.capacity - self.buffer.len();
            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.buffer.extend_from_slice(head);
            rest = tail;

            if self.buffer.len() == self.capacity {
                tracing::debug!("Receive buffer full, emitting {} bytes", self.capacity);
                messages.push(self.buffer.split().to_vec());
            }
        }

        messages
    }

    /// The line went quiet: emit whatever was collected
    pub fn on_idle(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().to_vec())
    }

    /// Number of bytes waiting for the next gap
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the assembler state
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_split_across_reads() {
        let mut assembler = IdleGapAssembler::default();
        assert!(assembler.feed(&[0xEF, 0xAA, 0x01]).is_empty());
        assert!(assembler.feed(&[0x00, 0x01, 0x00, 0x00]).is_empty());
        assert_eq!(assembler.pending(), 7);
        assert_eq!(
            assembler.on_idle(),
            Some(vec![0xEF, 0xAA, 0x01, 0x00, 0x01, 0x00, 0x00])
        );
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_idle_without_data() {
        let mut assembler = IdleGapAssembler::default();
        assert_eq!(assembler.on_idle(), None);
    }

    #[test]
    fn test_overflow_emits_full_chunks() {
        let mut assembler = IdleGapAssembler::new(4);
        let forced = assembler.feed(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(forced, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(assembler.on_idle(), Some(vec![9]));
    }

    #[test]
    fn test_clear() {
        let mut assembler = IdleGapAssembler::default();
        assembler.feed(&[0xEF, 0xAA]);
        assembler.clear();
        assert_eq!(assembler.on_idle(), None);
    }
}
