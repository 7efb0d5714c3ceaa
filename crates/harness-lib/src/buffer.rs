//! Result buffer
//!
//! Accumulates per-record outcomes in source order and hands them out as
//! fixed-size chunks:
//! - `push` returns a chunk once `chunk_size` entries are waiting
//! - `drain` returns whatever is left (end of pass or shutdown)
//! - chunk sequence numbers increase by one per emitted chunk

use crate::models::{ChunkEntry, ResultChunk};
use std::collections::VecDeque;
use tracing::debug;

/// Ordered outcome buffer, owned by the runner
#[derive(Debug)]
pub struct ResultBuffer {
    entries: VecDeque<ChunkEntry>,
    chunk_size: usize,
    next_sequence: u64,
}

impl ResultBuffer {
    /// A chunk size of zero is treated as one
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            entries: VecDeque::with_capacity(chunk_size),
            chunk_size,
            next_sequence: 0,
        }
    }

    /// Buffer one outcome; returns a full chunk when the threshold is reached
    pub fn push(&mut self, entry: ChunkEntry) -> Option<ResultChunk> {
        self.entries.push_back(entry);
        if self.entries.len() >= self.chunk_size {
            Some(self.take(self.chunk_size))
        } else {
            None
        }
    }

    /// Everything still buffered, if anything
    pub fn drain(&mut self) -> Option<ResultChunk> {
        if self.entries.is_empty() {
            return None;
        }
        let count = self.entries.len();
        Some(self.take(count))
    }

    fn take(&mut self, count: usize) -> ResultChunk {
        let entries: Vec<ChunkEntry> = self.entries.drain(..count).collect();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(sequence = sequence, entries = entries.len(), "Chunk ready");
        ResultChunk { sequence, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailedRecord, FailureStage, Fields, PredictionResult, RecordMeta};

    fn result(id: &str) -> ChunkEntry {
        ChunkEntry::Result(PredictionResult {
            record_id: id.to_string(),
            meta: RecordMeta::default(),
            fields: Fields::new(),
        })
    }

    fn failure(id: &str) -> ChunkEntry {
        ChunkEntry::Failure(FailedRecord::new(
            id,
            RecordMeta::default(),
            FailureStage::Predict,
            "boom",
        ))
    }

    #[test]
    fn test_chunk_emitted_at_threshold() {
        let mut buffer = ResultBuffer::new(3);
        assert!(buffer.push(result("a")).is_none());
        assert!(buffer.push(failure("b")).is_none());

        let chunk = buffer.push(result("c")).unwrap();
        assert_eq!(chunk.sequence, 0);
        assert_eq!(chunk.record_ids(), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chunk_count_is_ceiling_of_entries() {
        let mut buffer = ResultBuffer::new(15);
        let mut chunks = Vec::new();
        for i in 0..100 {
            if let Some(chunk) = buffer.push(result(&i.to_string())) {
                chunks.push(chunk);
            }
        }
        chunks.extend(buffer.drain());

        assert_eq!(chunks.len(), 7);
        assert!(chunks[..6].iter().all(|c| c.len() == 15));
        assert_eq!(chunks[6].len(), 10);

        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5, 6]);

        // Source order survives chunking
        let ids: Vec<String> = chunks.iter().flat_map(|c| c.record_ids()).collect();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_drain_of_empty_buffer_yields_nothing() {
        let mut buffer = ResultBuffer::new(4);
        assert!(buffer.drain().is_none());

        buffer.push(result("a"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain().unwrap().len(), 1);
        assert!(buffer.drain().is_none());
    }

    #[test]
    fn test_zero_chunk_size_flushes_every_entry() {
        let mut buffer = ResultBuffer::new(0);
        assert_eq!(buffer.chunk_size(), 1);
        assert!(buffer.push(result("a")).is_some());
    }
}
