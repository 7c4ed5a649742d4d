use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Outcome of recording one received chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The range was already covered; nothing changed.
    Duplicate,
    /// The chunk was recorded; `complete` is true when the whole payload has
    /// arrived and the last chunk was seen.
    Accepted { complete: bool },
}

/// Receiver-side bookkeeping for one object's chunked payload: the set of
/// byte ranges written so far plus the is_last marker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkTracker {
    /// Sorted, non-overlapping (start, end) ranges, end exclusive.
    ranges: Vec<(u64, u64)>,
    total: u64,
    last_seen: bool,
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a chunk. Out-of-order chunks are accepted only while the bytes
    /// buffered beyond the contiguous prefix stay within `max_buffer`;
    /// otherwise the chunk is refused with `Discarded` and must be resent
    /// later.
    pub fn record(
        &mut self,
        offset: u64,
        length: u64,
        total: u64,
        is_last: bool,
        max_buffer: usize,
    ) -> Result<AppendOutcome, SyncError> {
        if length == 0 && total == 0 {
            self.total = 0;
            self.last_seen = self.last_seen || is_last;
            return Ok(AppendOutcome::Accepted {
                complete: self.last_seen,
            });
        }
        if self.total == 0 {
            self.total = total;
        } else if total != self.total {
            return Err(SyncError::invalid("chunk total mismatch"));
        }
        if offset + length > self.total {
            return Err(SyncError::invalid("chunk beyond object size"));
        }

        let end = offset + length;
        if self.covered(offset, end) {
            return Ok(AppendOutcome::Duplicate);
        }

        let prefix = self.contiguous_prefix();
        if offset > prefix {
            let buffered: u64 = self
                .ranges
                .iter()
                .map(|(s, e)| e.saturating_sub((*s).max(prefix)))
                .sum();
            if buffered + length > max_buffer as u64 {
                return Err(SyncError::Discarded);
            }
        }

        self.insert(offset, end);
        if is_last {
            self.last_seen = true;
        }
        Ok(AppendOutcome::Accepted {
            complete: self.is_complete(),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.last_seen && self.contiguous_prefix() >= self.total
    }

    /// Length of the contiguous byte prefix received so far.
    pub fn contiguous_prefix(&self) -> u64 {
        let mut prefix = 0u64;
        for (start, end) in self.ranges.iter() {
            if *start > prefix {
                break;
            }
            prefix = prefix.max(*end);
        }
        prefix
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn covered(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|(s, e)| *s <= start && end <= *e)
    }

    fn insert(&mut self, start: u64, end: u64) {
        self.ranges.push((start, end));
        self.ranges.sort_by_key(|(s, _)| *s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for (s, e) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some((_, last_end)) if s <= *last_end => *last_end = (*last_end).max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }
}

/// Ascending chunk boundaries for a payload of `size` bytes.
pub fn chunk_offsets(size: u64, chunk_size: usize) -> Vec<(u64, usize)> {
    let chunk = chunk_size.max(1) as u64;
    if size == 0 {
        return vec![(0, 0)];
    }
    let mut offsets = Vec::new();
    let mut offset = 0u64;
    while offset < size {
        let len = chunk.min(size - offset) as usize;
        offsets.push((offset, len));
        offset += len as u64;
    }
    offsets
}
