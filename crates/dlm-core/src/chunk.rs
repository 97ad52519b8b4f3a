//! Chunk planning for the parallel fetcher.

/// One byte range [start, end) of a parallel fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Splits `total_size` bytes into `count` near-equal chunks covering the
/// whole resource; earlier chunks absorb the remainder. Empty for a zero
/// size or count.
pub fn plan(total_size: u64, count: usize) -> Vec<Chunk> {
    if total_size == 0 || count == 0 {
        return Vec::new();
    }
    let count = (count as u64).min(total_size);
    let base = total_size / count;
    let remainder = total_size % count;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        let len = if i < remainder { base + 1 } else { base };
        chunks.push(Chunk {
            start,
            end: start + len,
        });
        start += len;
    }
    chunks
}
