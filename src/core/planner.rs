use std::ops::Range;

/// Byte range of one chunk. `byte_end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub byte_start: u64,
    pub byte_end: u64,
}

impl ChunkDescriptor {
    /// Computes the descriptor of a single chunk without planning the whole file.
    pub fn at(index: usize, file_size: u64, chunk_size: u64) -> Self {
        let byte_start = (index as u64).saturating_mul(chunk_size).min(file_size);
        let byte_end = byte_start.saturating_add(chunk_size).min(file_size);

        Self {
            index,
            byte_start,
            byte_end,
        }
    }

    pub fn len(&self) -> u64 {
        self.byte_end - self.byte_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> Range<u64> {
        self.byte_start..self.byte_end
    }
}

/// Number of chunks a file is split into. Zero for an empty file.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }

    file_size.div_ceil(chunk_size) as usize
}

/// 计算分片信息
///
/// Chunk map the orchestrator walks. An empty file yields a single zero-length
/// descriptor, which the orchestrator drops since the session counts zero chunks.
pub fn plan(file_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    if chunk_size == 0 {
        return Vec::new();
    }

    if file_size == 0 {
        return vec![ChunkDescriptor {
            index: 0,
            byte_start: 0,
            byte_end: 0,
        }];
    }

    (0..total_chunks(file_size, chunk_size))
        .map(|index| ChunkDescriptor::at(index, file_size, chunk_size))
        .collect()
}
