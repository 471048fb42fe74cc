//! Fixed-size positional chunking

use super::format::DeltaBody;
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Length of chunk `index` in a blob of `size` bytes
pub fn chunk_len(index: u64, size: u64, chunk_size: u64) -> u64 {
    let start = index.saturating_mul(chunk_size);
    size.saturating_sub(start).min(chunk_size)
}

/// Byte range of chunk `index` within `data`, if the chunk exists
pub fn chunk_range(data: &[u8], index: u64, chunk_size: u64) -> Option<Range<usize>> {
    let start = usize::try_from(index.checked_mul(chunk_size)?).ok()?;
    if start >= data.len() {
        return None;
    }
    let len = usize::try_from(chunk_size).unwrap_or(usize::MAX);
    Some(start..data.len().min(start.saturating_add(len)))
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of stream
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Accumulates the positional comparison of source chunks against a base blob
pub struct ChunkDiff<'a> {
    base: &'a [u8],
    chunk_size: u64,
    next_index: u64,
    changed_chunks: Vec<u32>,
    payload: Vec<u8>,
}

impl<'a> ChunkDiff<'a> {
    pub fn new(base: &'a [u8], chunk_size: u64) -> Self {
        Self {
            base,
            chunk_size,
            next_index: 0,
            changed_chunks: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Compare the next source chunk with the base chunk at the same position
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let index = self.next_index;
        self.next_index += 1;

        let unchanged = chunk_range(self.base, index, self.chunk_size)
            .map(|range| &self.base[range])
            .is_some_and(|base_chunk| {
                base_chunk.len() == chunk.len()
                    && DigestUtils::compute_raw(base_chunk) == DigestUtils::compute_raw(chunk)
            });

        if !unchanged {
            let index = u32::try_from(index).map_err(|_| {
                ReplicationError::MalformedContent(format!(
                    "Blob has too many chunks for delta encoding ({})",
                    index
                ))
            })?;
            self.changed_chunks.push(index);
            self.payload.extend_from_slice(chunk);
        }

        Ok(())
    }

    pub fn chunks_seen(&self) -> u64 {
        self.next_index
    }

    pub fn changed_chunks(&self) -> usize {
        self.changed_chunks.len()
    }

    pub fn changed_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn into_body(self) -> DeltaBody {
        DeltaBody::Chunked {
            chunk_size: self.chunk_size,
            changed_chunks: self.changed_chunks,
            payload: self.payload,
        }
    }
}
