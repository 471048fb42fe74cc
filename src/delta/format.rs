//! Transfer plans and their binary wire frame
//!
//! ```text
//! u8 format | [u8; 32] sha256 of reconstructed content | u64 BE reconstructed length
//!   | format fields | payload
//! ```
//!
//! `PrefixSuffix` fields are two u64 BE lengths; `Chunked` fields are a u64 BE chunk
//! size, a u32 BE count and that many u32 BE chunk indices. `Identical` and
//! `Simple` carry no fields.

use super::chunk;
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use std::fmt;

/// Delta encoding chosen for one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFormat {
    Identical,
    Simple,
    PrefixSuffix,
    Chunked,
}

impl DeltaFormat {
    pub fn tag(self) -> u8 {
        match self {
            DeltaFormat::Identical => 0,
            DeltaFormat::Simple => 1,
            DeltaFormat::PrefixSuffix => 2,
            DeltaFormat::Chunked => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(DeltaFormat::Identical),
            1 => Ok(DeltaFormat::Simple),
            2 => Ok(DeltaFormat::PrefixSuffix),
            3 => Ok(DeltaFormat::Chunked),
            other => Err(ReplicationError::MalformedContent(format!(
                "Unknown delta format tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DeltaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeltaFormat::Identical => "identical",
            DeltaFormat::Simple => "simple",
            DeltaFormat::PrefixSuffix => "prefix-suffix",
            DeltaFormat::Chunked => "chunked",
        };
        f.write_str(name)
    }
}

/// Metadata prefixed to every transferred payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaHeader {
    pub format: DeltaFormat,
    /// Digest of the content `apply` must reconstruct
    pub digest: String,
    /// Length of the reconstructed content
    pub size: u64,
}

/// Format-specific instructions and carried bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaBody {
    Identical,
    Simple {
        data: Vec<u8>,
    },
    PrefixSuffix {
        prefix_len: u64,
        suffix_len: u64,
        middle: Vec<u8>,
    },
    Chunked {
        chunk_size: u64,
        /// Ascending indices of source chunks that differ from the destination
        changed_chunks: Vec<u32>,
        /// The changed chunks, concatenated in index order
        payload: Vec<u8>,
    },
}

/// How to reconstruct one source blob on the destination side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    digest: String,
    size: u64,
    body: DeltaBody,
}

impl TransferPlan {
    pub(crate) fn new(digest: String, size: u64, body: DeltaBody) -> Self {
        Self { digest, size, body }
    }

    pub fn header(&self) -> DeltaHeader {
        DeltaHeader {
            format: self.format(),
            digest: self.digest.clone(),
            size: self.size,
        }
    }

    pub fn format(&self) -> DeltaFormat {
        match self.body {
            DeltaBody::Identical => DeltaFormat::Identical,
            DeltaBody::Simple { .. } => DeltaFormat::Simple,
            DeltaBody::PrefixSuffix { .. } => DeltaFormat::PrefixSuffix,
            DeltaBody::Chunked { .. } => DeltaFormat::Chunked,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn body(&self) -> &DeltaBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut DeltaBody {
        &mut self.body
    }

    /// Bytes of blob content carried by the plan
    pub fn payload_len(&self) -> u64 {
        let len = match &self.body {
            DeltaBody::Identical => 0,
            DeltaBody::Simple { data } => data.len(),
            DeltaBody::PrefixSuffix { middle, .. } => middle.len(),
            DeltaBody::Chunked { payload, .. } => payload.len(),
        };
        len as u64
    }

    /// Content bytes that did not have to be carried
    pub fn bytes_saved(&self) -> u64 {
        self.size.saturating_sub(self.payload_len())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw_digest = DigestUtils::to_raw(&self.digest)?;

        let mut frame = Vec::with_capacity(41 + self.payload_len() as usize);
        frame.push(self.format().tag());
        frame.extend_from_slice(&raw_digest);
        frame.extend_from_slice(&self.size.to_be_bytes());

        match &self.body {
            DeltaBody::Identical => {}
            DeltaBody::Simple { data } => frame.extend_from_slice(data),
            DeltaBody::PrefixSuffix {
                prefix_len,
                suffix_len,
                middle,
            } => {
                frame.extend_from_slice(&prefix_len.to_be_bytes());
                frame.extend_from_slice(&suffix_len.to_be_bytes());
                frame.extend_from_slice(middle);
            }
            DeltaBody::Chunked {
                chunk_size,
                changed_chunks,
                payload,
            } => {
                let count = u32::try_from(changed_chunks.len()).map_err(|_| {
                    ReplicationError::MalformedContent("Too many changed chunks".to_string())
                })?;
                frame.extend_from_slice(&chunk_size.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
                for index in changed_chunks {
                    frame.extend_from_slice(&index.to_be_bytes());
                }
                frame.extend_from_slice(payload);
            }
        }

        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(frame);

        let format = DeltaFormat::from_tag(reader.read_u8()?)?;
        let mut raw_digest = [0u8; 32];
        raw_digest.copy_from_slice(reader.take(32)?);
        let digest = DigestUtils::from_raw(&raw_digest);
        let size = reader.read_u64()?;

        let body = match format {
            DeltaFormat::Identical => DeltaBody::Identical,
            DeltaFormat::Simple => {
                let data = reader.rest().to_vec();
                if data.len() as u64 != size {
                    return Err(malformed(format!(
                        "simple payload is {} bytes, header says {}",
                        data.len(),
                        size
                    )));
                }
                DeltaBody::Simple { data }
            }
            DeltaFormat::PrefixSuffix => {
                let prefix_len = reader.read_u64()?;
                let suffix_len = reader.read_u64()?;
                let middle = reader.rest().to_vec();
                let total = prefix_len
                    .checked_add(suffix_len)
                    .and_then(|affixes| affixes.checked_add(middle.len() as u64));
                if total != Some(size) {
                    return Err(malformed(format!(
                        "prefix {} + suffix {} + middle {} does not add up to {}",
                        prefix_len,
                        suffix_len,
                        middle.len(),
                        size
                    )));
                }
                DeltaBody::PrefixSuffix {
                    prefix_len,
                    suffix_len,
                    middle,
                }
            }
            DeltaFormat::Chunked => {
                let chunk_size = reader.read_u64()?;
                if chunk_size == 0 {
                    return Err(malformed("chunk size is zero".to_string()));
                }
                let total_chunks = chunk::chunk_count(size, chunk_size);

                let count = reader.read_u32()? as usize;
                if count as u64 > total_chunks {
                    return Err(malformed(format!(
                        "{} changed chunks listed for a {} chunk blob",
                        count, total_chunks
                    )));
                }

                let mut changed_chunks = Vec::with_capacity(count);
                let mut expected_payload = 0u64;
                for _ in 0..count {
                    let index = reader.read_u32()?;
                    if changed_chunks.last().is_some_and(|last| *last >= index)
                        || u64::from(index) >= total_chunks
                    {
                        return Err(malformed(format!("invalid chunk index {}", index)));
                    }
                    expected_payload += chunk::chunk_len(u64::from(index), size, chunk_size);
                    changed_chunks.push(index);
                }

                let payload = reader.rest().to_vec();
                if payload.len() as u64 != expected_payload {
                    return Err(malformed(format!(
                        "chunk payload is {} bytes, expected {}",
                        payload.len(),
                        expected_payload
                    )));
                }

                DeltaBody::Chunked {
                    chunk_size,
                    changed_chunks,
                    payload,
                }
            }
        };

        Ok(Self { digest, size, body })
    }
}

fn malformed(reason: String) -> ReplicationError {
    ReplicationError::MalformedContent(format!("Invalid delta frame: {}", reason))
}

struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed(format!("truncated at offset {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_for(content: &[u8], body: DeltaBody) -> TransferPlan {
        TransferPlan::new(
            DigestUtils::compute_docker_digest(content),
            content.len() as u64,
            body,
        )
    }

    #[test]
    fn test_frame_layout() {
        let plan = plan_for(
            b"abcdef",
            DeltaBody::PrefixSuffix {
                prefix_len: 2,
                suffix_len: 1,
                middle: b"cde".to_vec(),
            },
        );
        let frame = plan.encode().unwrap();

        assert_eq!(frame[0], DeltaFormat::PrefixSuffix.tag());
        assert_eq!(&frame[1..33], &DigestUtils::compute_raw(b"abcdef"));
        assert_eq!(&frame[33..41], &6u64.to_be_bytes());
        assert_eq!(&frame[41..49], &2u64.to_be_bytes());
        assert_eq!(&frame[49..57], &1u64.to_be_bytes());
        assert_eq!(&frame[57..], b"cde");
        assert_eq!(TransferPlan::decode(&frame).unwrap(), plan);
    }

    #[test]
    fn test_identical_frame_has_no_payload() {
        let plan = plan_for(b"same", DeltaBody::Identical);
        let frame = plan.encode().unwrap();
        assert_eq!(frame.len(), 41);
        assert_eq!(plan.payload_len(), 0);
        assert_eq!(plan.bytes_saved(), 4);
    }

    #[test]
    fn test_chunked_frame_decodes() {
        let content = vec![7u8; 10];
        let plan = plan_for(
            &content,
            DeltaBody::Chunked {
                chunk_size: 4,
                changed_chunks: vec![0, 2],
                payload: vec![7u8; 6],
            },
        );
        let decoded = TransferPlan::decode(&plan.encode().unwrap()).unwrap();
        assert_eq!(decoded, plan);
        assert_eq!(decoded.header().format, DeltaFormat::Chunked);
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(TransferPlan::decode(&[]).is_err());
        assert!(TransferPlan::decode(&[9u8; 41]).is_err());

        let plan = plan_for(b"payload", DeltaBody::Simple { data: b"payload".to_vec() });
        let mut frame = plan.encode().unwrap();
        frame.pop();
        assert!(matches!(
            TransferPlan::decode(&frame),
            Err(ReplicationError::MalformedContent(_))
        ));

        let chunked = plan_for(
            &[1u8; 8],
            DeltaBody::Chunked {
                chunk_size: 4,
                changed_chunks: vec![1, 0],
                payload: vec![1u8; 8],
            },
        );
        assert!(TransferPlan::decode(&chunked.encode().unwrap()).is_err());
    }
}
