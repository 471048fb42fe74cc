//! Delta transfer optimizer
//!
//! Given a source blob and, optionally, the blob the destination already holds in
//! the same position, the optimizer decides how little of the source needs to be
//! carried. Format selection, in order:
//!
//! 1. equal digests: [`DeltaFormat::Identical`], the source is never read
//! 2. no usable base, or sizes differ by more than `large_change_ratio`: `Simple`
//! 3. both blobs within `small_blob_threshold` and sharing enough prefix/suffix
//!    bytes: `PrefixSuffix`
//! 4. otherwise, when either blob is large: `Chunked`, degrading to `Simple` when
//!    more than `max_delta_ratio` of the source changed
//!
//! Every plan carries the digest of the reconstructed content, and [`DeltaOptimizer::apply`]
//! refuses to return bytes that do not hash to it.

pub mod chunk;
pub mod compression;
pub mod format;

pub use format::{DeltaBody, DeltaFormat, DeltaHeader, TransferPlan};

use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use chunk::ChunkDiff;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_CAPACITY_LIMIT: u64 = 64 * 1024 * 1024;

/// Thresholds controlling format selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaOptions {
    /// When false every non-identical blob is sent whole
    pub enabled: bool,
    pub small_blob_threshold: u64,
    pub chunk_size: u64,
    /// Relative size difference above which a base is ignored
    pub large_change_ratio: f64,
    /// Minimum share of the source covered by prefix + suffix for `PrefixSuffix`
    pub min_shared_ratio: f64,
    /// Maximum share of changed bytes for a `Chunked` plan to be kept
    pub max_delta_ratio: f64,
    pub compress_payloads: bool,
    pub compression_min_size: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            small_blob_threshold: 4 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            large_change_ratio: 0.5,
            min_shared_ratio: 0.5,
            max_delta_ratio: 0.8,
            compress_payloads: true,
            compression_min_size: 1024,
        }
    }
}

impl DeltaOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ReplicationError::Configuration(
                "delta.chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.small_blob_threshold == 0 {
            return Err(ReplicationError::Configuration(
                "delta.small_blob_threshold must be greater than 0".to_string(),
            ));
        }
        for (name, ratio) in [
            ("large_change_ratio", self.large_change_ratio),
            ("min_shared_ratio", self.min_shared_ratio),
            ("max_delta_ratio", self.max_delta_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ReplicationError::Configuration(format!(
                    "delta.{} must be within (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        Ok(())
    }
}

/// Digest and size of a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub digest: String,
    pub size: u64,
}

impl BlobDescriptor {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            size,
        }
    }

    pub fn of(content: &[u8]) -> Self {
        Self::new(
            DigestUtils::compute_docker_digest(content),
            content.len() as u64,
        )
    }
}

/// What the destination holds in the source blob's position
#[derive(Debug, Clone, Copy)]
pub struct DestinationBlob<'a> {
    pub descriptor: &'a BlobDescriptor,
    /// Existing bytes, when they were fetched for use as a delta base
    pub content: Option<&'a [u8]>,
}

impl<'a> DestinationBlob<'a> {
    pub fn metadata_only(descriptor: &'a BlobDescriptor) -> Self {
        Self {
            descriptor,
            content: None,
        }
    }

    pub fn with_content(descriptor: &'a BlobDescriptor, content: &'a [u8]) -> Self {
        Self {
            descriptor,
            content: Some(content),
        }
    }
}

/// Delta planner and reconstructor; holds only immutable thresholds
#[derive(Debug, Clone)]
pub struct DeltaOptimizer {
    options: DeltaOptions,
    output: Logger,
}

impl DeltaOptimizer {
    pub fn new(options: DeltaOptions, output: Logger) -> Self {
        Self { options, output }
    }

    pub fn options(&self) -> &DeltaOptions {
        &self.options
    }

    /// Decide how to carry `source` given what the destination already holds
    pub async fn plan<R>(
        &self,
        source: &BlobDescriptor,
        destination: Option<DestinationBlob<'_>>,
        mut source_reader: R,
    ) -> Result<TransferPlan>
    where
        R: AsyncRead + Unpin,
    {
        let source_digest = DigestUtils::normalize_digest(&source.digest)?;

        if let Some(dest) = &destination {
            if DigestUtils::normalize_digest(&dest.descriptor.digest)? == source_digest {
                self.output.debug(&format!(
                    "{} already present at destination",
                    DigestUtils::format_digest_short(&source_digest)
                ));
                return Ok(TransferPlan::new(
                    source_digest,
                    source.size,
                    DeltaBody::Identical,
                ));
            }
        }

        let base = destination
            .filter(|_| self.options.enabled)
            .and_then(|dest| dest.content)
            .filter(|base| !self.is_large_change(source.size, base.len() as u64));

        let plan = match base {
            None => {
                let data = self.read_source(source, &mut source_reader).await?;
                TransferPlan::new(source_digest, source.size, DeltaBody::Simple { data })
            }
            Some(base)
                if source.size <= self.options.small_blob_threshold
                    && base.len() as u64 <= self.options.small_blob_threshold =>
            {
                let data = self.read_source(source, &mut source_reader).await?;
                self.plan_prefix_suffix(source_digest, data, base)
            }
            Some(base) => {
                self.plan_chunked(source, source_digest, base, &mut source_reader)
                    .await?
            }
        };

        self.output.debug(&format!(
            "{}: {} plan carrying {} of {} bytes",
            DigestUtils::format_digest_short(plan.digest()),
            plan.format(),
            plan.payload_len(),
            plan.size()
        ));
        Ok(plan)
    }

    /// Reconstruct the source content, verifying it against the plan's digest
    pub fn apply(&self, plan: &TransferPlan, destination: Option<&[u8]>) -> Result<Vec<u8>> {
        let reconstructed = match plan.body() {
            DeltaBody::Identical => destination
                .ok_or_else(|| {
                    ReplicationError::MalformedContent(
                        "identical plan needs the destination content".to_string(),
                    )
                })?
                .to_vec(),
            DeltaBody::Simple { data } => data.clone(),
            DeltaBody::PrefixSuffix {
                prefix_len,
                suffix_len,
                middle,
            } => {
                let base = require_base(destination, DeltaFormat::PrefixSuffix)?;
                let prefix_len = to_usize(*prefix_len)?;
                let suffix_len = to_usize(*suffix_len)?;
                if prefix_len
                    .checked_add(suffix_len)
                    .is_none_or(|affixes| affixes > base.len())
                {
                    return Err(ReplicationError::MalformedContent(format!(
                        "prefix {} + suffix {} exceed base of {} bytes",
                        prefix_len,
                        suffix_len,
                        base.len()
                    )));
                }

                let mut out = Vec::with_capacity(prefix_len + middle.len() + suffix_len);
                out.extend_from_slice(&base[..prefix_len]);
                out.extend_from_slice(middle);
                out.extend_from_slice(&base[base.len() - suffix_len..]);
                out
            }
            DeltaBody::Chunked {
                chunk_size,
                changed_chunks,
                payload,
            } => {
                let base = require_base(destination, DeltaFormat::Chunked)?;
                apply_chunked(plan.size(), *chunk_size, changed_chunks, payload, base)?
            }
        };

        DigestUtils::verify_data_integrity(&reconstructed, plan.digest())?;
        Ok(reconstructed)
    }

    /// [`apply`](Self::apply) with the destination content supplied as a stream
    pub async fn apply_from_reader<R>(
        &self,
        plan: &TransferPlan,
        destination_reader: Option<R>,
    ) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let destination = match destination_reader {
            Some(mut reader) => {
                let mut content = Vec::new();
                reader.read_to_end(&mut content).await?;
                Some(content)
            }
            None => None,
        };
        self.apply(plan, destination.as_deref())
    }

    /// Serialize a plan for transit, compressing it when configured
    pub fn encode(&self, plan: &TransferPlan) -> Result<Vec<u8>> {
        let frame = plan.encode()?;
        compression::pack(
            &frame,
            self.options.compress_payloads,
            self.options.compression_min_size,
        )
    }

    pub fn decode(&self, packed: &[u8]) -> Result<TransferPlan> {
        TransferPlan::decode(&compression::unpack(packed)?)
    }

    fn is_large_change(&self, source_size: u64, base_size: u64) -> bool {
        let larger = source_size.max(base_size);
        if larger == 0 {
            return false;
        }
        let difference = source_size.abs_diff(base_size);
        difference as f64 / larger as f64 > self.options.large_change_ratio
    }

    async fn read_source<R>(&self, source: &BlobDescriptor, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::with_capacity(capacity_hint(source.size, self.options.chunk_size));
        reader.read_to_end(&mut data).await?;
        DigestUtils::verify_data_integrity(&data, &source.digest)?;
        Ok(data)
    }

    fn plan_prefix_suffix(&self, digest: String, data: Vec<u8>, base: &[u8]) -> TransferPlan {
        let size = data.len() as u64;
        let (prefix_len, suffix_len) = shared_affixes(&data, base);
        let shared = (prefix_len + suffix_len) as f64;

        if data.is_empty() || shared / (data.len() as f64) < self.options.min_shared_ratio {
            return TransferPlan::new(digest, size, DeltaBody::Simple { data });
        }

        let middle = data[prefix_len..data.len() - suffix_len].to_vec();
        TransferPlan::new(
            digest,
            size,
            DeltaBody::PrefixSuffix {
                prefix_len: prefix_len as u64,
                suffix_len: suffix_len as u64,
                middle,
            },
        )
    }

    async fn plan_chunked<R>(
        &self,
        source: &BlobDescriptor,
        digest: String,
        base: &[u8],
        reader: &mut R,
    ) -> Result<TransferPlan>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = self.options.chunk_size;
        let mut buffer = vec![0u8; to_usize(chunk_size)?];
        let mut diff = ChunkDiff::new(base, chunk_size);
        let mut whole = Vec::with_capacity(capacity_hint(source.size, self.options.chunk_size));

        loop {
            let read = chunk::read_chunk(reader, &mut buffer).await?;
            if read == 0 {
                break;
            }
            diff.push(&buffer[..read])?;
            whole.extend_from_slice(&buffer[..read]);
            if read < buffer.len() {
                break;
            }
        }

        DigestUtils::verify_data_integrity(&whole, &source.digest)?;
        let size = whole.len() as u64;

        if size == 0 || diff.changed_bytes() as f64 / size as f64 > self.options.max_delta_ratio {
            self.output.debug(&format!(
                "{}: {} of {} chunks changed, sending whole blob",
                DigestUtils::format_digest_short(&digest),
                diff.changed_chunks(),
                diff.chunks_seen()
            ));
            return Ok(TransferPlan::new(digest, size, DeltaBody::Simple { data: whole }));
        }

        Ok(TransferPlan::new(digest, size, diff.into_body()))
    }
}

/// Longest common prefix and suffix, each capped at half the shorter input
fn shared_affixes(source: &[u8], base: &[u8]) -> (usize, usize) {
    let cap = source.len().min(base.len()) / 2;
    let prefix = source
        .iter()
        .zip(base)
        .take(cap)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = source
        .iter()
        .rev()
        .zip(base.iter().rev())
        .take(cap)
        .take_while(|(a, b)| a == b)
        .count();
    (prefix, suffix)
}

fn apply_chunked(
    size: u64,
    chunk_size: u64,
    changed_chunks: &[u32],
    payload: &[u8],
    base: &[u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(to_usize(size)?.min(payload.len() + base.len()));
    let mut changed = changed_chunks.iter().peekable();
    let mut offset = 0usize;

    for index in 0..chunk::chunk_count(size, chunk_size) {
        let len = to_usize(chunk::chunk_len(index, size, chunk_size))?;

        if changed.peek().is_some_and(|next| u64::from(**next) == index) {
            changed.next();
            let piece = payload.get(offset..offset + len).ok_or_else(|| {
                ReplicationError::MalformedContent(format!(
                    "chunk payload too short for chunk {}",
                    index
                ))
            })?;
            out.extend_from_slice(piece);
            offset += len;
        } else {
            let piece = chunk::chunk_range(base, index, chunk_size)
                .map(|range| &base[range])
                .filter(|piece| piece.len() == len)
                .ok_or_else(|| {
                    ReplicationError::MalformedContent(format!(
                        "base blob has no chunk {} to reuse",
                        index
                    ))
                })?;
            out.extend_from_slice(piece);
        }
    }

    if changed.next().is_some() || offset != payload.len() {
        return Err(ReplicationError::MalformedContent(
            "chunk list does not match payload".to_string(),
        ));
    }

    Ok(out)
}

fn require_base(destination: Option<&[u8]>, format: DeltaFormat) -> Result<&[u8]> {
    destination.ok_or_else(|| {
        ReplicationError::MalformedContent(format!("{} plan needs a base blob", format))
    })
}

/// Pre-allocation for a blob of advertised `size`; registry metadata is not
/// trusted beyond a few chunks, the vector grows past that as data arrives
fn capacity_hint(size: u64, chunk_size: u64) -> usize {
    let limit = chunk_size.saturating_mul(4).max(DEFAULT_CAPACITY_LIMIT);
    usize::try_from(size.min(limit)).unwrap_or(0)
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        ReplicationError::MalformedContent(format!("length {} exceeds addressable memory", value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreadableSource;

    impl AsyncRead for UnreadableSource {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("source must not be read")))
        }
    }

    fn optimizer_with(options: DeltaOptions) -> DeltaOptimizer {
        DeltaOptimizer::new(options, Logger::new_quiet())
    }

    fn small_chunk_options() -> DeltaOptions {
        DeltaOptions {
            small_blob_threshold: 64,
            chunk_size: 16,
            ..Default::default()
        }
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    async fn round_trip(
        optimizer: &DeltaOptimizer,
        source: &[u8],
        base: Option<&[u8]>,
    ) -> TransferPlan {
        let source_desc = BlobDescriptor::of(source);
        let base_desc = base.map(BlobDescriptor::of);
        let destination = base_desc
            .as_ref()
            .zip(base)
            .map(|(desc, content)| DestinationBlob::with_content(desc, content));

        let plan = optimizer
            .plan(&source_desc, destination, source)
            .await
            .unwrap();

        let transported = optimizer.decode(&optimizer.encode(&plan).unwrap()).unwrap();
        assert_eq!(transported, plan);
        assert_eq!(optimizer.apply(&transported, base).unwrap(), source);
        plan
    }

    #[tokio::test]
    async fn test_identical_skips_source_read() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let content = b"layer content".to_vec();
        let desc = BlobDescriptor::of(&content);

        let plan = optimizer
            .plan(&desc, Some(DestinationBlob::metadata_only(&desc)), UnreadableSource)
            .await
            .unwrap();

        assert_eq!(plan.format(), DeltaFormat::Identical);
        assert_eq!(plan.payload_len(), 0);
        assert_eq!(optimizer.apply(&plan, Some(&content)).unwrap(), content);
    }

    #[tokio::test]
    async fn test_simple_without_base() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let plan = round_trip(&optimizer, b"brand new blob", None).await;
        assert_eq!(plan.format(), DeltaFormat::Simple);
        assert_eq!(plan.bytes_saved(), 0);
    }

    #[tokio::test]
    async fn test_simple_on_large_size_change() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let base = patterned(100, 1);
        let source = patterned(400, 1);
        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        assert_eq!(plan.format(), DeltaFormat::Simple);
    }

    #[tokio::test]
    async fn test_prefix_suffix_for_small_edit() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let base = patterned(1000, 3);
        let mut source = base.clone();
        source[500] ^= 0xff;
        source[501] ^= 0xff;

        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        assert_eq!(plan.format(), DeltaFormat::PrefixSuffix);
        assert_eq!(plan.payload_len(), 2);
        assert_eq!(plan.bytes_saved(), 998);
    }

    #[tokio::test]
    async fn test_prefix_suffix_cap_prevents_overlap() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let base = vec![b'x'; 10];
        let source = vec![b'x'; 11];
        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        match plan.body() {
            DeltaBody::PrefixSuffix {
                prefix_len,
                suffix_len,
                middle,
            } => {
                assert_eq!((*prefix_len, *suffix_len), (5, 5));
                assert_eq!(middle.len(), 1);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simple_when_little_is_shared() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let base = patterned(200, 1);
        let source = patterned(200, 2);
        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        assert_eq!(plan.format(), DeltaFormat::Simple);
    }

    #[tokio::test]
    async fn test_chunked_for_large_blobs() {
        let optimizer = optimizer_with(small_chunk_options());
        let base = patterned(160, 9);
        let mut source = base.clone();
        source[40] ^= 0x01;
        source.extend_from_slice(b"tail");

        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        match plan.body() {
            DeltaBody::Chunked {
                chunk_size,
                changed_chunks,
                payload,
            } => {
                assert_eq!(*chunk_size, 16);
                assert_eq!(changed_chunks, &vec![2, 10]);
                assert_eq!(payload.len(), 20);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunked_degrades_when_mostly_changed() {
        let optimizer = optimizer_with(small_chunk_options());
        let base = patterned(160, 9);
        let source = patterned(160, 10);
        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        assert_eq!(plan.format(), DeltaFormat::Simple);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_is_rejected() {
        let optimizer = optimizer_with(small_chunk_options());
        let base = patterned(160, 4);
        let mut source = base.clone();
        source[100] ^= 0x80;

        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        let mut corrupted = plan.clone();
        if let DeltaBody::Chunked { payload, .. } = corrupted.body_mut() {
            payload[3] ^= 0x01;
        } else {
            panic!("expected chunked plan, got {}", plan.format());
        }

        assert!(matches!(
            optimizer.apply(&corrupted, Some(&base)),
            Err(ReplicationError::IntegrityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_source_read_is_detected() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let desc = BlobDescriptor::of(b"expected");
        let result = optimizer.plan(&desc, None, &b"tampered"[..]).await;
        assert!(matches!(
            result,
            Err(ReplicationError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_is_rejected_without_allocating() {
        let optimizer = optimizer_with(small_chunk_options());
        let base = patterned(160, 4);
        let plan = TransferPlan::new(
            DigestUtils::compute_docker_digest(&base),
            1 << 60,
            DeltaBody::Chunked {
                chunk_size: 16,
                changed_chunks: Vec::new(),
                payload: Vec::new(),
            },
        );

        assert!(matches!(
            optimizer.apply(&plan, Some(&base)),
            Err(ReplicationError::MalformedContent(_))
        ));
    }

    #[tokio::test]
    async fn test_advertised_size_is_not_trusted_for_allocation() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let desc = BlobDescriptor::new(DigestUtils::compute_docker_digest(b"abc"), u64::MAX / 2);
        let plan = optimizer.plan(&desc, None, &b"abc"[..]).await.unwrap();
        assert_eq!(plan.format(), DeltaFormat::Simple);
        assert_eq!(capacity_hint(u64::MAX, 1024), DEFAULT_CAPACITY_LIMIT as usize);
        assert_eq!(capacity_hint(10, 1024), 10);
    }

    #[tokio::test]
    async fn test_disabled_delta_sends_whole_blob() {
        let optimizer = optimizer_with(DeltaOptions {
            enabled: false,
            ..Default::default()
        });
        let base = patterned(1000, 3);
        let mut source = base.clone();
        source[10] = 0;
        let plan = round_trip(&optimizer, &source, Some(&base)).await;
        assert_eq!(plan.format(), DeltaFormat::Simple);
    }

    #[tokio::test]
    async fn test_apply_from_reader() {
        let optimizer = optimizer_with(DeltaOptions::default());
        let base = patterned(1000, 5);
        let mut source = base.clone();
        source[700] = !source[700];
        let plan = round_trip(&optimizer, &source, Some(&base)).await;

        let rebuilt = optimizer
            .apply_from_reader(&plan, Some(&base[..]))
            .await
            .unwrap();
        assert_eq!(rebuilt, source);

        assert!(optimizer
            .apply_from_reader::<&[u8]>(&plan, None)
            .await
            .is_err());
    }

    #[test]
    fn test_validate_options() {
        assert!(DeltaOptions::default().validate().is_ok());
        let bad = DeltaOptions {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = DeltaOptions {
            max_delta_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
