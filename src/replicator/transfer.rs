//! Moving one tag's content between registries
//!
//! Blobs are copied config first, then layers in manifest order; child manifests
//! of an index are copied by digest; the tag itself is written last so a
//! destination tag never points at content that is not there yet.

use crate::delta::{DeltaOptimizer, DestinationBlob, TransferPlan};
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use crate::registry::{ContentDescriptor, Manifest, ManifestReferences, RegistryClient};
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Byte accounting for a replicated tag.
///
/// Byte counts measure the encoded delta payload, not wire traffic: the registry
/// API still uploads each reconstructed blob whole, and a delta base is read in
/// full from the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Blobs written to the destination
    pub blobs_transferred: usize,
    /// Blobs the destination already held
    pub blobs_present: usize,
    /// Length of the encoded delta frames
    pub bytes_transferred: u64,
    /// Blob bytes the delta frames did not have to carry
    pub bytes_saved: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.blobs_transferred += other.blobs_transferred;
        self.blobs_present += other.blobs_present;
        self.bytes_transferred += other.bytes_transferred;
        self.bytes_saved += other.bytes_saved;
    }

    fn record_present(&mut self, plan: &TransferPlan) {
        self.blobs_present += 1;
        self.bytes_saved += plan.bytes_saved();
    }

    fn record_transfer(&mut self, plan: &TransferPlan, carried: u64) {
        self.blobs_transferred += 1;
        self.bytes_transferred += carried;
        self.bytes_saved += plan.size().saturating_sub(carried);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    /// The destination tag already resolves to the source manifest
    UpToDate { digest: String },
    Replicated { digest: String, stats: TransferStats },
}

/// One tag's transfer, bound to a unit's registries, timeout and cancellation
pub struct ImageTransfer<'a> {
    pub source: &'a dyn RegistryClient,
    pub destination: &'a dyn RegistryClient,
    pub optimizer: &'a DeltaOptimizer,
    pub source_repository: &'a str,
    pub destination_repository: &'a str,
    pub request_timeout: Duration,
    pub token: &'a CancellationToken,
    pub output: &'a Logger,
}

impl ImageTransfer<'_> {
    /// Replicate `tag`, returning early when the destination is already current
    pub async fn replicate_tag(&self, tag: &str, force: bool) -> Result<TagOutcome> {
        let manifest = self
            .call(self.source.get_manifest(self.source_repository, tag))
            .await?
            .ok_or_else(|| {
                ReplicationError::NotFound(format!(
                    "{}:{} no longer exists at {}",
                    self.source_repository,
                    tag,
                    self.source.name()
                ))
            })?;

        let existing = self
            .call(
                self.destination
                    .get_manifest(self.destination_repository, tag),
            )
            .await?;

        if !force && existing.as_ref().is_some_and(|m| m.digest == manifest.digest) {
            return Ok(TagOutcome::UpToDate {
                digest: manifest.digest,
            });
        }

        let mut stats = TransferStats::default();
        match manifest.references()? {
            ManifestReferences::Index { manifests } => {
                self.replicate_children(&manifests, &mut stats).await?;
            }
            references => {
                self.replicate_blobs(&references, existing.as_ref(), &mut stats)
                    .await?;
            }
        }

        self.call(
            self.destination
                .put_manifest(self.destination_repository, tag, &manifest),
        )
        .await?;

        Ok(TagOutcome::Replicated {
            digest: manifest.digest,
            stats,
        })
    }

    /// Copy an image's blobs; `base` is the manifest the destination tag held before
    async fn replicate_blobs(
        &self,
        references: &ManifestReferences,
        base: Option<&Manifest>,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let base_blobs: Vec<ContentDescriptor> = base
            .and_then(|manifest| manifest.references().ok())
            .map(|refs| refs.blobs().into_iter().cloned().collect())
            .unwrap_or_default();

        for (position, descriptor) in references.blobs().into_iter().enumerate() {
            self.transfer_blob(descriptor, base_blobs.get(position), stats)
                .await?;
        }
        Ok(())
    }

    async fn replicate_children(
        &self,
        children: &[ContentDescriptor],
        stats: &mut TransferStats,
    ) -> Result<()> {
        for child in children {
            let present = self
                .call(
                    self.destination
                        .get_manifest(self.destination_repository, &child.digest),
                )
                .await?
                .is_some();
            if present {
                stats.blobs_present += 1;
                continue;
            }

            let manifest = self
                .call(
                    self.source
                        .get_manifest(self.source_repository, &child.digest),
                )
                .await?
                .ok_or_else(|| {
                    ReplicationError::NotFound(format!(
                        "child manifest {} missing from {}",
                        child.digest, self.source_repository
                    ))
                })?;

            let references = manifest.references()?;
            if matches!(references, ManifestReferences::Index { .. }) {
                return Err(ReplicationError::MalformedContent(format!(
                    "nested index {} is not supported",
                    child.digest
                )));
            }

            self.replicate_blobs(&references, None, stats).await?;
            self.call(self.destination.put_manifest(
                self.destination_repository,
                &manifest.digest,
                &manifest,
            ))
            .await?;
        }
        Ok(())
    }

    /// Copy one blob, using `base` (the destination blob in the same position)
    /// as the delta base when it is present
    async fn transfer_blob(
        &self,
        descriptor: &ContentDescriptor,
        base: Option<&ContentDescriptor>,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let blob = descriptor.blob();

        if let Some(existing) = self
            .call(
                self.destination
                    .get_blob_metadata(self.destination_repository, &blob.digest),
            )
            .await?
        {
            let plan = self
                .optimizer
                .plan(
                    &blob,
                    Some(DestinationBlob::metadata_only(&existing)),
                    tokio::io::empty(),
                )
                .await?;
            stats.record_present(&plan);
            return Ok(());
        }

        let base = match base {
            Some(base) if self.optimizer.options().enabled && base.digest != blob.digest => {
                match self
                    .call(
                        self.destination
                            .get_blob_metadata(self.destination_repository, &base.digest),
                    )
                    .await?
                {
                    Some(metadata) => {
                        let content = self.read_destination(&metadata.digest).await?;
                        Some((metadata, content))
                    }
                    None => None,
                }
            }
            _ => None,
        };
        let destination_view = base
            .as_ref()
            .map(|(metadata, content)| DestinationBlob::with_content(metadata, content));

        let plan = self
            .call(async {
                let reader = self
                    .source
                    .get_blob_reader(self.source_repository, &blob.digest)
                    .await?;
                self.optimizer.plan(&blob, destination_view, reader).await
            })
            .await?;

        let packed = self.optimizer.encode(&plan)?;
        let received = self.optimizer.decode(&packed)?;
        let content = self
            .optimizer
            .apply(&received, base.as_ref().map(|(_, content)| content.as_slice()))?;

        self.call(self.destination.put_blob(
            self.destination_repository,
            &blob.digest,
            content,
        ))
        .await?;

        let carried = packed.len() as u64;
        self.output.detail(&format!(
            "{} {} → {}: {} plan, {} of {}",
            DigestUtils::format_digest_short(&blob.digest),
            self.source_repository,
            self.destination_repository,
            plan.format(),
            self.output.format_size(carried),
            self.output.format_size(blob.size)
        ));
        stats.record_transfer(&plan, carried);
        Ok(())
    }

    async fn read_destination(&self, digest: &str) -> Result<Vec<u8>> {
        self.call(async {
            let mut reader = self
                .destination
                .get_blob_reader(self.destination_repository, digest)
                .await?;
            let mut content = Vec::new();
            reader.read_to_end(&mut content).await?;
            Ok(content)
        })
        .await
    }

    /// Run one registry call under the request timeout, abandoning it on cancellation
    async fn call<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ReplicationError::Cancelled),
            outcome = tokio::time::timeout(self.request_timeout, operation) => {
                outcome.unwrap_or_else(|elapsed| Err(elapsed.into()))
            }
        }
    }
}
