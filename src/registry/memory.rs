//! In-process registry with fault injection
//!
//! Behaves like a well-formed registry (digest-checked uploads, manifests
//! rejected while referenced content is missing) and lets tests inject transient
//! failures, authorization failures, corrupted reads and latency per operation.

use super::manifest::{
    ContentDescriptor, DOCKER_CONFIG, DOCKER_LAYER, DOCKER_MANIFEST_V2, Manifest,
    ManifestReferences,
};
use super::{BlobReader, RegistryClient};
use crate::delta::BlobDescriptor;
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Registry operations, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    ListRepositories,
    ListTags,
    GetManifest,
    GetBlobMetadata,
    GetBlobReader,
    PutBlob,
    PutManifest,
}

#[derive(Debug, Default)]
struct Repository {
    tags: BTreeMap<String, String>,
    manifests: HashMap<String, Manifest>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Faults {
    transient: HashMap<Operation, usize>,
    denied_repositories: HashSet<String>,
    corrupt_reads: HashMap<String, usize>,
    interrupted_reads: HashMap<String, usize>,
    latency: HashMap<Operation, Duration>,
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    name: String,
    repositories: Mutex<BTreeMap<String, Repository>>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<Operation, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Store a blob in `repository`, returning its digest
    pub fn insert_blob(&self, repository: &str, content: &[u8]) -> String {
        let digest = DigestUtils::compute_docker_digest(content);
        lock(&self.repositories)
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), content.to_vec());
        digest
    }

    /// Store a manifest by digest and, when given, under `tag`
    pub fn insert_manifest(&self, repository: &str, tag: Option<&str>, manifest: &Manifest) {
        let mut repositories = lock(&self.repositories);
        let repo = repositories.entry(repository.to_string()).or_default();
        repo.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), manifest.digest.clone());
        }
    }

    /// Create a schema 2 image from raw layer contents and tag it
    pub fn push_image(&self, repository: &str, tag: &str, layers: &[Vec<u8>]) -> Manifest {
        let layer_descriptors: Vec<ContentDescriptor> = layers
            .iter()
            .map(|layer| ContentDescriptor {
                media_type: DOCKER_LAYER.to_string(),
                digest: self.insert_blob(repository, layer),
                size: layer.len() as u64,
            })
            .collect();

        let diff_ids: Vec<&str> = layer_descriptors.iter().map(|d| d.digest.as_str()).collect();
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        })
        .to_string()
        .into_bytes();
        let config_descriptor = ContentDescriptor {
            media_type: DOCKER_CONFIG.to_string(),
            digest: self.insert_blob(repository, &config),
            size: config.len() as u64,
        };

        let manifest = Manifest::image(&config_descriptor, &layer_descriptors)
            .unwrap_or_else(|_| Manifest::new(DOCKER_MANIFEST_V2, Vec::new()));
        self.insert_manifest(repository, Some(tag), &manifest);
        manifest
    }

    pub fn remove_tag(&self, repository: &str, tag: &str) {
        if let Some(repo) = lock(&self.repositories).get_mut(repository) {
            repo.tags.remove(tag);
        }
    }

    pub fn tag_digest(&self, repository: &str, tag: &str) -> Option<String> {
        lock(&self.repositories)
            .get(repository)
            .and_then(|repo| repo.tags.get(tag).cloned())
    }

    pub fn tags(&self, repository: &str) -> Vec<String> {
        lock(&self.repositories)
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn blob(&self, repository: &str, digest: &str) -> Option<Vec<u8>> {
        lock(&self.repositories)
            .get(repository)
            .and_then(|repo| repo.blobs.get(digest).cloned())
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.blob(repository, digest).is_some()
    }

    /// Fail the next `count` calls of `operation` with a transient error
    pub fn fail_next(&self, operation: Operation, count: usize) {
        *lock(&self.faults).transient.entry(operation).or_default() += count;
    }

    /// Reject every call touching `repository` with an authorization failure
    pub fn deny_repository(&self, repository: &str) {
        lock(&self.faults)
            .denied_repositories
            .insert(repository.to_string());
    }

    /// Flip a bit in the next `count` reads of blob `digest`
    pub fn corrupt_next_reads(&self, digest: &str, count: usize) {
        *lock(&self.faults)
            .corrupt_reads
            .entry(digest.to_string())
            .or_default() += count;
    }

    /// Reset the connection half way through the next `count` reads of blob `digest`
    pub fn interrupt_next_reads(&self, digest: &str, count: usize) {
        *lock(&self.faults)
            .interrupted_reads
            .entry(digest.to_string())
            .or_default() += count;
    }

    /// Delay every call of `operation` by `delay`
    pub fn set_latency(&self, operation: Operation, delay: Duration) {
        lock(&self.faults).latency.insert(operation, delay);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        lock(&self.calls).get(&operation).copied().unwrap_or(0)
    }

    /// Calls that move content: blob reads and writes, manifest writes
    pub fn transfer_calls(&self) -> usize {
        self.calls(Operation::GetBlobReader)
            + self.calls(Operation::PutBlob)
            + self.calls(Operation::PutManifest)
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Record the call and apply any injected latency and faults
    async fn enter(&self, operation: Operation, repository: Option<&str>) -> Result<()> {
        *lock(&self.calls).entry(operation).or_default() += 1;

        let delay = lock(&self.faults).latency.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = lock(&self.faults);
        if let Some(remaining) = faults.transient.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicationError::TransientNetwork(format!(
                    "{}: injected failure for {:?}",
                    self.name, operation
                )));
            }
        }

        if let Some(repository) = repository {
            if faults.denied_repositories.contains(repository) {
                return Err(ReplicationError::AuthFailure(format!(
                    "{}: access to {} denied",
                    self.name, repository
                )));
            }
        }

        Ok(())
    }

    fn manifest_blobs_present(repo: &Repository, manifest: &Manifest) -> Result<()> {
        let missing: Vec<String> = match manifest.references()? {
            ManifestReferences::Image { config, layers } => std::iter::once(&config)
                .chain(layers.iter())
                .filter(|d| !repo.blobs.contains_key(&d.digest))
                .map(|d| d.digest.clone())
                .collect(),
            ManifestReferences::Index { manifests } => manifests
                .iter()
                .filter(|d| !repo.manifests.contains_key(&d.digest))
                .map(|d| d.digest.clone())
                .collect(),
        };

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::Registry(format!(
                "MANIFEST_BLOB_UNKNOWN: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Reader that fails like a dropped connection
struct ConnectionReset;

impl AsyncRead for ConnectionReset {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.enter(Operation::Ping, None).await
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        self.enter(Operation::ListRepositories, None).await?;
        Ok(lock(&self.repositories).keys().cloned().collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.enter(Operation::ListTags, Some(repository)).await?;
        lock(&self.repositories)
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .ok_or_else(|| {
                ReplicationError::NotFound(format!("{}: repository {}", self.name, repository))
            })
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<Manifest>> {
        self.enter(Operation::GetManifest, Some(repository)).await?;
        let repositories = lock(&self.repositories);
        let Some(repo) = repositories.get(repository) else {
            return Ok(None);
        };
        let digest = repo
            .tags
            .get(reference)
            .map(String::as_str)
            .unwrap_or(reference);
        Ok(repo.manifests.get(digest).cloned())
    }

    async fn get_blob_metadata(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<BlobDescriptor>> {
        self.enter(Operation::GetBlobMetadata, Some(repository)).await?;
        Ok(self
            .blob(repository, digest)
            .map(|content| BlobDescriptor::new(digest, content.len() as u64)))
    }

    async fn get_blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        self.enter(Operation::GetBlobReader, Some(repository)).await?;
        let mut content = self.blob(repository, digest).ok_or_else(|| {
            ReplicationError::NotFound(format!("{}: blob {} in {}", self.name, digest, repository))
        })?;

        let interrupted = {
            let mut faults = lock(&self.faults);
            if let Some(remaining) = faults.corrupt_reads.get_mut(digest) {
                if *remaining > 0 && !content.is_empty() {
                    *remaining -= 1;
                    content[0] ^= 0x01;
                }
            }
            match faults.interrupted_reads.get_mut(digest) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if interrupted {
            content.truncate(content.len() / 2);
            return Ok(Box::new(io::Cursor::new(content).chain(ConnectionReset)));
        }
        Ok(Box::new(io::Cursor::new(content)))
    }

    async fn put_blob(&self, repository: &str, digest: &str, content: Vec<u8>) -> Result<()> {
        self.enter(Operation::PutBlob, Some(repository)).await?;
        DigestUtils::verify_data_integrity(&content, digest)?;
        lock(&self.repositories)
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(DigestUtils::normalize_digest(digest)?, content);
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        self.enter(Operation::PutManifest, Some(repository)).await?;

        let mut repositories = lock(&self.repositories);
        let repo = repositories.entry(repository.to_string()).or_default();
        Self::manifest_blobs_present(repo, manifest)?;

        repo.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        if reference != manifest.digest {
            repo.tags
                .insert(reference.to_string(), manifest.digest.clone());
        }
        Ok(())
    }
}
