//! Registry-client capability interface
//!
//! The replication engine depends only on [`RegistryClient`]. Two adapters ship
//! with the crate: [`HttpRegistryClient`] speaks the Docker Registry HTTP API v2,
//! and [`InMemoryRegistry`] keeps everything in process with fault injection.
//!
//! Every operation is fallible and may be retried; callers bound each call with
//! their own timeout and cancellation.

pub mod auth;
pub mod http;
pub mod manifest;
pub mod memory;

pub use http::HttpRegistryClient;
pub use manifest::{ContentDescriptor, Manifest, ManifestReferences};
pub use memory::{InMemoryRegistry, Operation};

use crate::delta::BlobDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Streamed blob content
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Human-readable identity used in log lines
    fn name(&self) -> &str;

    /// Verify the registry is reachable and the credentials are accepted
    async fn ping(&self) -> Result<()>;

    async fn list_repositories(&self) -> Result<Vec<String>>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Fetch a manifest by tag or digest; `None` when it does not exist
    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<Manifest>>;

    /// Size and digest of a blob; `None` when the blob is absent
    async fn get_blob_metadata(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<BlobDescriptor>>;

    async fn get_blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader>;

    async fn put_blob(&self, repository: &str, digest: &str, content: Vec<u8>) -> Result<()>;

    /// Store `manifest` under `reference` (a tag, or its own digest)
    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()>;
}
