//! Image manifest model
//!
//! Manifests are kept as the exact bytes the source registry served so their
//! digest is preserved at the destination. Parsing only extracts the content
//! references the replicator has to copy first.

use crate::delta::BlobDescriptor;
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Accept header value covering every manifest type the replicator understands
pub fn accept_header() -> String {
    [OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST_V2].join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl ContentDescriptor {
    pub fn blob(&self) -> BlobDescriptor {
        BlobDescriptor::new(self.digest.clone(), self.size)
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: Option<u32>,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    config: Option<ContentDescriptor>,
    #[serde(default)]
    layers: Vec<ContentDescriptor>,
    #[serde(default)]
    manifests: Vec<ContentDescriptor>,
}

/// What a manifest points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestReferences {
    /// A single-platform image: config blob plus ordered layers
    Image {
        config: ContentDescriptor,
        layers: Vec<ContentDescriptor>,
    },
    /// A manifest list / OCI index of child manifests
    Index { manifests: Vec<ContentDescriptor> },
}

impl ManifestReferences {
    /// Blobs of an image in replication order (config first); empty for an index
    pub fn blobs(&self) -> Vec<&ContentDescriptor> {
        match self {
            ManifestReferences::Image { config, layers } => {
                std::iter::once(config).chain(layers.iter()).collect()
            }
            ManifestReferences::Index { .. } => Vec::new(),
        }
    }
}

/// A manifest as served by a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl Manifest {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: DigestUtils::compute_docker_digest(&bytes),
            bytes,
        }
    }

    /// Build a manifest whose media type is taken from the document itself,
    /// falling back to `default_media_type`
    pub fn from_bytes(bytes: Vec<u8>, default_media_type: &str) -> Result<Self> {
        let raw = parse_raw(&bytes)?;
        let media_type = raw
            .media_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_media_type.to_string());
        Ok(Self::new(media_type, bytes))
    }

    pub fn is_index(&self) -> bool {
        self.media_type == DOCKER_MANIFEST_LIST || self.media_type == OCI_INDEX
    }

    pub fn references(&self) -> Result<ManifestReferences> {
        let raw = parse_raw(&self.bytes)?;

        if let Some(version) = raw.schema_version {
            if version != 2 {
                return Err(ReplicationError::MalformedContent(format!(
                    "Unsupported manifest schema version {}",
                    version
                )));
            }
        }

        let declared = raw.media_type.as_deref().unwrap_or(&self.media_type);
        let is_index = !raw.manifests.is_empty()
            || declared == DOCKER_MANIFEST_LIST
            || declared == OCI_INDEX;

        let references = if is_index {
            ManifestReferences::Index {
                manifests: raw.manifests,
            }
        } else {
            let config = raw.config.ok_or_else(|| {
                ReplicationError::MalformedContent(format!(
                    "Manifest {} has no config descriptor",
                    DigestUtils::format_digest_short(&self.digest)
                ))
            })?;
            ManifestReferences::Image {
                config,
                layers: raw.layers,
            }
        };

        let descriptors = match &references {
            ManifestReferences::Image { config, layers } => {
                std::iter::once(config).chain(layers.iter()).collect::<Vec<_>>()
            }
            ManifestReferences::Index { manifests } => manifests.iter().collect(),
        };
        for descriptor in descriptors {
            if !DigestUtils::is_valid_docker_digest(&descriptor.digest) {
                return Err(ReplicationError::MalformedContent(format!(
                    "Manifest references invalid digest '{}'",
                    descriptor.digest
                )));
            }
        }

        Ok(references)
    }

    /// Serialize a schema 2 image manifest for the given config and layers
    pub fn image(config: &ContentDescriptor, layers: &[ContentDescriptor]) -> Result<Self> {
        let document = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_V2,
            "config": config,
            "layers": layers,
        });
        Ok(Self::new(DOCKER_MANIFEST_V2, serde_json::to_vec(&document)?))
    }

    /// Serialize an OCI index over the given child manifests
    pub fn index(children: &[&Manifest]) -> Result<Self> {
        let manifests: Vec<ContentDescriptor> = children
            .iter()
            .map(|child| ContentDescriptor {
                media_type: child.media_type.clone(),
                digest: child.digest.clone(),
                size: child.bytes.len() as u64,
            })
            .collect();
        let document = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": manifests,
        });
        Ok(Self::new(OCI_INDEX, serde_json::to_vec(&document)?))
    }
}

fn parse_raw(bytes: &[u8]) -> Result<RawManifest> {
    serde_json::from_slice(bytes)
        .map_err(|e| ReplicationError::MalformedContent(format!("Invalid manifest JSON: {}", e)))
}
