//! SHA256 digest utilities for registry content
//!
//! This module provides centralized functionality for computing, validating,
//! and formatting the SHA256 digests that address blobs and manifests.

use crate::error::{ReplicationError, Result};
use sha2::Digest;

/// Standard SHA256 digest for empty content
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Utilities for working with SHA256 digests in registry context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data as lowercase hex
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Self::compute_raw(data))
    }

    /// Compute the raw 32-byte SHA256 of `data`
    pub fn compute_raw(data: &[u8]) -> [u8; 32] {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Compute full Docker digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate full Docker digest format (sha256:xxxxx)
    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix("sha256:")
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Normalize digest to full Docker format (add sha256: prefix if missing)
    pub fn normalize_digest(digest: &str) -> Result<String> {
        let hex_part = digest.strip_prefix("sha256:").unwrap_or(digest);
        if !Self::is_valid_sha256_hex(hex_part) {
            return Err(ReplicationError::MalformedContent(format!(
                "Invalid SHA256 digest: expected 64 hex characters, got '{}'",
                digest
            )));
        }
        Ok(format!("sha256:{}", hex_part.to_ascii_lowercase()))
    }

    /// Decode a Docker digest into its raw 32 bytes
    pub fn to_raw(digest: &str) -> Result<[u8; 32]> {
        let normalized = Self::normalize_digest(digest)?;
        let mut raw = [0u8; 32];
        hex::decode_to_slice(&normalized[7..], &mut raw).map_err(|e| {
            ReplicationError::MalformedContent(format!("Invalid digest {}: {}", digest, e))
        })?;
        Ok(raw)
    }

    /// Encode raw 32 bytes as a Docker digest
    pub fn from_raw(raw: &[u8; 32]) -> String {
        format!("sha256:{}", hex::encode(raw))
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<()> {
        let expected = Self::normalize_digest(expected_digest)?;
        let computed = Self::compute_docker_digest(data);

        if computed != expected {
            return Err(ReplicationError::integrity(expected, computed));
        }

        Ok(())
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        if digest.len() > 19 {
            format!("{}...", &digest[..19])
        } else {
            digest.to_string()
        }
    }
}
