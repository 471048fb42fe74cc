//! Standardized mapping from registry responses to the error taxonomy

use crate::error::ReplicationError;
use reqwest::StatusCode;

/// Maps HTTP status codes returned by a registry onto [`ReplicationError`]
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Classify a non-success registry response for `operation`
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> ReplicationError {
        match status.as_u16() {
            401 => ReplicationError::AuthFailure(format!(
                "Unauthorized to perform {}: {}",
                operation, error_text
            )),
            403 => ReplicationError::AuthFailure(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => ReplicationError::NotFound(format!(
                "Resource not found for {}: {}",
                operation, error_text
            )),
            408 => ReplicationError::TransientNetwork(format!(
                "Request timeout during {}: {}",
                operation, error_text
            )),
            429 => ReplicationError::TransientNetwork(format!(
                "Rate limited during {}: {}",
                operation, error_text
            )),
            400 if error_text.contains("DIGEST_INVALID") => ReplicationError::integrity(
                operation.to_string(),
                format!("registry rejected digest: {}", error_text),
            ),
            400 | 422 => ReplicationError::MalformedContent(format!(
                "Registry rejected content for {}: {}",
                operation, error_text
            )),
            500 if Self::is_storage_backend_error(error_text) => {
                ReplicationError::TransientNetwork(format!(
                    "Registry storage backend error during {}: {}",
                    operation, error_text
                ))
            }
            500..=599 => ReplicationError::TransientNetwork(format!(
                "Registry unavailable during {} (status {}): {}",
                operation, status, error_text
            )),
            _ => ReplicationError::Registry(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }

    /// Check if error indicates a storage backend issue that might be temporary
    pub fn is_storage_backend_error(error_text: &str) -> bool {
        error_text.contains("s3aws")
            || error_text.contains("DriverName")
            || error_text.contains("storage backend")
    }
}

/// Network error categorization
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize transport-level failures; all of them are worth retrying
    /// except TLS certificate problems, which need operator action.
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> ReplicationError {
        if error.is_timeout() {
            ReplicationError::TransientNetwork(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            ReplicationError::TransientNetwork(format!(
                "Connection error during {}: {}",
                context, error
            ))
        } else if error.to_string().contains("certificate") {
            ReplicationError::AuthFailure(format!(
                "TLS certificate error during {}: {}",
                context, error
            ))
        } else if error.is_decode() {
            ReplicationError::MalformedContent(format!(
                "Undecodable response during {}: {}",
                context, error
            ))
        } else {
            ReplicationError::TransientNetwork(format!("{} network error: {}", context, error))
        }
    }
}
