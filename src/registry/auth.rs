//! Authentication for Docker registry access
//!
//! Registries answer unauthenticated requests with `401` and a `WWW-Authenticate`
//! challenge. For `Bearer` challenges a token is fetched from the advertised realm
//! (with basic credentials when configured) and cached per scope; for `Basic`
//! challenges the configured credentials are sent directly.

use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Credential {
    Bearer(String),
    Basic,
}

#[derive(Debug)]
pub struct RegistryAuth {
    client: Client,
    username: Option<String>,
    password: Option<String>,
    credentials: Mutex<HashMap<String, Credential>>,
    output: Logger,
}

impl RegistryAuth {
    pub fn new(
        client: Client,
        username: Option<String>,
        password: Option<String>,
        output: Logger,
    ) -> Self {
        Self {
            client,
            username,
            password,
            credentials: Mutex::new(HashMap::new()),
            output,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Parse a `WWW-Authenticate` header value
    pub fn parse_challenge(header: &str) -> Option<AuthChallenge> {
        let header = header.trim();
        let (scheme, params_str) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(AuthChallenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params_str);
        let realm = params.get("realm")?.to_string();
        Some(AuthChallenge::Bearer {
            realm,
            service: params.get("service").map(|s| s.to_string()),
            scope: params.get("scope").map(|s| s.to_string()),
        })
    }

    /// Attach the cached credential for `scope`, if any
    pub fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        let credential = self.lock().get(scope).cloned();
        self.apply(request, credential.as_ref())
    }

    /// Answer a challenge for `scope`, caching the resulting credential
    pub async fn respond(&self, challenge_header: &str, scope: &str) -> Result<()> {
        let challenge = Self::parse_challenge(challenge_header).ok_or_else(|| {
            ReplicationError::AuthFailure(format!(
                "Unsupported authentication challenge: {}",
                challenge_header
            ))
        })?;

        let credential = match challenge {
            AuthChallenge::Basic => {
                if !self.has_credentials() {
                    return Err(ReplicationError::AuthFailure(
                        "Registry requires basic authentication but no credentials are configured"
                            .to_string(),
                    ));
                }
                Credential::Basic
            }
            AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let requested = if scope.is_empty() {
                    challenge_scope
                } else {
                    Some(scope.to_string())
                };
                let token = self
                    .fetch_token(&realm, service.as_deref(), requested.as_deref())
                    .await?;
                Credential::Bearer(token)
            }
        };

        self.lock().insert(scope.to_string(), credential);
        Ok(())
    }

    /// Forget the cached credential for `scope` (e.g. an expired token)
    pub fn invalidate(&self, scope: &str) {
        self.lock().remove(scope);
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String> {
        let mut url = url::Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }

        self.output.detail(&format!("Requesting token from: {}", url));

        let mut request = self.client.get(url.as_str());
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(if status.is_server_error() {
                ReplicationError::TransientNetwork(format!(
                    "Token service unavailable (status {}): {}",
                    status, error_text
                ))
            } else {
                ReplicationError::AuthFailure(format!(
                    "Token request failed with status {}: {}",
                    status, error_text
                ))
            });
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            ReplicationError::AuthFailure(format!("Failed to parse token response: {}", e))
        })?;

        if let Some(expires_in) = token_response.expires_in {
            self.output
                .detail(&format!("Token expires in {} seconds", expires_in));
        }

        token_response
            .token
            .or(token_response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ReplicationError::AuthFailure("Token response did not contain a token".to_string())
            })
    }

    fn apply(&self, request: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
        match credential {
            Some(Credential::Bearer(token)) => request.bearer_auth(token),
            Some(Credential::Basic) => match (&self.username, &self.password) {
                (Some(username), Some(password)) => request.basic_auth(username, Some(password)),
                _ => request,
            },
            None => request,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Split `key="value",key2="value2"` pairs, honouring commas inside quotes
fn parse_params(params_str: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();

    for c in params_str.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Token scope for pulling from `repository`
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

/// Token scope for pushing to `repository`
pub fn push_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}

pub const CATALOG_SCOPE: &str = "registry:catalog:*";
