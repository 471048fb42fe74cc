//! Docker Registry HTTP API v2 adapter
//!
//! Implements the registry capability over HTTP:
//! - Catalog and tag listing with `Link` header pagination
//! - Manifest GET/PUT (`/v2/{name}/manifests/{reference}`)
//! - Blob HEAD/GET (`/v2/{name}/blobs/{digest}`), downloads are streamed
//! - Monolithic blob upload (`POST /v2/{name}/blobs/uploads/` then `PUT ?digest=`)

use super::auth::{self, RegistryAuth};
use super::manifest::{self, Manifest};
use super::{BlobReader, RegistryClient};
use crate::config::RegistryEndpoint;
use crate::delta::BlobDescriptor;
use crate::digest::DigestUtils;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::StreamReader;

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct HttpRegistryClient {
    client: Client,
    endpoint: RegistryEndpoint,
    auth: RegistryAuth,
    output: Logger,
}

impl HttpRegistryClient {
    pub fn new(endpoint: RegistryEndpoint, connect_timeout: Duration, output: Logger) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(endpoint.skip_tls)
            .user_agent(concat!("docker-image-replicator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ReplicationError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        let auth = RegistryAuth::new(
            client.clone(),
            endpoint.username.clone(),
            endpoint.password.clone(),
            output.clone(),
        );

        Ok(Self {
            client,
            endpoint,
            auth,
            output,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.base_url(), path)
    }

    /// Send a request built by `build`, answering one auth challenge if needed
    async fn send<F>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self
            .auth
            .authorize(build(&self.client), scope)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
        else {
            return Ok(response);
        };

        self.output
            .detail(&format!("Auth challenge from {}: {}", self.name(), challenge));
        self.auth.invalidate(scope);
        self.auth.respond(&challenge, scope).await?;

        Ok(self
            .auth
            .authorize(build(&self.client), scope)
            .send()
            .await?)
    }

    async fn ensure_success(response: Response, operation: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        Err(HttpErrorHandler::handle_registry_error(
            status,
            &error_text,
            operation,
        ))
    }

    /// Resolve the `rel="next"` target of a `Link` header
    fn next_page(&self, response: &Response) -> Result<Option<String>> {
        let Some(link) = response
            .headers()
            .get(LINK)
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(None);
        };

        match parse_next_link(link) {
            Some(target) if target.starts_with("http://") || target.starts_with("https://") => {
                Ok(Some(target))
            }
            Some(target) => {
                let base = url::Url::parse(self.endpoint.base_url())?;
                Ok(Some(base.join(&target)?.to_string()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn name(&self) -> &str {
        self.endpoint.base_url()
    }

    async fn ping(&self) -> Result<()> {
        let url = self.url("/v2/");
        let response = self.send("", |client| client.get(&url)).await?;
        Self::ensure_success(response, "registry ping").await?;
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repositories = Vec::new();
        let mut next = Some(self.url(&format!("/v2/_catalog?n={}", PAGE_SIZE)));

        while let Some(url) = next {
            self.output.detail(&format!("Listing repositories: {}", url));
            let response = self
                .send(auth::CATALOG_SCOPE, |client| client.get(&url))
                .await?;
            let response = Self::ensure_success(response, "repository listing").await?;
            next = self.next_page(&response)?;

            let page: CatalogResponse = response.json().await?;
            repositories.extend(page.repositories);
        }

        Ok(repositories)
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut next = Some(self.url(&format!("/v2/{}/tags/list?n={}", repository, PAGE_SIZE)));
        let scope = auth::pull_scope(repository);

        while let Some(url) = next {
            let response = self.send(&scope, |client| client.get(&url)).await?;
            let response =
                Self::ensure_success(response, &format!("tag listing for {}", repository)).await?;
            next = self.next_page(&response)?;

            let page: TagListResponse = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());
        }

        Ok(tags)
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<Manifest>> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repository, reference));
        let accept = manifest::accept_header();
        let response = self
            .send(&auth::pull_scope(repository), |client| {
                client.get(&url).header(ACCEPT, accept.as_str())
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::ensure_success(
            response,
            &format!("manifest fetch {}:{}", repository, reference),
        )
        .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_else(|| manifest::DOCKER_MANIFEST_V2.to_string());
        let bytes = response.bytes().await?.to_vec();

        Manifest::from_bytes(bytes, &content_type).map(Some)
    }

    async fn get_blob_metadata(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<BlobDescriptor>> {
        let digest = DigestUtils::normalize_digest(digest)?;
        let url = self.url(&format!("/v2/{}/blobs/{}", repository, digest));
        let response = self
            .send(&auth::pull_scope(repository), |client| client.head(&url))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0);
                Ok(Some(BlobDescriptor::new(digest, size)))
            }
            status => Err(HttpErrorHandler::handle_registry_error(
                status,
                "",
                &format!("blob check {}", DigestUtils::format_digest_short(&digest)),
            )),
        }
    }

    async fn get_blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        let digest = DigestUtils::normalize_digest(digest)?;
        let url = self.url(&format!("/v2/{}/blobs/{}", repository, digest));
        let response = self
            .send(&auth::pull_scope(repository), |client| client.get(&url))
            .await?;
        let response = Self::ensure_success(
            response,
            &format!("blob download {}", DigestUtils::format_digest_short(&digest)),
        )
        .await?;

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn put_blob(&self, repository: &str, digest: &str, content: Vec<u8>) -> Result<()> {
        let digest = DigestUtils::normalize_digest(digest)?;
        let scope = auth::push_scope(repository);
        let upload_url = self.url(&format!("/v2/{}/blobs/uploads/", repository));

        self.output.detail(&format!(
            "Starting blob upload session for {} ({} bytes)",
            DigestUtils::format_digest_short(&digest),
            content.len()
        ));

        let response = self
            .send(&scope, |client| client.post(&upload_url).header(CONTENT_LENGTH, 0))
            .await?;
        let response = Self::ensure_success(response, "blob upload session").await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ReplicationError::Registry("Missing Location header in upload response".to_string())
            })?;

        let full_location = if location.starts_with("http") {
            location.to_string()
        } else if location.starts_with('/') {
            self.url(location)
        } else {
            format!("{}{}", upload_url, location)
        };
        let separator = if full_location.contains('?') { '&' } else { '?' };
        let final_url = format!("{}{}digest={}", full_location, separator, digest);

        let response = self
            .send(&scope, |client| {
                client
                    .put(&final_url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(content.clone())
            })
            .await?;
        Self::ensure_success(
            response,
            &format!("blob upload {}", DigestUtils::format_digest_short(&digest)),
        )
        .await?;

        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repository, reference));
        let response = self
            .send(&auth::push_scope(repository), |client| {
                client
                    .put(&url)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.bytes.clone())
            })
            .await?;
        Self::ensure_success(
            response,
            &format!("manifest upload {}:{}", repository, reference),
        )
        .await?;
        Ok(())
    }
}

/// Extract the target of the `rel="next"` entry of a `Link` header
fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|param| param.trim().replace(' ', "") == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let target = target.trim();
        Some(target.strip_prefix('<')?.strip_suffix('>')?.to_string())
    })
}
