//! Configuration management
//!
//! Settings are layered: built-in defaults, then an optional JSON config file,
//! then `DOCKER_REPLICATOR_*` environment variables, and finally command-line
//! flags (applied by the CLI runner).

use crate::delta::DeltaOptions;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "DOCKER_REPLICATOR_";

/// Connection settings for one registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryEndpoint {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub skip_tls: bool,
}

impl RegistryEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Registry base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn validate(&self, role: &str) -> Result<()> {
        if self.url.is_empty() {
            return Err(ReplicationError::Configuration(format!(
                "{} registry URL cannot be empty",
                role
            )));
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ReplicationError::Configuration(format!(
                "Invalid {} registry URL: {}. Must start with http:// or https://",
                role, self.url
            )));
        }

        url::Url::parse(&self.url)?;

        if self.username.is_some() != self.password.is_some() {
            return Err(ReplicationError::Configuration(format!(
                "{} registry credentials need both username and password",
                role
            )));
        }

        Ok(())
    }
}

/// Retry and backoff settings for a single unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReplicationError::Configuration(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ReplicationError::Configuration(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ReplicationError::Configuration(
                "retry.max_delay_ms must not be lower than retry.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: RegistryEndpoint,
    pub destination: RegistryEndpoint,
    pub source_prefix: String,
    pub destination_prefix: String,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_repositories: Vec<String>,
    pub workers: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpointing: bool,
    pub retry: RetryConfig,
    pub request_timeout_secs: u64,
    pub delta: DeltaOptions,
    pub serve_interval_secs: u64,
    pub verbose: bool,
    pub dry_run: bool,
    pub force: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: RegistryEndpoint::default(),
            destination: RegistryEndpoint::default(),
            source_prefix: String::new(),
            destination_prefix: String::new(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            exclude_repositories: Vec::new(),
            workers: 5,
            checkpoint_dir: None,
            checkpointing: true,
            retry: RetryConfig::default(),
            request_timeout_secs: 300,
            delta: DeltaOptions::default(),
            serve_interval_secs: 300,
            verbose: false,
            dry_run: false,
            force: false,
        }
    }
}

impl AppConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            ReplicationError::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Defaults, overlaid with the config file if given, overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `DOCKER_REPLICATOR_*` variables obtained through `lookup`.
    /// A numeric variable that does not parse is a configuration error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(val) = var("SOURCE_URL") {
            self.source.url = val;
        }
        if let Some(val) = var("SOURCE_USERNAME") {
            self.source.username = Some(val);
        }
        if let Some(val) = var("SOURCE_PASSWORD") {
            self.source.password = Some(val);
        }
        if let Some(val) = var("DEST_URL") {
            self.destination.url = val;
        }
        if let Some(val) = var("DEST_USERNAME") {
            self.destination.username = Some(val);
        }
        if let Some(val) = var("DEST_PASSWORD") {
            self.destination.password = Some(val);
        }
        if let Some(val) = var("SOURCE_PREFIX") {
            self.source_prefix = val;
        }
        if let Some(val) = var("DEST_PREFIX") {
            self.destination_prefix = val;
        }
        if let Some(val) = var("INCLUDE_TAGS") {
            self.include_tags = split_list(&val);
        }
        if let Some(val) = var("EXCLUDE_TAGS") {
            self.exclude_tags = split_list(&val);
        }
        if let Some(val) = var("EXCLUDE_REPOS") {
            self.exclude_repositories = split_list(&val);
        }
        if let Some(val) = var("CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = var("WORKERS") {
            self.workers = parse_env("WORKERS", &val)?;
        }
        if let Some(val) = var("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("MAX_ATTEMPTS", &val)?;
        }
        if let Some(val) = var("TIMEOUT") {
            self.request_timeout_secs = parse_env("TIMEOUT", &val)?;
        }
        if let Some(val) = var("SERVE_INTERVAL") {
            self.serve_interval_secs = parse_env("SERVE_INTERVAL", &val)?;
        }
        if let Some(val) = var("SKIP_TLS") {
            let skip = matches!(val.as_str(), "1" | "true" | "yes");
            self.source.skip_tls = skip;
            self.destination.skip_tls = skip;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.destination.validate("destination")?;

        if self.workers == 0 {
            return Err(ReplicationError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ReplicationError::Configuration(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.serve_interval_secs == 0 {
            return Err(ReplicationError::Configuration(
                "serve_interval_secs must be greater than 0".to_string(),
            ));
        }

        self.retry.validate()?;
        self.delta.validate()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn serve_interval(&self) -> Duration {
        Duration::from_secs(self.serve_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ReplicationError::Configuration(format!(
            "{}{} must be a non-negative integer, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
