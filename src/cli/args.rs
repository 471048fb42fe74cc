//! Command-line argument parsing

use crate::config::AppConfig;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "docker-image-replicator")]
#[command(about = "Replicate image repositories and tags between Docker registries")]
#[command(version, author)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path
    #[arg(long = "config", global = true, help = "Path to a JSON configuration file")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet output
    #[arg(
        long = "quiet",
        short = 'q',
        global = true,
        conflicts_with = "verbose",
        help = "Only print errors"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replicate the selected repositories and tags once
    Replicate(ReplicateArgs),
    /// Check that both registries and the checkpoint directory are usable
    HealthCheck(ConnectionArgs),
    /// Replicate on a schedule until interrupted
    Serve(ServeArgs),
    /// Inspect or remove stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,

        #[arg(long = "checkpoint-dir", help = "Directory holding checkpoint documents")]
        checkpoint_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// List stored checkpoints, most recently updated first
    List,
    /// Show the units of one checkpoint
    Show { job_id: String },
    /// Delete one checkpoint
    Delete { job_id: String },
}

#[derive(ClapArgs, Debug, Default)]
pub struct ConnectionArgs {
    #[arg(long = "source", short = 's', help = "Source registry URL")]
    pub source: Option<String>,

    #[arg(long = "destination", short = 'd', help = "Destination registry URL")]
    pub destination: Option<String>,

    #[arg(long = "source-username", help = "Username for the source registry")]
    pub source_username: Option<String>,

    #[arg(long = "source-password", help = "Password for the source registry")]
    pub source_password: Option<String>,

    #[arg(long = "dest-username", help = "Username for the destination registry")]
    pub dest_username: Option<String>,

    #[arg(long = "dest-password", help = "Password for the destination registry")]
    pub dest_password: Option<String>,

    #[arg(long = "skip-tls", short = 'k', help = "Skip TLS certificate verification")]
    pub skip_tls: bool,

    #[arg(long = "timeout", short = 't', help = "Timeout for each registry call in seconds")]
    pub timeout: Option<u64>,

    #[arg(long = "checkpoint-dir", help = "Directory holding checkpoint documents")]
    pub checkpoint_dir: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ReplicateArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[arg(long = "source-prefix", help = "Only replicate repositories starting with this prefix")]
    pub source_prefix: Option<String>,

    #[arg(long = "dest-prefix", help = "Prefix replacing the source prefix at the destination")]
    pub dest_prefix: Option<String>,

    #[arg(long = "include", short = 'i', help = "Tag pattern to include (repeatable)")]
    pub include: Vec<String>,

    #[arg(long = "exclude", short = 'e', help = "Tag pattern to exclude (repeatable)")]
    pub exclude: Vec<String>,

    #[arg(long = "exclude-repo", help = "Repository pattern to skip (repeatable)")]
    pub exclude_repo: Vec<String>,

    #[arg(long = "workers", short = 'j', help = "Number of units replicated concurrently")]
    pub workers: Option<usize>,

    #[arg(long = "max-attempts", help = "Attempts per unit for transient failures")]
    pub max_attempts: Option<u32>,

    #[arg(long = "no-checkpoint", help = "Run without a resumable checkpoint")]
    pub no_checkpoint: bool,

    #[arg(long = "no-delta", help = "Always send whole blobs")]
    pub no_delta: bool,

    #[arg(long = "dry-run", short = 'n', help = "List the units that would be replicated")]
    pub dry_run: bool,

    #[arg(long = "force", help = "Replicate tags even when the destination is up to date")]
    pub force: bool,

    #[arg(long = "fresh", help = "Discard any existing checkpoint for this job")]
    pub fresh: bool,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    #[command(flatten)]
    pub replicate: ReplicateArgs,

    #[arg(long = "interval", help = "Seconds between replication cycles")]
    pub interval: Option<u64>,
}

impl ConnectionArgs {
    /// Overlay the flags that were given onto `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.source {
            config.source.url = url.clone();
        }
        if let Some(url) = &self.destination {
            config.destination.url = url.clone();
        }
        if let Some(username) = &self.source_username {
            config.source.username = Some(username.clone());
        }
        if let Some(password) = &self.source_password {
            config.source.password = Some(password.clone());
        }
        if let Some(username) = &self.dest_username {
            config.destination.username = Some(username.clone());
        }
        if let Some(password) = &self.dest_password {
            config.destination.password = Some(password.clone());
        }
        if self.skip_tls {
            config.source.skip_tls = true;
            config.destination.skip_tls = true;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = Some(dir.clone());
        }
    }
}

impl ReplicateArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        self.connection.apply(config);

        if let Some(prefix) = &self.source_prefix {
            config.source_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.dest_prefix {
            config.destination_prefix = prefix.clone();
        }
        if !self.include.is_empty() {
            config.include_tags = self.include.clone();
        }
        if !self.exclude.is_empty() {
            config.exclude_tags = self.exclude.clone();
        }
        if !self.exclude_repo.is_empty() {
            config.exclude_repositories = self.exclude_repo.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if self.no_checkpoint {
            config.checkpointing = false;
        }
        if self.no_delta {
            config.delta.enabled = false;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.force {
            config.force = true;
        }
    }
}

impl ServeArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        self.replicate.apply(config);
        if let Some(interval) = self.interval {
            config.serve_interval_secs = interval;
        }
    }
}
