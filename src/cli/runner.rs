//! Command runner: turns parsed arguments into configured engine components

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::cli::args::{Args, CheckpointAction, Command};
use crate::config::{AppConfig, RegistryEndpoint};
use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::replicator::{ReplicationRequest, TreeReplicator};
use crate::service::{ReplicationService, shutdown_signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code for fatal setup errors
pub const EXIT_FATAL: i32 = 1;

pub struct Runner {
    args: Args,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self { args, output }
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    /// Run the selected command, returning the process exit code
    pub async fn run(&self) -> Result<i32> {
        match &self.args.command {
            Command::Replicate(replicate) => {
                let mut config = self.load_config()?;
                replicate.apply(&mut config);
                let mut request = self.prepare(&config)?;
                request.fresh = replicate.fresh;
                self.replicate(&config, &request).await
            }
            Command::Serve(serve) => {
                let mut config = self.load_config()?;
                serve.apply(&mut config);
                let mut request = self.prepare(&config)?;
                request.fresh = serve.replicate.fresh;
                self.serve(&config, request).await
            }
            Command::HealthCheck(connection) => {
                let mut config = self.load_config()?;
                connection.apply(&mut config);
                self.health_check(&config).await
            }
            Command::Checkpoint {
                action,
                checkpoint_dir,
            } => {
                let mut config = self.load_config()?;
                if let Some(dir) = checkpoint_dir {
                    config.checkpoint_dir = Some(dir.clone());
                }
                self.checkpoint(&config, action).await
            }
        }
    }

    fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.args.config.as_deref())?;
        config.verbose |= self.args.verbose;
        Ok(config)
    }

    fn prepare(&self, config: &AppConfig) -> Result<ReplicationRequest> {
        self.output.subsection("Validating configuration");
        config.validate()?;
        self.output.step("Configuration is valid");
        Ok(ReplicationRequest::from_config(config))
    }

    async fn replicate(&self, config: &AppConfig, request: &ReplicationRequest) -> Result<i32> {
        let replicator = self.build_replicator(config)?;

        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone(), self.output.clone()));

        let report = replicator.run(request, &cancel).await;
        cancel.cancel();

        let report = report?;
        report.print(&self.output);
        Ok(report.exit_code())
    }

    async fn serve(&self, config: &AppConfig, request: ReplicationRequest) -> Result<i32> {
        let replicator = self.build_replicator(config)?;
        let service =
            ReplicationService::new(replicator, request, config.serve_interval(), self.output.clone());

        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone(), self.output.clone()));

        service.run(&cancel).await?;
        Ok(0)
    }

    async fn health_check(&self, config: &AppConfig) -> Result<i32> {
        self.output.section("Health check");
        config.validate()?;

        let mut healthy = true;
        for (role, endpoint) in [("Source", &config.source), ("Destination", &config.destination)] {
            self.output.step(&format!("Pinging {} registry {}", role.to_lowercase(), endpoint.url));
            let outcome = match self.http_client(endpoint, config) {
                Ok(client) => {
                    tokio::time::timeout(config.request_timeout(), client.ping())
                        .await
                        .unwrap_or_else(|elapsed| Err(elapsed.into()))
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => self.output.success(&format!("{} registry is reachable", role)),
                Err(e) => {
                    healthy = false;
                    self.output
                        .error(&format!("{} registry check failed: {}", role, e));
                }
            }
        }

        if config.checkpointing {
            let dir = self.checkpoint_dir(config);
            self.output
                .step(&format!("Checking checkpoint directory {}", dir.display()));
            let usable = match FileCheckpointStore::new(&dir, self.output.clone()) {
                Ok(store) => store.list().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match usable {
                Ok(()) => self.output.success("Checkpoint directory is usable"),
                Err(e) => {
                    healthy = false;
                    self.output
                        .error(&format!("Checkpoint directory check failed: {}", e));
                }
            }
        }

        Ok(if healthy { 0 } else { EXIT_FATAL })
    }

    async fn checkpoint(&self, config: &AppConfig, action: &CheckpointAction) -> Result<i32> {
        let store = FileCheckpointStore::new(self.checkpoint_dir(config), self.output.clone())?;

        match action {
            CheckpointAction::List => {
                self.output
                    .section(&format!("Checkpoints in {}", store.dir().display()));
                let summaries = store.list().await?;
                if summaries.is_empty() {
                    self.output.info("No checkpoints stored");
                }
                for summary in summaries {
                    self.output.info(&format!(
                        "{}  {:<9}  {}/{} units ({:.1}%), {} failed, updated {}",
                        summary.job_id,
                        summary.status.to_string(),
                        summary.completed_units,
                        summary.total_units,
                        summary.progress_percent(),
                        summary.failed_units,
                        summary.updated_at.format("%Y-%m-%d %H:%M:%S")
                    ));
                    self.output.detail(&format!(
                        "    {} → {}",
                        summary.source, summary.destination
                    ));
                }
                Ok(0)
            }
            CheckpointAction::Show { job_id } => {
                let checkpoint = store.load(job_id).await?.ok_or_else(|| {
                    ReplicationError::NotFound(format!("checkpoint {}", job_id))
                })?;
                let summary = checkpoint.summary();

                self.output.section(&format!("Checkpoint {}", job_id));
                self.output.summary_kv(
                    "Job",
                    &[
                        ("Source", checkpoint.source.clone()),
                        ("Destination", checkpoint.destination.clone()),
                        ("Status", checkpoint.status.to_string()),
                        ("Created", checkpoint.created_at.to_rfc3339()),
                        ("Updated", checkpoint.updated_at.to_rfc3339()),
                        ("Progress", format!("{:.1}%", summary.progress_percent())),
                    ],
                );
                let units: Vec<String> = checkpoint
                    .units
                    .values()
                    .map(|unit| {
                        let mut line = format!(
                            "{} → {}:{} [{}] attempts={}",
                            unit.key(),
                            unit.destination_repository,
                            unit.tag,
                            unit.status,
                            unit.attempts
                        );
                        if let Some(error) = &unit.last_error {
                            line.push_str(&format!(" error={}", error));
                        }
                        line
                    })
                    .collect();
                self.output.list("Units", &units);
                Ok(0)
            }
            CheckpointAction::Delete { job_id } => {
                if store.delete(job_id).await? {
                    self.output
                        .success(&format!("Deleted checkpoint {}", job_id));
                    Ok(0)
                } else {
                    self.output
                        .warning(&format!("No checkpoint {} found", job_id));
                    Ok(EXIT_FATAL)
                }
            }
        }
    }

    fn build_replicator(&self, config: &AppConfig) -> Result<TreeReplicator> {
        self.output.subsection("Setting up registry clients");
        let source: Arc<dyn RegistryClient> = Arc::new(self.http_client(&config.source, config)?);
        let destination: Arc<dyn RegistryClient> =
            Arc::new(self.http_client(&config.destination, config)?);

        for (role, endpoint) in [("Source", &config.source), ("Destination", &config.destination)] {
            if endpoint.has_auth() {
                self.output.step(&format!("{}: {} (authenticated)", role, endpoint.url));
            } else {
                self.output.step(&format!("{}: {} (anonymous)", role, endpoint.url));
            }
        }

        let store = if config.checkpointing {
            self.open_store(config)
        } else {
            None
        };

        Ok(TreeReplicator::new(
            source,
            destination,
            store,
            self.output.clone(),
        ))
    }

    fn http_client(
        &self,
        endpoint: &RegistryEndpoint,
        config: &AppConfig,
    ) -> Result<HttpRegistryClient> {
        HttpRegistryClient::new(
            endpoint.clone(),
            Duration::from_secs(config.request_timeout_secs.min(30)),
            self.output.clone(),
        )
    }

    /// Open the checkpoint store; failure only costs resumability
    fn open_store(&self, config: &AppConfig) -> Option<Arc<dyn CheckpointStore>> {
        let dir = self.checkpoint_dir(config);
        match FileCheckpointStore::new(&dir, self.output.clone()) {
            Ok(store) => {
                self.output
                    .detail(&format!("Checkpoints stored in {}", dir.display()));
                Some(Arc::new(store))
            }
            Err(e) => {
                self.output.warning(&format!(
                    "Checkpoint directory {} unavailable: {}",
                    dir.display(),
                    e
                ));
                None
            }
        }
    }

    fn checkpoint_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .checkpoint_dir
            .clone()
            .unwrap_or_else(FileCheckpointStore::default_dir)
    }
}
