//! Tree replication orchestrator
//!
//! A run enumerates source repositories and tags, narrows them with the tag
//! filter, reconciles the resulting units against the job's checkpoint and
//! submits every unit that is not already settled to a [`WorkerPool`]. The
//! orchestrator itself only enumerates, submits and aggregates; all blob traffic
//! happens inside unit tasks.
//!
//! ```text
//! enumerate -> filter -> reconcile(checkpoint) -> submit(pool) -> aggregate -> report
//! ```

pub mod report;
pub mod retry;
pub mod transfer;
pub mod unit;

pub use report::{FailedUnit, ReplicationOutcome, ReplicationReport};
pub use retry::{RetryDecision, RetryPolicy};
pub use transfer::TransferStats;
pub use unit::{UnitContext, UnitResult};

use crate::checkpoint::{
    Checkpoint, CheckpointLedger, CheckpointStore, JobStatus, UnitRecord, UnitUpdate,
};
use crate::concurrency::WorkerPool;
use crate::config::{AppConfig, RetryConfig};
use crate::delta::{DeltaOptimizer, DeltaOptions};
use crate::digest::DigestUtils;
use crate::error::{ReplicationError, Result};
use crate::filter::TagFilter;
use crate::logging::Logger;
use crate::registry::RegistryClient;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Everything that defines one replication job
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    pub source_prefix: String,
    pub destination_prefix: String,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_repositories: Vec<String>,
    pub workers: usize,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub delta: DeltaOptions,
    pub checkpointing: bool,
    pub dry_run: bool,
    pub force: bool,
    /// Discard the job's checkpoint before running
    pub fresh: bool,
}

impl ReplicationRequest {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            source_prefix: config.source_prefix.clone(),
            destination_prefix: config.destination_prefix.clone(),
            include_tags: config.include_tags.clone(),
            exclude_tags: config.exclude_tags.clone(),
            exclude_repositories: config.exclude_repositories.clone(),
            workers: config.workers,
            retry: config.retry.clone(),
            request_timeout: config.request_timeout(),
            delta: config.delta.clone(),
            checkpointing: config.checkpointing,
            dry_run: config.dry_run,
            force: config.force,
            fresh: false,
        }
    }

    /// Stable job identifier for this request between two registries.
    ///
    /// Pattern order does not matter; worker count, retry and delta tuning do not
    /// take part, so changing them keeps the job resumable.
    pub fn job_id(&self, source: &str, destination: &str) -> String {
        let sorted = |patterns: &[String]| {
            let mut patterns = patterns.to_vec();
            patterns.sort();
            patterns.join(",")
        };

        let identity = [
            source.trim_end_matches('/').to_string(),
            destination.trim_end_matches('/').to_string(),
            self.source_prefix.clone(),
            self.destination_prefix.clone(),
            sorted(&self.include_tags),
            sorted(&self.exclude_tags),
            sorted(&self.exclude_repositories),
        ]
        .join("\n");

        DigestUtils::compute_sha256(identity.as_bytes())[..32].to_string()
    }
}

impl Default for ReplicationRequest {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Destination repository name for `repository`: the source prefix is replaced
/// by the destination prefix, or the destination prefix is prepended
pub fn destination_repository(
    repository: &str,
    source_prefix: &str,
    destination_prefix: &str,
) -> String {
    let remainder = repository
        .strip_prefix(source_prefix)
        .unwrap_or(repository)
        .trim_start_matches('/');
    let prefix = destination_prefix.trim_end_matches('/');

    match (prefix.is_empty(), remainder.is_empty()) {
        (true, true) => repository.to_string(),
        (true, false) => remainder.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, remainder),
    }
}

pub struct TreeReplicator {
    source: Arc<dyn RegistryClient>,
    destination: Arc<dyn RegistryClient>,
    store: Option<Arc<dyn CheckpointStore>>,
    filter: Arc<TagFilter>,
    output: Logger,
}

impl TreeReplicator {
    pub fn new(
        source: Arc<dyn RegistryClient>,
        destination: Arc<dyn RegistryClient>,
        store: Option<Arc<dyn CheckpointStore>>,
        output: Logger,
    ) -> Self {
        Self {
            source,
            destination,
            store,
            filter: Arc::new(TagFilter::new()),
            output,
        }
    }

    /// Share one pattern cache across replicators (the `serve` loop reuses it)
    pub fn with_filter(mut self, filter: Arc<TagFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn job_id(&self, request: &ReplicationRequest) -> String {
        request.job_id(self.source.name(), self.destination.name())
    }

    /// Enumerate the units selected by `request`, in catalog order
    pub async fn enumerate(
        &self,
        request: &ReplicationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<UnitRecord>> {
        let repositories = self
            .with_retry(request, cancel, "list repositories", || {
                self.source.list_repositories()
            })
            .await?;

        let mut units = Vec::new();
        for repository in repositories {
            if !repository.starts_with(&request.source_prefix) {
                continue;
            }
            if self
                .filter
                .matches_any(&repository, &request.exclude_repositories)?
            {
                self.output
                    .detail(&format!("Repository {} excluded", repository));
                continue;
            }

            let tags = self
                .with_retry(request, cancel, "list tags", || {
                    self.source.list_tags(&repository)
                })
                .await?;
            let selected =
                self.filter
                    .select(&tags, &request.include_tags, &request.exclude_tags)?;

            let target = destination_repository(
                &repository,
                &request.source_prefix,
                &request.destination_prefix,
            );
            self.output.detail(&format!(
                "{}: {} of {} tag(s) selected → {}",
                repository,
                selected.len(),
                tags.len(),
                target
            ));

            units.extend(
                selected
                    .into_iter()
                    .map(|tag| UnitRecord::pending(repository.clone(), target.clone(), tag)),
            );
        }
        Ok(units)
    }

    /// Run the job described by `request` until it completes or `cancel` fires.
    ///
    /// Setup failures (bad patterns, enumeration errors) are returned as errors
    /// before any unit starts; per-unit failures end up in the report.
    pub async fn run(
        &self,
        request: &ReplicationRequest,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport> {
        let started = Instant::now();
        self.output.section("Replicating registry tree");
        self.output.info(&format!(
            "{} → {}",
            self.source.name(),
            self.destination.name()
        ));

        self.filter.validate(&request.include_tags)?;
        self.filter.validate(&request.exclude_tags)?;
        self.filter.validate(&request.exclude_repositories)?;
        request.retry.validate()?;
        request.delta.validate()?;

        let job_id = self.job_id(request);
        self.output.info(&format!("Job ID: {}", job_id));

        self.output.subsection("Enumerating source");
        let units = self.enumerate(request, cancel).await?;
        self.output
            .info(&format!("Enumerated {} unit(s)", units.len()));

        let store = self.store.clone().filter(|_| request.checkpointing);
        let ledger = CheckpointLedger::new(store, job_id.clone(), self.output.clone());

        if request.dry_run {
            return Ok(self.dry_run(&ledger, request, units, started).await);
        }
        if request.fresh {
            ledger.discard().await;
        }

        self.output.subsection("Reconciling checkpoint");
        let mut checkpoint = match ledger.load().await {
            Some(checkpoint) => {
                self.output.info(&format!(
                    "Resuming job {} ({})",
                    job_id, checkpoint.status
                ));
                checkpoint
            }
            None => Checkpoint::new(
                job_id.clone(),
                self.source.name(),
                self.destination.name(),
            ),
        };
        let reconciled = checkpoint.reconcile(units);
        checkpoint.status = JobStatus::Running;
        ledger.save(&checkpoint).await;

        self.output.summary_kv(
            "Units",
            &[
                ("Settled", reconciled.settled.to_string()),
                ("Requeued", reconciled.requeued.to_string()),
                ("New", reconciled.added.to_string()),
                ("Dropped", reconciled.dropped.to_string()),
            ],
        );

        let queued: Vec<UnitRecord> = checkpoint.pending_units().into_iter().cloned().collect();
        let mut report =
            ReplicationReport::new(job_id, checkpoint.units.len(), reconciled.settled);

        if queued.is_empty() {
            ledger.finish(JobStatus::Completed).await;
            report.elapsed = started.elapsed();
            report.outcome = ReplicationOutcome::NothingToDo;
            return Ok(report);
        }

        self.output.subsection(&format!(
            "Replicating {} unit(s) with {} worker(s)",
            queued.len(),
            request.workers
        ));

        let context = UnitContext {
            source: Arc::clone(&self.source),
            destination: Arc::clone(&self.destination),
            optimizer: Arc::new(DeltaOptimizer::new(
                request.delta.clone(),
                self.output.clone(),
            )),
            ledger: ledger.clone(),
            policy: RetryPolicy::new(&request.retry),
            request_timeout: request.request_timeout,
            force: request.force,
            output: self.output.clone(),
        };

        let pool = WorkerPool::start(request.workers, self.output.clone());
        let mut handles = Vec::with_capacity(queued.len());
        for unit in queued.iter().cloned() {
            let key = unit.key();
            let context = context.clone();
            match pool
                .submit(cancel, move |token| async move {
                    Ok::<_, ReplicationError>(context.run(unit, token).await)
                })
                .await
            {
                Ok(handle) => handles.push((key, handle)),
                Err(ReplicationError::Cancelled) => {
                    self.output.warning(&format!(
                        "Cancellation requested; {} unit(s) not started",
                        queued.len() - handles.len()
                    ));
                    break;
                }
                Err(e) => {
                    pool.stop(false).await;
                    ledger.finish(JobStatus::Failed).await;
                    return Err(e);
                }
            }
        }

        for (key, handle) in handles {
            match handle.await {
                Ok(result) => report.record(&result),
                Err(e) => {
                    self.output
                        .error(&format!("{} task aborted: {}", key, e));
                    ledger
                        .mark_unit(&key, UnitUpdate::failed(e.to_string()))
                        .await;
                    report.record_failure(key, e.to_string());
                }
            }
        }
        pool.stop(!cancel.is_cancelled()).await;

        report.pending = queued.len() - report.processed();
        report.finish(started.elapsed());

        let status = match report.outcome {
            ReplicationOutcome::Paused => JobStatus::Paused,
            _ => JobStatus::Completed,
        };
        ledger.finish(status).await;
        Ok(report)
    }

    async fn dry_run(
        &self,
        ledger: &CheckpointLedger,
        request: &ReplicationRequest,
        units: Vec<UnitRecord>,
        started: Instant,
    ) -> ReplicationReport {
        let mut checkpoint = match ledger.load().await {
            Some(checkpoint) if !request.fresh => checkpoint,
            _ => Checkpoint::new(ledger.job_id(), self.source.name(), self.destination.name()),
        };
        let reconciled = checkpoint.reconcile(units);

        let mut report = ReplicationReport::new(
            ledger.job_id(),
            checkpoint.units.len(),
            reconciled.settled,
        );
        report.planned = checkpoint
            .pending_units()
            .into_iter()
            .map(|unit| format!("{} → {}:{}", unit.key(), unit.destination_repository, unit.tag))
            .collect();
        report.pending = report.planned.len();
        report.outcome = ReplicationOutcome::DryRun;
        report.elapsed = started.elapsed();
        report
    }

    /// Run a setup call with the request timeout, retrying transient failures
    async fn with_retry<T, F, Fut>(
        &self,
        request: &ReplicationRequest,
        cancel: &CancellationToken,
        what: &str,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::new(&request.retry);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                outcome = tokio::time::timeout(request.request_timeout, operation()) => {
                    outcome.unwrap_or_else(|elapsed| Err(elapsed.into()))
                }
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match policy.decide(&error, attempt, true) {
                RetryDecision::RetryAfter(delay) => {
                    self.output.warning(&format!(
                        "Failed to {} (attempt {}), retrying in {}: {}",
                        what,
                        attempt,
                        self.output.format_duration(delay),
                        error
                    ));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_destination_repository_mapping() {
        assert_eq!(destination_repository("team/app", "team/", "mirror/"), "mirror/app");
        assert_eq!(destination_repository("team/app", "team", "mirror"), "mirror/app");
        assert_eq!(destination_repository("app", "", "mirror"), "mirror/app");
        assert_eq!(destination_repository("team/app", "team", ""), "app");
        assert_eq!(destination_repository("app", "", ""), "app");
        assert_eq!(destination_repository("team", "team", "mirror"), "mirror");
    }

    #[test]
    fn test_job_id_is_stable() {
        let mut request = ReplicationRequest {
            include_tags: strings(&["v*", "latest"]),
            ..Default::default()
        };
        let id = request.job_id("https://a.example", "https://b.example");
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        request.include_tags = strings(&["latest", "v*"]);
        request.workers = 17;
        assert_eq!(request.job_id("https://a.example/", "https://b.example"), id);

        request.exclude_tags = strings(&["dev"]);
        assert_ne!(request.job_id("https://a.example", "https://b.example"), id);
        assert_ne!(
            ReplicationRequest::default().job_id("https://b.example", "https://a.example"),
            ReplicationRequest::default().job_id("https://a.example", "https://b.example")
        );
    }
}
