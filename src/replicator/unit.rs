//! The worker-side task for one replication unit

use super::retry::{RetryDecision, RetryPolicy};
use super::transfer::{ImageTransfer, TagOutcome, TransferStats};
use crate::checkpoint::{CheckpointLedger, UnitRecord, UnitStatus, UnitUpdate};
use crate::delta::DeltaOptimizer;
use crate::error::{ErrorClass, ReplicationError};
use crate::logging::Logger;
use crate::registry::RegistryClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a unit task ended
#[derive(Debug, Clone, PartialEq)]
pub struct UnitResult {
    pub key: String,
    pub source_repository: String,
    pub destination_repository: String,
    pub tag: String,
    /// `Pending` when the unit was interrupted by cancellation
    pub status: UnitStatus,
    /// Attempts made during this run
    pub attempts: u32,
    pub error: Option<String>,
    pub manifest_digest: Option<String>,
    pub stats: TransferStats,
}

impl UnitResult {
    fn new(unit: &UnitRecord) -> Self {
        Self {
            key: unit.key(),
            source_repository: unit.source_repository.clone(),
            destination_repository: unit.destination_repository.clone(),
            tag: unit.tag.clone(),
            status: UnitStatus::Pending,
            attempts: 0,
            error: None,
            manifest_digest: None,
            stats: TransferStats::default(),
        }
    }
}

/// Everything a unit task needs, shared by all tasks of a run
#[derive(Clone)]
pub struct UnitContext {
    pub source: Arc<dyn RegistryClient>,
    pub destination: Arc<dyn RegistryClient>,
    pub optimizer: Arc<DeltaOptimizer>,
    pub ledger: CheckpointLedger,
    pub policy: RetryPolicy,
    pub request_timeout: Duration,
    pub force: bool,
    pub output: Logger,
}

impl UnitContext {
    /// Replicate `unit`, retrying per the policy, and record every transition.
    ///
    /// Errors are contained: the returned result carries the final status.
    pub async fn run(self, unit: UnitRecord, token: CancellationToken) -> UnitResult {
        let mut result = UnitResult::new(&unit);
        let mut integrity_retried = false;

        loop {
            if token.is_cancelled() {
                return self.interrupt(result).await;
            }

            result.attempts += 1;
            self.ledger
                .mark_unit(&result.key, UnitUpdate::started())
                .await;

            let transfer = ImageTransfer {
                source: self.source.as_ref(),
                destination: self.destination.as_ref(),
                optimizer: &self.optimizer,
                source_repository: &unit.source_repository,
                destination_repository: &unit.destination_repository,
                request_timeout: self.request_timeout,
                token: &token,
                output: &self.output,
            };

            let error = match transfer.replicate_tag(&unit.tag, self.force).await {
                Ok(TagOutcome::UpToDate { digest }) => {
                    self.output
                        .detail(&format!("{} is up to date", result.key));
                    return self
                        .settle(result, UnitStatus::Skipped, digest, TransferStats::default())
                        .await;
                }
                Ok(TagOutcome::Replicated { digest, stats }) => {
                    self.output.step(&format!(
                        "{} → {}:{} ({} delta payload, {} saved)",
                        result.key,
                        result.destination_repository,
                        result.tag,
                        self.output.format_size(stats.bytes_transferred),
                        self.output.format_size(stats.bytes_saved)
                    ));
                    return self
                        .settle(result, UnitStatus::Completed, digest, stats)
                        .await;
                }
                Err(e) if e.is_cancelled() => return self.interrupt(result).await,
                Err(e) => e,
            };

            match self
                .policy
                .decide(&error, result.attempts, integrity_retried)
            {
                RetryDecision::RetryAfter(delay) => {
                    if error.class() == ErrorClass::RetryOnce {
                        integrity_retried = true;
                    }
                    self.output.warning(&format!(
                        "{} attempt {} failed, retrying in {}: {}",
                        result.key,
                        result.attempts,
                        self.output.format_duration(delay),
                        error
                    ));
                    let mut update = UnitUpdate::new(UnitStatus::Pending);
                    update.error = Some(error.to_string());
                    self.ledger.mark_unit(&result.key, update).await;

                    tokio::select! {
                        _ = token.cancelled() => return self.interrupt(result).await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => return self.fail(result, &error).await,
            }
        }
    }

    async fn settle(
        &self,
        mut result: UnitResult,
        status: UnitStatus,
        digest: String,
        stats: TransferStats,
    ) -> UnitResult {
        let update = UnitUpdate::new(status)
            .with_manifest(digest.clone())
            .with_bytes(stats.bytes_transferred, stats.bytes_saved);
        self.ledger.mark_unit(&result.key, update).await;

        result.status = status;
        result.manifest_digest = Some(digest);
        result.stats = stats;
        result
    }

    async fn fail(&self, mut result: UnitResult, error: &ReplicationError) -> UnitResult {
        self.output.error(&format!(
            "{} failed after {} attempt(s): {}",
            result.key, result.attempts, error
        ));
        self.ledger
            .mark_unit(&result.key, UnitUpdate::failed(error.to_string()))
            .await;

        result.status = UnitStatus::Failed;
        result.error = Some(error.to_string());
        result
    }

    /// Return an interrupted unit to `Pending` so a resume picks it up
    async fn interrupt(&self, mut result: UnitResult) -> UnitResult {
        if result.attempts > 0 {
            self.ledger
                .mark_unit(&result.key, UnitUpdate::new(UnitStatus::Pending))
                .await;
        }
        self.output
            .detail(&format!("{} interrupted, left pending", result.key));
        result.status = UnitStatus::Pending;
        result
    }
}
