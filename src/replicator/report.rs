//! Final outcome of a replication run

use super::transfer::TransferStats;
use super::unit::UnitResult;
use crate::checkpoint::UnitStatus;
use crate::logging::Logger;
use std::time::Duration;

/// How a run ended, as seen by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Every unit completed or was already up to date
    Completed,
    /// The run finished but one or more units failed
    PartialSuccess,
    /// Every enumerated unit was already settled by an earlier run
    NothingToDo,
    /// Cancellation stopped the run; the same job resumes where it left off
    Paused,
    /// Units were listed but nothing was transferred or recorded
    DryRun,
}

impl ReplicationOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ReplicationOutcome::Completed
            | ReplicationOutcome::NothingToDo
            | ReplicationOutcome::DryRun => 0,
            ReplicationOutcome::PartialSuccess => 2,
            ReplicationOutcome::Paused => 130,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub job_id: String,
    pub outcome: ReplicationOutcome,
    /// Units known to the job after reconciliation
    pub total_units: usize,
    /// Units settled by earlier runs and not attempted
    pub already_settled: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<FailedUnit>,
    /// Units left for a later run
    pub pending: usize,
    /// Unit keys a dry run would process
    pub planned: Vec<String>,
    pub stats: TransferStats,
    pub elapsed: Duration,
}

impl ReplicationReport {
    pub fn new(job_id: impl Into<String>, total_units: usize, already_settled: usize) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: ReplicationOutcome::Completed,
            total_units,
            already_settled,
            completed: 0,
            skipped: 0,
            failed: Vec::new(),
            pending: 0,
            planned: Vec::new(),
            stats: TransferStats::default(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn record(&mut self, result: &UnitResult) {
        match result.status {
            UnitStatus::Completed => self.completed += 1,
            UnitStatus::Skipped => self.skipped += 1,
            UnitStatus::Failed => self.failed.push(FailedUnit {
                key: result.key.clone(),
                error: result.error.clone().unwrap_or_default(),
            }),
            UnitStatus::Pending | UnitStatus::InProgress => self.pending += 1,
        }
        self.stats.merge(&result.stats);
    }

    pub fn record_failure(&mut self, key: impl Into<String>, error: impl Into<String>) {
        self.failed.push(FailedUnit {
            key: key.into(),
            error: error.into(),
        });
    }

    /// Units that reached a final state during this run
    pub fn processed(&self) -> usize {
        self.completed + self.skipped + self.failed.len()
    }

    /// Derive the outcome once every queued unit is accounted for
    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        self.outcome = if self.pending > 0 {
            ReplicationOutcome::Paused
        } else if !self.failed.is_empty() {
            ReplicationOutcome::PartialSuccess
        } else {
            ReplicationOutcome::Completed
        };
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn print(&self, output: &Logger) {
        output.section("Replication Summary");
        output.summary_kv(
            "Job",
            &[
                ("Job ID", self.job_id.clone()),
                ("Units", self.total_units.to_string()),
                ("Settled earlier", self.already_settled.to_string()),
                ("Completed", self.completed.to_string()),
                ("Up to date", self.skipped.to_string()),
                ("Failed", self.failed.len().to_string()),
                ("Pending", self.pending.to_string()),
            ],
        );
        output.summary_kv(
            "Transfer",
            &[
                ("Blobs copied", self.stats.blobs_transferred.to_string()),
                ("Blobs reused", self.stats.blobs_present.to_string()),
                ("Delta payload", output.format_size(self.stats.bytes_transferred)),
                ("Delta savings", output.format_size(self.stats.bytes_saved)),
                ("Elapsed", output.format_duration(self.elapsed)),
            ],
        );

        if !self.failed.is_empty() {
            let lines: Vec<String> = self
                .failed
                .iter()
                .map(|unit| format!("{}: {}", unit.key, unit.error))
                .collect();
            output.list("Failed units", &lines);
        }

        match self.outcome {
            ReplicationOutcome::Completed => output.success(&format!(
                "Replication completed: {} unit(s) replicated, {} already up to date",
                self.completed, self.skipped
            )),
            ReplicationOutcome::PartialSuccess => output.warning(&format!(
                "Replication finished with {} failed unit(s) out of {}",
                self.failed.len(),
                self.processed()
            )),
            ReplicationOutcome::NothingToDo => output.success(&format!(
                "Nothing to do: all {} unit(s) were completed by earlier runs",
                self.total_units
            )),
            ReplicationOutcome::Paused => output.warning(&format!(
                "Replication paused with {} unit(s) pending; rerun the same job to resume",
                self.pending
            )),
            ReplicationOutcome::DryRun => {
                output.list("Units to replicate", &self.planned);
                output.info(&format!(
                    "Dry run: {} unit(s) would be processed",
                    self.planned.len()
                ));
            }
        }
    }
}
