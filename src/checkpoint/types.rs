//! Checkpoint document model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Progress of one replication unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl UnitStatus {
    /// Settled units are never re-attempted by a resume
    pub fn is_settled(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Skipped)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Overall state of a replication job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Ledger entry for one (source repository, destination repository, tag) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub source_repository: String,
    pub destination_repository: String,
    pub tag: String,
    pub status: UnitStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub bytes_saved: u64,
    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn pending(
        source_repository: impl Into<String>,
        destination_repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            source_repository: source_repository.into(),
            destination_repository: destination_repository.into(),
            tag: tag.into(),
            status: UnitStatus::Pending,
            attempts: 0,
            last_error: None,
            manifest_digest: None,
            bytes_transferred: 0,
            bytes_saved: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        unit_key(&self.source_repository, &self.tag)
    }
}

/// Ledger key of a unit: `<source repository>:<tag>`
pub fn unit_key(source_repository: &str, tag: &str) -> String {
    format!("{}:{}", source_repository, tag)
}

/// A status transition reported by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct UnitUpdate {
    pub status: UnitStatus,
    pub error: Option<String>,
    pub manifest_digest: Option<String>,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    /// Count this transition as a new attempt
    pub count_attempt: bool,
}

impl UnitUpdate {
    pub fn new(status: UnitStatus) -> Self {
        Self {
            status,
            error: None,
            manifest_digest: None,
            bytes_transferred: 0,
            bytes_saved: 0,
            count_attempt: false,
        }
    }

    pub fn started() -> Self {
        Self {
            count_attempt: true,
            ..Self::new(UnitStatus::InProgress)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(UnitStatus::Failed)
        }
    }

    pub fn with_manifest(mut self, digest: impl Into<String>) -> Self {
        self.manifest_digest = Some(digest.into());
        self
    }

    pub fn with_bytes(mut self, transferred: u64, saved: u64) -> Self {
        self.bytes_transferred = transferred;
        self.bytes_saved = saved;
        self
    }
}

/// Outcome of merging a freshly enumerated unit set into a checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Completed or skipped units that will not run again
    pub settled: usize,
    /// Previously pending, in-progress or failed units queued again
    pub requeued: usize,
    pub added: usize,
    /// Units no longer present upstream
    pub dropped: usize,
}

impl ReconcileSummary {
    pub fn pending(&self) -> usize {
        self.requeued + self.added
    }
}

/// Durable progress ledger of one replication job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub source: String,
    pub destination: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub units: BTreeMap<String, UnitRecord>,
}

impl Checkpoint {
    pub fn new(
        job_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            source: source.into(),
            destination: destination.into(),
            created_at: now,
            updated_at: now,
            status: JobStatus::Running,
            units: BTreeMap::new(),
        }
    }

    /// Apply a worker's transition. A completed unit never moves backwards;
    /// returns whether the record changed.
    pub fn apply_update(&mut self, key: &str, update: &UnitUpdate) -> bool {
        let Some(record) = self.units.get_mut(key) else {
            return false;
        };

        if record.status == UnitStatus::Completed && update.status != UnitStatus::Completed {
            return false;
        }

        let now = Utc::now();
        record.status = update.status;
        record.last_error = update.error.clone();
        if update.count_attempt {
            record.attempts += 1;
        }
        if update.manifest_digest.is_some() {
            record.manifest_digest = update.manifest_digest.clone();
        }
        if update.status.is_settled() {
            record.bytes_transferred = update.bytes_transferred;
            record.bytes_saved = update.bytes_saved;
        }
        record.updated_at = now;
        self.updated_at = now;
        true
    }

    /// Merge an enumerated unit set into this checkpoint
    pub fn reconcile(&mut self, enumerated: Vec<UnitRecord>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut merged = BTreeMap::new();

        for unit in enumerated {
            let key = unit.key();
            match self.units.remove(&key) {
                Some(mut existing) => {
                    if existing.status.is_settled() {
                        summary.settled += 1;
                    } else {
                        existing.status = UnitStatus::Pending;
                        summary.requeued += 1;
                    }
                    existing.destination_repository = unit.destination_repository;
                    merged.insert(key, existing);
                }
                None => {
                    summary.added += 1;
                    merged.insert(key, unit);
                }
            }
        }

        summary.dropped = self.units.len();
        self.units = merged;
        self.updated_at = Utc::now();
        summary
    }

    /// Units that still need to run, in key order
    pub fn pending_units(&self) -> Vec<&UnitRecord> {
        self.units
            .values()
            .filter(|unit| !unit.status.is_settled())
            .collect()
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.values().filter(|u| u.status == status).count()
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            job_id: self.job_id.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            total_units: self.units.len(),
            completed_units: self.count(UnitStatus::Completed) + self.count(UnitStatus::Skipped),
            failed_units: self.count(UnitStatus::Failed),
        }
    }
}

/// Listing entry for stored checkpoints
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub job_id: String,
    pub source: String,
    pub destination: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
}

impl CheckpointSummary {
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            100.0
        } else {
            self.completed_units as f64 * 100.0 / self.total_units as f64
        }
    }
}
