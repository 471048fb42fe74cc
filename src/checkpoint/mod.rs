//! Resumable progress ledger
//!
//! [`CheckpointStore`] persists one [`Checkpoint`] document per job. The replicator
//! never talks to a store directly; it goes through a [`CheckpointLedger`], which
//! turns an absent store into a no-op and downgrades store failures to warnings so
//! that losing resumability never fails a run.

pub mod file_store;
pub mod types;

pub use file_store::FileCheckpointStore;
pub use types::{
    Checkpoint, CheckpointSummary, JobStatus, ReconcileSummary, UnitRecord, UnitStatus,
    UnitUpdate, unit_key,
};

use crate::error::Result;
use crate::logging::Logger;
use async_trait::async_trait;
use std::sync::Arc;

/// Durable storage for checkpoint documents
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load a job's checkpoint, `None` when the job has never been saved
    async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>>;

    /// Replace a job's whole checkpoint document
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Record a unit transition (read-modify-write under the job's lock)
    async fn mark_unit(&self, job_id: &str, unit_key: &str, update: UnitUpdate) -> Result<()>;

    async fn list(&self) -> Result<Vec<CheckpointSummary>>;

    /// Remove a job's checkpoint, returning whether one existed
    async fn delete(&self, job_id: &str) -> Result<bool>;
}

/// Job-scoped, failure-tolerant view of an optional [`CheckpointStore`]
#[derive(Clone)]
pub struct CheckpointLedger {
    store: Option<Arc<dyn CheckpointStore>>,
    job_id: String,
    output: Logger,
}

impl CheckpointLedger {
    pub fn new(
        store: Option<Arc<dyn CheckpointStore>>,
        job_id: impl Into<String>,
        output: Logger,
    ) -> Self {
        if store.is_none() {
            output.warning("No checkpoint store configured; this run cannot be resumed");
        }
        Self {
            store,
            job_id: job_id.into(),
            output,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    pub async fn load(&self) -> Option<Checkpoint> {
        let store = self.store.as_ref()?;
        match store.load(&self.job_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.output.warning(&format!(
                    "Could not load checkpoint {}, starting over: {}",
                    self.job_id, e
                ));
                None
            }
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(checkpoint).await {
                self.output
                    .warning(&format!("Could not save checkpoint {}: {}", self.job_id, e));
            }
        }
    }

    pub async fn mark_unit(&self, unit_key: &str, update: UnitUpdate) {
        if let Some(store) = &self.store {
            let status = update.status;
            if let Err(e) = store.mark_unit(&self.job_id, unit_key, update).await {
                self.output.warning(&format!(
                    "Could not record {} for {}: {}",
                    status, unit_key, e
                ));
            }
        }
    }

    /// Record the job's final status on the stored document
    pub async fn finish(&self, status: JobStatus) {
        if let Some(mut checkpoint) = self.load().await {
            checkpoint.status = status;
            self.save(&checkpoint).await;
        }
    }

    pub async fn discard(&self) {
        if let Some(store) = &self.store {
            match store.delete(&self.job_id).await {
                Ok(true) => self
                    .output
                    .info(&format!("Discarded existing checkpoint {}", self.job_id)),
                Ok(false) => {}
                Err(e) => self.output.warning(&format!(
                    "Could not discard checkpoint {}: {}",
                    self.job_id, e
                )),
            }
        }
    }
}
