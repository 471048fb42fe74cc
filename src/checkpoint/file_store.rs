//! JSON-file checkpoint store
//!
//! One `<job id>.json` document per job inside a directory only the owner can
//! access. Documents are rewritten whole through a temporary file and an atomic
//! rename, under a per-job async mutex.

use super::types::{Checkpoint, CheckpointSummary, UnitUpdate};
use super::CheckpointStore;
use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const APP_DIR: &str = "docker-image-replicator";

pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    output: Logger,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, output: Logger) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;

        let store = Self {
            dir,
            locks: Mutex::new(HashMap::new()),
            output,
        };
        store.ensure_private()?;
        Ok(store)
    }

    /// `$XDG_STATE_HOME/docker-image-replicator/checkpoints`, falling back to
    /// `$HOME/.local/state/...` and finally to the working directory
    pub fn default_dir() -> PathBuf {
        Self::default_dir_from(|key| std::env::var(key).ok())
    }

    pub fn default_dir_from<F>(lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(state_home) = non_empty("XDG_STATE_HOME") {
            return PathBuf::from(state_home).join(APP_DIR).join("checkpoints");
        }
        if let Some(home) = non_empty("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("state")
                .join(APP_DIR)
                .join("checkpoints");
        }
        PathBuf::from(format!(".{}", APP_DIR)).join("checkpoints")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tighten the directory to owner-only access if it has become more permissive
    #[cfg(unix)]
    pub fn ensure_private(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(&self.dir)
            .map_err(|e| unavailable(&format!("inspect {}", self.dir.display()), e))?;
        let mode = metadata.permissions().mode() & 0o777;

        if mode & 0o077 != 0 {
            self.output.warning(&format!(
                "Checkpoint directory {} had permissions {:o}, tightening to 700",
                self.dir.display(),
                mode
            ));
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| unavailable(&format!("restrict {}", self.dir.display()), e))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn ensure_private(&self) -> Result<()> {
        Ok(())
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ReplicationError::CheckpointUnavailable(format!(
                "Invalid checkpoint id '{}'",
                job_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    fn job_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }

    async fn read(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(job_id)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(&format!("read {}", path.display()), e)),
        };

        serde_json::from_slice(&content).map(Some).map_err(|e| {
            ReplicationError::CheckpointUnavailable(format!(
                "Corrupt checkpoint {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.job_id)?;
        let tmp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let content = serde_json::to_vec_pretty(checkpoint)?;

        write_private_file(&tmp_path, &content)
            .await
            .map_err(|e| unavailable(&format!("write {}", tmp_path.display()), e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| unavailable(&format!("commit {}", path.display()), e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        self.ensure_private()?;
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;
        self.read(job_id).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let lock = self.job_lock(&checkpoint.job_id);
        let _guard = lock.lock().await;

        let mut document = checkpoint.clone();
        document.updated_at = Utc::now();
        self.write(&document).await
    }

    async fn mark_unit(&self, job_id: &str, unit_key: &str, update: UnitUpdate) -> Result<()> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut checkpoint = self.read(job_id).await?.ok_or_else(|| {
            ReplicationError::CheckpointUnavailable(format!("No checkpoint for job {}", job_id))
        })?;

        if !checkpoint.units.contains_key(unit_key) {
            return Err(ReplicationError::CheckpointUnavailable(format!(
                "Unit {} is not part of job {}",
                unit_key, job_id
            )));
        }

        if checkpoint.apply_update(unit_key, &update) {
            self.write(&checkpoint).await?;
        } else {
            self.output.debug(&format!(
                "Ignoring {} transition for completed unit {}",
                update.status, unit_key
            ));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| unavailable(&format!("list {}", self.dir.display()), e))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            match self.load(job_id).await {
                Ok(Some(checkpoint)) => summaries.push(checkpoint.summary()),
                Ok(None) => {}
                Err(e) => self
                    .output
                    .warning(&format!("Skipping unreadable checkpoint {}: {}", job_id, e)),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        let path = self.path_for(job_id)?;
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(&format!("delete {}", path.display()), e)),
        }
    }
}

fn unavailable(action: &str, err: std::io::Error) -> ReplicationError {
    ReplicationError::CheckpointUnavailable(format!("Failed to {}: {}", action, err))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| unavailable(&format!("create {}", dir.display()), e))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| unavailable(&format!("create {}", dir.display()), e))
}

async fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::types::{JobStatus, UnitRecord, UnitStatus};

    fn store_in(dir: &Path) -> FileCheckpointStore {
        FileCheckpointStore::new(dir.join("checkpoints"), Logger::new_quiet()).unwrap()
    }

    fn checkpoint_with_units(job_id: &str, count: usize) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(job_id, "https://src", "https://dst");
        for i in 0..count {
            let record = UnitRecord::pending("app", "app", format!("v{}", i));
            checkpoint.units.insert(record.key(), record);
        }
        checkpoint
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        assert!(store.load("job1").await.unwrap().is_none());

        let checkpoint = checkpoint_with_units("job1", 3);
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("job1").await.unwrap().unwrap();
        assert_eq!(loaded.units, checkpoint.units);
        assert_eq!(loaded.status, JobStatus::Running);
        let leftovers = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_mark_unit_keeps_every_update() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(tmp.path()));
        store.save(&checkpoint_with_units("job", 20)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .mark_unit(
                        "job",
                        &format!("app:v{}", i),
                        UnitUpdate::new(UnitStatus::Completed).with_bytes(i, 0),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = store.load("job").await.unwrap().unwrap();
        assert_eq!(loaded.count(UnitStatus::Completed), 20);
        assert_eq!(loaded.units["app:v7"].bytes_transferred, 7);
    }

    #[tokio::test]
    async fn test_mark_unit_keeps_completed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&checkpoint_with_units("job", 1)).await.unwrap();

        store
            .mark_unit("job", "app:v0", UnitUpdate::new(UnitStatus::Completed))
            .await
            .unwrap();
        store
            .mark_unit("job", "app:v0", UnitUpdate::failed("late failure"))
            .await
            .unwrap();

        let loaded = store.load("job").await.unwrap().unwrap();
        assert_eq!(loaded.units["app:v0"].status, UnitStatus::Completed);
    }

    #[tokio::test]
    async fn test_mark_unit_requires_known_job_and_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let err = store
            .mark_unit("nojob", "app:v0", UnitUpdate::started())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::CheckpointUnavailable(_)));

        store.save(&checkpoint_with_units("job", 1)).await.unwrap();
        assert!(store
            .mark_unit("job", "other:v0", UnitUpdate::started())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&checkpoint_with_units("first", 1)).await.unwrap();
        store.save(&checkpoint_with_units("second", 2)).await.unwrap();
        std::fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);

        assert!(store.delete("first").await.unwrap());
        assert!(!store.delete("first").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(store.load("../escape").await.is_err());
        assert!(store.delete("").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        std::fs::write(store.dir().join("broken.json"), "{").unwrap();
        assert!(matches!(
            store.load("broken").await,
            Err(ReplicationError::CheckpointUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_are_private_and_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&checkpoint_with_units("job", 1)).await.unwrap();

        let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(store.dir()), 0o700);
        assert_eq!(mode(store.dir().join("job.json").as_path()), 0o600);

        std::fs::set_permissions(store.dir(), std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(store.load("job").await.unwrap().is_some());
        assert_eq!(mode(store.dir()), 0o700);
    }

    #[test]
    fn test_default_dir_resolution() {
        let xdg = FileCheckpointStore::default_dir_from(|key| match key {
            "XDG_STATE_HOME" => Some("/state".to_string()),
            "HOME" => Some("/home/user".to_string()),
            _ => None,
        });
        assert_eq!(
            xdg,
            PathBuf::from("/state/docker-image-replicator/checkpoints")
        );

        let home = FileCheckpointStore::default_dir_from(|key| match key {
            "HOME" => Some("/home/user".to_string()),
            _ => None,
        });
        assert_eq!(
            home,
            PathBuf::from("/home/user/.local/state/docker-image-replicator/checkpoints")
        );

        let fallback = FileCheckpointStore::default_dir_from(|_| None);
        assert_eq!(
            fallback,
            PathBuf::from(".docker-image-replicator/checkpoints")
        );
    }
}
