//! End-to-end replication runs against in-memory registries

use async_trait::async_trait;
use docker_image_replicator::checkpoint::{
    CheckpointStore, FileCheckpointStore, JobStatus, UnitStatus,
};
use docker_image_replicator::config::RetryConfig;
use docker_image_replicator::delta::BlobDescriptor;
use docker_image_replicator::registry::{
    BlobReader, InMemoryRegistry, Manifest, Operation, RegistryClient,
};
use docker_image_replicator::{
    Logger, ReplicationError, ReplicationOutcome, ReplicationRequest, Result, TreeReplicator,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn request() -> ReplicationRequest {
    ReplicationRequest {
        workers: 4,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn file_store(dir: &TempDir) -> Arc<dyn CheckpointStore> {
    Arc::new(FileCheckpointStore::new(dir.path(), Logger::new_quiet()).unwrap())
}

fn replicator(
    source: &Arc<InMemoryRegistry>,
    destination: Arc<dyn RegistryClient>,
    store: Option<Arc<dyn CheckpointStore>>,
) -> TreeReplicator {
    TreeReplicator::new(source.clone(), destination, store, Logger::new_quiet())
}

/// Deterministic incompressible bytes
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// team/web: v1 v2 latest dev, team/api: v1, tools/ci: v1
fn seed_tree(source: &InMemoryRegistry) {
    for tag in ["v1", "v2", "latest", "dev"] {
        source.push_image(
            "team/web",
            tag,
            &[b"web base".to_vec(), format!("web {}", tag).into_bytes()],
        );
    }
    source.push_image("team/api", "v1", &[b"api".to_vec()]);
    source.push_image("tools/ci", "v1", &[b"ci".to_vec()]);
}

/// Destination wrapper that cancels the run after a number of tag writes
struct CancelAfterTags {
    inner: Arc<InMemoryRegistry>,
    remaining: AtomicUsize,
    cancel: CancellationToken,
}

#[async_trait]
impl RegistryClient for CancelAfterTags {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        self.inner.list_repositories().await
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.inner.list_tags(repository).await
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<Manifest>> {
        self.inner.get_manifest(repository, reference).await
    }

    async fn get_blob_metadata(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<BlobDescriptor>> {
        self.inner.get_blob_metadata(repository, digest).await
    }

    async fn get_blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        self.inner.get_blob_reader(repository, digest).await
    }

    async fn put_blob(&self, repository: &str, digest: &str, content: Vec<u8>) -> Result<()> {
        self.inner.put_blob(repository, digest, content).await
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        self.inner.put_manifest(repository, reference, manifest).await?;
        if reference != manifest.digest && self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_full_run_then_rerun_is_nothing_to_do() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let dir = TempDir::new().unwrap();
    let replicator = replicator(&source, destination.clone(), Some(file_store(&dir)));
    let request = request();

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.total_units, 6);
    assert_eq!(report.completed, 6);
    assert!(report.failed.is_empty());

    for (repository, tag) in [
        ("team/web", "v1"),
        ("team/web", "dev"),
        ("team/api", "v1"),
        ("tools/ci", "v1"),
    ] {
        assert_eq!(
            destination.tag_digest(repository, tag),
            source.tag_digest(repository, tag),
            "{}:{}",
            repository,
            tag
        );
    }

    source.reset_calls();
    destination.reset_calls();
    let rerun = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.outcome, ReplicationOutcome::NothingToDo);
    assert_eq!(rerun.exit_code(), 0);
    assert_eq!(rerun.already_settled, 6);
    assert_eq!(source.transfer_calls(), 0);
    assert_eq!(destination.transfer_calls(), 0);
}

#[tokio::test]
async fn test_filters_and_prefix_mapping() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let replicator = replicator(&source, destination.clone(), None);

    let request = ReplicationRequest {
        source_prefix: "team/".to_string(),
        destination_prefix: "mirror".to_string(),
        include_tags: vec!["v*".to_string()],
        exclude_tags: vec!["v2".to_string()],
        exclude_repositories: vec!["team/a?i".to_string()],
        ..request()
    };
    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.completed, 1);
    assert_eq!(destination.tags("mirror/web"), vec!["v1"]);
    assert!(destination.tags("mirror/api").is_empty());
    assert!(destination.tags("tools/ci").is_empty());
    assert!(destination.tags("mirror/ci").is_empty());
}

#[tokio::test]
async fn test_interrupted_run_resumes_remaining_units() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    for tag in ["t1", "t2", "t3", "t4"] {
        source.push_image("app", tag, &[format!("layer {}", tag).into_bytes()]);
    }
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let request = ReplicationRequest {
        workers: 1,
        ..request()
    };

    let cancel = CancellationToken::new();
    let interrupting = Arc::new(CancelAfterTags {
        inner: destination.clone(),
        remaining: AtomicUsize::new(2),
        cancel: cancel.clone(),
    });
    let first = replicator(&source, interrupting, Some(store.clone()));
    let job_id = first.job_id(&request);

    let report = first.run(&request, &cancel).await.unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Paused);
    assert_eq!(report.exit_code(), 130);
    assert_eq!(report.completed, 2);
    assert_eq!(report.pending, 2);

    let checkpoint = store.load(&job_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.status, JobStatus::Paused);
    assert_eq!(checkpoint.count(UnitStatus::Completed), 2);
    assert_eq!(checkpoint.count(UnitStatus::Pending), 2);

    destination.reset_calls();
    let second = replicator(&source, destination.clone(), Some(store.clone()));
    let report = second
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.already_settled, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(destination.calls(Operation::PutManifest), 2);

    let checkpoint = store.load(&job_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.status, JobStatus::Completed);
    assert_eq!(checkpoint.count(UnitStatus::Completed), 4);
    for tag in ["t1", "t2", "t3", "t4"] {
        assert_eq!(destination.tag_digest("app", tag), source.tag_digest("app", tag));
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    source.push_image("app", "v1", &[b"layer".to_vec()]);
    source.fail_next(Operation::GetBlobReader, 2);
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let replicator = replicator(&source, destination.clone(), Some(store.clone()));
    let request = request();

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(destination.tag_digest("app", "v1"), source.tag_digest("app", "v1"));

    let checkpoint = store
        .load(&replicator.job_id(&request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.units["app:v1"].attempts, 3);
    assert_eq!(checkpoint.units["app:v1"].status, UnitStatus::Completed);
}

#[tokio::test]
async fn test_stream_resets_mid_blob_are_retried() {
    const LAYER: usize = 128 * 1024;

    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));

    let old_layer = noise(LAYER, 11);
    let mut new_layer = old_layer.clone();
    new_layer[LAYER / 3] ^= 0xff;
    destination.push_image("app", "v1", &[old_layer.clone()]);
    let manifest = source.push_image("app", "v1", &[new_layer.clone()]);
    source.push_image("app", "v2", &[b"fresh".to_vec()]);

    let new_digest = BlobDescriptor::of(&new_layer).digest;
    let base_digest = BlobDescriptor::of(&old_layer).digest;
    let fresh_digest = BlobDescriptor::of(b"fresh").digest;
    destination.interrupt_next_reads(&base_digest, 1);
    source.interrupt_next_reads(&new_digest, 1);
    source.interrupt_next_reads(&fresh_digest, 1);

    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let replicator = replicator(&source, destination.clone(), Some(store.clone()));
    let mut request = request();
    request.delta.small_blob_threshold = 32 * 1024;
    request.delta.chunk_size = 8 * 1024;

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed, "{:?}", report.failed);
    assert_eq!(report.completed, 2);
    assert_eq!(destination.blob("app", &new_digest), Some(new_layer));
    assert_eq!(destination.tag_digest("app", "v1"), Some(manifest.digest));
    assert_eq!(destination.tag_digest("app", "v2"), source.tag_digest("app", "v2"));

    let checkpoint = store
        .load(&replicator.job_id(&request))
        .await
        .unwrap()
        .unwrap();
    // v1 loses one attempt to the base read and one to the source read
    assert_eq!(checkpoint.units["app:v1"].attempts, 3);
    assert_eq!(checkpoint.units["app:v2"].attempts, 2);
}

#[tokio::test]
async fn test_auth_failure_is_terminal_and_siblings_complete() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    source.push_image("public", "v1", &[b"one".to_vec()]);
    source.push_image("public", "v2", &[b"two".to_vec()]);
    source.push_image("secret", "v1", &[b"hidden".to_vec()]);
    destination.deny_repository("secret");
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let replicator = replicator(&source, destination.clone(), Some(store.clone()));
    let request = request();

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::PartialSuccess);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].key, "secret:v1");
    assert_eq!(destination.tags("public"), vec!["v1", "v2"]);

    let checkpoint = store
        .load(&replicator.job_id(&request))
        .await
        .unwrap()
        .unwrap();
    let secret = &checkpoint.units["secret:v1"];
    assert_eq!(secret.status, UnitStatus::Failed);
    assert_eq!(secret.attempts, 1);
    assert!(secret.last_error.is_some());

    // Failed units are retried by the next run, settled ones are not
    let rerun = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.already_settled, 2);
    assert_eq!(rerun.processed(), 1);
    assert_eq!(rerun.outcome, ReplicationOutcome::PartialSuccess);
}

#[tokio::test]
async fn test_delta_carries_only_changed_bytes() {
    const LAYER: usize = 256 * 1024;

    for chunked in [false, true] {
        let source = Arc::new(InMemoryRegistry::new("source"));
        let destination = Arc::new(InMemoryRegistry::new("destination"));

        let old_layer = noise(LAYER, 7);
        let mut new_layer = old_layer.clone();
        for byte in &mut new_layer[LAYER / 2..LAYER / 2 + 100] {
            *byte ^= 0xff;
        }
        destination.push_image("app", "v1", &[old_layer]);
        let manifest = source.push_image("app", "v1", &[new_layer.clone()]);
        let new_digest = BlobDescriptor::of(&new_layer).digest;

        let mut request = request();
        if chunked {
            request.delta.small_blob_threshold = 64 * 1024;
            request.delta.chunk_size = 16 * 1024;
        }
        let report = replicator(&source, destination.clone(), None)
            .run(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, ReplicationOutcome::Completed, "chunked={}", chunked);
        assert!(
            report.stats.bytes_transferred < (LAYER / 8) as u64,
            "chunked={} carried {}",
            chunked,
            report.stats.bytes_transferred
        );
        assert!(report.stats.bytes_saved > (LAYER / 2) as u64);
        assert_eq!(destination.blob("app", &new_digest), Some(new_layer));
        assert_eq!(destination.tag_digest("app", "v1"), Some(manifest.digest));
    }
}

#[tokio::test]
async fn test_disabled_delta_sends_whole_blobs() {
    const LAYER: usize = 64 * 1024;
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));

    let old_layer = noise(LAYER, 3);
    let mut new_layer = old_layer.clone();
    new_layer[10] ^= 0x01;
    destination.push_image("app", "v1", &[old_layer]);
    source.push_image("app", "v1", &[new_layer]);

    let mut request = request();
    request.delta.enabled = false;
    let report = replicator(&source, destination.clone(), None)
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert!(report.stats.bytes_transferred >= LAYER as u64);
}

#[tokio::test]
async fn test_runs_without_a_checkpoint_store() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let replicator = replicator(&source, destination.clone(), None);
    let request = request();

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.completed, 6);

    // Nothing remembers the first run, but every tag is already current
    destination.reset_calls();
    let rerun = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.outcome, ReplicationOutcome::Completed);
    assert_eq!(rerun.skipped, 6);
    assert_eq!(destination.transfer_calls(), 0);
}

#[tokio::test]
async fn test_index_replicates_children_first() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    let amd64 = source.push_image("multi", "amd64", &[b"amd64 layer".to_vec()]);
    let arm64 = source.push_image("multi", "arm64", &[b"arm64 layer".to_vec()]);
    source.remove_tag("multi", "amd64");
    source.remove_tag("multi", "arm64");
    let index = Manifest::index(&[&amd64, &arm64]).unwrap();
    source.insert_manifest("multi", Some("latest"), &index);

    let report = replicator(&source, destination.clone(), None)
        .run(&request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.completed, 1);
    assert_eq!(destination.tags("multi"), vec!["latest"]);
    assert_eq!(destination.tag_digest("multi", "latest"), Some(index.digest));
    for child in [&amd64, &arm64] {
        let copied = destination
            .get_manifest("multi", &child.digest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copied.bytes, child.bytes);
    }
    assert!(destination.has_blob("multi", &BlobDescriptor::of(b"arm64 layer").digest));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let replicator = replicator(&source, destination.clone(), Some(store.clone()));
    let request = ReplicationRequest {
        dry_run: true,
        include_tags: vec!["v1".to_string()],
        ..request()
    };

    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::DryRun);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.planned.len(), 3);
    assert!(report.planned.iter().any(|line| line.starts_with("team/api:v1")));
    assert_eq!(destination.transfer_calls(), 0);
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_run_discards_checkpoint() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let dir = TempDir::new().unwrap();
    let replicator = replicator(&source, destination.clone(), Some(file_store(&dir)));
    let mut request = request();

    replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    let moved = source.push_image("team/web", "latest", &[b"moved".to_vec()]);

    request.fresh = true;
    let report = replicator
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, ReplicationOutcome::Completed);
    assert_eq!(report.already_settled, 0);
    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 5);
    assert_eq!(destination.tag_digest("team/web", "latest"), Some(moved.digest));
}

#[tokio::test]
async fn test_setup_failures_abort_before_any_unit() {
    let source = Arc::new(InMemoryRegistry::new("source"));
    let destination = Arc::new(InMemoryRegistry::new("destination"));
    seed_tree(&source);
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let replicator = replicator(&source, destination.clone(), Some(store.clone()));

    let bad_pattern = ReplicationRequest {
        include_tags: vec!["v[9-0]".to_string()],
        ..request()
    };
    let error = replicator
        .run(&bad_pattern, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ReplicationError::Configuration(_)));

    source.fail_next(Operation::ListRepositories, 10);
    let error = replicator
        .run(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ReplicationError::TransientNetwork(_)));

    assert_eq!(destination.transfer_calls(), 0);
    assert!(store.list().await.unwrap().is_empty());
}
