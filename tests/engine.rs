use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tiercache::{
    AcquisitionBackend, BackendConfig, BackendProcess, Catalog, CommandBackend,
    EmptySubscriberPolicy, Engine, EngineConfig, EngineError, JsonCatalog, QualityTier,
    ResetScope, SlotUpdate, StatusState, TrackDescriptor, TrackRecord,
};

/// Shell backend that counts how often it was launched.
struct ScriptBackend {
    inner: CommandBackend,
    launches: Arc<AtomicUsize>,
}

impl ScriptBackend {
    fn new(script: &str) -> (Self, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        let inner = CommandBackend::new(BackendConfig {
            name: "script".to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            in_progress_suffixes: vec![".part".to_string()],
        });
        (
            Self {
                inner,
                launches: launches.clone(),
            },
            launches,
        )
    }
}

impl AcquisitionBackend for ScriptBackend {
    fn name(&self) -> &str {
        "script"
    }

    fn launch(
        &self,
        track: &TrackDescriptor,
        tier: QualityTier,
        scratch_dir: &Path,
    ) -> Result<BackendProcess, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(track, tier, scratch_dir)
    }
}

fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::rooted_at(dir);
    config.ready_threshold_bytes = 4;
    config.watch_interval_ms = 20;
    config.tail_interval_ms = 20;
    config.join_timeout_secs = 10;
    config.scratch_cleanup_delay_secs = 0;
    config.registry_grace_secs = 1;
    config.output_drain_timeout_ms = 500;
    config.backend.in_progress_suffixes = vec![".part".to_string()];
    config
}

async fn setup(script: &str, config: EngineConfig) -> (Engine, Arc<JsonCatalog>, Arc<AtomicUsize>) {
    setup_track(TrackRecord::new("t1", "Song").with_artist("Band"), script, config).await
}

async fn setup_track(
    record: TrackRecord,
    script: &str,
    config: EngineConfig,
) -> (Engine, Arc<JsonCatalog>, Arc<AtomicUsize>) {
    let catalog = Arc::new(JsonCatalog::in_memory());
    catalog.upsert_track(record).await.unwrap();
    let (backend, launches) = ScriptBackend::new(script);
    let engine = Engine::new(config, catalog.clone(), Arc::new(backend));
    (engine, catalog, launches)
}

async fn wait_for_state(engine: &Engine, tier: QualityTier, want: StatusState) {
    for _ in 0..200 {
        let status = engine.get_status("t1", tier).await.unwrap();
        if status.state == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("t1@{} never reached {:?}", tier, want);
}

async fn wait_for_no_jobs(engine: &Engine) {
    for _ in 0..200 {
        if engine.active_jobs().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("jobs never left the registry");
}

const THREE_PIECES: &str = "printf 'AAAAAAAA' > song.mp3.part; sleep 0.3; \
     printf 'BBBBBBBB' >> song.mp3.part; sleep 0.3; \
     printf 'CCCCCCCC' >> song.mp3.part; mv song.mp3.part song.mp3; \
     echo 'quality: 320'";

const EXPECTED: &[u8] = b"AAAAAAAABBBBBBBBCCCCCCCC";

#[tokio::test]
async fn concurrent_requests_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, catalog, launches) = setup(THREE_PIECES, test_config(dir.path())).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let handle = engine.request_stream("t1", QualityTier::Kbps320).await?;
            handle.read_to_end().await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), EXPECTED);
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    wait_for_state(&engine, QualityTier::Kbps320, StatusState::Ready).await;
    let record = catalog.get_track("t1").await.unwrap().unwrap();
    let cached = record.cached_file(QualityTier::Kbps320).unwrap();
    // Promoted across the .part rename, byte for byte.
    assert_eq!(std::fs::read(cached).unwrap(), EXPECTED);
    assert!(cached.starts_with(dir.path().join("library")));
}

#[tokio::test]
async fn late_joiner_catches_up_from_byte_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _catalog, launches) = setup(THREE_PIECES, test_config(dir.path())).await;

    let mut first = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(first.wait_ready().await.unwrap(), QualityTier::Kbps320);
    tokio::time::sleep(Duration::from_millis(350)).await;

    let status = engine.get_status("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(status.state, StatusState::Downloading);

    let second = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    let (a, b) = tokio::join!(first.read_to_end(), second.read_to_end());
    assert_eq!(a.unwrap(), EXPECTED);
    assert_eq!(b.unwrap(), EXPECTED);

    wait_for_state(&engine, QualityTier::Kbps320, StatusState::Ready).await;
    // Later requests come straight from the cache.
    let third = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(third.read_to_end().await.unwrap(), EXPECTED);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn confirmed_miss_is_remembered_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'ERROR: no results found'; exit 1";
    let (engine, catalog, launches) = setup(script, test_config(dir.path())).await;

    let mut handle = engine.request_stream("t1", QualityTier::Lossless).await.unwrap();
    let err = handle.wait_ready().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::QualityUnavailable { exhausted: true, .. }
    ));
    assert!(catalog
        .get_unavailability("t1", QualityTier::Lossless)
        .await
        .unwrap());

    // Answered from the negative cache without another launch.
    let again = engine.request_stream("t1", QualityTier::Lossless).await;
    assert!(matches!(again, Err(EngineError::QualityUnavailable { .. })));
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    engine
        .reset_unavailability("t1", ResetScope::Tier(QualityTier::Lossless))
        .await
        .unwrap();
    let mut retried = engine.request_stream("t1", QualityTier::Lossless).await.unwrap();
    assert!(retried.wait_ready().await.is_err());
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn miss_falls_back_to_a_cached_lower_tier() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'ERROR: no results found'; exit 1";
    let (engine, catalog, _launches) = setup(script, test_config(dir.path())).await;
    let cached = dir.path().join("older.mp3");
    std::fs::write(&cached, b"two-fifty-six").unwrap();
    catalog
        .update_track("t1", SlotUpdate::exact(cached, QualityTier::Kbps256))
        .await
        .unwrap();

    let mut handle = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(handle.wait_ready().await.unwrap(), QualityTier::Kbps256);
    assert!(handle.is_fallback());
    assert_eq!(handle.read_to_end().await.unwrap(), b"two-fifty-six");

    let status = engine.get_status("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(status.state, StatusState::Failed);
    assert_eq!(status.error_class, Some(tiercache::FailureClass::UnavailableAtQuality));
}

#[tokio::test]
async fn transient_failures_are_not_negative_cached() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'ERROR: connection reset by peer'; exit 1";
    let (engine, catalog, _launches) = setup(script, test_config(dir.path())).await;

    let mut handle = engine.request_stream("t1", QualityTier::Kbps192).await.unwrap();
    let err = handle.wait_ready().await.unwrap_err();
    assert!(matches!(err, EngineError::BackendTransient(_)));
    assert!(err.is_retryable());
    assert!(!catalog
        .get_unavailability("t1", QualityTier::Kbps192)
        .await
        .unwrap());
}

#[tokio::test]
async fn abandoned_download_is_aborted_under_abort_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.empty_subscriber_policy = EmptySubscriberPolicy::Abort;
    let script = "printf 'AAAAAAAA' > song.mp3.part; sleep 5; mv song.mp3.part song.mp3";
    let (engine, catalog, _launches) = setup(script, config).await;

    let mut handle = engine.request_stream("t1", QualityTier::Kbps128).await.unwrap();
    handle.wait_ready().await.unwrap();
    drop(handle);

    wait_for_state(&engine, QualityTier::Kbps128, StatusState::Failed).await;
    let status = engine.get_status("t1", QualityTier::Kbps128).await.unwrap();
    assert_eq!(status.error_class, Some(tiercache::FailureClass::Pending));

    let scratch = dir.path().join("scratch");
    let mut leftovers = usize::MAX;
    for _ in 0..100 {
        leftovers = std::fs::read_dir(&scratch).map(|d| d.count()).unwrap_or(0);
        if leftovers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(leftovers, 0);
    let record = catalog.get_track("t1").await.unwrap().unwrap();
    assert!(record.cached_file(QualityTier::Kbps128).is_none());
    assert!(!record.is_unavailable(QualityTier::Kbps128));
}

#[tokio::test]
async fn size_classified_fallback_is_reported_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let script = "printf 'AAAAAAAABBBBBBBB' > song.mp3.part; sleep 0.3; mv song.mp3.part song.mp3";
    let (engine, catalog, launches) = setup(script, test_config(dir.path())).await;

    let mut handle = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    handle.wait_ready().await.unwrap();
    assert_eq!(handle.extension().as_deref(), Some("mp3"));
    let mut body = Vec::new();
    while let Some(chunk) = handle.next_chunk().await {
        body.extend(chunk.unwrap());
    }
    assert_eq!(body, b"AAAAAAAABBBBBBBB");
    // 16 bytes, no reported quality: the size table says 128.
    assert_eq!(handle.served_tier(), QualityTier::Kbps128);
    assert!(handle.is_fallback());

    wait_for_state(&engine, QualityTier::Kbps320, StatusState::Ready).await;
    let status = engine.get_status("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(status.achieved, Some(QualityTier::Kbps128));
    wait_for_no_jobs(&engine).await;

    // The job is gone; the repeat request must come from the catalog.
    for _ in 0..2 {
        let mut again = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
        assert_eq!(again.wait_ready().await.unwrap(), QualityTier::Kbps128);
        assert!(again.is_fallback());
        assert_eq!(again.read_to_end().await.unwrap(), b"AAAAAAAABBBBBBBB");
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    let status = engine.get_status("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(status.state, StatusState::Ready);
    assert_eq!(status.achieved, Some(QualityTier::Kbps128));
    let record = catalog.get_track("t1").await.unwrap().unwrap();
    assert_eq!(record.standard.requested, Some(QualityTier::Kbps320));
    assert_eq!(record.standard.achieved, Some(QualityTier::Kbps128));
}

#[tokio::test]
async fn known_duration_classifies_by_bitrate() {
    let dir = tempfile::tempdir().unwrap();
    // 80000 bytes over 2 seconds is 320 kbps.
    let script = "head -c 80000 /dev/zero > song.mp3.part; mv song.mp3.part song.mp3";
    let record = TrackRecord::new("t1", "Song")
        .with_artist("Band")
        .with_album("Record")
        .with_duration(2.0);
    let (engine, catalog, launches) = setup_track(record, script, test_config(dir.path())).await;

    let mut handle = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    handle.wait_ready().await.unwrap();
    let mut total = 0;
    while let Some(chunk) = handle.next_chunk().await {
        total += chunk.unwrap().len();
    }
    assert_eq!(total, 80000);
    assert_eq!(handle.served_tier(), QualityTier::Kbps320);
    assert!(!handle.is_fallback());

    wait_for_state(&engine, QualityTier::Kbps320, StatusState::Ready).await;
    wait_for_no_jobs(&engine).await;
    let record = catalog.get_track("t1").await.unwrap().unwrap();
    let hit = record.cached(QualityTier::Kbps320).unwrap();
    assert_eq!(hit.achieved, QualityTier::Kbps320);

    let again = engine.request_stream("t1", QualityTier::Kbps320).await.unwrap();
    assert_eq!(again.read_to_end().await.unwrap().len(), 80000);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}
