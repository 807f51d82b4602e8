use futures_util::Stream;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::{kill_tree, AcquisitionBackend, LineSignal, OutputSummary, TrackDescriptor};
use crate::broadcaster::{spawn_file_feed, Broadcaster};
use crate::catalog::{Catalog, TrackRecord};
use crate::config::{EmptySubscriberPolicy, EngineConfig};
use crate::error::{EngineError, FailureClass};
use crate::job::{Feed, FeedReceiver, Job, JobKey, JobSnapshot, JobState, Joined};
use crate::promoter::{remove_scratch, CachePromoter, FinishedFile};
use crate::quality::{audio_extension, fallback_chain, QualityTier};
use crate::registry::JobRegistry;
use crate::unavailability::{ResetScope, UnavailabilityTracker};
use crate::watcher::{
    file_extension, file_hint, resolve_current, DetectedFile, ScratchWatcher, WatchStatus,
};

/// The download-and-broadcast cache.
///
/// Cheap to clone; clones share jobs, catalog and backend.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    catalog: Arc<dyn Catalog>,
    backend: Arc<dyn AcquisitionBackend>,
    registry: Arc<JobRegistry>,
    unavailability: UnavailabilityTracker,
    promoter: CachePromoter,
    broadcaster: Broadcaster,
}

/// Coarse state reported by [`Engine::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    /// Nothing cached and nothing running.
    Idle,
    Searching,
    Downloading,
    Ready,
    Failed,
}

impl From<JobState> for StatusState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Searching => StatusState::Searching,
            JobState::Downloading => StatusState::Downloading,
            JobState::Ready => StatusState::Ready,
            JobState::Failed => StatusState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    pub track_id: String,
    pub requested: QualityTier,
    pub state: StatusState,
    pub progress: Option<f32>,
    pub achieved: Option<QualityTier>,
    pub error: Option<String>,
    pub error_class: Option<FailureClass>,
    pub subscribers: usize,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn Catalog>,
        backend: Arc<dyn AcquisitionBackend>,
    ) -> Self {
        let suffixes = config.backend.in_progress_suffixes.clone();
        let placeholder_dir = config
            .unavailable_placeholders
            .then(|| config.storage_dir.clone());
        let inner = EngineInner {
            registry: Arc::new(JobRegistry::new(
                config.scratch_root.clone(),
                config.registry_grace(),
            )),
            unavailability: UnavailabilityTracker::new(catalog.clone(), placeholder_dir),
            promoter: CachePromoter::new(
                config.storage_dir.clone(),
                suffixes.clone(),
                catalog.clone(),
                config.scratch_cleanup_delay(),
            ),
            broadcaster: Broadcaster::new(suffixes, config.catchup_chunk_bytes),
            config,
            catalog,
            backend,
        };
        tracing::info!(
            "[engine] Ready with backend {} (empty subscriber policy: {:?})",
            inner.backend.name(),
            inner.config.empty_subscriber_policy
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Serves `track_id` at `tier` from cache, or joins or starts its download.
    pub async fn request_stream(
        &self,
        track_id: &str,
        tier: QualityTier,
    ) -> Result<StreamHandle, EngineError> {
        let inner = &self.inner;
        let record = inner.track(track_id).await?;

        if let Some(hit) = record.cached(tier) {
            tracing::debug!(
                "[engine] Cache hit for {} at {} (holds {})",
                track_id,
                tier,
                hit.achieved
            );
            return Ok(self.serve_file(track_id, tier, hit.achieved, hit.path.to_path_buf()));
        }

        if inner.unavailability.is_unavailable(track_id, tier).await? {
            return match cached_fallback(&record, tier) {
                Some((served, path)) => {
                    tracing::info!(
                        "[engine] {} unavailable at {}, serving cached {}",
                        track_id,
                        tier,
                        served
                    );
                    Ok(self.serve_file(track_id, tier, served, path))
                }
                None => {
                    tracing::info!("[engine] {} unavailable at {}, nothing to fall back to", track_id, tier);
                    Err(EngineError::QualityUnavailable {
                        track_id: track_id.to_string(),
                        tier,
                        exhausted: true,
                    })
                }
            };
        }

        let key = JobKey::new(track_id, tier);
        let (job, is_new) = inner.registry.acquire_or_join(&key).await;
        // Subscribe before the driver starts so the first caller can't be abandoned.
        let joined = job.subscribe();
        if is_new {
            let descriptor = TrackDescriptor::from_record(&record);
            tokio::spawn(run_job(Arc::clone(inner), job.clone(), descriptor));
        }

        let handle = match joined {
            Joined::Queued(rx) | Joined::Failed(rx) => {
                let mut handle = self.handle(track_id, tier, tier, rx);
                handle.job = Some(job);
                handle
            }
            Joined::FromFile(tx, rx, path) => {
                let served = job.snapshot().achieved.unwrap_or(tier);
                let mut handle = self.handle(track_id, tier, served, rx);
                handle.extension = self.extension_of(&path);
                spawn_file_feed(path, None, tx, inner.config.catchup_chunk_bytes);
                handle
            }
        };
        Ok(handle)
    }

    fn serve_file(
        &self,
        track_id: &str,
        requested: QualityTier,
        served: QualityTier,
        path: PathBuf,
    ) -> StreamHandle {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handle = self.handle(track_id, requested, served, rx);
        handle.extension = self.extension_of(&path);
        spawn_file_feed(path, None, tx, self.inner.config.catchup_chunk_bytes);
        handle
    }

    fn extension_of(&self, path: &Path) -> Option<String> {
        file_extension(path, &self.inner.config.backend.in_progress_suffixes)
    }

    fn handle(
        &self,
        track_id: &str,
        requested: QualityTier,
        served: QualityTier,
        rx: FeedReceiver,
    ) -> StreamHandle {
        StreamHandle {
            track_id: track_id.to_string(),
            requested,
            served,
            extension: None,
            job: None,
            rx,
            first: None,
            ready: false,
            done: false,
            join_timeout: self.inner.config.join_timeout(),
        }
    }

    pub async fn get_status(
        &self,
        track_id: &str,
        tier: QualityTier,
    ) -> Result<TrackStatus, EngineError> {
        let inner = &self.inner;
        if let Some(job) = inner.registry.get(&JobKey::new(track_id, tier)) {
            let snapshot = job.snapshot();
            return Ok(TrackStatus {
                track_id: snapshot.track_id,
                requested: snapshot.tier,
                state: snapshot.state.into(),
                progress: snapshot.progress,
                achieved: snapshot.achieved,
                error_class: snapshot.error.as_ref().map(EngineError::class),
                error: snapshot.error.map(|e| e.to_string()),
                subscribers: snapshot.subscribers,
            });
        }

        let record = inner.track(track_id).await?;
        let mut status = TrackStatus {
            track_id: track_id.to_string(),
            requested: tier,
            state: StatusState::Idle,
            progress: None,
            achieved: None,
            error: None,
            error_class: None,
            subscribers: 0,
        };
        if let Some(hit) = record.cached(tier) {
            status.state = StatusState::Ready;
            status.progress = Some(100.0);
            status.achieved = Some(hit.achieved);
        } else if record.is_unavailable(tier) {
            let err = EngineError::QualityUnavailable {
                track_id: track_id.to_string(),
                tier,
                exhausted: cached_fallback(&record, tier).is_none(),
            };
            status.state = StatusState::Failed;
            status.error_class = Some(err.class());
            status.error = Some(err.to_string());
        }
        Ok(status)
    }

    pub async fn reset_unavailability(
        &self,
        track_id: &str,
        scope: ResetScope,
    ) -> Result<(), EngineError> {
        self.inner.track(track_id).await?;
        self.inner.unavailability.reset(track_id, scope).await
    }

    /// Cancels every live job and forgets all registry state.
    pub fn clear_cache(&self) -> usize {
        self.inner.registry.clear().len()
    }

    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.inner.registry.snapshots()
    }
}

/// First already-cached tier after `requested` in its fallback chain.
fn cached_fallback(record: &TrackRecord, requested: QualityTier) -> Option<(QualityTier, PathBuf)> {
    fallback_chain(requested)
        .into_iter()
        .skip(1)
        .find_map(|tier| record.cached(tier).map(|hit| (hit.achieved, hit.path.to_path_buf())))
}

enum Outcome {
    Finished {
        file: DetectedFile,
        summary: OutputSummary,
    },
    Failed(EngineError),
    Aborted(String),
}

async fn run_job(engine: Arc<EngineInner>, job: Arc<Job>, track: TrackDescriptor) {
    match engine.drive(&job, &track).await {
        Outcome::Finished { file, summary } => {
            engine.finish_success(&job, &track, file, summary).await
        }
        Outcome::Failed(err) => engine.finish_failure(&job, err).await,
        Outcome::Aborted(reason) => engine.finish_abort(&job, reason).await,
    }
    engine.registry.schedule_removal(job);
}

impl EngineInner {
    async fn track(&self, track_id: &str) -> Result<TrackRecord, EngineError> {
        self.catalog
            .get_track(track_id)
            .await?
            .ok_or_else(|| EngineError::NotFoundInCatalog(track_id.to_string()))
    }

    /// Runs the backend while watching and tailing its output, until it exits.
    async fn drive(&self, job: &Arc<Job>, track: &TrackDescriptor) -> Outcome {
        let key = job.key().clone();
        let scratch = job.scratch_dir().to_path_buf();
        let config = &self.config;

        if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
            return Outcome::Failed(EngineError::scratch_io(e));
        }
        let process = match self.backend.launch(track, key.tier, &scratch) {
            Ok(process) => process,
            Err(err) => return Outcome::Failed(err),
        };
        tracing::info!(
            "[engine] {} started {} (pid {:?})",
            key,
            self.backend.name(),
            process.id()
        );
        let (mut child, mut lines) = process.into_parts();

        let mut watcher = ScratchWatcher::new(
            scratch.clone(),
            config.backend.in_progress_suffixes.clone(),
            config.ready_threshold_bytes,
            config.watch_max_attempts,
            config.watch_retries,
        );
        let mut watch_tick = tokio::time::interval(config.watch_interval());
        watch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tail_tick = tokio::time::interval(config.tail_interval());
        tail_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cancel = job.cancel_token();
        let mut summary = OutputSummary::default();
        let mut watching = true;
        let mut lines_open = true;

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    kill_tree(&mut child).await;
                    return Outcome::Aborted("job cancelled".to_string());
                }
                status = child.wait() => break status,
                line = lines.recv(), if lines_open => match line {
                    Some(line) => observe_line(job, &mut summary, &line),
                    None => lines_open = false,
                },
                _ = watch_tick.tick(), if watching => match watcher.poll().await {
                    Ok(WatchStatus::Ready(file)) => {
                        let extension = file_extension(&file.path, &config.backend.in_progress_suffixes);
                        job.mark_streaming(file.path, extension);
                        watching = false;
                    }
                    Ok(WatchStatus::GaveUp) => watching = false,
                    Ok(WatchStatus::Waiting) => {}
                    Err(e) => tracing::warn!("[watcher] {} scan failed: {}", key, e),
                },
                _ = tail_tick.tick() => {
                    if let Err(e) = self.broadcaster.tick(job).await {
                        tracing::warn!("[broadcast] {} tick failed: {}", key, e);
                    }
                    if config.empty_subscriber_policy == EmptySubscriberPolicy::Abort
                        && job.is_abandoned()
                    {
                        kill_tree(&mut child).await;
                        return Outcome::Aborted("no subscribers left".to_string());
                    }
                }
            }
        };

        if lines_open {
            let _ = tokio::time::timeout(config.output_drain_timeout(), async {
                while let Some(line) = lines.recv().await {
                    observe_line(job, &mut summary, &line);
                }
            })
            .await;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Outcome::Failed(EngineError::BackendTransient(format!(
                    "waiting for backend failed: {}",
                    e
                )))
            }
        };
        let detected = self.locate_output(job, &watcher).await;
        tracing::info!(
            "[engine] {} backend exited ({}), output: {:?}",
            key,
            status,
            detected.as_ref().map(|f| &f.path)
        );

        match detected {
            Some(file) if status.success() && !summary.not_found => {
                Outcome::Finished { file, summary }
            }
            detected => Outcome::Failed(classify_failure(&key, status, detected.is_some(), &summary)),
        }
    }

    /// The finished output file, following any final rename.
    async fn locate_output(&self, job: &Job, watcher: &ScratchWatcher) -> Option<DetectedFile> {
        let suffixes = &self.config.backend.in_progress_suffixes;
        let known = job.lock().file_path.clone();
        match known {
            Some(known) => resolve_current(job.scratch_dir(), &known, suffixes)
                .await
                .ok()
                .flatten()
                .map(|(path, size)| {
                    let hint = file_hint(&path, suffixes);
                    DetectedFile { path, size, hint }
                }),
            None => watcher.final_scan().await.ok().flatten(),
        }
    }

    async fn finish_success(
        &self,
        job: &Arc<Job>,
        track: &TrackDescriptor,
        file: DetectedFile,
        summary: OutputSummary,
    ) {
        let key = job.key().clone();
        let suffixes = &self.config.backend.in_progress_suffixes;
        job.mark_streaming(file.path.clone(), file_extension(&file.path, suffixes));

        // Classified before the streams end so every subscriber learns the tier.
        let finished = FinishedFile {
            path: &file.path,
            hint: file.hint,
            reported: summary.reported,
            duration_secs: track.duration_secs,
        };
        let achieved = match self.promoter.classify(&finished).await {
            Ok(tier) => tier,
            Err(err) => {
                tracing::error!("[promote] {} could not classify output: {}", key, err);
                job.fail(err);
                self.promoter
                    .schedule_scratch_cleanup(job.scratch_dir().to_path_buf());
                return;
            }
        };
        job.announce_achieved(achieved);
        {
            let mut inner = job.lock();
            inner.complete = true;
            inner.progress = Some(100.0);
        }

        if let Err(e) = self
            .broadcaster
            .drain(job, self.config.tail_interval())
            .await
        {
            tracing::warn!("[broadcast] {} ended streams early: {}", key, e);
        }

        let final_file = job.lock().file_path.clone().unwrap_or(file.path);
        match self.promoter.promote(&key, &final_file, achieved).await {
            Ok(promotion) => {
                job.lock().final_path = Some(promotion.path);
                job.set_state(JobState::Ready);
            }
            Err(err) => {
                tracing::error!("[promote] {} promotion failed: {}", key, err);
                job.fail(err);
            }
        }
        self.promoter
            .schedule_scratch_cleanup(job.scratch_dir().to_path_buf());
    }

    async fn finish_failure(&self, job: &Arc<Job>, err: EngineError) {
        let key = job.key().clone();
        tracing::warn!("[engine] {} failed: {}", key, err);

        if matches!(err, EngineError::QualityUnavailable { .. }) {
            if let Err(e) = self
                .unavailability
                .mark_unavailable(&key.track_id, key.tier)
                .await
            {
                tracing::warn!("[negative] Could not record {} as unavailable: {}", key, e);
            }
        }

        let fallback = match self.catalog.get_track(&key.track_id).await {
            Ok(Some(record)) => cached_fallback(&record, key.tier),
            _ => None,
        };
        let err = match err {
            EngineError::QualityUnavailable { track_id, tier, .. } => {
                EngineError::QualityUnavailable {
                    track_id,
                    tier,
                    exhausted: fallback.is_none(),
                }
            }
            other => other,
        };

        let subscribers = job.take_for_failure(err.clone());
        for subscriber in subscribers {
            match &fallback {
                // Only a subscriber that has seen no bytes can switch files.
                Some((tier, path)) if subscriber.cursor() == 0 => {
                    tracing::info!(
                        "[engine] {} subscriber {} falls back to cached {}",
                        key,
                        subscriber.id,
                        tier
                    );
                    spawn_file_feed(
                        path.clone(),
                        Some(*tier),
                        subscriber.into_sink(),
                        self.config.catchup_chunk_bytes,
                    );
                }
                _ => subscriber.send_error(err.clone()),
            }
        }
        remove_scratch(job.scratch_dir()).await;
    }

    async fn finish_abort(&self, job: &Arc<Job>, reason: String) {
        tracing::warn!("[engine] {} aborted: {}", job.key(), reason);
        job.fail(EngineError::Aborted(reason));
        remove_scratch(job.scratch_dir()).await;
    }
}

fn observe_line(job: &Job, summary: &mut OutputSummary, line: &str) {
    tracing::debug!("[backend] {}: {}", job.key(), line);
    match summary.observe(line) {
        LineSignal::Progress(pct) => job.set_progress(pct),
        LineSignal::NotFound => tracing::info!("[backend] {} reports not found: {}", job.key(), line),
        LineSignal::Transient => tracing::warn!("[backend] {} transient error: {}", job.key(), line),
        LineSignal::ReportedQuality(tier) => {
            tracing::debug!("[backend] {} reports quality {}", job.key(), tier)
        }
        LineSignal::Error | LineSignal::Other => {}
    }
}

fn classify_failure(
    key: &JobKey,
    status: ExitStatus,
    has_output: bool,
    summary: &OutputSummary,
) -> EngineError {
    if summary.confirmed_not_found() {
        return EngineError::QualityUnavailable {
            track_id: key.track_id.clone(),
            tier: key.tier,
            exhausted: false,
        };
    }
    let detail = match &summary.last_error {
        Some(line) => line.clone(),
        None if status.success() && !has_output => "backend produced no output file".to_string(),
        None => format!("backend exited with {}", status),
    };
    EngineError::BackendTransient(detail)
}

/// A subscriber's view of one requested stream.
pub struct StreamHandle {
    track_id: String,
    requested: QualityTier,
    served: QualityTier,
    extension: Option<String>,
    /// Set while bytes come from a live job rather than a file.
    job: Option<Arc<Job>>,
    rx: FeedReceiver,
    first: Option<Vec<u8>>,
    ready: bool,
    done: bool,
    join_timeout: Duration,
}

impl StreamHandle {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn requested_tier(&self) -> QualityTier {
        self.requested
    }

    /// Tier of the bytes being delivered. Settled once `wait_ready` returns.
    pub fn served_tier(&self) -> QualityTier {
        self.served
    }

    pub fn is_fallback(&self) -> bool {
        self.served != self.requested
    }

    /// Audio extension of the file behind the stream, once one is known.
    pub fn extension(&self) -> Option<String> {
        self.extension.clone().or_else(|| {
            self.job
                .as_ref()
                .and_then(|job| job.lock().extension.clone())
        })
    }

    fn apply_notice(&mut self, feed: Feed) -> Option<Feed> {
        match feed {
            Feed::Switch { tier, path } => {
                self.served = tier;
                self.extension = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| audio_extension(n, &[]));
                None
            }
            Feed::Achieved(tier) => {
                self.served = tier;
                None
            }
            other => Some(other),
        }
    }

    /// Waits, at most the join timeout, until bytes are available.
    pub async fn wait_ready(&mut self) -> Result<QualityTier, EngineError> {
        if self.ready {
            return Ok(self.served);
        }
        let deadline = Instant::now() + self.join_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => {
                    self.ready = true;
                    self.done = true;
                    return Err(EngineError::DownloadJoinTimeout {
                        track_id: self.track_id.clone(),
                        tier: self.requested,
                        waited_secs: self.join_timeout.as_secs(),
                    });
                }
                Ok(Some(feed)) => match self.apply_notice(feed) {
                    Some(Feed::Bytes(bytes)) => {
                        self.first = Some(bytes);
                        self.ready = true;
                        return Ok(self.served);
                    }
                    Some(Feed::Error(err)) => {
                        self.ready = true;
                        self.done = true;
                        return Err(err);
                    }
                    _ => {}
                },
                Ok(None) => {
                    self.ready = true;
                    self.done = true;
                    return Ok(self.served);
                }
            }
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, EngineError>> {
        if !self.ready {
            if let Err(err) = self.wait_ready().await {
                return Some(Err(err));
            }
        }
        if let Some(bytes) = self.first.take() {
            return Some(Ok(bytes));
        }
        if self.done {
            return None;
        }
        loop {
            let Some(feed) = self.rx.recv().await else {
                self.done = true;
                return None;
            };
            match self.apply_notice(feed) {
                Some(Feed::Bytes(bytes)) => return Some(Ok(bytes)),
                Some(Feed::Error(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                _ => {}
            }
        }
    }

    /// Collects the whole stream.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend(chunk?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, EngineError>> + Send {
        futures_util::stream::unfold(self, |mut handle| async move {
            handle.next_chunk().await.map(|chunk| (chunk, handle))
        })
    }
}
