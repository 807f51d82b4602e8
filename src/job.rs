use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::quality::QualityTier;

/// One acquisition per (track, tier).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobKey {
    pub track_id: String,
    pub tier: QualityTier,
}

impl JobKey {
    pub fn new(track_id: impl Into<String>, tier: QualityTier) -> Self {
        Self {
            track_id: track_id.into(),
            tier,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.track_id, self.tier)
    }
}

/// Searching -> Downloading -> Ready, or Failed from either of the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Backend running, nothing streamable yet.
    Searching,
    /// A file crossed the readiness threshold and is being tailed.
    Downloading,
    Ready,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Ready | JobState::Failed)
    }
}

/// What a subscriber's sink carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    Bytes(Vec<u8>),
    /// The bytes that follow come from a cached file of another tier.
    Switch { tier: QualityTier, path: PathBuf },
    /// The download finished and holds `tier`, which may differ from the request.
    Achieved(QualityTier),
    Error(EngineError),
}

pub type FeedSender = mpsc::UnboundedSender<Feed>;
pub type FeedReceiver = mpsc::UnboundedReceiver<Feed>;

/// A sink plus the byte offset already delivered through it.
#[derive(Debug)]
pub struct Subscriber {
    pub id: u64,
    sink: FeedSender,
    cursor: u64,
}

impl Subscriber {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    /// Delivers `bytes`, advancing the cursor. False once the receiver is gone.
    pub fn send_bytes(&mut self, bytes: Vec<u8>) -> bool {
        let len = bytes.len() as u64;
        if self.sink.send(Feed::Bytes(bytes)).is_err() {
            return false;
        }
        self.cursor += len;
        true
    }

    pub fn send_error(self, err: EngineError) {
        let _ = self.sink.send(Feed::Error(err));
    }

    pub fn into_sink(self) -> FeedSender {
        self.sink
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub track_id: String,
    pub tier: QualityTier,
    pub state: JobState,
    pub progress: Option<f32>,
    pub achieved: Option<QualityTier>,
    pub file_path: Option<PathBuf>,
    pub bytes_streamed: u64,
    pub subscribers: usize,
    #[serde(serialize_with = "error_message")]
    pub error: Option<EngineError>,
}

fn error_message<S>(err: &Option<EngineError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match err {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct JobInner {
    pub progress: Option<f32>,
    pub file_path: Option<PathBuf>,
    /// Audio extension of `file_path`, without any in-progress suffix.
    pub extension: Option<String>,
    pub achieved: Option<QualityTier>,
    pub complete: bool,
    pub last_error: Option<EngineError>,
    /// Joined but not yet caught up.
    pub pending: Vec<Subscriber>,
    /// Receiving live deltas.
    pub live: Vec<Subscriber>,
    /// Bytes of the scratch file already fanned out.
    pub cursor: u64,
    /// Streams have been ended; late joiners are served from disk.
    pub drained: bool,
    /// Permanent copy, once promoted.
    pub final_path: Option<PathBuf>,
    pub ever_subscribed: bool,
    next_subscriber_id: u64,
}

/// A single in-flight acquisition and its subscribers.
#[derive(Debug)]
pub struct Job {
    key: JobKey,
    scratch_dir: PathBuf,
    inner: Mutex<JobInner>,
    state: watch::Sender<JobState>,
    cancel: CancellationToken,
}

/// How a new subscriber gets its bytes.
#[derive(Debug)]
pub enum Joined {
    /// Queued for catch-up by the job's driver.
    Queued(FeedReceiver),
    /// The job already finished streaming; read this file instead.
    FromFile(FeedSender, FeedReceiver, PathBuf),
    /// The job failed; the receiver holds the error.
    Failed(FeedReceiver),
}

impl Job {
    pub fn new(key: JobKey, scratch_dir: PathBuf) -> Self {
        let (state, _) = watch::channel(JobState::Searching);
        Self {
            key,
            scratch_dir,
            inner: Mutex::new(JobInner::default()),
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Follows state changes, starting from the current one.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("[job] {} {:?} -> {:?}", self.key, previous, state);
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a subscriber. The job's driver owns all byte delivery to queued ones.
    pub fn subscribe(&self) -> Joined {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.ever_subscribed = true;

        if self.state() == JobState::Failed {
            let err = inner
                .last_error
                .clone()
                .unwrap_or_else(|| EngineError::BackendTransient("job failed".to_string()));
            let _ = tx.send(Feed::Error(err));
            return Joined::Failed(rx);
        }

        if inner.drained {
            let path = inner.final_path.clone().or_else(|| inner.file_path.clone());
            if let Some(path) = path {
                return Joined::FromFile(tx, rx, path);
            }
        }

        if let Some(tier) = inner.achieved {
            let _ = tx.send(Feed::Achieved(tier));
        }
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.pending.push(Subscriber {
            id,
            sink: tx,
            cursor: 0,
        });
        tracing::debug!("[job] {} subscriber {} joined", self.key, id);
        Joined::Queued(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.pending.len() + inner.live.len()
    }

    /// Drops subscribers whose receiver went away.
    pub(crate) fn prune_closed(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.pending.len() + inner.live.len();
        inner.pending.retain(|s| !s.is_closed());
        inner.live.retain(|s| !s.is_closed());
        let removed = before - (inner.pending.len() + inner.live.len());
        if removed > 0 {
            tracing::debug!("[job] {} dropped {} disconnected subscriber(s)", self.key, removed);
        }
        removed
    }

    /// Had subscribers once and has none left.
    pub(crate) fn is_abandoned(&self) -> bool {
        let inner = self.lock();
        inner.ever_subscribed && inner.pending.is_empty() && inner.live.is_empty()
    }

    pub(crate) fn set_progress(&self, pct: f32) {
        self.lock().progress = Some(pct);
    }

    pub(crate) fn mark_streaming(&self, path: PathBuf, extension: Option<String>) {
        {
            let mut inner = self.lock();
            inner.file_path = Some(path);
            inner.extension = extension;
        }
        self.set_state(JobState::Downloading);
    }

    /// Records the classified tier and tells every current subscriber.
    pub(crate) fn announce_achieved(&self, tier: QualityTier) {
        let mut inner = self.lock();
        inner.achieved = Some(tier);
        for subscriber in inner.pending.iter().chain(inner.live.iter()) {
            let _ = subscriber.sink.send(Feed::Achieved(tier));
        }
        if tier != self.key.tier {
            tracing::info!("[job] {} achieved {} instead", self.key, tier);
        }
    }

    /// Moves to Failed and hands back every subscriber for the caller to settle.
    pub(crate) fn take_for_failure(&self, err: EngineError) -> Vec<Subscriber> {
        let mut inner = self.lock();
        inner.last_error = Some(err);
        let mut all = std::mem::take(&mut inner.pending);
        all.append(&mut inner.live);
        // Under the lock, so no subscriber can slip in between.
        self.set_state(JobState::Failed);
        all
    }

    /// Ends every subscriber with `err` and moves to Failed.
    pub(crate) fn fail(&self, err: EngineError) {
        for subscriber in self.take_for_failure(err.clone()) {
            subscriber.send_error(err.clone());
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        JobSnapshot {
            track_id: self.key.track_id.clone(),
            tier: self.key.tier,
            state: self.state(),
            progress: inner.progress,
            achieved: inner.achieved,
            file_path: inner.final_path.clone().or_else(|| inner.file_path.clone()),
            bytes_streamed: inner.cursor,
            subscribers: inner.pending.len() + inner.live.len(),
            error: inner.last_error.clone(),
        }
    }
}
