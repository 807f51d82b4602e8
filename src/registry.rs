use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::job::{Job, JobKey, JobSnapshot, JobState};
use crate::promoter::sanitize_component;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Live jobs, at most one per (track, tier).
///
/// Owned by an engine instance; two engines never share jobs.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobKey, Arc<Job>>>,
    locks: Mutex<HashMap<JobKey, KeyLock>>,
    scratch_root: PathBuf,
    grace: Duration,
    sequence: AtomicU64,
}

impl JobRegistry {
    pub fn new(scratch_root: PathBuf, grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            scratch_root,
            grace,
            sequence: AtomicU64::new(0),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobKey, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_lock(&self, key: &JobKey) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Returns the live job for `key`, creating one if there is none.
    ///
    /// `true` means the caller created the job and must start its driver.
    /// Concurrent callers for a new key serialize on the key's lock, so only
    /// the first creates.
    pub async fn acquire_or_join(&self, key: &JobKey) -> (Arc<Job>, bool) {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if let Some(job) = self.get(key) {
            if job.state() != JobState::Failed {
                tracing::debug!("[registry] Joining existing job {}", key);
                return (job, false);
            }
            tracing::debug!("[registry] Replacing failed job {}", key);
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let scratch_dir = self.scratch_root.join(format!(
            "{}_{}_{}_{}",
            sanitize_component(&key.track_id),
            key.tier.as_str(),
            chrono::Utc::now().timestamp_millis(),
            seq
        ));
        let job = Arc::new(Job::new(key.clone(), scratch_dir));
        self.jobs().insert(key.clone(), job.clone());
        tracing::info!("[registry] Created job {}", key);
        (job, true)
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<Job>> {
        self.jobs().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = jobs.iter().map(|job| job.snapshot()).collect();
        snapshots.sort_by(|a, b| (&a.track_id, a.tier).cmp(&(&b.track_id, b.tier)));
        snapshots
    }

    /// Removes `job` if it is still the one registered under its key.
    pub fn remove(&self, job: &Arc<Job>) -> bool {
        let key = job.key();
        let removed = {
            let mut jobs = self.jobs();
            match jobs.get(key) {
                Some(current) if Arc::ptr_eq(current, job) => {
                    jobs.remove(key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Keep the lock while someone is waiting on it.
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
            tracing::debug!("[registry] Removed job {}", key);
        }
        removed
    }

    /// Drops a terminal job once it has no subscribers and the grace delay has passed.
    pub fn schedule_removal(self: &Arc<Self>, job: Arc<Job>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut states = job.watch_state();
            // The job owns the sender, so this only errs if the job is gone.
            let _ = states.wait_for(|state| state.is_terminal()).await;
            loop {
                tokio::time::sleep(registry.grace).await;
                if job.subscriber_count() == 0 {
                    break;
                }
            }
            registry.remove(&job);
        });
    }

    /// Cancels and forgets every job.
    pub fn clear(&self) -> Vec<Arc<Job>> {
        let jobs: Vec<Arc<Job>> = self.jobs().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.cancel();
        }
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::info!("[registry] Cleared {} job(s)", jobs.len());
        jobs
    }
}
