use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Catalog, SlotUpdate};
use crate::error::EngineError;
use crate::job::JobKey;
use crate::quality::{audio_extension, classify_achieved, QualityHint, QualityTier};

/// Result of copying a finished download into permanent storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub path: PathBuf,
    pub requested: QualityTier,
    pub achieved: QualityTier,
    pub size: u64,
}

impl Promotion {
    /// The backend delivered a different tier than was asked for.
    pub fn is_fallback(&self) -> bool {
        self.requested != self.achieved
    }
}

/// What the promoter needs to know about a finished scratch file.
#[derive(Debug, Clone)]
pub struct FinishedFile<'a> {
    pub path: &'a Path,
    pub hint: QualityHint,
    pub reported: Option<QualityTier>,
    pub duration_secs: Option<f64>,
}

pub struct CachePromoter {
    storage_dir: PathBuf,
    suffixes: Vec<String>,
    catalog: Arc<dyn Catalog>,
    cleanup_delay: Duration,
}

impl CachePromoter {
    pub fn new(
        storage_dir: PathBuf,
        suffixes: Vec<String>,
        catalog: Arc<dyn Catalog>,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            storage_dir,
            suffixes,
            catalog,
            cleanup_delay,
        }
    }

    /// Decides which tier a finished download actually holds.
    pub async fn classify(&self, file: &FinishedFile<'_>) -> Result<QualityTier, EngineError> {
        let size = tokio::fs::metadata(file.path)
            .await
            .map_err(EngineError::scratch_io)?
            .len();
        Ok(classify_achieved(file.reported, file.hint, size, file.duration_secs))
    }

    /// Copies a classified download into storage and records it in the catalog.
    ///
    /// The scratch file is copied rather than moved because late joiners may
    /// still be reading it. The slot remembers `key.tier` as well as
    /// `achieved` so a repeat request for the same tier is a cache hit.
    pub async fn promote(
        &self,
        key: &JobKey,
        path: &Path,
        achieved: QualityTier,
    ) -> Result<Promotion, EngineError> {
        let ext = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| audio_extension(n, &self.suffixes))
            .unwrap_or_else(|| "bin".to_string());
        let name = format!(
            "{}_{}_{}.{}",
            sanitize_component(&key.track_id),
            achieved.as_str(),
            unique_token(&key.track_id, achieved),
            ext
        );

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(EngineError::scratch_io)?;
        let dest = self.storage_dir.join(name);
        let size = tokio::fs::copy(path, &dest)
            .await
            .map_err(EngineError::scratch_io)?;

        let update = SlotUpdate {
            path: dest.clone(),
            requested: key.tier,
            achieved,
        };
        if let Err(e) = self.catalog.update_track(&key.track_id, update).await {
            // Don't leave an orphan behind when the catalog refuses it.
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }

        let promotion = Promotion {
            path: dest,
            requested: key.tier,
            achieved,
            size,
        };
        tracing::info!(
            "[promote] Cached {} as {} ({} bytes{}) at {}",
            key,
            achieved,
            size,
            if promotion.is_fallback() { ", fallback" } else { "" },
            promotion.path.display()
        );
        Ok(promotion)
    }

    /// Removes a scratch directory after the cleanup delay.
    pub fn schedule_scratch_cleanup(&self, dir: PathBuf) {
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remove_scratch(&dir).await;
        });
    }
}

pub async fn remove_scratch(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!("[promote] Removed scratch dir {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("[promote] Failed to remove {}: {}", dir.display(), e),
    }
}

/// Replaces anything outside [A-Za-z0-9_-] so the value is safe in a file name.
pub fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Short token that keeps two promotions of the same track/tier apart.
pub fn unique_token(track_id: &str, tier: QualityTier) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}:{}", track_id, tier.as_str(), nanos, seq).as_bytes());
    hasher
        .finalize()
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect()
}
