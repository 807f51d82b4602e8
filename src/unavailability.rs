use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::EngineError;
use crate::quality::{QualityTier, LADDER};

/// Which marks a reset should clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Tier(QualityTier),
    All,
}

impl std::str::FromStr for ResetScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(ResetScope::All)
        } else {
            s.parse().map(ResetScope::Tier)
        }
    }
}

/// Negative cache: remembers that a (track, tier) cannot be obtained.
///
/// Marks are only ever cleared by [`UnavailabilityTracker::reset`].
pub struct UnavailabilityTracker {
    catalog: Arc<dyn Catalog>,
    /// Directory for empty marker files, when placeholders are enabled.
    placeholder_dir: Option<PathBuf>,
}

impl UnavailabilityTracker {
    pub fn new(catalog: Arc<dyn Catalog>, placeholder_dir: Option<PathBuf>) -> Self {
        Self {
            catalog,
            placeholder_dir,
        }
    }

    pub async fn is_unavailable(&self, track_id: &str, tier: QualityTier) -> Result<bool, EngineError> {
        self.catalog.get_unavailability(track_id, tier).await
    }

    pub async fn mark_unavailable(&self, track_id: &str, tier: QualityTier) -> Result<(), EngineError> {
        self.catalog.set_unavailability(track_id, tier, true).await?;
        if let Some(path) = self.placeholder_path(track_id, tier) {
            if let Err(e) = tokio::fs::write(&path, b"").await {
                tracing::warn!("[negative] Failed to write placeholder {}: {}", path.display(), e);
            }
        }
        tracing::info!("[negative] Marked {} unavailable at {}", track_id, tier);
        Ok(())
    }

    pub async fn reset(&self, track_id: &str, scope: ResetScope) -> Result<(), EngineError> {
        let tiers: Vec<QualityTier> = match scope {
            ResetScope::Tier(tier) => vec![tier],
            ResetScope::All => LADDER.to_vec(),
        };
        for tier in tiers {
            self.catalog.set_unavailability(track_id, tier, false).await?;
            if let Some(path) = self.placeholder_path(track_id, tier) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        tracing::info!("[negative] Reset unavailability for {} ({:?})", track_id, scope);
        Ok(())
    }

    fn placeholder_path(&self, track_id: &str, tier: QualityTier) -> Option<PathBuf> {
        self.placeholder_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}_{}.unavailable",
                crate::promoter::sanitize_component(track_id),
                tier.as_str()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{JsonCatalog, TrackRecord};

    async fn tracker(placeholders: Option<PathBuf>) -> UnavailabilityTracker {
        let catalog = Arc::new(JsonCatalog::in_memory());
        catalog.upsert_track(TrackRecord::new("t1", "Song")).await.unwrap();
        UnavailabilityTracker::new(catalog, placeholders)
    }

    #[tokio::test]
    async fn mark_then_reset_single_tier() {
        let tracker = tracker(None).await;
        tracker.mark_unavailable("t1", QualityTier::Lossless).await.unwrap();
        assert!(tracker.is_unavailable("t1", QualityTier::Lossless).await.unwrap());
        assert!(!tracker.is_unavailable("t1", QualityTier::Kbps320).await.unwrap());

        tracker.reset("t1", ResetScope::Tier(QualityTier::Lossless)).await.unwrap();
        assert!(!tracker.is_unavailable("t1", QualityTier::Lossless).await.unwrap());
    }

    #[tokio::test]
    async fn reset_all_clears_every_tier() {
        let tracker = tracker(None).await;
        tracker.mark_unavailable("t1", QualityTier::Lossless).await.unwrap();
        tracker.mark_unavailable("t1", QualityTier::Kbps128).await.unwrap();
        tracker.reset("t1", ResetScope::All).await.unwrap();
        for tier in LADDER {
            assert!(!tracker.is_unavailable("t1", tier).await.unwrap());
        }
    }

    #[tokio::test]
    async fn placeholders_follow_marks() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(Some(dir.path().to_path_buf())).await;
        tracker.mark_unavailable("t1", QualityTier::Kbps256).await.unwrap();
        let marker = dir.path().join("t1_256.unavailable");
        assert!(marker.exists());
        tracker.reset("t1", ResetScope::All).await.unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn reset_scope_parses() {
        assert_eq!("all".parse::<ResetScope>(), Ok(ResetScope::All));
        assert_eq!("320".parse::<ResetScope>(), Ok(ResetScope::Tier(QualityTier::Kbps320)));
        assert!("bogus".parse::<ResetScope>().is_err());
    }
}
