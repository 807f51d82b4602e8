use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::quality::QualityTier;

/// Availability of the lossless slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    ConfirmedUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HighSlot {
    pub path: Option<PathBuf>,
    pub availability: Availability,
    /// Tier the job that filled `path` was asked for.
    #[serde(default)]
    pub requested: Option<QualityTier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardSlot {
    pub path: Option<PathBuf>,
    /// Tier actually achieved by the file in `path`.
    pub achieved: Option<QualityTier>,
    /// Tier the job that filled `path` was asked for.
    #[serde(default)]
    pub requested: Option<QualityTier>,
}

/// A cache hit: the file to serve and the tier it actually holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedFile<'a> {
    pub path: &'a Path,
    pub achieved: QualityTier,
}

/// Catalog view of one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub high: HighSlot,
    #[serde(default)]
    pub standard: StandardSlot,
    /// Lossy tiers confirmed unobtainable. Lossless lives in `high.availability`.
    #[serde(default)]
    pub unavailable: BTreeSet<QualityTier>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TrackRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: None,
            album: None,
            duration_secs: None,
            high: HighSlot::default(),
            standard: StandardSlot::default(),
            unavailable: BTreeSet::new(),
            updated_at: None,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Cached file that satisfies a request for `tier`, if the catalog
    /// points at one that still exists.
    ///
    /// A slot answers for the tier it achieved and also for the tier its job
    /// was asked for, so a request that fell back is not downloaded again.
    pub fn cached(&self, tier: QualityTier) -> Option<CachedFile<'_>> {
        let high = self.high.path.as_deref().map(|path| CachedFile {
            path,
            achieved: QualityTier::Lossless,
        });
        let standard = self
            .standard
            .path
            .as_deref()
            .zip(self.standard.achieved)
            .map(|(path, achieved)| CachedFile { path, achieved });

        let hit = if tier.is_lossless() {
            high.or(standard.filter(|_| self.standard.requested == Some(tier)))
        } else {
            standard
                .filter(|c| c.achieved == tier || self.standard.requested == Some(tier))
                .or(high.filter(|_| self.high.requested == Some(tier)))
        };
        hit.filter(|c| c.path.exists())
    }

    pub fn cached_file(&self, tier: QualityTier) -> Option<&Path> {
        self.cached(tier).map(|c| c.path)
    }

    pub fn is_unavailable(&self, tier: QualityTier) -> bool {
        if tier.is_lossless() {
            self.high.availability == Availability::ConfirmedUnavailable
        } else {
            self.unavailable.contains(&tier)
        }
    }

    fn set_unavailable(&mut self, tier: QualityTier, unavailable: bool) {
        if tier.is_lossless() {
            self.high.availability = if unavailable {
                Availability::ConfirmedUnavailable
            } else if self.high.path.is_some() {
                Availability::Available
            } else {
                Availability::Unknown
            };
        } else if unavailable {
            self.unavailable.insert(tier);
        } else {
            self.unavailable.remove(&tier);
        }
    }

    fn apply(&mut self, update: &SlotUpdate) {
        if update.achieved.is_lossless() {
            self.high.path = Some(update.path.clone());
            self.high.availability = Availability::Available;
            self.high.requested = Some(update.requested);
        } else {
            self.standard.path = Some(update.path.clone());
            self.standard.achieved = Some(update.achieved);
            self.standard.requested = Some(update.requested);
        }
    }
}

/// Points a track's slot at a newly promoted file.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotUpdate {
    pub path: PathBuf,
    pub requested: QualityTier,
    pub achieved: QualityTier,
}

impl SlotUpdate {
    /// Update for a file that holds exactly the tier it was fetched for.
    pub fn exact(path: PathBuf, tier: QualityTier) -> Self {
        Self {
            path,
            requested: tier,
            achieved: tier,
        }
    }
}

/// Narrow read/write contract the engine needs from the track catalog.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn get_track(&self, id: &str) -> Result<Option<TrackRecord>, EngineError>;
    async fn update_track(&self, id: &str, update: SlotUpdate) -> Result<(), EngineError>;
    async fn get_unavailability(&self, id: &str, tier: QualityTier) -> Result<bool, EngineError>;
    async fn set_unavailability(
        &self,
        id: &str,
        tier: QualityTier,
        unavailable: bool,
    ) -> Result<(), EngineError>;
    async fn upsert_track(&self, record: TrackRecord) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogIndex {
    tracks: HashMap<String, TrackRecord>,
}

/// Catalog kept in memory and mirrored to a JSON index file.
pub struct JsonCatalog {
    index_file: Option<PathBuf>,
    index: Mutex<CatalogIndex>,
}

impl JsonCatalog {
    /// Open (or create) a catalog backed by `index_file`.
    pub fn open(index_file: &Path) -> Result<Self, EngineError> {
        let index = if index_file.exists() {
            let content = std::fs::read_to_string(index_file)
                .map_err(|e| EngineError::catalog(format!("Failed to read catalog index: {}", e)))?;
            serde_json::from_str(&content)
                .map_err(|e| EngineError::catalog(format!("Failed to parse catalog index: {}", e)))?
        } else {
            CatalogIndex::default()
        };
        tracing::info!(
            "[catalog] Opened catalog at {} ({} tracks)",
            index_file.display(),
            index.tracks.len()
        );
        Ok(Self {
            index_file: Some(index_file.to_path_buf()),
            index: Mutex::new(index),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            index_file: None,
            index: Mutex::new(CatalogIndex::default()),
        }
    }

    async fn save_index(&self, index: &CatalogIndex) -> Result<(), EngineError> {
        let Some(path) = &self.index_file else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(index)
            .map_err(|e| EngineError::catalog(format!("Failed to serialize catalog index: {}", e)))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(EngineError::catalog)?;
        }
        // Write-then-rename so a crash never leaves a truncated index behind.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| EngineError::catalog(format!("Failed to write catalog index: {}", e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::catalog(format!("Failed to replace catalog index: {}", e)))
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut TrackRecord),
    {
        let mut index = self.index.lock().await;
        let record = index
            .tracks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFoundInCatalog(id.to_string()))?;
        f(record);
        record.updated_at = Some(Utc::now());
        self.save_index(&index).await
    }
}

#[async_trait]
impl Catalog for JsonCatalog {
    async fn get_track(&self, id: &str) -> Result<Option<TrackRecord>, EngineError> {
        let mut index = self.index.lock().await;
        let Some(record) = index.tracks.get_mut(id) else {
            return Ok(None);
        };
        let mut dropped = false;
        if record.high.path.as_ref().is_some_and(|p| !p.exists()) {
            tracing::info!("[catalog] Cached lossless file missing, clearing slot for {}", id);
            record.high.path = None;
            if record.high.availability == Availability::Available {
                record.high.availability = Availability::Unknown;
            }
            dropped = true;
        }
        if record.standard.path.as_ref().is_some_and(|p| !p.exists()) {
            tracing::info!("[catalog] Cached standard file missing, clearing slot for {}", id);
            record.standard = StandardSlot::default();
            dropped = true;
        }
        let snapshot = record.clone();
        if dropped {
            let _ = self.save_index(&index).await;
        }
        Ok(Some(snapshot))
    }

    async fn update_track(&self, id: &str, update: SlotUpdate) -> Result<(), EngineError> {
        self.mutate(id, |record| record.apply(&update)).await
    }

    async fn get_unavailability(&self, id: &str, tier: QualityTier) -> Result<bool, EngineError> {
        let index = self.index.lock().await;
        index
            .tracks
            .get(id)
            .map(|record| record.is_unavailable(tier))
            .ok_or_else(|| EngineError::NotFoundInCatalog(id.to_string()))
    }

    async fn set_unavailability(
        &self,
        id: &str,
        tier: QualityTier,
        unavailable: bool,
    ) -> Result<(), EngineError> {
        self.mutate(id, |record| record.set_unavailable(tier, unavailable))
            .await
    }

    async fn upsert_track(&self, record: TrackRecord) -> Result<(), EngineError> {
        let mut index = self.index.lock().await;
        index.tracks.insert(record.id.clone(), record);
        self.save_index(&index).await
    }
}
