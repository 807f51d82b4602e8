use serde::Serialize;
use thiserror::Error;

use crate::quality::QualityTier;

/// Errors surfaced by the engine.
///
/// Every variant carries owned strings so a job-level failure can be cloned
/// out to each subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Track not found in catalog: {0}")]
    NotFoundInCatalog(String),

    #[error("Track {track_id} is unavailable at quality {tier}")]
    QualityUnavailable {
        track_id: String,
        tier: QualityTier,
        /// True when no tier of the fallback chain could be served either.
        exhausted: bool,
    },

    #[error("Failed to launch acquisition backend: {0}")]
    BackendLaunch(String),

    #[error("Acquisition backend failed: {0}")]
    BackendTransient(String),

    #[error("Timed out after {waited_secs}s waiting for {track_id} at {tier}")]
    DownloadJoinTimeout {
        track_id: String,
        tier: QualityTier,
        waited_secs: u64,
    },

    #[error("Scratch file I/O failed: {0}")]
    ScratchIo(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Download aborted: {0}")]
    Aborted(String),
}

/// How a caller-facing layer should present an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Still producing or hit a transient problem; retry shortly.
    Pending,
    /// Definitively unavailable at the requested quality.
    UnavailableAtQuality,
    /// Definitively unavailable at any quality.
    UnavailableEverywhere,
}

impl EngineError {
    pub fn scratch_io(err: std::io::Error) -> Self {
        EngineError::ScratchIo(err.to_string())
    }

    pub fn catalog(err: impl std::fmt::Display) -> Self {
        EngineError::Catalog(err.to_string())
    }

    /// Whether a later request for the same key may succeed without a reset.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NotFoundInCatalog(_) | EngineError::QualityUnavailable { .. } => false,
            EngineError::BackendLaunch(_)
            | EngineError::BackendTransient(_)
            | EngineError::DownloadJoinTimeout { .. }
            | EngineError::ScratchIo(_)
            | EngineError::Catalog(_)
            | EngineError::Aborted(_) => true,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            EngineError::NotFoundInCatalog(_) => FailureClass::UnavailableEverywhere,
            EngineError::QualityUnavailable { tier, exhausted, .. } => {
                if *exhausted && !tier.is_lossless() {
                    FailureClass::UnavailableEverywhere
                } else {
                    FailureClass::UnavailableAtQuality
                }
            }
            _ => FailureClass::Pending,
        }
    }
}
