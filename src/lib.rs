//! Adaptive-quality download-and-broadcast cache for audio tracks.
//!
//! A request for a (track, quality tier) pair is served from the permanent
//! cache when possible. Otherwise one backend download is started per pair
//! and every concurrent requester receives the same growing file, each from
//! byte zero. Finished downloads are promoted into the cache and recorded in
//! the catalog; confirmed misses are remembered so they are not retried.

pub mod backend;
pub mod broadcaster;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod job;
pub mod logging;
pub mod promoter;
pub mod quality;
pub mod registry;
pub mod unavailability;
pub mod watcher;

pub use backend::{AcquisitionBackend, BackendProcess, CommandBackend, TrackDescriptor};
pub use catalog::{CachedFile, Catalog, JsonCatalog, SlotUpdate, TrackRecord};
pub use config::{BackendConfig, EmptySubscriberPolicy, EngineConfig};
pub use engine::{Engine, StatusState, StreamHandle, TrackStatus};
pub use error::{EngineError, FailureClass};
pub use job::{JobSnapshot, JobState};
pub use quality::QualityTier;
pub use unavailability::ResetScope;
