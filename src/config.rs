use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with an in-flight download once its last subscriber leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptySubscriberPolicy {
    /// Kill the backend and discard the scratch directory.
    Abort,
    /// Keep downloading so the result still lands in the cache.
    Continue,
}

/// External acquisition tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub program: String,
    /// Argument template. Placeholders: {query} {title} {artist} {album}
    /// {format} {bitrate} {quality} {output}
    pub args: Vec<String>,
    pub in_progress_suffixes: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "yt-dlp".to_string(),
            program: "yt-dlp".to_string(),
            args: vec![
                "--no-playlist".to_string(),
                "--newline".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "{format}".to_string(),
                "--audio-quality".to_string(),
                "{bitrate}".to_string(),
                "-o".to_string(),
                "{output}/%(title)s.%(ext)s".to_string(),
                "ytsearch1:{query}".to_string(),
            ],
            in_progress_suffixes: default_in_progress_suffixes(),
        }
    }
}

pub fn default_in_progress_suffixes() -> Vec<String> {
    vec![
        ".part".to_string(),
        ".download".to_string(),
        ".tmp".to_string(),
        ".ytdl".to_string(),
    ]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG.
    pub filter: String,
    /// Directory for engine.log / engine.err.log. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
        }
    }
}

/// Engine configuration with persistence support
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    // Directories
    pub storage_dir: PathBuf,
    pub scratch_root: PathBuf,
    pub catalog_file: PathBuf,

    // Readiness detection
    pub ready_threshold_bytes: u64,
    pub watch_interval_ms: u64,
    pub watch_max_attempts: u32,
    pub watch_retries: u32,

    // Tailing
    pub tail_interval_ms: u64,
    pub catchup_chunk_bytes: usize,

    // Timeouts and delays
    pub join_timeout_secs: u64,
    pub scratch_cleanup_delay_secs: u64,
    pub registry_grace_secs: u64,
    pub output_drain_timeout_ms: u64,

    // Policies
    pub empty_subscriber_policy: EmptySubscriberPolicy,
    pub unavailable_placeholders: bool,

    pub backend: BackendConfig,
    pub logging: LoggingConfig,
    pub http: HttpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            storage_dir: base.join("library"),
            scratch_root: base.join("scratch"),
            catalog_file: base.join("catalog.json"),
            ready_threshold_bytes: 64 * 1024,
            watch_interval_ms: 150,
            watch_max_attempts: 200,
            watch_retries: 1,
            tail_interval_ms: 150,
            catchup_chunk_bytes: 256 * 1024,
            join_timeout_secs: 60,
            scratch_cleanup_delay_secs: 30,
            registry_grace_secs: 10,
            output_drain_timeout_ms: 2000,
            empty_subscriber_policy: EmptySubscriberPolicy::Continue,
            unavailable_placeholders: false,
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tiercache")
}

impl EngineConfig {
    /// Load configuration from disk, using defaults if the file doesn't exist,
    /// then apply environment overrides and clamp values.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: EngineConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            tracing::info!("[config] Loaded engine config from: {}", path.display());
            config
        } else {
            tracing::info!("[config] Config file {} not found, using defaults", path.display());
            EngineConfig::default()
        };
        config.apply_env_overrides();
        config.validate();
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TIERCACHE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TIERCACHE_SCRATCH_DIR") {
            self.scratch_root = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("TIERCACHE_CATALOG_FILE") {
            self.catalog_file = PathBuf::from(file);
        }
        if let Ok(listen) = std::env::var("TIERCACHE_LISTEN") {
            self.http.listen = listen;
        }
    }

    /// Validate and clamp settings to reasonable ranges
    pub fn validate(&mut self) {
        self.ready_threshold_bytes = self.ready_threshold_bytes.clamp(1, 16 * 1024 * 1024);
        self.watch_interval_ms = self.watch_interval_ms.clamp(10, 5_000);
        self.watch_max_attempts = self.watch_max_attempts.clamp(1, 100_000);
        self.watch_retries = self.watch_retries.min(10);
        self.tail_interval_ms = self.tail_interval_ms.clamp(10, 5_000);
        self.catchup_chunk_bytes = self.catchup_chunk_bytes.clamp(4 * 1024, 16 * 1024 * 1024);
        self.join_timeout_secs = self.join_timeout_secs.clamp(1, 600);
        self.scratch_cleanup_delay_secs = self.scratch_cleanup_delay_secs.min(3_600);
        self.registry_grace_secs = self.registry_grace_secs.min(3_600);
        self.output_drain_timeout_ms = self.output_drain_timeout_ms.clamp(10, 60_000);
        if self.backend.in_progress_suffixes.is_empty() {
            self.backend.in_progress_suffixes = default_in_progress_suffixes();
        }
    }

    /// Ensure all necessary directories exist
    pub fn ensure_directories_exist(&self) -> Result<()> {
        let mut dirs_to_create = vec![self.storage_dir.clone(), self.scratch_root.clone()];
        if let Some(parent) = self.catalog_file.parent() {
            dirs_to_create.push(parent.to_path_buf());
        }
        if let Some(log_dir) = &self.logging.log_dir {
            dirs_to_create.push(log_dir.clone());
        }
        for dir in dirs_to_create {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Configuration rooted entirely inside `base`, with short timers. Used by tests.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            storage_dir: base.join("library"),
            scratch_root: base.join("scratch"),
            catalog_file: base.join("catalog.json"),
            ..Self::default()
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn scratch_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.scratch_cleanup_delay_secs)
    }

    pub fn registry_grace(&self) -> Duration {
        Duration::from_secs(self.registry_grace_secs)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }
}
