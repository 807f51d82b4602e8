use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

const LOG_FILE_NAME: &str = "engine.log";
const ERROR_FILE_NAME: &str = "engine.err.log";

/// Where the installed subscriber writes, if anywhere besides the console.
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub log_file: PathBuf,
    pub error_file: PathBuf,
}

static INSTALLED: OnceCell<Option<LogPaths>> = OnceCell::new();

/// Install the global tracing subscriber. Later calls return the first result.
///
/// Everything goes to the console and `engine.log`; WARN and above are also
/// copied to `engine.err.log`.
pub fn init(config: &LoggingConfig) -> Result<Option<LogPaths>> {
    if let Some(paths) = INSTALLED.get() {
        return Ok(paths.clone());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(fmt::layer().with_target(false).boxed());

    let paths = match &config.log_dir {
        Some(dir) => {
            let paths = LogPaths {
                log_file: dir.join(LOG_FILE_NAME),
                error_file: dir.join(ERROR_FILE_NAME),
            };
            let log_file = open_append(&paths.log_file)?;
            let error_file = open_append(&paths.error_file)?;
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(log_file))
                    .boxed(),
            );
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(error_file))
                    .with_filter(LevelFilter::WARN)
                    .boxed(),
            );
            Some(paths)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let paths = INSTALLED.get_or_init(|| paths).clone();
    if let Some(p) = &paths {
        tracing::info!("[logging] Writing logs to {}", p.log_file.display());
    }
    Ok(paths)
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot write to log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_append_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.log");
        open_append(&path).unwrap();
        assert!(path.exists());
    }
}
