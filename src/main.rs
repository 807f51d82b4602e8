use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use tiercache::{config::EngineConfig, http, logging, CommandBackend, Engine, JsonCatalog};

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tiercache")
        .join("config.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = EngineConfig::load(&config_path)?;
    config.ensure_directories_exist()?;
    if let Some(paths) = logging::init(&config.logging)? {
        tracing::info!(
            "[main] Logging to {} (errors: {})",
            paths.log_file.display(),
            paths.error_file.display()
        );
    }
    tracing::info!("[main] Using config {}", config_path.display());

    let catalog = JsonCatalog::open(&config.catalog_file)
        .with_context(|| format!("Failed to open catalog {}", config.catalog_file.display()))?;
    let backend = CommandBackend::new(config.backend.clone());
    let listen = config.http.listen.clone();
    let engine = Engine::new(config, Arc::new(catalog), Arc::new(backend));

    http::serve(engine, &listen).await
}
