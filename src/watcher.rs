use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::quality::{audio_extension, hint_from_extension, strip_in_progress_suffix, QualityHint};

/// An audio file found in a scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFile {
    pub path: PathBuf,
    pub size: u64,
    pub hint: QualityHint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchStatus {
    /// Nothing streamable yet.
    Waiting,
    /// The locked file crossed the readiness threshold.
    Ready(DetectedFile),
    /// Attempts and retries are used up; only the final scan can find a file now.
    GaveUp,
}

struct Locked {
    path: PathBuf,
    attempts: u32,
}

/// Polls a job's scratch directory until an audio file is big enough to stream.
///
/// The first plausible audio file is locked onto and every other artifact is
/// ignored from then on.
pub struct ScratchWatcher {
    dir: PathBuf,
    suffixes: Vec<String>,
    threshold: u64,
    max_attempts: u32,
    retries_left: u32,
    locked: Option<Locked>,
    gave_up: bool,
}

impl ScratchWatcher {
    pub fn new(
        dir: PathBuf,
        suffixes: Vec<String>,
        threshold: u64,
        max_attempts: u32,
        retries: u32,
    ) -> Self {
        Self {
            dir,
            suffixes,
            threshold,
            max_attempts,
            retries_left: retries,
            locked: None,
            gave_up: false,
        }
    }

    pub async fn poll(&mut self) -> Result<WatchStatus, EngineError> {
        if self.gave_up {
            return Ok(WatchStatus::GaveUp);
        }

        if self.locked.is_none() {
            let files = list_audio_files(&self.dir, &self.suffixes).await?;
            match files.into_iter().next() {
                Some((path, _)) => {
                    tracing::debug!("[watcher] Locked onto {}", path.display());
                    self.locked = Some(Locked { path, attempts: 0 });
                }
                None => return Ok(WatchStatus::Waiting),
            }
        }

        let Some(locked) = self.locked.as_mut() else {
            return Ok(WatchStatus::Waiting);
        };
        let current = resolve_current(&self.dir, &locked.path, &self.suffixes).await?;
        if let Some((path, size)) = current {
            locked.path = path.clone();
            if size >= self.threshold {
                let hint = file_hint(&path, &self.suffixes);
                tracing::info!(
                    "[watcher] {} ready to stream ({} bytes)",
                    path.display(),
                    size
                );
                self.locked = None;
                self.gave_up = true;
                return Ok(WatchStatus::Ready(DetectedFile { path, size, hint }));
            }
        }

        locked.attempts += 1;
        if locked.attempts >= self.max_attempts {
            tracing::warn!(
                "[watcher] {} never reached {} bytes after {} attempts",
                locked.path.display(),
                self.threshold,
                locked.attempts
            );
            self.locked = None;
            if self.retries_left > 0 {
                self.retries_left -= 1;
            } else {
                self.gave_up = true;
                return Ok(WatchStatus::GaveUp);
            }
        }
        Ok(WatchStatus::Waiting)
    }

    /// After the backend exits: the largest audio file present, regardless of size.
    pub async fn final_scan(&self) -> Result<Option<DetectedFile>, EngineError> {
        let files = list_audio_files(&self.dir, &self.suffixes).await?;
        Ok(files
            .into_iter()
            .max_by_key(|(_, size)| *size)
            .map(|(path, size)| {
                let hint = file_hint(&path, &self.suffixes);
                DetectedFile { path, size, hint }
            }))
    }
}

/// Audio extension of `path`, looking past any in-progress suffix.
pub fn file_extension(path: &Path, suffixes: &[String]) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| audio_extension(n, suffixes))
}

/// Quality hint from a file's audio extension.
pub fn file_hint(path: &Path, suffixes: &[String]) -> QualityHint {
    file_extension(path, suffixes)
        .map(|ext| hint_from_extension(&ext))
        .unwrap_or(QualityHint::Unknown)
}

/// Audio files in `dir` with their sizes, sorted by name.
pub async fn list_audio_files(
    dir: &Path,
    suffixes: &[String],
) -> Result<Vec<(PathBuf, u64)>, EngineError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::scratch_io(e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(EngineError::scratch_io)? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if audio_extension(name, suffixes).is_none() {
            continue;
        }
        // The file may vanish between listing and stat during a rename.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_file() {
            files.push((path, meta.len()));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Logical name of an audio file: no in-progress suffix, no extension.
fn logical_stem(path: &Path, suffixes: &[String]) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (name, _) = strip_in_progress_suffix(name, suffixes);
    let stem = Path::new(name).file_stem()?.to_str()?;
    Some(stem.to_string())
}

/// Where the file last seen at `known` lives now.
///
/// Follows a rename that drops the in-progress suffix or swaps the
/// extension; otherwise falls back to the largest audio file present.
pub async fn resolve_current(
    dir: &Path,
    known: &Path,
    suffixes: &[String],
) -> Result<Option<(PathBuf, u64)>, EngineError> {
    if let Ok(meta) = tokio::fs::metadata(known).await {
        if meta.is_file() {
            return Ok(Some((known.to_path_buf(), meta.len())));
        }
    }
    let files = list_audio_files(dir, suffixes).await?;
    let stem = logical_stem(known, suffixes);
    if let Some(found) = files
        .iter()
        .find(|(path, _)| stem.is_some() && logical_stem(path, suffixes) == stem)
    {
        tracing::debug!(
            "[watcher] {} moved to {}",
            known.display(),
            found.0.display()
        );
        return Ok(Some(found.clone()));
    }
    Ok(files.into_iter().max_by_key(|(_, size)| *size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        vec![".part".to_string()]
    }

    #[tokio::test]
    async fn ignores_non_audio_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cover.jpg"), vec![0u8; 4096]).unwrap();
        std::fs::write(dir.path().join("info.json"), b"{}").unwrap();
        let mut watcher = ScratchWatcher::new(dir.path().to_path_buf(), suffixes(), 10, 5, 0);
        assert_eq!(watcher.poll().await.unwrap(), WatchStatus::Waiting);
    }

    #[tokio::test]
    async fn becomes_ready_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("song.mp3.part");
        std::fs::write(&part, vec![1u8; 8]).unwrap();
        let mut watcher = ScratchWatcher::new(dir.path().to_path_buf(), suffixes(), 16, 50, 0);
        assert_eq!(watcher.poll().await.unwrap(), WatchStatus::Waiting);

        std::fs::write(&part, vec![1u8; 32]).unwrap();
        match watcher.poll().await.unwrap() {
            WatchStatus::Ready(file) => {
                assert_eq!(file.path, part);
                assert_eq!(file.size, 32);
                assert_eq!(file.hint, QualityHint::Lossy);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn retries_once_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.flac"), vec![1u8; 4]).unwrap();
        let mut watcher = ScratchWatcher::new(dir.path().to_path_buf(), suffixes(), 1024, 2, 1);
        let mut statuses = Vec::new();
        for _ in 0..5 {
            statuses.push(watcher.poll().await.unwrap());
        }
        assert_eq!(
            statuses,
            vec![
                WatchStatus::Waiting,
                WatchStatus::Waiting,
                WatchStatus::Waiting,
                WatchStatus::GaveUp,
                WatchStatus::GaveUp,
            ]
        );
        let last = watcher.final_scan().await.unwrap().unwrap();
        assert_eq!(last.hint, QualityHint::Lossless);
    }

    #[tokio::test]
    async fn follows_suffix_rename_and_extension_swap() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("song.webm.part");
        let done = dir.path().join("song.opus");
        std::fs::write(&done, vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("other.mp3"), vec![0u8; 99]).unwrap();

        let resolved = resolve_current(dir.path(), &part, &suffixes()).await.unwrap();
        assert_eq!(resolved, Some((done, 10)));
    }
}
