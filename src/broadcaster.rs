use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::EngineError;
use crate::job::{Feed, FeedSender, Job, Subscriber};
use crate::quality::QualityTier;
use crate::watcher::resolve_current;

/// Where a tailing step left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub cursor: u64,
    pub size: u64,
}

/// Tails a job's growing scratch file and fans new bytes out to its subscribers.
///
/// Only the job's driver task calls into this, so the job cursor never moves
/// while a catch-up read is in flight.
pub struct Broadcaster {
    suffixes: Vec<String>,
    chunk_bytes: usize,
}

impl Broadcaster {
    pub fn new(suffixes: Vec<String>, chunk_bytes: usize) -> Self {
        Self {
            suffixes,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// One tailing step: follow renames, catch up new joiners, send the delta.
    pub async fn tick(&self, job: &Job) -> Result<TickReport, EngineError> {
        job.prune_closed();

        let (known, cursor) = {
            let inner = job.lock();
            (inner.file_path.clone(), inner.cursor)
        };

        let Some(known) = known else {
            // Nothing written yet, so there is nothing to catch up on.
            let mut inner = job.lock();
            let pending = std::mem::take(&mut inner.pending);
            inner.live.extend(pending);
            return Ok(TickReport { cursor, size: 0 });
        };

        let Some((path, size)) = resolve_current(job.scratch_dir(), &known, &self.suffixes).await?
        else {
            return Ok(TickReport { cursor, size: cursor });
        };
        if path != known {
            tracing::info!(
                "[broadcast] {} renamed {} -> {}",
                job.key(),
                known.display(),
                path.display()
            );
            job.lock().file_path = Some(path.clone());
        }

        self.catch_up_pending(job, &path, cursor).await;

        if size <= cursor {
            return Ok(TickReport { cursor, size });
        }

        let delta = match read_range(&path, cursor, size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Leave the cursor alone; the next tick retries the same range.
                tracing::warn!("[broadcast] {} read failed at {}: {}", job.key(), cursor, e);
                return Ok(TickReport { cursor, size });
            }
        };
        let advanced = cursor + delta.len() as u64;

        let mut inner = job.lock();
        inner.live.retain_mut(|subscriber| {
            debug_assert_eq!(subscriber.cursor(), cursor);
            subscriber.send_bytes(delta.clone())
        });
        inner.cursor = advanced;
        Ok(TickReport {
            cursor: advanced,
            size,
        })
    }

    /// Gives each pending subscriber bytes [0, cursor) before it goes live.
    async fn catch_up_pending(&self, job: &Job, path: &Path, cursor: u64) {
        let pending = std::mem::take(&mut job.lock().pending);
        if pending.is_empty() {
            return;
        }

        let mut ready = Vec::with_capacity(pending.len());
        for mut subscriber in pending {
            match self.catch_up(&mut subscriber, path, cursor).await {
                Ok(true) => ready.push(subscriber),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        "[broadcast] {} catch-up for subscriber {} failed: {}",
                        job.key(),
                        subscriber.id,
                        err
                    );
                    subscriber.send_error(err);
                }
            }
        }

        if cursor > 0 {
            tracing::debug!(
                "[broadcast] {} caught up {} subscriber(s) to {} bytes",
                job.key(),
                ready.len(),
                cursor
            );
        }
        job.lock().live.extend(ready);
    }

    /// False when the subscriber disconnected midway.
    async fn catch_up(
        &self,
        subscriber: &mut Subscriber,
        path: &Path,
        cursor: u64,
    ) -> Result<bool, EngineError> {
        let mut offset = subscriber.cursor();
        while offset < cursor {
            let end = cursor.min(offset + self.chunk_bytes as u64);
            let bytes = read_range(path, offset, end)
                .await
                .map_err(EngineError::scratch_io)?;
            if bytes.len() as u64 != end - offset {
                return Err(EngineError::ScratchIo(format!(
                    "short read at {} in {}",
                    offset,
                    path.display()
                )));
            }
            if !subscriber.send_bytes(bytes) {
                return Ok(false);
            }
            offset = end;
        }
        Ok(true)
    }

    /// Tails until everything written has been delivered, then ends every stream.
    ///
    /// Called once the backend has exited and the job is marked complete.
    pub async fn drain(&self, job: &Job, tick: Duration) -> Result<u64, EngineError> {
        const MAX_STALLED_TICKS: u32 = 20;
        let mut stalled = 0;
        let mut last_cursor = None;

        loop {
            let report = self.tick(job).await?;
            {
                let mut inner = job.lock();
                if inner.complete && report.cursor >= report.size && inner.pending.is_empty() {
                    inner.drained = true;
                    let live = std::mem::take(&mut inner.live);
                    drop(inner);
                    tracing::info!(
                        "[broadcast] {} finished streaming {} bytes to {} subscriber(s)",
                        job.key(),
                        report.cursor,
                        live.len()
                    );
                    // Dropping the sinks ends each stream.
                    drop(live);
                    return Ok(report.cursor);
                }
            }

            if last_cursor == Some(report.cursor) {
                stalled += 1;
                if stalled >= MAX_STALLED_TICKS {
                    let err = EngineError::ScratchIo(format!(
                        "stuck at {} of {} bytes",
                        report.cursor, report.size
                    ));
                    let subscribers = {
                        let mut inner = job.lock();
                        inner.drained = true;
                        let mut all = std::mem::take(&mut inner.pending);
                        all.append(&mut inner.live);
                        all
                    };
                    for subscriber in subscribers {
                        subscriber.send_error(err.clone());
                    }
                    return Err(err);
                }
                tokio::time::sleep(tick).await;
            } else {
                stalled = 0;
            }
            last_cursor = Some(report.cursor);
        }
    }
}

/// Reads bytes [start, end) of `path`. May return fewer if the file is shorter.
pub async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let len = end.saturating_sub(start);
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Streams a finished file into `sink`, optionally announcing a tier switch first.
pub fn spawn_file_feed(
    path: PathBuf,
    switch: Option<QualityTier>,
    sink: FeedSender,
    chunk_bytes: usize,
) {
    tokio::spawn(async move {
        if let Some(tier) = switch {
            let announce = Feed::Switch {
                tier,
                path: path.clone(),
            };
            if sink.send(announce).is_err() {
                return;
            }
        }
        if let Err(err) = feed_file(&path, &sink, chunk_bytes).await {
            tracing::warn!("[broadcast] Serving {} failed: {}", path.display(), err);
            let _ = sink.send(Feed::Error(err));
        }
    });
}

async fn feed_file(path: &Path, sink: &FeedSender, chunk_bytes: usize) -> Result<(), EngineError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(EngineError::scratch_io)?;
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    loop {
        let n = file.read(&mut buf).await.map_err(EngineError::scratch_io)?;
        if n == 0 {
            return Ok(());
        }
        if sink.send(Feed::Bytes(buf[..n].to_vec())).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FeedReceiver, JobKey, Joined};
    use std::io::Write;

    fn queued(job: &Job) -> FeedReceiver {
        match job.subscribe() {
            Joined::Queued(rx) => rx,
            other => panic!("expected queued subscriber, got {:?}", other),
        }
    }

    fn collect(rx: &mut FeedReceiver) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(feed) = rx.try_recv() {
            match feed {
                Feed::Bytes(bytes) => out.extend(bytes),
                other => panic!("unexpected feed item {:?}", other),
            }
        }
        out
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn late_joiner_sees_contiguous_stream() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("song.mp3.part");
        let job = Job::new(JobKey::new("t1", QualityTier::Kbps320), dir.path().to_path_buf());
        let broadcaster = Broadcaster::new(vec![".part".to_string()], 3);

        let mut first = queued(&job);
        append(&part, b"hello ");
        job.mark_streaming(part.clone(), Some("mp3".to_string()));
        broadcaster.tick(&job).await.unwrap();

        let mut second = queued(&job);
        append(&part, b"world");
        broadcaster.tick(&job).await.unwrap();

        let done = dir.path().join("song.mp3");
        std::fs::rename(&part, &done).unwrap();
        append(&done, b"!");
        job.lock().complete = true;
        let total = broadcaster.drain(&job, Duration::from_millis(1)).await.unwrap();

        assert_eq!(total, 12);
        assert_eq!(collect(&mut first), b"hello world!");
        assert_eq!(collect(&mut second), b"hello world!");
        assert!(first.recv().await.is_none());
        assert_eq!(job.lock().file_path.as_deref(), Some(done.as_path()));
    }

    #[tokio::test]
    async fn subscribers_before_the_file_exists_go_live() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(JobKey::new("t1", QualityTier::Kbps128), dir.path().to_path_buf());
        let broadcaster = Broadcaster::new(Vec::new(), 1024);
        let _rx = queued(&job);
        let report = broadcaster.tick(&job).await.unwrap();
        assert_eq!(report, TickReport { cursor: 0, size: 0 });
        assert_eq!(job.lock().live.len(), 1);
    }

    #[tokio::test]
    async fn closed_subscribers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.flac");
        append(&file, b"abc");
        let job = Job::new(JobKey::new("t1", QualityTier::Lossless), dir.path().to_path_buf());
        job.mark_streaming(file.clone(), Some("flac".to_string()));
        let broadcaster = Broadcaster::new(Vec::new(), 1024);

        let gone = queued(&job);
        let mut kept = queued(&job);
        drop(gone);
        broadcaster.tick(&job).await.unwrap();
        assert_eq!(job.subscriber_count(), 1);
        assert_eq!(collect(&mut kept), b"abc");
    }

    #[tokio::test]
    async fn file_feed_announces_switch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cached.mp3");
        std::fs::write(&file, b"cached bytes").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        spawn_file_feed(file.clone(), Some(QualityTier::Kbps256), tx, 4);

        assert_eq!(
            rx.recv().await,
            Some(Feed::Switch {
                tier: QualityTier::Kbps256,
                path: file
            })
        );
        let mut out = Vec::new();
        while let Some(feed) = rx.recv().await {
            if let Feed::Bytes(bytes) = feed {
                out.extend(bytes);
            }
        }
        assert_eq!(out, b"cached bytes");
    }
}
