use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::catalog::TrackRecord;
use crate::config::BackendConfig;
use crate::error::EngineError;
use crate::quality::QualityTier;

/// Human-readable description of what the backend should fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    pub track_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
}

impl TrackDescriptor {
    pub fn from_record(record: &TrackRecord) -> Self {
        Self {
            track_id: record.id.clone(),
            title: record.title.clone(),
            artist: record.artist.clone(),
            album: record.album.clone(),
            duration_secs: record.duration_secs,
        }
    }

    /// Search query in "Artist - Title" form.
    pub fn query(&self) -> String {
        match &self.artist {
            Some(artist) if !artist.is_empty() => format!("{} - {}", artist, self.title),
            _ => self.title.clone(),
        }
    }
}

/// A launched backend: the child process plus a merged stream of its output lines.
pub struct BackendProcess {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
}

impl BackendProcess {
    /// Wraps a spawned child, capturing stdout and stderr line by line.
    pub fn from_child(mut child: Child) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx);
        }
        Self { child, lines: rx }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn into_parts(self) -> (Child, mpsc::UnboundedReceiver<String>) {
        (self.child, self.lines)
    }
}

/// Kills a backend together with anything it spawned.
///
/// Backends are started in their own process group on unix, so the whole
/// group goes down, not just the direct child.
pub async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let group = format!("-{}", pid);
            if let Err(e) = Command::new("kill").args(["-9", "--", &group]).output().await {
                tracing::warn!("[backend] Could not signal process group {}: {}", pid, e);
            }
        }

        #[cfg(target_os = "windows")]
        {
            let pid = pid.to_string();
            if let Err(e) = Command::new("taskkill")
                .args(["/PID", &pid, "/T", "/F"])
                .output()
                .await
            {
                tracing::warn!("[backend] Could not kill process tree {}: {}", pid, e);
            }
        }
    }
    let _ = child.kill().await;
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Something that can fetch one track at one exact tier into a directory.
///
/// Implementations never substitute another tier; the engine owns fallback.
/// Aborting a job kills the returned child's process group (see [`kill_tree`]),
/// so helpers it forks are stopped too as long as they stay in that group.
pub trait AcquisitionBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn launch(
        &self,
        track: &TrackDescriptor,
        tier: QualityTier,
        scratch_dir: &Path,
    ) -> Result<BackendProcess, EngineError>;
}

/// Runs an external program built from an argument template.
pub struct CommandBackend {
    config: BackendConfig,
}

impl CommandBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn build_args(&self, track: &TrackDescriptor, tier: QualityTier, scratch_dir: &Path) -> Vec<String> {
        let constraint = tier.constraint();
        let output = scratch_dir.to_string_lossy();
        let bitrate = constraint.bitrate_arg();
        let query = track.query();
        let replacements: [(&str, &str); 8] = [
            ("{query}", &query),
            ("{title}", &track.title),
            ("{artist}", track.artist.as_deref().unwrap_or("")),
            ("{album}", track.album.as_deref().unwrap_or("")),
            ("{format}", constraint.format),
            ("{bitrate}", &bitrate),
            ("{quality}", tier.as_str()),
            ("{output}", &output),
        ];
        self.config
            .args
            .iter()
            .map(|arg| {
                replacements
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }
}

impl AcquisitionBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn launch(
        &self,
        track: &TrackDescriptor,
        tier: QualityTier,
        scratch_dir: &Path,
    ) -> Result<BackendProcess, EngineError> {
        let args = self.build_args(track, tier, scratch_dir);
        tracing::info!(
            "[backend] Launching {} for {} at {} in {}",
            self.config.program,
            track.track_id,
            tier,
            scratch_dir.display()
        );
        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .current_dir(scratch_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .map_err(|e| {
                EngineError::BackendLaunch(format!("{}: {}", self.config.program, e))
            })?;
        Ok(BackendProcess::from_child(child))
    }
}

/// What a single output line tells us.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineSignal {
    Progress(f32),
    NotFound,
    Transient,
    ReportedQuality(QualityTier),
    Error,
    Other,
}

const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "notfound",
    "no results",
    "no matches",
    "no match found",
    "unavailable",
    "not available",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "rate limit",
    "too many requests",
    "http error 429",
    "http error 5",
    "temporarily",
    "try again",
    "network",
];

/// Heuristically classifies one line of backend output.
///
/// Transient markers take precedence over not-found markers so that a
/// "service temporarily unavailable" never ends up negative-cached.
pub fn classify_line(line: &str) -> LineSignal {
    let lower = line.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return LineSignal::Transient;
    }
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return LineSignal::NotFound;
    }
    if let Some(tier) = parse_reported_quality(&lower) {
        return LineSignal::ReportedQuality(tier);
    }
    if let Some(pct) = parse_percent(&lower) {
        return LineSignal::Progress(pct);
    }
    if lower.contains("error") {
        return LineSignal::Error;
    }
    LineSignal::Other
}

fn parse_reported_quality(lower: &str) -> Option<QualityTier> {
    let idx = lower.find("quality:")?;
    let rest = lower[idx + "quality:".len()..].trim_start();
    let token = rest.split_whitespace().next()?;
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric()).parse().ok()
}

fn parse_percent(lower: &str) -> Option<f32> {
    let end = lower.find('%')?;
    let head = &lower[..end];
    let start = head
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|i| i + 1)
        .unwrap_or(0);
    let value: f32 = head[start..].parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// Outcome flags accumulated from a backend's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSummary {
    pub not_found: bool,
    pub transient: bool,
    pub reported: Option<QualityTier>,
    pub progress: Option<f32>,
    pub last_error: Option<String>,
}

impl OutputSummary {
    /// Folds one line into the summary, returning its classification.
    pub fn observe(&mut self, line: &str) -> LineSignal {
        let signal = classify_line(line);
        match signal {
            LineSignal::Progress(pct) => self.progress = Some(pct),
            LineSignal::NotFound => {
                self.not_found = true;
                self.last_error = Some(line.trim().to_string());
            }
            LineSignal::Transient => {
                self.transient = true;
                self.last_error = Some(line.trim().to_string());
            }
            LineSignal::ReportedQuality(tier) => self.reported = Some(tier),
            LineSignal::Error => self.last_error = Some(line.trim().to_string()),
            LineSignal::Other => {}
        }
        signal
    }

    /// A not-found verdict is only trusted when nothing transient was seen.
    pub fn confirmed_not_found(&self) -> bool {
        self.not_found && !self.transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TrackDescriptor {
        TrackDescriptor {
            track_id: "t1".to_string(),
            title: "Blue".to_string(),
            artist: Some("Joni".to_string()),
            album: None,
            duration_secs: None,
        }
    }

    #[test]
    fn progress_lines_parse_percentages() {
        assert_eq!(classify_line("[download]  45.3% of 3.20MiB"), LineSignal::Progress(45.3));
        assert_eq!(classify_line("100%"), LineSignal::Progress(100.0));
        assert_eq!(classify_line("just chatter"), LineSignal::Other);
    }

    #[test]
    fn not_found_and_transient_markers() {
        assert_eq!(classify_line("ERROR: track not found"), LineSignal::NotFound);
        assert_eq!(classify_line("No results for query"), LineSignal::NotFound);
        assert_eq!(
            classify_line("ERROR: service temporarily unavailable"),
            LineSignal::Transient
        );
        assert_eq!(classify_line("HTTP Error 503: Service Unavailable"), LineSignal::Transient);
        assert_eq!(classify_line("ERROR: something odd"), LineSignal::Error);
    }

    #[test]
    fn reported_quality_is_picked_up() {
        assert_eq!(
            classify_line("[info] quality: 256"),
            LineSignal::ReportedQuality(QualityTier::Kbps256)
        );
        assert_eq!(
            classify_line("Quality: FLAC"),
            LineSignal::ReportedQuality(QualityTier::Lossless)
        );
    }

    #[test]
    fn summary_keeps_not_found_and_transient_apart() {
        let mut summary = OutputSummary::default();
        summary.observe("ERROR: not found");
        assert!(summary.confirmed_not_found());
        summary.observe("connection reset by peer");
        assert!(!summary.confirmed_not_found());
        assert_eq!(summary.last_error.as_deref(), Some("connection reset by peer"));
    }

    #[test]
    fn args_template_is_filled() {
        let config = BackendConfig {
            args: vec![
                "--fmt={format}".to_string(),
                "--br={bitrate}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "{query}".to_string(),
            ],
            ..BackendConfig::default()
        };
        let backend = CommandBackend::new(config);
        let args = backend.build_args(&descriptor(), QualityTier::Kbps320, Path::new("/tmp/job"));
        assert_eq!(args, vec!["--fmt=mp3", "--br=320k", "-o", "/tmp/job", "Joni - Blue"]);

        let args = backend.build_args(&descriptor(), QualityTier::Lossless, Path::new("/tmp/job"));
        assert_eq!(args[0], "--fmt=flac");
    }

    #[test]
    fn descriptor_carries_catalog_metadata() {
        let record = TrackRecord::new("t9", "Coyote")
            .with_artist("Joni")
            .with_album("Hejira")
            .with_duration(301.5);
        let track = TrackDescriptor::from_record(&record);
        assert_eq!(track.album.as_deref(), Some("Hejira"));
        assert_eq!(track.duration_secs, Some(301.5));
        assert_eq!(track.query(), "Joni - Coyote");

        let backend = CommandBackend::new(BackendConfig {
            args: vec!["{album}/{title}".to_string()],
            ..BackendConfig::default()
        });
        let args = backend.build_args(&track, QualityTier::Kbps128, Path::new("/tmp/job"));
        assert_eq!(args, vec!["Hejira/Coyote"]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_tree_stops_forked_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let backend = CommandBackend::new(BackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            ..BackendConfig::default()
        });
        let process = backend
            .launch(&descriptor(), QualityTier::Kbps128, dir.path())
            .unwrap();
        let (mut child, _lines) = process.into_parts();

        let mut helper = String::new();
        for _ in 0..100 {
            helper = std::fs::read_to_string(&pid_file).unwrap_or_default();
            if helper.ends_with('\n') {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let helper = helper.trim().to_string();
        assert!(!helper.is_empty());

        kill_tree(&mut child).await;
        // An unreaped zombie counts as stopped.
        let status = format!("/proc/{}/status", helper);
        let mut alive = true;
        for _ in 0..100 {
            alive = std::fs::read_to_string(&status)
                .map(|s| !s.lines().any(|l| l.starts_with("State:") && l.contains('Z')))
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!alive, "helper {} survived", helper);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(BackendConfig {
            program: "/definitely/not/a/real/binary".to_string(),
            args: Vec::new(),
            ..BackendConfig::default()
        });
        let result = backend.launch(&descriptor(), QualityTier::Kbps128, dir.path());
        assert!(matches!(result, Err(EngineError::BackendLaunch(_))));
    }

    #[tokio::test]
    async fn output_lines_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(BackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 10%; echo oops >&2".to_string()],
            ..BackendConfig::default()
        });
        let process = backend
            .launch(&descriptor(), QualityTier::Kbps128, dir.path())
            .unwrap();
        let (mut child, mut lines) = process.into_parts();
        assert!(child.wait().await.unwrap().success());
        let mut seen = Vec::new();
        while let Some(line) = lines.recv().await {
            seen.push(line);
        }
        seen.sort();
        assert_eq!(seen, vec!["10%".to_string(), "oops".to_string()]);
    }
}
