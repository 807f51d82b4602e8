use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Discrete audio quality levels, declared best first.
///
/// The derived `Ord` follows declaration order, so `Lossless < Kbps320`.
/// Use [`compare`] when "higher quality sorts greater" is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "lossless")]
    Lossless,
    #[serde(rename = "320")]
    Kbps320,
    #[serde(rename = "256")]
    Kbps256,
    #[serde(rename = "192")]
    Kbps192,
    #[serde(rename = "128")]
    Kbps128,
}

/// The full ladder, best first.
pub const LADDER: [QualityTier; 5] = [
    QualityTier::Lossless,
    QualityTier::Kbps320,
    QualityTier::Kbps256,
    QualityTier::Kbps192,
    QualityTier::Kbps128,
];

impl QualityTier {
    /// Position on the ladder, 0 being the best tier.
    pub fn rank(self) -> usize {
        match self {
            QualityTier::Lossless => 0,
            QualityTier::Kbps320 => 1,
            QualityTier::Kbps256 => 2,
            QualityTier::Kbps192 => 3,
            QualityTier::Kbps128 => 4,
        }
    }

    pub fn is_lossless(self) -> bool {
        self == QualityTier::Lossless
    }

    /// Nominal bitrate in kbps. Lossless has no fixed rate.
    pub fn bitrate_kbps(self) -> Option<u32> {
        match self {
            QualityTier::Lossless => None,
            QualityTier::Kbps320 => Some(320),
            QualityTier::Kbps256 => Some(256),
            QualityTier::Kbps192 => Some(192),
            QualityTier::Kbps128 => Some(128),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Lossless => "lossless",
            QualityTier::Kbps320 => "320",
            QualityTier::Kbps256 => "256",
            QualityTier::Kbps192 => "192",
            QualityTier::Kbps128 => "128",
        }
    }

    /// Exact-match constraint handed to the acquisition backend.
    pub fn constraint(self) -> QualityConstraint {
        match self {
            QualityTier::Lossless => QualityConstraint {
                format: "flac",
                bitrate: None,
            },
            other => QualityConstraint {
                format: "mp3",
                bitrate: other.bitrate_kbps(),
            },
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized
            .trim_end_matches("kbps")
            .trim_end_matches('k')
            .trim();
        match normalized {
            "lossless" | "flac" | "hi" | "high" | "hifi" => Ok(QualityTier::Lossless),
            "320" => Ok(QualityTier::Kbps320),
            "256" => Ok(QualityTier::Kbps256),
            "192" => Ok(QualityTier::Kbps192),
            "128" => Ok(QualityTier::Kbps128),
            _ => Err(format!("Unknown quality tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityConstraint {
    pub format: &'static str,
    pub bitrate: Option<u32>,
}

impl QualityConstraint {
    /// Bitrate argument as backends usually expect it ("320k"), or "0" (best) for lossless.
    pub fn bitrate_arg(&self) -> String {
        match self.bitrate {
            Some(kbps) => format!("{}k", kbps),
            None => "0".to_string(),
        }
    }
}

/// Orders tiers by quality, higher quality comparing greater.
pub fn compare(a: QualityTier, b: QualityTier) -> Ordering {
    b.rank().cmp(&a.rank())
}

/// Ordered tiers to try for `requested`, starting with `requested` itself.
///
/// Lossless gets no substitutes. Every other tier gets the whole ladder,
/// nearest rung first, ties going to the higher tier.
pub fn fallback_chain(requested: QualityTier) -> Vec<QualityTier> {
    if requested.is_lossless() {
        return vec![requested];
    }
    let origin = requested.rank() as isize;
    let mut chain: Vec<QualityTier> = LADDER.to_vec();
    chain.sort_by_key(|tier| {
        let rank = tier.rank() as isize;
        let distance = (rank - origin).unsigned_abs();
        // Lower rank is higher quality, so it wins ties.
        (distance, rank)
    });
    chain
}

/// What a file extension says about the quality of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityHint {
    Lossless,
    Lossy,
    Unknown,
}

const LOSSLESS_EXTENSIONS: &[&str] = &["flac", "wav", "alac", "aiff", "aif", "ape", "wv"];
const LOSSY_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "webm"];

/// Strips a known in-progress suffix (".part", ".download", ...) from a file name.
pub fn strip_in_progress_suffix<'a>(file_name: &'a str, suffixes: &[String]) -> (&'a str, bool) {
    for suffix in suffixes {
        if let Some(stripped) = file_name.strip_suffix(suffix.as_str()) {
            return (stripped, true);
        }
    }
    (file_name, false)
}

/// Extension of the audio payload, ignoring any in-progress suffix.
pub fn audio_extension(file_name: &str, suffixes: &[String]) -> Option<String> {
    let (name, _) = strip_in_progress_suffix(file_name, suffixes);
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    if LOSSLESS_EXTENSIONS.contains(&ext.as_str()) || LOSSY_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

pub fn hint_from_extension(ext: &str) -> QualityHint {
    let ext = ext.to_ascii_lowercase();
    if LOSSLESS_EXTENSIONS.contains(&ext.as_str()) {
        QualityHint::Lossless
    } else if LOSSY_EXTENSIONS.contains(&ext.as_str()) {
        QualityHint::Lossy
    } else {
        QualityHint::Unknown
    }
}

/// MIME type for an audio file, by extension first and tier otherwise.
pub fn content_type(extension: Option<&str>, tier: QualityTier) -> &'static str {
    match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("flac") => "audio/flac",
        Some("mp3") => "audio/mpeg",
        Some("m4a" | "aac" | "alac") => "audio/mp4",
        Some("ogg" | "opus") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("wav") => "audio/wav",
        Some("aiff" | "aif") => "audio/aiff",
        _ if tier.is_lossless() => "audio/flac",
        _ => "audio/mpeg",
    }
}

const MB: u64 = 1024 * 1024;

// Size thresholds for a ~4 minute track, used when the duration is unknown.
const SIZE_TABLE: [(u64, QualityTier); 4] = [
    (20 * MB, QualityTier::Lossless),
    (8 * MB + 400 * 1024, QualityTier::Kbps320),
    (6 * MB + 700 * 1024, QualityTier::Kbps256),
    (5 * MB, QualityTier::Kbps192),
];

/// Estimates the tier of a finished file from its size.
pub fn estimate_from_size(size_bytes: u64, duration_secs: Option<f64>) -> QualityTier {
    if let Some(secs) = duration_secs.filter(|s| *s > 1.0) {
        let kbps = (size_bytes as f64 * 8.0) / secs / 1000.0;
        return snap_bitrate(kbps);
    }
    for (threshold, tier) in SIZE_TABLE {
        if size_bytes >= threshold {
            return tier;
        }
    }
    QualityTier::Kbps128
}

/// Snaps a measured bitrate to the nearest ladder rung.
pub fn snap_bitrate(kbps: f64) -> QualityTier {
    if kbps >= 700.0 {
        return QualityTier::Lossless;
    }
    LADDER
        .iter()
        .filter_map(|tier| tier.bitrate_kbps().map(|rate| (*tier, rate)))
        .min_by(|(_, a), (_, b)| {
            let da = (kbps - *a as f64).abs();
            let db = (kbps - *b as f64).abs();
            da.partial_cmp(&db).unwrap_or(Ordering::Equal)
        })
        .map(|(tier, _)| tier)
        .unwrap_or(QualityTier::Kbps128)
}

/// Determines the achieved tier: a backend-reported value wins, then the
/// container extension, then the size estimate.
pub fn classify_achieved(
    reported: Option<QualityTier>,
    hint: QualityHint,
    size_bytes: u64,
    duration_secs: Option<f64>,
) -> QualityTier {
    if let Some(tier) = reported {
        return tier;
    }
    match hint {
        QualityHint::Lossless => QualityTier::Lossless,
        QualityHint::Lossy => {
            // Lossy containers never count as lossless, whatever their size.
            match estimate_from_size(size_bytes, duration_secs) {
                QualityTier::Lossless => QualityTier::Kbps320,
                tier => tier,
            }
        }
        QualityHint::Unknown => estimate_from_size(size_bytes, duration_secs),
    }
}
