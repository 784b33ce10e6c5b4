//! Incremental parser for youtube-dl / yt-dlp output
//!
//! Each stdout line becomes a [`ProgressEvent`]; each stderr line becomes a
//! [`StderrClass`]. The parser keeps just enough state to correlate lines that
//! describe the same file: a download is only confirmed once a `Destination:`
//! line has been followed by a `100%` line, or by a merger announcing the
//! final container.
//!
//! Recognised stdout grammar:
//!
//! ```text
//! [download] Destination: <path>
//! [download]  45.2% of ~10.00MiB at 1.20MiB/s ETA 00:05
//! [download] 100% of 2.06MiB in 00:02
//! [download] <path> has already been downloaded
//! [download] File is larger than max-filesize (...)
//! [download] Downloading video 3 of 10
//! [Merger] Merging formats into "<path>"
//! [ffmpeg] ... / [ExtractAudio] ... / Deleting original file ...
//! [<extractor>] <id>: Downloading webpage
//! {"id": ..., "title": ...}            (--dump-json, simulated modes)
//! ```

use super::error::DownloadError;
use super::progress::{ProgressEvent, Stage, VideoSignal};
use crate::media::VideoMetadata;
use regex::{Regex, RegexSet};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

static DESTINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").expect("Invalid regex pattern")
});

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[download\]\s+(\d+(?:\.\d+)?)%(?:\s+of\s+~?\s*(\S+))?(?:\s+at\s+(\S+))?(?:\s+ETA\s+(\S+))?(?:\s+in\s+(\S+))?",
    )
    .expect("Invalid regex pattern")
});

static ALREADY_DOWNLOADED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?) has already been downloaded").expect("Invalid regex pattern")
});

static MERGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"\s*$"#).expect("Invalid regex pattern")
});

static FILESIZE_ABORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+File is (?:larger|smaller) than (?:max|min)-filesize")
        .expect("Invalid regex pattern")
});

static PLAYLIST_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+Downloading (?:video|item) (\d+) of (\d+)")
        .expect("Invalid regex pattern")
});

static POST_PROCESSOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\[(?:ffmpeg|Merger|ExtractAudio|EmbedThumbnail|EmbedSubtitle|Metadata|Fixup\w*|VideoConvertor|VideoRemuxer|SponsorBlock|ModifyChapters|MoveFiles|ThumbnailsConvertor)\]|Deleting original file)",
    )
    .expect("Invalid regex pattern")
});

static EXTRACTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([\w:]+)\]\s+").expect("Invalid regex pattern"));

/// Stem suffix of a single-format fragment awaiting a merge (`video.f137.mp4`)
static FORMAT_FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.f\d+$").expect("Invalid regex pattern"));

static SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?i?B)$").expect("Invalid regex pattern")
});

/// Default stderr patterns treated as benign noise
pub fn default_ignorable_patterns() -> Vec<String> {
    [
        r"(?i)sign in to confirm your age",
        r"(?i)this video may be inappropriate for some users",
        r"(?i)premieres in \d+",
        r"(?i)this live event will begin in",
        r"(?i)there are no annotations to write",
        r"(?i)there are no subtitles for the requested languages",
        r"(?i)video doesn't have subtitles",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Default stderr patterns treated as transient network failures
pub fn default_network_patterns() -> Vec<String> {
    [
        r"(?i)connection reset by peer",
        r"(?i)timed out",
        r"(?i)temporary failure in name resolution",
        r"(?i)network is unreachable",
        r"(?i)unable to download webpage: <urlopen error",
        r"(?i)http error 50[234]",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Operator-tunable stderr allow-lists
#[derive(Debug, Clone)]
pub struct StderrFilters {
    ignorable: RegexSet,
    network: RegexSet,
}

impl StderrFilters {
    /// Compile the pattern lists, naming the first invalid pattern on failure
    pub fn new(ignorable: &[String], network: &[String]) -> Result<Self, DownloadError> {
        Ok(Self {
            ignorable: compile_set(ignorable)?,
            network: compile_set(network)?,
        })
    }

    pub fn is_ignorable(&self, line: &str) -> bool {
        self.ignorable.is_match(line)
    }

    pub fn is_network_error(&self, line: &str) -> bool {
        self.network.is_match(line)
    }
}

impl Default for StderrFilters {
    fn default() -> Self {
        Self::new(&default_ignorable_patterns(), &default_network_patterns()).unwrap_or_else(|e| {
            tracing::error!("Built-in output filters failed to compile: {}", e);
            Self {
                ignorable: RegexSet::empty(),
                network: RegexSet::empty(),
            }
        })
    }
}

fn compile_set(patterns: &[String]) -> Result<RegexSet, DownloadError> {
    for pattern in patterns {
        if let Err(source) = Regex::new(pattern) {
            return Err(DownloadError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            });
        }
    }
    RegexSet::new(patterns).map_err(|source| DownloadError::InvalidPattern {
        pattern: patterns.join(" | "),
        source,
    })
}

/// Classification of one stderr line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrClass {
    /// Matched an operator allow-list entry
    Ignorable,
    Warning(String),
    Error(String),
    DebugNoise,
    /// Transient failure; handled like a stall
    NetworkError(String),
}

/// Parse a human-readable size such as `2.06MiB` into bytes
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE.captures(text.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    let multiplier: f64 = match &caps[2] {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

fn is_format_fragment(path: &Path) -> bool {
    path.file_stem()
        .map(|stem| FORMAT_FRAGMENT.is_match(&stem.to_string_lossy()))
        .unwrap_or(false)
}

fn fill_path(event: &mut ProgressEvent, path: &Path) {
    let meta = VideoMetadata::from_path(path);
    event.path = meta.path;
    event.filename = meta.filename;
    event.extension = meta.extension;
}

/// Stateful line parser for one job attempt
#[derive(Debug)]
pub struct OutputParser {
    simulated: bool,
    filters: Arc<StderrFilters>,
    last_destination: Option<PathBuf>,
    last_size: Option<String>,
    confirmed: HashSet<PathBuf>,
    playlist_index: Option<u32>,
    playlist_size: Option<u32>,
}

impl OutputParser {
    pub fn new(simulated: bool, filters: Arc<StderrFilters>) -> Self {
        Self {
            simulated,
            filters,
            last_destination: None,
            last_size: None,
            confirmed: HashSet::new(),
            playlist_index: None,
            playlist_size: None,
        }
    }

    pub fn playlist_size(&self) -> Option<u32> {
        self.playlist_size
    }

    /// Classify one stdout line
    pub fn parse_stdout_line(&mut self, line: &str) -> ProgressEvent {
        let line = line.trim_end();
        let mut event = ProgressEvent::default();
        if line.is_empty() {
            return event;
        }

        if line.starts_with('{') {
            return self.parse_json_line(line);
        }

        if let Some(caps) = PLAYLIST_POSITION.captures(line) {
            self.playlist_index = caps[1].parse().ok();
            self.playlist_size = caps[2].parse().ok();
            event.stage = Some(Stage::Pending);
            event.playlist_index = self.playlist_index;
            event.playlist_size = self.playlist_size;
            return event;
        }

        if let Some(caps) = DESTINATION.captures(line) {
            let path = PathBuf::from(caps[1].trim());
            event.stage = Some(Stage::Downloading);
            fill_path(&mut event, &path);
            self.last_destination = Some(path);
            self.last_size = None;
            return event;
        }

        if let Some(caps) = ALREADY_DOWNLOADED.captures(line) {
            let path = PathBuf::from(caps[1].trim());
            event.stage = Some(Stage::AlreadyDone);
            fill_path(&mut event, &path);
            if self.confirmed.insert(path.clone()) {
                event.video = Some(VideoSignal::Old(self.metadata_for(&path, None)));
            }
            return event;
        }

        if FILESIZE_ABORT.is_match(line) {
            event.stage = Some(Stage::FilesizeAbort);
            return event;
        }

        if let Some(caps) = PROGRESS.captures(line) {
            let percent: f32 = caps[1].parse().unwrap_or(0.0);
            event.stage = Some(Stage::Downloading);
            event.percent = Some(percent.clamp(0.0, 100.0));
            event.size = caps.get(2).map(|m| m.as_str().to_string());
            event.speed = caps.get(3).map(|m| m.as_str().to_string());
            event.eta = caps.get(4).map(|m| m.as_str().to_string());
            event.playlist_index = self.playlist_index;
            event.playlist_size = self.playlist_size;
            if event.size.is_some() {
                self.last_size = event.size.clone();
            }

            if percent >= 100.0 {
                if let Some(path) = self.last_destination.clone() {
                    fill_path(&mut event, &path);
                    if !is_format_fragment(&path) && self.confirmed.insert(path.clone()) {
                        let size = self.last_size.as_deref().and_then(parse_size);
                        event.video = Some(VideoSignal::New(self.metadata_for(&path, size)));
                    }
                }
            }
            return event;
        }

        if let Some(caps) = MERGER.captures(line) {
            let path = PathBuf::from(caps[1].trim());
            event.stage = Some(Stage::PostProcessing);
            fill_path(&mut event, &path);
            if self.confirmed.insert(path.clone()) {
                event.video = Some(VideoSignal::New(self.metadata_for(&path, None)));
            }
            self.last_destination = Some(path);
            return event;
        }

        if POST_PROCESSOR.is_match(line) {
            event.stage = Some(Stage::PostProcessing);
            return event;
        }

        if EXTRACTOR.is_match(line) {
            event.stage = Some(if self.simulated {
                Stage::Checking
            } else {
                Stage::Pending
            });
        }

        event
    }

    fn metadata_for(&self, path: &Path, size: Option<u64>) -> VideoMetadata {
        let mut meta = VideoMetadata::from_path(path);
        meta.name = meta.filename.clone();
        meta.file_size = size;
        meta.playlist_index = self.playlist_index;
        meta
    }

    fn parse_json_line(&mut self, line: &str) -> ProgressEvent {
        let mut event = ProgressEvent::default();
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::trace!("Ignoring malformed JSON line: {}", e);
                return event;
            }
        };

        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let number = |key: &str| value.get(key).and_then(|v| v.as_u64());

        let path = text("_filename").or_else(|| text("filename")).map(PathBuf::from);
        let mut meta = match path {
            Some(ref p) => VideoMetadata::from_path(p),
            None => VideoMetadata::default(),
        };
        // Simulated downloads report where the file would go, not where it is
        meta.path = None;
        meta.name = text("title");
        meta.url = text("webpage_url").or_else(|| text("original_url"));
        meta.source_id = text("id");
        if meta.extension.is_none() {
            meta.extension = text("ext");
        }
        meta.file_size = number("filesize").or_else(|| number("filesize_approx"));
        meta.playlist_index = number("playlist_index").map(|n| n as u32);

        if let Some(size) = number("n_entries").or_else(|| number("playlist_count")) {
            self.playlist_size = Some(size as u32);
        }
        self.playlist_index = meta.playlist_index.or(self.playlist_index);

        event.stage = Some(Stage::Checking);
        event.filename = meta.filename.clone();
        event.extension = meta.extension.clone();
        event.playlist_index = self.playlist_index;
        event.playlist_size = self.playlist_size;
        event.video = Some(VideoSignal::Simulated(meta));
        event
    }

    /// Classify one stderr line
    pub fn parse_stderr_line(&self, line: &str) -> StderrClass {
        let line = line.trim();
        if line.is_empty() || line.starts_with("[debug]") {
            return StderrClass::DebugNoise;
        }
        if self.filters.is_ignorable(line) {
            return StderrClass::Ignorable;
        }
        if self.filters.is_network_error(line) {
            return StderrClass::NetworkError(line.to_string());
        }
        if let Some(rest) = line.strip_prefix("WARNING:") {
            return StderrClass::Warning(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix("ERROR:") {
            return StderrClass::Error(rest.trim().to_string());
        }
        if line.to_lowercase().contains("error") {
            return StderrClass::Error(line.to_string());
        }
        StderrClass::DebugNoise
    }
}
