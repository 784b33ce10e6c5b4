//! Media database view consumed by the download engine
//!
//! The engine never owns channels, playlists, folders or videos. It reads a
//! small projection of each target through [`MediaRepository`] and writes back
//! the outcome of every job (downloaded, missing, errors, warnings).

pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identifier of a media entity inside the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of media entity a target refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Channel,
    Playlist,
    Folder,
}

impl MediaKind {
    /// Channels, playlists and folders hold other targets
    pub fn is_container(self) -> bool {
        !matches!(self, MediaKind::Video)
    }
}

/// Per-target flags read during queue admission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFlags {
    /// Downloads disabled for this target (and its videos)
    pub disabled: bool,
    /// System folder excluded from recursive operations
    pub private: bool,
    /// Metadata already fetched by an earlier simulated download
    pub checked: bool,
    /// Video file already present on disk
    pub downloaded: bool,
    /// Video is a live broadcast happening right now
    pub live: bool,
    /// Destination lives on an external directory that is currently unavailable
    pub external_dir_missing: bool,
}

/// Read-only projection of a media entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub id: TargetId,
    pub kind: MediaKind,
    pub name: String,
    pub url: Option<String>,
    pub parent: Option<TargetId>,
    pub children: Vec<TargetId>,
    /// Directory the downloader writes into
    pub destination: PathBuf,
    /// Container that owns `destination` when it is shared with other containers
    pub dest_master: Option<TargetId>,
    pub flags: TargetFlags,
}

impl TargetInfo {
    /// True if this target writes into a directory owned by another container
    pub fn is_slave(&self) -> bool {
        self.dest_master.is_some_and(|master| master != self.id)
    }
}

/// Metadata of a video announced by the downloader
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub name: Option<String>,
    pub url: Option<String>,
    /// Extractor-specific video id (e.g. the YouTube id)
    pub source_id: Option<String>,
    pub path: Option<PathBuf>,
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub file_size: Option<u64>,
    pub playlist_index: Option<u32>,
}

impl VideoMetadata {
    /// Build metadata from the final path of a downloaded file
    pub fn from_path(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            filename: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
            extension: path
                .extension()
                .map(|s| s.to_string_lossy().into_owned()),
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Media target not found: {0}")]
    NotFound(TargetId),

    #[error("Cannot store a video inside {0}: not a container or video")]
    InvalidContainer(TargetId),

    #[error("Failed to access library file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse library file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistent media database as seen by the download engine
///
/// Implementations must be cheap to call from many workers at once.
pub trait MediaRepository: Send + Sync {
    fn resolve_target(&self, id: TargetId) -> Option<TargetInfo>;

    /// Create a video under `container`, or update the matching one.
    ///
    /// When `container` is itself a video, that video is updated in place.
    fn create_or_update_video(
        &self,
        container: TargetId,
        meta: &VideoMetadata,
    ) -> Result<TargetId, RepositoryError>;

    fn mark_downloaded(&self, id: TargetId, is_new: bool);

    fn mark_missing(&self, id: TargetId);

    fn record_error(&self, id: TargetId, message: &str);

    fn record_warning(&self, id: TargetId, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_metadata_from_path() {
        let meta = VideoMetadata::from_path(Path::new("/x/y.mp4"));
        assert_eq!(meta.filename.as_deref(), Some("y"));
        assert_eq!(meta.extension.as_deref(), Some("mp4"));
        assert_eq!(meta.path, Some(PathBuf::from("/x/y.mp4")));
    }

    #[test]
    fn test_is_slave() {
        let mut info = TargetInfo {
            id: TargetId(2),
            kind: MediaKind::Channel,
            name: "b".to_string(),
            url: None,
            parent: None,
            children: Vec::new(),
            destination: PathBuf::from("/dl"),
            dest_master: None,
            flags: TargetFlags::default(),
        };
        assert!(!info.is_slave());
        info.dest_master = Some(TargetId(2));
        assert!(!info.is_slave());
        info.dest_master = Some(TargetId(1));
        assert!(info.is_slave());
    }
}
