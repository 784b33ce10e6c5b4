//! In-memory media library with JSON persistence
//!
//! Used by the command line front-end as its library and by tests as the
//! repository collaborator.

use super::{
    MediaKind, MediaRepository, RepositoryError, TargetFlags, TargetId, TargetInfo, VideoMetadata,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stored state of a single media entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: TargetId,
    pub kind: MediaKind,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub parent: Option<TargetId>,
    #[serde(default)]
    pub children: Vec<TargetId>,
    pub destination: PathBuf,
    #[serde(default)]
    pub dest_master: Option<TargetId>,
    #[serde(default)]
    pub flags: TargetFlags,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Downloaded during the most recent operation
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub missing: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl MediaRecord {
    fn info(&self) -> TargetInfo {
        TargetInfo {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            url: self.url.clone(),
            parent: self.parent,
            children: self.children.clone(),
            destination: self.destination.clone(),
            dest_master: self.dest_master,
            flags: self.flags.clone(),
        }
    }

    fn matches(&self, meta: &VideoMetadata) -> bool {
        if let (Some(a), Some(b)) = (&self.source_id, &meta.source_id) {
            if a == b {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (&self.url, &meta.url) {
            if a == b {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (&self.file, &meta.path) {
            if a == b {
                return true;
            }
        }
        false
    }

    fn apply(&mut self, meta: &VideoMetadata) {
        if let Some(ref path) = meta.path {
            self.file = Some(path.clone());
        }
        if meta.file_size.is_some() {
            self.file_size = meta.file_size;
        }
        if self.url.is_none() {
            self.url = meta.url.clone();
        }
        if self.source_id.is_none() {
            self.source_id = meta.source_id.clone();
        }
        self.flags.checked = true;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Library {
    next_id: u64,
    records: BTreeMap<TargetId, MediaRecord>,
}

impl Library {
    fn insert(
        &mut self,
        kind: MediaKind,
        name: &str,
        url: Option<String>,
        parent: Option<TargetId>,
        destination: PathBuf,
    ) -> TargetId {
        self.next_id += 1;
        let id = TargetId(self.next_id);
        self.records.insert(
            id,
            MediaRecord {
                id,
                kind,
                name: name.to_string(),
                url,
                parent,
                children: Vec::new(),
                destination,
                dest_master: None,
                flags: TargetFlags::default(),
                source_id: None,
                file: None,
                file_size: None,
                is_new: false,
                missing: false,
                errors: Vec::new(),
                warnings: Vec::new(),
            },
        );
        if let Some(parent_id) = parent {
            if let Some(parent) = self.records.get_mut(&parent_id) {
                parent.children.push(id);
            }
        }
        id
    }
}

/// Thread-safe media library kept in memory
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    library: RwLock<Library>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Library> {
        self.library.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Library> {
        self.library.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_folder(
        &self,
        name: &str,
        parent: Option<TargetId>,
        destination: impl Into<PathBuf>,
    ) -> TargetId {
        self.write()
            .insert(MediaKind::Folder, name, None, parent, destination.into())
    }

    pub fn add_channel(
        &self,
        name: &str,
        url: &str,
        parent: Option<TargetId>,
        destination: impl Into<PathBuf>,
    ) -> TargetId {
        self.write().insert(
            MediaKind::Channel,
            name,
            Some(url.to_string()),
            parent,
            destination.into(),
        )
    }

    pub fn add_playlist(
        &self,
        name: &str,
        url: &str,
        parent: Option<TargetId>,
        destination: impl Into<PathBuf>,
    ) -> TargetId {
        self.write().insert(
            MediaKind::Playlist,
            name,
            Some(url.to_string()),
            parent,
            destination.into(),
        )
    }

    /// Add a video; `url` may be empty for videos known only by file
    pub fn add_video(
        &self,
        name: &str,
        url: Option<&str>,
        parent: Option<TargetId>,
        destination: impl Into<PathBuf>,
    ) -> TargetId {
        self.write().insert(
            MediaKind::Video,
            name,
            url.map(str::to_string),
            parent,
            destination.into(),
        )
    }

    /// Modify the admission flags of a target
    pub fn set_flags(&self, id: TargetId, update: impl FnOnce(&mut TargetFlags)) {
        if let Some(record) = self.write().records.get_mut(&id) {
            update(&mut record.flags);
        }
    }

    /// Make `slave` write into the destination owned by `master`
    pub fn share_destination(&self, master: TargetId, slave: TargetId) {
        let mut library = self.write();
        let Some(destination) = library.records.get(&master).map(|r| r.destination.clone()) else {
            return;
        };
        if let Some(record) = library.records.get_mut(&master) {
            record.dest_master = Some(master);
        }
        if let Some(record) = library.records.get_mut(&slave) {
            record.dest_master = Some(master);
            record.destination = destination;
        }
    }

    pub fn record(&self, id: TargetId) -> Option<MediaRecord> {
        self.read().records.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<MediaRecord> {
        self.read().records.values().cloned().collect()
    }

    /// Targets without a parent, in creation order
    pub fn roots(&self) -> Vec<TargetId> {
        self.read()
            .records
            .values()
            .filter(|r| r.parent.is_none())
            .map(|r| r.id)
            .collect()
    }

    /// Find a container or video by its URL
    pub fn find_by_url(&self, url: &str) -> Option<TargetId> {
        self.read()
            .records
            .values()
            .find(|r| r.url.as_deref() == Some(url))
            .map(|r| r.id)
    }

    /// Clear per-operation state (new flags, errors, warnings)
    pub fn reset_operation_state(&self) {
        for record in self.write().records.values_mut() {
            record.is_new = false;
            record.errors.clear();
            record.warnings.clear();
        }
    }

    /// Load a library previously written by [`InMemoryRepository::save`]
    ///
    /// A missing file yields an empty library.
    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = std::fs::read_to_string(path)?;
        let library: Library = serde_json::from_str(&json)?;
        tracing::debug!(
            "Loaded {} media records from {}",
            library.records.len(),
            path.display()
        );
        Ok(Self {
            library: RwLock::new(library),
        })
    }

    /// Persist the library as JSON (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(&*self.read())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl MediaRepository for InMemoryRepository {
    fn resolve_target(&self, id: TargetId) -> Option<TargetInfo> {
        self.read().records.get(&id).map(MediaRecord::info)
    }

    fn create_or_update_video(
        &self,
        container: TargetId,
        meta: &VideoMetadata,
    ) -> Result<TargetId, RepositoryError> {
        let mut library = self.write();
        let parent = library
            .records
            .get(&container)
            .ok_or(RepositoryError::NotFound(container))?
            .clone();

        if parent.kind == MediaKind::Video {
            if let Some(record) = library.records.get_mut(&container) {
                record.apply(meta);
            }
            return Ok(container);
        }

        let existing = parent.children.iter().copied().find(|child| {
            library
                .records
                .get(child)
                .is_some_and(|r| r.kind == MediaKind::Video && r.matches(meta))
        });
        if let Some(id) = existing {
            if let Some(record) = library.records.get_mut(&id) {
                record.apply(meta);
            }
            return Ok(id);
        }

        let name = meta
            .name
            .clone()
            .or_else(|| meta.filename.clone())
            .unwrap_or_else(|| "Unnamed video".to_string());
        let id = library.insert(
            MediaKind::Video,
            &name,
            meta.url.clone(),
            Some(container),
            parent.destination.clone(),
        );
        if let Some(record) = library.records.get_mut(&id) {
            record.apply(meta);
        }
        tracing::debug!(video = %id, container = %container, "Created video '{}'", name);
        Ok(id)
    }

    fn mark_downloaded(&self, id: TargetId, is_new: bool) {
        if let Some(record) = self.write().records.get_mut(&id) {
            record.flags.downloaded = true;
            record.is_new = is_new;
            record.missing = false;
        }
    }

    fn mark_missing(&self, id: TargetId) {
        if let Some(record) = self.write().records.get_mut(&id) {
            record.flags.downloaded = false;
            record.missing = true;
        }
    }

    fn record_error(&self, id: TargetId, message: &str) {
        if let Some(record) = self.write().records.get_mut(&id) {
            record.errors.push(message.to_string());
        }
    }

    fn record_warning(&self, id: TargetId, message: &str) {
        if let Some(record) = self.write().records.get_mut(&id) {
            record.warnings.push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_children_are_linked() {
        let repo = InMemoryRepository::new();
        let folder = repo.add_folder("Music", None, "/dl/music");
        let channel = repo.add_channel("Chan", "https://example.com/c", Some(folder), "/dl/music/chan");

        let info = repo.resolve_target(folder).unwrap();
        assert_eq!(info.children, vec![channel]);
        assert_eq!(repo.resolve_target(channel).unwrap().parent, Some(folder));
        assert_eq!(repo.roots(), vec![folder]);
    }

    #[test]
    fn test_create_or_update_video_reuses_match() {
        let repo = InMemoryRepository::new();
        let channel = repo.add_channel("Chan", "https://example.com/c", None, "/dl/chan");

        let meta = VideoMetadata::from_path(Path::new("/dl/chan/a.mp4"));
        let first = repo.create_or_update_video(channel, &meta).unwrap();
        let second = repo.create_or_update_video(channel, &meta).unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.resolve_target(channel).unwrap().children.len(), 1);
        assert_eq!(repo.record(first).unwrap().name, "a");
    }

    #[test]
    fn test_create_or_update_on_video_updates_in_place() {
        let repo = InMemoryRepository::new();
        let video = repo.add_video("Clip", Some("https://example.com/v"), None, "/dl");

        let mut meta = VideoMetadata::from_path(Path::new("/dl/clip.webm"));
        meta.file_size = Some(42);
        let id = repo.create_or_update_video(video, &meta).unwrap();

        assert_eq!(id, video);
        let record = repo.record(video).unwrap();
        assert_eq!(record.file, Some(PathBuf::from("/dl/clip.webm")));
        assert_eq!(record.file_size, Some(42));
        assert!(record.flags.checked);
    }

    #[test]
    fn test_create_or_update_unknown_container() {
        let repo = InMemoryRepository::new();
        let result = repo.create_or_update_video(TargetId(99), &VideoMetadata::default());
        assert!(matches!(result, Err(RepositoryError::NotFound(TargetId(99)))));
    }

    #[test]
    fn test_mark_downloaded_and_missing() {
        let repo = InMemoryRepository::new();
        let video = repo.add_video("v", Some("https://example.com/v"), None, "/dl");

        repo.mark_downloaded(video, true);
        let record = repo.record(video).unwrap();
        assert!(record.flags.downloaded);
        assert!(record.is_new);

        repo.mark_missing(video);
        let record = repo.record(video).unwrap();
        assert!(!record.flags.downloaded);
        assert!(record.missing);
    }

    #[test]
    fn test_share_destination() {
        let repo = InMemoryRepository::new();
        let master = repo.add_channel("A", "https://example.com/a", None, "/dl/shared");
        let slave = repo.add_channel("B", "https://example.com/b", None, "/dl/b");

        repo.share_destination(master, slave);

        let slave_info = repo.resolve_target(slave).unwrap();
        assert!(slave_info.is_slave());
        assert_eq!(slave_info.destination, PathBuf::from("/dl/shared"));
        assert!(!repo.resolve_target(master).unwrap().is_slave());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let repo = InMemoryRepository::new();
        let channel = repo.add_channel("Chan", "https://example.com/c", None, "/dl/chan");
        repo.set_flags(channel, |f| f.disabled = true);
        repo.record_error(channel, "boom");

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("library.json");
        repo.save(&path).unwrap();

        let loaded = InMemoryRepository::load(&path).unwrap();
        let record = loaded.record(channel).unwrap();
        assert!(record.flags.disabled);
        assert_eq!(record.errors, vec!["boom".to_string()]);

        // ids keep increasing after a reload
        let next = loaded.add_folder("F", None, "/dl/f");
        assert!(next > channel);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = InMemoryRepository::load(&temp_dir.path().join("nope.json")).unwrap();
        assert!(repo.records().is_empty());
    }
}
