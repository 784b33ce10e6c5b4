//! Where vidherd keeps its settings, media library and logs
//!
//! All three live in one config directory. `--config` pins it; otherwise the
//! first existing candidate wins and the user directory is created as a last
//! resort.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

const APP_DIR_NAME: &str = "vidherd";
const CONFIG_DIR_ENV: &str = "VIDHERD_CONFIG_DIR";

static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Entries kept under the config directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFile {
    Settings,
    Library,
    /// Tracing output and the operation log
    Logs,
}

impl AppFile {
    pub fn file_name(self) -> &'static str {
        match self {
            AppFile::Settings => "settings.toml",
            AppFile::Library => "library.json",
            AppFile::Logs => ".logs",
        }
    }
}

/// Pin the config directory; it does not have to exist yet
pub fn set_config_dir_override(path: Option<PathBuf>) {
    *CONFIG_DIR_OVERRIDE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = path;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME))
}

/// Directories tried in order, labelled for logging
fn candidates() -> Vec<(&'static str, PathBuf)> {
    let mut out = Vec::new();
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        out.push((CONFIG_DIR_ENV, PathBuf::from(dir)));
    }
    if let Some(dir) = user_config_dir() {
        out.push(("user config", dir));
    }
    if let Ok(cwd) = std::env::current_dir() {
        out.push(("working directory", cwd.join("config")));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("config")))
    {
        out.push(("executable directory", dir));
    }
    out
}

pub fn find_config_directory() -> Result<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Ok(dir);
    }

    for (source, dir) in candidates() {
        if dir.is_dir() {
            tracing::debug!("Config directory from {}: {}", source, dir.display());
            return Ok(dir);
        }
        if source == CONFIG_DIR_ENV {
            tracing::warn!("{} points to a missing directory: {}", CONFIG_DIR_ENV, dir.display());
        }
    }

    let dir = user_config_dir().context("Could not determine user config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    tracing::info!("Created config directory {}", dir.display());
    Ok(dir)
}

pub fn app_path(file: AppFile) -> Result<PathBuf> {
    Ok(find_config_directory()?.join(file.file_name()))
}

/// `Downloads` under the working directory
pub fn default_download_dir() -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join("Downloads"))
        .unwrap_or_else(|_| PathBuf::from("Downloads"))
}

/// Anchor a relative path (e.g. a download directory from settings.toml) at
/// the config directory
pub fn under_config_dir(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match find_config_directory() {
        Ok(config_dir) => config_dir.join(path),
        Err(_) => path.to_path_buf(),
    }
}
