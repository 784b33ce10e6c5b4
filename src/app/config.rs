use crate::download::options::YtdlpTranslator;
use crate::download::parser::{default_ignorable_patterns, default_network_patterns, StderrFilters};
use crate::download::schedule::{parse_clock, AlternateLimits, DaySpec};
use crate::download::settings::{
    InterJobDelay, OperationLimits, OperationSettings, RestartPolicies, RestartPolicy,
};
use crate::util::paths::{self, AppFile};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Application configuration (saved to config/settings.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub downloader: DownloaderConfig,
    pub workers: WorkersConfig,
    pub limits: LimitsConfig,
    pub bandwidth: BandwidthConfig,
    pub alternate_limits: AlternateLimitsConfig,
    pub stall: StallConfig,
    pub restart: RestartConfig,
    pub output: OutputConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// youtube-dl compatible executable
    pub executable: PathBuf,
    pub output_template: String,
    pub extra_args: Vec<String>,
    pub archive_name: String,
    /// Destination for URLs given on the command line
    pub default_directory: PathBuf,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let translator = YtdlpTranslator::default();
        Self {
            executable: translator.executable,
            output_template: translator.output_template,
            extra_args: translator.extra_args,
            archive_name: translator.archive_name,
            default_directory: paths::default_download_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub broadcast_workers: bool,
    pub dispatch_interval_ms: u64,
    /// Pause after each real custom download, in seconds; 0/0 disables it
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            broadcast_workers: true,
            dispatch_interval_ms: 250,
            delay_min_secs: 0,
            delay_max_secs: 0,
        }
    }
}

/// Operation ceilings; 0 means unlimited
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_videos: u64,
    pub max_mib: u64,
    pub max_minutes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// KiB/s, 0 for unlimited
    pub limit_kib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternateLimitsConfig {
    pub enabled: bool,
    /// HH:MM
    pub start: String,
    /// HH:MM
    pub stop: String,
    pub days: DaySpec,
    pub workers: usize,
    /// KiB/s, 0 for unlimited
    pub bandwidth_kib: u64,
    pub check_interval_secs: u64,
}

impl Default for AlternateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "00:00".to_string(),
            stop: "07:00".to_string(),
            days: DaySpec::Every,
            workers: 1,
            bandwidth_kib: 0,
            check_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub conflict_poll_secs: u64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 90,
            poll_interval_ms: 100,
            conflict_poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartRule {
    pub enabled: bool,
    pub max_restarts: u32,
}

impl Default for RestartRule {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
        }
    }
}

impl From<RestartRule> for RestartPolicy {
    fn from(rule: RestartRule) -> Self {
        RestartPolicy {
            enabled: rule.enabled,
            max_restarts: rule.max_restarts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub simulate: RestartRule,
    pub real: RestartRule,
    pub classic: RestartRule,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            simulate: RestartRule::default(),
            real: RestartRule::default(),
            classic: RestartRule {
                enabled: false,
                max_restarts: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// stderr lines matching any of these are dropped
    pub ignorable_patterns: Vec<String>,
    /// stderr lines matching any of these end the attempt as a stall
    pub network_patterns: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            ignorable_patterns: default_ignorable_patterns(),
            network_patterns: default_network_patterns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub completion_grace_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            completion_grace_ms: 500,
            drain_timeout_ms: 2000,
        }
    }
}

/// Problems found by [`Config::validate`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("workers.count must be at least 1")]
    NoWorkers,

    #[error("downloader.executable must not be empty")]
    MissingExecutable,

    #[error("workers.delay_min_secs ({min}) is greater than workers.delay_max_secs ({max})")]
    DelayRange { min: u64, max: u64 },

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("{field} is not a valid HH:MM time: '{value}'")]
    InvalidClock { field: &'static str, value: String },

    #[error("alternate_limits.workers must be at least 1")]
    NoAlternateWorkers,

    #[error("{field} contains an invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        message: String,
    },
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Config {
    /// Load configuration from the config directory, defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        let config_path = paths::app_path(AppFile::Settings)?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit file, defaults if absent
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        config.downloader.default_directory =
            paths::under_config_dir(&config.downloader.default_directory);

        let errors = config.validate();
        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration: {}", join_errors(&errors));
        }
        Ok(config)
    }

    /// Save configuration into the config directory
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let config_path = paths::app_path(AppFile::Settings)?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Validate, then write atomically (temp file + rename)
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let errors = self.validate();
        if !errors.is_empty() {
            anyhow::bail!("Cannot save invalid config: {}", join_errors(&errors));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &content).context("Failed to write temp config file")?;
        std::fs::rename(&temp_path, path).context("Failed to rename temp config file")?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Every problem with this configuration
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.workers.count == 0 {
            errors.push(ConfigError::NoWorkers);
        }
        if self.downloader.executable.as_os_str().is_empty() {
            errors.push(ConfigError::MissingExecutable);
        }
        if self.workers.delay_min_secs > self.workers.delay_max_secs {
            errors.push(ConfigError::DelayRange {
                min: self.workers.delay_min_secs,
                max: self.workers.delay_max_secs,
            });
        }

        for (field, value) in [
            ("workers.dispatch_interval_ms", self.workers.dispatch_interval_ms),
            ("stall.timeout_secs", self.stall.timeout_secs),
            ("stall.poll_interval_ms", self.stall.poll_interval_ms),
            ("stall.conflict_poll_secs", self.stall.conflict_poll_secs),
        ] {
            if value == 0 {
                errors.push(ConfigError::ZeroInterval { field });
            }
        }

        let alt = &self.alternate_limits;
        for (field, value) in [
            ("alternate_limits.start", &alt.start),
            ("alternate_limits.stop", &alt.stop),
        ] {
            if parse_clock(value).is_err() {
                errors.push(ConfigError::InvalidClock {
                    field,
                    value: value.clone(),
                });
            }
        }
        if alt.enabled {
            if alt.workers == 0 {
                errors.push(ConfigError::NoAlternateWorkers);
            }
            if alt.check_interval_secs == 0 {
                errors.push(ConfigError::ZeroInterval {
                    field: "alternate_limits.check_interval_secs",
                });
            }
        }

        for (field, patterns) in [
            ("output.ignorable_patterns", &self.output.ignorable_patterns),
            ("output.network_patterns", &self.output.network_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(ConfigError::InvalidPattern {
                        field,
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        errors
    }

    fn alternate(&self) -> anyhow::Result<Option<AlternateLimits>> {
        let alt = &self.alternate_limits;
        if !alt.enabled {
            return Ok(None);
        }
        Ok(Some(AlternateLimits {
            enabled: true,
            start: parse_clock(&alt.start).context("alternate_limits.start")?,
            stop: parse_clock(&alt.stop).context("alternate_limits.stop")?,
            days: alt.days,
            workers: alt.workers,
            bandwidth: non_zero(alt.bandwidth_kib),
        }))
    }

    /// Engine settings for one operation
    ///
    /// Compiles the output filters; fails on any validation error.
    pub fn operation_settings(&self) -> anyhow::Result<OperationSettings> {
        let errors = self.validate();
        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration: {}", join_errors(&errors));
        }

        let filters = StderrFilters::new(
            &self.output.ignorable_patterns,
            &self.output.network_patterns,
        )?;

        let inter_job_delay = (self.workers.delay_max_secs > 0).then(|| InterJobDelay {
            min: Duration::from_secs(self.workers.delay_min_secs),
            max: Duration::from_secs(self.workers.delay_max_secs),
        });

        Ok(OperationSettings {
            worker_count: self.workers.count,
            allow_broadcast_workers: self.workers.broadcast_workers,
            dispatch_interval: Duration::from_millis(self.workers.dispatch_interval_ms),
            poll_interval: Duration::from_millis(self.stall.poll_interval_ms),
            stall_timeout: Duration::from_secs(self.stall.timeout_secs),
            conflict_poll: Duration::from_secs(self.stall.conflict_poll_secs),
            restart: RestartPolicies {
                simulate: self.restart.simulate.into(),
                real: self.restart.real.into(),
                classic: self.restart.classic.into(),
            },
            inter_job_delay,
            limits: OperationLimits {
                max_videos: non_zero(self.limits.max_videos),
                max_bytes: non_zero(self.limits.max_mib).map(|mib| mib * 1024 * 1024),
                max_elapsed: non_zero(self.limits.max_minutes)
                    .map(|minutes| Duration::from_secs(minutes * 60)),
            },
            bandwidth_limit: non_zero(self.bandwidth.limit_kib),
            alternate: self.alternate()?,
            alt_check_interval: Duration::from_secs(self.alternate_limits.check_interval_secs),
            completion_grace: Duration::from_millis(self.shutdown.completion_grace_ms),
            drain_timeout: Duration::from_millis(self.shutdown.drain_timeout_ms),
            filters: Arc::new(filters),
        })
    }

    /// Downloader command builder for this configuration
    pub fn translator(&self) -> YtdlpTranslator {
        YtdlpTranslator {
            executable: self.downloader.executable.clone(),
            output_template: self.downloader.output_template.clone(),
            extra_args: self.downloader.extra_args.clone(),
            archive_name: self.downloader.archive_name.clone(),
        }
    }
}

fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn create_test_config_toml() -> &'static str {
        r#"
[downloader]
executable = "/usr/local/bin/yt-dlp"
extra_args = ["--no-mtime"]

[workers]
count = 4
delay_min_secs = 2
delay_max_secs = 6

[limits]
max_videos = 50
max_mib = 100
max_minutes = 30

[bandwidth]
limit_kib = 500

[alternate_limits]
enabled = true
start = "21:00"
stop = "07:00"
days = "weekdays"
workers = 1
bandwidth_kib = 100

[restart.classic]
enabled = true
max_restarts = 2
"#
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.workers.count, 2);
        assert!(config.workers.broadcast_workers);
        assert_eq!(config.downloader.executable, PathBuf::from("yt-dlp"));
        assert_eq!(config.limits, LimitsConfig::default());
        assert_eq!(config.bandwidth.limit_kib, 0);
        assert!(!config.alternate_limits.enabled);
        assert_eq!(config.stall.timeout_secs, 90);
        assert!(config.restart.real.enabled);
        assert!(!config.restart.classic.enabled);
        assert!(!config.output.network_patterns.is_empty());
        assert!(config.validate().is_empty());
    }

    #[test]
    #[serial]
    fn test_config_load_valid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        std::fs::write(&config_path, create_test_config_toml()).unwrap();

        let config = Config::load_from(&config_path).unwrap();

        assert_eq!(config.workers.count, 4);
        assert_eq!(config.downloader.extra_args, vec!["--no-mtime".to_string()]);
        assert_eq!(config.alternate_limits.days, DaySpec::Weekdays);
        assert_eq!(config.restart.classic.max_restarts, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.stall, StallConfig::default());
        assert_eq!(config.shutdown, ShutdownConfig::default());
    }

    #[test]
    fn test_config_load_missing_file_uses_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&temp_dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config.workers.count, 2);
    }

    #[test]
    fn test_config_load_rejects_invalid_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        std::fs::write(&config_path, "[workers]\ncount = 0\n").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("workers.count"));
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.workers.count = 0;
        config.workers.delay_min_secs = 10;
        config.workers.delay_max_secs = 5;
        config.stall.timeout_secs = 0;
        config.alternate_limits.start = "25:00".to_string();
        config.output.network_patterns.push("(unclosed".to_string());

        let errors = config.validate();

        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ConfigError::NoWorkers));
        assert!(errors.contains(&ConfigError::DelayRange { min: 10, max: 5 }));
        assert!(errors.contains(&ConfigError::ZeroInterval {
            field: "stall.timeout_secs"
        }));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigError::InvalidClock {
                field: "alternate_limits.start",
                ..
            }
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigError::InvalidPattern {
                field: "output.network_patterns",
                ..
            }
        )));
    }

    #[test]
    fn test_operation_settings_mapping() {
        let config: Config = toml::from_str(create_test_config_toml()).unwrap();
        let settings = config.operation_settings().unwrap();

        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.bandwidth_limit, Some(500));
        assert_eq!(settings.limits.max_videos, Some(50));
        assert_eq!(settings.limits.max_bytes, Some(100 * 1024 * 1024));
        assert_eq!(settings.limits.max_elapsed, Some(Duration::from_secs(1800)));
        assert_eq!(
            settings.inter_job_delay,
            Some(InterJobDelay {
                min: Duration::from_secs(2),
                max: Duration::from_secs(6),
            })
        );
        assert!(settings.restart.classic.allows(1));
        assert!(!settings.restart.classic.allows(2));

        let alternate = settings.alternate.unwrap();
        assert_eq!(alternate.workers, 1);
        assert_eq!(alternate.bandwidth, Some(100));
        assert_eq!(alternate.days, DaySpec::Weekdays);
    }

    #[test]
    fn test_operation_settings_zero_means_unlimited() {
        let settings = Config::default().operation_settings().unwrap();
        assert_eq!(settings.limits, OperationLimits::default());
        assert_eq!(settings.bandwidth_limit, None);
        assert_eq!(settings.inter_job_delay, None);
        assert!(settings.alternate.is_none());
    }

    #[test]
    #[serial]
    fn test_config_save_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        paths::set_config_dir_override(Some(temp_dir.path().to_path_buf()));

        let mut config = Config::default();
        config.workers.count = 3;
        config.limits.max_videos = 10;
        let path = config.save().unwrap();
        assert_eq!(path, temp_dir.path().join("settings.toml"));

        let loaded = Config::load().unwrap();
        assert_eq!(loaded, config);

        paths::set_config_dir_override(None);
    }

    #[test]
    fn test_save_refuses_invalid_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workers.count = 0;
        assert!(config.save_to(&temp_dir.path().join("settings.toml")).is_err());
    }
}
