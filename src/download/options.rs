//! Translation of a work item into a downloader command line

use super::item::WorkItem;
use std::ffi::OsString;
use std::path::PathBuf;

/// Executable plus argv for one job attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program name for log messages
    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Per-job inputs that change while an operation runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// KiB/s, `None` for unlimited
    pub bandwidth_limit: Option<u64>,
}

/// Builds the downloader invocation for a work item
pub trait OptionTranslator: Send + Sync {
    fn build_command(&self, item: &WorkItem, options: &JobOptions) -> CommandSpec;
}

/// Minimal yt-dlp / youtube-dl translator
#[derive(Debug, Clone)]
pub struct YtdlpTranslator {
    pub executable: PathBuf,
    pub output_template: String,
    pub extra_args: Vec<String>,
    /// Archive file written into container destinations
    pub archive_name: String,
}

impl Default for YtdlpTranslator {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("yt-dlp"),
            output_template: "%(title)s.%(ext)s".to_string(),
            extra_args: Vec::new(),
            archive_name: "ytdl-archive.txt".to_string(),
        }
    }
}

impl OptionTranslator for YtdlpTranslator {
    fn build_command(&self, item: &WorkItem, options: &JobOptions) -> CommandSpec {
        let mut spec = CommandSpec::new(self.executable.as_os_str()).arg("--newline");

        if item.mode.is_simulated() {
            spec = spec.args(["--dump-json", "--simulate"]);
        } else {
            spec = spec
                .arg("-o")
                .arg(item.destination.join(&self.output_template));
            if item.kind.is_container() && !item.mode.is_classic() {
                spec = spec
                    .arg("--download-archive")
                    .arg(item.destination.join(&self.archive_name));
            }
        }

        if let Some(rate) = options.bandwidth_limit {
            spec = spec.arg("--limit-rate").arg(format!("{}K", rate));
        }
        if item.broadcast {
            spec = spec.arg("--live-from-start");
        }

        spec = spec.args(&self.extra_args);
        if let Some(url) = &item.url {
            spec = spec.arg(url);
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::item::DownloadMode;
    use crate::media::{MediaKind, TargetFlags, TargetId, TargetInfo};
    use pretty_assertions::assert_eq;

    fn item(kind: MediaKind, mode: DownloadMode, live: bool) -> WorkItem {
        let info = TargetInfo {
            id: TargetId(1),
            kind,
            name: "t".to_string(),
            url: Some("https://example.com/t".to_string()),
            parent: None,
            children: Vec::new(),
            destination: PathBuf::from("/dl"),
            dest_master: None,
            flags: TargetFlags {
                live,
                ..TargetFlags::default()
            },
        };
        WorkItem::new(1, &info, mode, false, false)
    }

    fn args(spec: &CommandSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_simulated_video() {
        let spec = YtdlpTranslator::default().build_command(
            &item(MediaKind::Video, DownloadMode::Simulate, false),
            &JobOptions::default(),
        );
        assert_eq!(spec.display_name(), "yt-dlp");
        assert_eq!(
            args(&spec),
            vec!["--newline", "--dump-json", "--simulate", "https://example.com/t"]
        );
    }

    #[test]
    fn test_real_channel_with_bandwidth() {
        let spec = YtdlpTranslator::default().build_command(
            &item(MediaKind::Channel, DownloadMode::Real, false),
            &JobOptions {
                bandwidth_limit: Some(500),
            },
        );
        let template = PathBuf::from("/dl").join("%(title)s.%(ext)s");
        let archive = PathBuf::from("/dl").join("ytdl-archive.txt");
        assert_eq!(
            args(&spec),
            vec![
                "--newline".to_string(),
                "-o".to_string(),
                template.to_string_lossy().into_owned(),
                "--download-archive".to_string(),
                archive.to_string_lossy().into_owned(),
                "--limit-rate".to_string(),
                "500K".to_string(),
                "https://example.com/t".to_string(),
            ]
        );
    }

    #[test]
    fn test_broadcast_and_extra_args() {
        let translator = YtdlpTranslator {
            extra_args: vec!["--no-mtime".to_string()],
            ..YtdlpTranslator::default()
        };
        let spec = translator.build_command(
            &item(MediaKind::Video, DownloadMode::Real, true),
            &JobOptions::default(),
        );
        let args = args(&spec);
        assert!(args.contains(&"--live-from-start".to_string()));
        assert!(!args.contains(&"--download-archive".to_string()));
        assert_eq!(args[args.len() - 2], "--no-mtime");
        assert_eq!(args[args.len() - 1], "https://example.com/t");
    }
}
