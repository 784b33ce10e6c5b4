use crate::download::DownloadMode;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod error;
pub mod handler;
pub mod output;
pub mod run;

/// vidherd - bulk video download orchestrator
#[derive(Parser, Debug)]
#[command(name = "vidherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Override config directory path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (TRACE level) and echo downloader output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download (or check) media targets
    Run(RunArgs),

    /// Show statistics of previous operations
    History {
        /// Show only the most recent N operations
        #[arg(long, short = 'n')]
        limit: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        /// Configuration action
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// URLs of videos, channels or playlists; the whole library when omitted
    pub urls: Vec<String>,

    /// Media library file (defaults to library.json in the config directory)
    #[arg(long, value_name = "FILE")]
    pub library: Option<PathBuf>,

    /// Destination directory for URLs not yet in the library
    #[arg(long, short = 'd', value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Fetch metadata only
    #[arg(long)]
    pub simulate: bool,

    /// Use the custom download politeness rules
    #[arg(long)]
    pub custom: bool,

    /// Plain youtube-dl style download without library bookkeeping
    #[arg(long, conflicts_with = "custom")]
    pub classic: bool,

    /// Number of workers for this operation
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// Do not stop at the configured video, size or time ceilings
    #[arg(long)]
    pub ignore_limits: bool,
}

impl RunArgs {
    pub fn mode(&self) -> DownloadMode {
        match (self.classic, self.custom, self.simulate) {
            (true, _, true) => DownloadMode::ClassicSimulate,
            (true, _, false) => DownloadMode::ClassicReal,
            (false, true, true) => DownloadMode::CustomSimulate,
            (false, true, false) => DownloadMode::CustomReal,
            (false, false, true) => DownloadMode::Simulate,
            (false, false, false) => DownloadMode::Real,
        }
    }
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the path of settings.toml
    Path,

    /// Write a default settings.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
