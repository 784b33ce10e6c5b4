/// Operation logging
///
/// Appends the statistics of every finished operation to JSONL log files.
/// Log files are organized by date: {logs_dir}/operations_YYYYMMDD.jsonl
use super::stats::OperationStats;
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const LOG_PREFIX: &str = "operations_";

/// Appends finished operation statistics to the log for today
///
/// Creates the logs directory if it doesn't exist. Returns the path of the
/// file that was written.
pub fn append_operation(stats: &OperationStats, logs_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create {}", logs_dir.display()))?;

    let today = Utc::now().format("%Y%m%d").to_string();
    let log_file = logs_dir.join(format!("{}{}.jsonl", LOG_PREFIX, today));

    let json_line = serde_json::to_string(stats)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open {}", log_file.display()))?;

    writeln!(file, "{}", json_line)?;
    file.sync_all()?;

    tracing::debug!(
        "Appended operation {} to {}",
        stats.operation_id,
        log_file.display()
    );

    Ok(log_file)
}

/// Reads every logged operation, oldest file first
///
/// Lines that fail to parse are skipped with a warning. A missing logs
/// directory yields an empty history.
pub fn read_operations(logs_dir: &Path) -> Result<Vec<OperationStats>> {
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(logs_dir)
        .with_context(|| format!("Failed to read {}", logs_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();

    let mut operations = Vec::new();
    for path in files {
        let file = std::fs::File::open(&path)?;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OperationStats>(&line) {
                Ok(stats) => operations.push(stats),
                Err(e) => tracing::warn!(
                    "Skipping malformed entry {}:{}: {}",
                    path.display(),
                    index + 1,
                    e
                ),
            }
        }
    }

    Ok(operations)
}
