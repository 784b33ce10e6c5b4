use crate::download::stats::{OperationStats, StopReason};
use crate::media::memory::MediaRecord;

/// Format bytes into human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format seconds as `1h02m03s`, `2m05s` or `4.2s`
pub fn format_duration(secs: f64) -> String {
    let whole = secs as u64;
    if whole >= 3600 {
        format!("{}h{:02}m{:02}s", whole / 3600, (whole % 3600) / 60, whole % 60)
    } else if whole >= 60 {
        format!("{}m{:02}s", whole / 60, whole % 60)
    } else {
        format!("{:.1}s", secs)
    }
}

pub fn stop_reason_label(reason: Option<StopReason>) -> &'static str {
    match reason {
        None => "completed",
        Some(StopReason::Manual) => "stopped by user",
        Some(StopReason::VideoLimit) => "video limit reached",
        Some(StopReason::SizeLimit) => "size limit reached",
        Some(StopReason::TimeLimit) => "time limit reached",
    }
}

/// Multi-line summary printed after an operation
pub fn format_operation_summary(stats: &OperationStats) -> String {
    let mut output = String::new();
    let duration = stats
        .duration_secs()
        .map(format_duration)
        .unwrap_or_else(|| "N/A".to_string());

    output.push_str(&format!(
        "Operation {} {} in {}\n",
        stats.operation_id,
        stop_reason_label(stats.stop_reason),
        duration
    ));
    output.push_str(&format!(
        "  Videos: {} (new {}, old {}, simulated {})\n",
        stats.videos_total, stats.new_videos, stats.old_videos, stats.simulated_videos
    ));
    if stats.bytes_downloaded > 0 {
        output.push_str(&format!(
            "  Downloaded: {}\n",
            format_bytes(stats.bytes_downloaded)
        ));
    }

    let jobs = &stats.jobs;
    output.push_str(&format!(
        "  Jobs: {} ok, {} warning, {} error, {} already done, {} size-limit abort, {} stopped\n",
        jobs.ok, jobs.warning, jobs.error, jobs.already_done, jobs.size_limit_abort, jobs.stopped
    ));
    if stats.restarts > 0 || stats.not_started > 0 {
        output.push_str(&format!(
            "  Restarts: {}, not started: {}\n",
            stats.restarts, stats.not_started
        ));
    }

    output.trim_end().to_string()
}

/// One line per logged operation, or pretty JSON
pub fn format_history(entries: &[OperationStats], json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string());
    }
    if entries.is_empty() {
        return "No operation history found".to_string();
    }

    let mut output = format!("Operation History ({} entries)\n", entries.len());
    for entry in entries {
        let status_symbol = if entry.jobs.error > 0 { "✗" } else { "✓" };
        let mode = entry
            .mode
            .map(|m| format!("{:?}", m))
            .unwrap_or_else(|| "-".to_string());
        let duration = entry
            .duration_secs()
            .map(format_duration)
            .unwrap_or_else(|| "N/A".to_string());

        output.push_str(&format!(
            "\n{} {} [{}] {} videos ({} new), {}, {} - {}",
            status_symbol,
            entry.started_at.format("%Y-%m-%d %H:%M:%S"),
            mode,
            entry.videos_total,
            entry.new_videos,
            format_bytes(entry.bytes_downloaded),
            duration,
            stop_reason_label(entry.stop_reason)
        ));
    }
    output
}

/// Errors and warnings recorded against library targets during the operation
pub fn format_target_messages(records: &[MediaRecord]) -> String {
    let mut output = String::new();
    for record in records {
        if record.errors.is_empty() && record.warnings.is_empty() && !record.missing {
            continue;
        }
        output.push_str(&format!("{} {}\n", record.id, record.name));
        if record.missing {
            output.push_str("  MISSING\n");
        }
        for error in &record.errors {
            output.push_str(&format!("  ERROR: {}\n", error));
        }
        for warning in &record.warnings {
            output.push_str(&format!("  WARNING: {}\n", warning));
        }
    }
    output.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::item::DownloadMode;
    use crate::media::memory::InMemoryRepository;
    use crate::media::MediaRepository;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(4.24), "4.2s");
        assert_eq!(format_duration(125.0), "2m05s");
        assert_eq!(format_duration(3723.0), "1h02m03s");
    }

    #[test]
    fn test_operation_summary() {
        let started_at = Utc::now();
        let mut stats = OperationStats {
            mode: Some(DownloadMode::Real),
            started_at,
            stopped_at: Some(started_at + chrono::Duration::seconds(90)),
            stop_reason: Some(StopReason::VideoLimit),
            videos_total: 5,
            new_videos: 5,
            bytes_downloaded: 3 * 1024 * 1024,
            ..OperationStats::default()
        };
        stats.jobs.ok = 2;

        let summary = format_operation_summary(&stats);
        assert!(summary.contains("video limit reached in 1m30s"));
        assert!(summary.contains("Videos: 5 (new 5, old 0, simulated 0)"));
        assert!(summary.contains("Downloaded: 3.00 MB"));
        assert!(summary.contains("Jobs: 2 ok"));
        assert!(!summary.contains("Restarts"));
    }

    #[test]
    fn test_history_empty_and_json() {
        assert_eq!(format_history(&[], false), "No operation history found");
        assert_eq!(format_history(&[], true), "[]");
    }

    #[test]
    fn test_target_messages() {
        let repo = InMemoryRepository::new();
        repo.add_video("quiet", Some("https://q"), None, "/dl");
        let noisy = repo.add_video("noisy", Some("https://n"), None, "/dl");
        repo.record_error(noisy, "boom");
        repo.record_warning(noisy, "careful");

        let text = format_target_messages(&repo.records());
        assert_eq!(
            text,
            format!("{} noisy\n  ERROR: boom\n  WARNING: careful", noisy)
        );
    }
}
