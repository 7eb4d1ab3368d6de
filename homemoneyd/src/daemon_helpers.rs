fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn format_last_sync(millis: Option<i64>) -> String {
    let Some(millis) = millis else {
        return "never".to_string();
    };
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{millis} ms since epoch"))
}

pub fn format_status(summary: &StatusSummary) -> String {
    format!(
        "pending changes: {}\nlast sync: {}",
        summary.pending,
        format_last_sync(summary.last_sync_millis)
    )
}

pub fn format_report(report: &SyncReport) -> String {
    let mut out = format!(
        "uploaded: {} of {} (failed {}, skipped {}, deferred {})\n\
         downloaded: {} records, {} new, {} updated, {} removed locally, {} skipped\n\
         conflicts: {}\n\
         took: {} ms",
        report.upload.succeeded,
        report.upload.total,
        report.upload.failed,
        report.upload.skipped,
        report.upload.deferred,
        report.download.fetched,
        report.download.new,
        report.download.updated,
        report.download.deleted,
        report.download.skipped,
        report.download.conflicts.len(),
        report.duration.as_millis()
    );
    for item in &report.upload.failed_items {
        let fate = if item.permanent { "dropped" } else { "will retry" };
        out.push_str(&format!(
            "\n  {} {} ({fate}): {}",
            item.operation.as_str(),
            item.local_id,
            item.error
        ));
    }
    for conflict in &report.download.conflicts {
        out.push_str(&format!(
            "\n  conflict {} <-> {}: local {} vs server {}",
            conflict.local_id, conflict.remote_id, conflict.local.amount, conflict.server.amount
        ));
    }
    out
}
