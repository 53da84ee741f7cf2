//! Table formatting and progress output for the CLI.

use comfy_table::{ContentArrangement, Table};
use dockyard_core::event::events;
use dockyard_core::{EventEmitter, PipelineEvent};
use tokio::sync::broadcast::error::RecvError;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [
        ("GB", 1024 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("KB", 1024),
    ];
    UNITS
        .iter()
        .find(|(_, size)| bytes >= *size)
        .map(|(unit, size)| format!("{:.1} {}", bytes as f64 / *size as f64, unit))
        .unwrap_or_else(|| format!("{} B", bytes))
}

/// Format a timestamp relative to now, e.g. "3 days ago".
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }
    let (value, unit) = match secs {
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 30 * 86_400 => (s / 86_400, "day"),
        s if s < 365 * 86_400 => (s / (30 * 86_400), "month"),
        s => (s / (365 * 86_400), "year"),
    };
    let plural = if value == 1 { "" } else { "s" };
    format!("{value} {unit}{plural} ago")
}

/// `sha256:` plus the first 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    match digest.strip_prefix("sha256:") {
        Some(hex) => format!("sha256:{}", &hex[..hex.len().min(12)]),
        None => digest.chars().take(12).collect(),
    }
}

/// One progress line for a pipeline event, or `None` for events not shown.
pub fn progress_line(event: &PipelineEvent) -> Option<String> {
    let field = |name: &str| {
        event
            .field(name)
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))
            .unwrap_or_default()
    };
    let line = match event.key.as_str() {
        events::BUILD_STARTED => format!("Building {} ({} backend)", field("target"), field("backend")),
        events::BUILD_STEP => format!(
            "  [{}/{}] {}",
            field("step"),
            field("total"),
            field("instruction")
        ),
        events::PUSH_STARTED => format!("Pushing {} to {}", field("reference"), field("registry")),
        events::PUSH_RETRY => format!(
            "  {}: attempt {} failed, retrying: {}",
            field("registry"),
            field("attempt"),
            field("error")
        ),
        events::PUSH_REAUTH => format!("  {}: credential rejected, re-authenticating", field("registry")),
        events::PUSH_COMPLETED => format!("Pushed {} ({})", field("reference"), short_digest(&field("digest"))),
        _ => return None,
    };
    Some(line)
}

/// Print progress lines to stderr until the emitter is dropped.
pub fn spawn_progress(emitter: &EventEmitter) -> tokio::task::JoinHandle<()> {
    let mut rx = emitter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = progress_line(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}
