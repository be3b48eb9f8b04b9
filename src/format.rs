// Traffic, speed and elapsed-time labels for the connection table

use chrono::{DateTime, Utc};

const TRAFFIC_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count (e.g., "1023 B", "1.00 KB", "3.27 GB")
///
/// A unit is only advanced while the truncated quotient `value / 1024` is
/// non-zero, so a value just below a boundary stays in the smaller unit
/// (1048575 bytes renders as "1024.00 KB", not "1.00 MB").
pub fn format_traffic(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;

    while (value / 1024.0).trunc() >= 1.0 && unit < TRAFFIC_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, TRAFFIC_UNITS[0])
    } else {
        format!("{:.2} {}", value, TRAFFIC_UNITS[unit])
    }
}

/// Format an upload/download rate pair, showing only the directions in use
pub fn format_speed(upload: u64, download: u64) -> String {
    match (upload, download) {
        (0, 0) => "-".to_string(),
        (up, 0) => format!("↑ {}/s", format_traffic(up)),
        (0, down) => format!("↓ {}/s", format_traffic(down)),
        (up, down) => format!("↑ {}/s ↓ {}/s", format_traffic(up), format_traffic(down)),
    }
}

/// Relative "time ago" label for a connection start time
pub fn format_relative(start: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - start).num_seconds().max(0) as f64;
    let minutes = seconds / 60.0;
    let hours = minutes / 60.0;
    let days = hours / 24.0;

    if seconds < 45.0 {
        "a few seconds ago".to_string()
    } else if seconds < 90.0 {
        "a minute ago".to_string()
    } else if minutes < 45.0 {
        format!("{} minutes ago", minutes.round() as u64)
    } else if minutes < 90.0 {
        "an hour ago".to_string()
    } else if hours < 22.0 {
        format!("{} hours ago", hours.round() as u64)
    } else if hours < 36.0 {
        "a day ago".to_string()
    } else if days < 26.0 {
        format!("{} days ago", days.round() as u64)
    } else if days < 46.0 {
        "a month ago".to_string()
    } else if days < 320.0 {
        format!("{} months ago", (days / 30.4).round() as u64)
    } else if days < 548.0 {
        "a year ago".to_string()
    } else {
        format!("{} years ago", (days / 365.0).round() as u64)
    }
}
