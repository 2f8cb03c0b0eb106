//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}

/// Shorten a digest to `sha256:` plus 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    match digest.strip_prefix("sha256:") {
        Some(hex) => format!("sha256:{}", &hex[..hex.len().min(12)]),
        None => digest.chars().take(12).collect(),
    }
}

/// Parse a size string like "500m", "10g", "1t" into bytes.
///
/// Supported suffixes (case-insensitive): `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb`.
/// No suffix assumes bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let (num_str, multiplier) = [
        ("tb", TB),
        ("t", TB),
        ("gb", GB),
        ("g", GB),
        ("mb", MB),
        ("m", MB),
        ("kb", KB),
        ("k", KB),
        ("b", 1),
    ]
    .iter()
    .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
    .unwrap_or((s.as_str(), 1));

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size value too large: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(100 * 1048576), "100.0 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123"),
            "sha256:0123456789ab"
        );
        assert_eq!(short_digest("sha256:abc"), "sha256:abc");
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
    }

    #[test]
    fn test_parse_size_bytes_suffixes() {
        assert_eq!(parse_size_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_size_bytes("100B").unwrap(), 100);
        assert_eq!(parse_size_bytes("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size_bytes("500MB").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size_bytes("  10g  ").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("1TB").unwrap(), 1024 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_bytes_invalid() {
        assert!(parse_size_bytes("").is_err());
        assert!(parse_size_bytes("abc").is_err());
        assert!(parse_size_bytes("1.5g").is_err());
        assert!(parse_size_bytes("-10g").is_err());
        assert!(parse_size_bytes("99999999999999t").is_err());
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["KEY", "SIZE"]);
        table.add_row(["sha256:abc", "1.0 KB"]);
        let output = table.to_string();
        assert!(output.contains("KEY"));
        assert!(output.contains("sha256:abc"));
        assert!(output.contains("1.0 KB"));
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&(now - chrono::Duration::seconds(30))), "30 seconds ago");
        assert_eq!(format_ago(&(now - chrono::Duration::minutes(5))), "5 minutes ago");
        assert_eq!(format_ago(&(now - chrono::Duration::hours(2))), "2 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(3))), "3 days ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(60))), "2 months ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(730))), "2 years ago");
        assert_eq!(format_ago(&(now + chrono::Duration::hours(1))), "just now");
    }
}
