//! Duration parsing utilities.

use anyhow::Context;
use std::time::Duration;

/// Parse a duration string like "1d", "1h", "30m", "300s", "300" into seconds.
/// Supports:
/// - Plain numbers (interpreted as seconds): "300"
/// - Seconds suffix: "300s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
/// - Days suffix: "1d"
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let units: [(char, u64, &str); 4] = [
        ('d', 86_400, "days"),
        ('h', 3_600, "hours"),
        ('m', 60, "minutes"),
        ('s', 1, "seconds"),
    ];
    for (suffix, scale, name) in units {
        if let Some(num_str) = s.strip_suffix(suffix) {
            let value: u64 = num_str
                .trim()
                .parse()
                .with_context(|| format!("Invalid {name} value: {num_str}"))?;
            return value
                .checked_mul(scale)
                .with_context(|| format!("Duration out of range: {value} {name}"));
        }
    }

    // No suffix - treat as seconds
    s.parse::<u64>()
        .with_context(|| format!("Invalid duration value: {s}"))
}

/// Like [`parse_duration_to_secs`], as a [`Duration`].
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    parse_duration_to_secs(s).map(Duration::from_secs)
}
