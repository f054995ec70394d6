//! Duration formatting for run reports.
//!
//! Two renderings are provided:
//!
//! - Clock: `HH:MM:SS`, used for the "Job took ..." log line
//! - Compact: `1d2h3m4s`, used when listing lock ages
//!
//! # Examples
//!
//! ```
//! use runlock::core::duration::{format_clock, format_compact};
//! use std::time::Duration;
//!
//! assert_eq!(format_clock(Duration::from_secs(3661)), "01:01:01");
//! assert_eq!(format_compact(Duration::from_secs(5400)), "1h30m");
//! ```

use std::time::Duration;

/// Format a `Duration` as `HH:MM:SS`.
///
/// Sub-second precision is truncated. Hours are not wrapped at 24, so a run of
/// 25 hours renders as `25:00:00`.
pub fn format_clock(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Format a `Duration` using the largest units that fit, e.g. `1h30m`.
pub fn format_compact(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();
    let mut remaining = total_secs;

    for (unit, size) in [('d', 86400), ('h', 3600), ('m', 60)] {
        if remaining >= size {
            result.push_str(&format!("{}{}", remaining / size, unit));
            remaining %= size;
        }
    }

    if remaining > 0 {
        result.push_str(&format!("{}s", remaining));
    }

    result
}
