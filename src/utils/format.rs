//! Human-readable durations for alert text and logs

/// Format seconds as "M:SS", or "H:MM:SS" once an hour has passed.
pub fn format_clock(secs: f64) -> String {
    let total_seconds = secs.max(0.0) as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Format a duration as a compact uptime string ("1h 2m 3s")
pub fn format_uptime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(59.9), "0:59");
        assert_eq!(format_clock(600.0), "10:00");
        assert_eq!(format_clock(3725.0), "1:02:05");
        assert_eq!(format_clock(-4.0), "0:00");
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3723), "1h 2m 3s");
    }
}
