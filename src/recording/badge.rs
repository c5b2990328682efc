/// Toolbar badge of the extension action.
pub trait Badge: Send + Sync {
    fn set_text(&self, text: &str);
    fn set_background_color(&self, color: &str);
}

/// Badge that only logs what it would display.
pub struct LogBadge;

impl Badge for LogBadge {
    fn set_text(&self, text: &str) {
        if text.is_empty() {
            tracing::info!("Badge cleared");
        } else {
            tracing::info!("Badge: {}", text);
        }
    }

    fn set_background_color(&self, color: &str) {
        tracing::debug!("Badge color: {}", color);
    }
}

const MAX_BADGE_SECONDS: u64 = 99 * 60 + 59;

/// `mm:ss`, empty at zero, saturating at `99:59`.
pub fn format_badge_text(seconds: u64) -> String {
    if seconds == 0 {
        return String::new();
    }
    let seconds = seconds.min(MAX_BADGE_SECONDS);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_badge_text() {
        assert_eq!(format_badge_text(0), "");
        assert_eq!(format_badge_text(5), "00:05");
        assert_eq!(format_badge_text(65), "01:05");
        assert_eq!(format_badge_text(5999), "99:59");
        assert_eq!(format_badge_text(100_000), "99:59");
    }
}
