pub fn build_host() -> &'static str {
    option_env!("DESKWATCH_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("DESKWATCH_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_rev() -> &'static str {
    option_env!("DESKWATCH_BUILD_REV").unwrap_or("-")
}

/// Render the raw build time (`epoch:<secs>` or RFC3339) as `YYYY-MM-DD HH:MM:SS` UTC.
///
/// Anything unparseable is returned trimmed, so a broken build env never hides the banner.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        let dt = epoch
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0));
        if let Some(dt) = dt {
            return dt.format("%Y-%m-%d %H:%M:%S").to_string();
        }
        return raw.to_string();
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }

    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "deskwatch | headless desktop watchdog (rev {} built on {} at {})",
        build_rev(),
        build_host(),
        format_build_time_pretty(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_renders_as_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time_pretty(" epoch:86400 "), "1970-01-02 00:00:00");
    }

    #[test]
    fn rfc3339_is_normalized_to_utc() {
        assert_eq!(
            format_build_time_pretty("2024-03-01T10:00:00+02:00"),
            "2024-03-01 08:00:00"
        );
    }

    #[test]
    fn garbage_is_passed_through() {
        assert_eq!(format_build_time_pretty("epoch:soon"), "epoch:soon");
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
    }

    #[test]
    fn banner_names_the_tool() {
        assert!(banner().starts_with("deskwatch |"));
    }
}
