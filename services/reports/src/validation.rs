//! Report request validation

use regex::Regex;
use std::sync::OnceLock;

use crate::models::Period;

/// Subject ids end up in object keys, so only path-safe characters pass.
pub fn validate_user_uuid(user_uuid: &str) -> Result<(), String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("Failed to compile user uuid regex")
    });

    if !pattern.is_match(user_uuid) {
        return Err(
            "user_uuid must be 1 to 128 characters of letters, digits, '-' or '_'".to_string(),
        );
    }
    Ok(())
}

pub fn validate_period(period: &Period) -> Result<(), String> {
    if let (Some(start), Some(end)) = (period.start, period.end) {
        if start > end {
            return Err("start_ts must not be after end_ts".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_validate_user_uuid() {
        assert!(validate_user_uuid("54885c9b-6eea-48f7-89f9-353ad8273e95").is_ok());
        assert!(validate_user_uuid("prothetic_1").is_ok());

        assert!(validate_user_uuid("").is_err());
        assert!(validate_user_uuid("../other").is_err());
        assert!(validate_user_uuid("a/b").is_err());
        assert!(validate_user_uuid(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_period() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        assert!(validate_period(&Period { start: Some(early), end: Some(late) }).is_ok());
        assert!(validate_period(&Period { start: Some(early), end: Some(early) }).is_ok());
        assert!(validate_period(&Period { start: Some(late), end: None }).is_ok());
        assert!(validate_period(&Period { start: Some(late), end: Some(early) }).is_err());
    }
}
