//! Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

/// Pick the post-login target: `requested` when it starts with an allowed
/// prefix, otherwise `fallback`.
pub fn safe_redirect(requested: Option<&str>, allowed_prefixes: &[String], fallback: &str) -> String {
    match requested {
        Some(target) if is_allowed_redirect(target, allowed_prefixes) => target.to_string(),
        _ => fallback.to_string(),
    }
}

fn is_allowed_redirect(target: &str, allowed_prefixes: &[String]) -> bool {
    allowed_prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        // "http://host" must not admit "http://host.evil.com"
        target == prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(['/', '?', '#']))
    })
}

/// Validate a caller-supplied upstream path.
///
/// The path must be absolute and must not be able to change the authority
/// or escape the service root once appended to the base URL.
pub fn validate_upstream_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path is required".to_string());
    }

    if path.len() > 2048 {
        return Err("Path must be at most 2048 characters long".to_string());
    }

    if !path.starts_with('/') || path.starts_with("//") {
        return Err("Path must be absolute".to_string());
    }

    static PATH_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = PATH_REGEX.get_or_init(|| {
        Regex::new(r"^/[A-Za-z0-9._~!$&'()*+,;=:@%/-]*(\?[A-Za-z0-9._~!$&'()*+,;=:@%/?-]*)?$")
            .expect("Failed to compile path regex")
    });

    if !regex.is_match(path) {
        return Err("Path contains forbidden characters".to_string());
    }

    let route = path.split('?').next().unwrap_or_default();
    if route.split('/').any(is_parent_segment) {
        return Err("Path must not contain parent segments".to_string());
    }

    Ok(())
}

/// `..` in any mix of literal and percent-encoded dots
fn is_parent_segment(segment: &str) -> bool {
    segment.to_ascii_lowercase().replace("%2e", ".") == ".."
}
