//! Sanitization of failure details
//!
//! Plugin failures end up in logs, load reports and the permission audit trail.
//! Before any detail string leaves the runtime it is passed through
//! [`sanitize_detail`], which:
//! - replaces absolute filesystem paths with their final component
//! - redacts `key=value` pairs whose key looks like a credential
//! - caps the message length

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Maximum length of a sanitized detail message (in characters)
pub const MAX_DETAIL_CHARS: usize = 512;

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[_-]?key|token|secret|password|passwd|credential)s?(\s*[=:]\s*)[^\s,;]+")
        .expect("secret pattern is valid")
});

static UNIX_PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:/[^\s/:'",;()]+){2,}/?"#).expect("unix path pattern is valid")
});

static WINDOWS_PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[A-Za-z]:\\(?:[^\\\s:'",;()]+\\)*[^\\\s:'",;()]+"#)
        .expect("windows path pattern is valid")
});

/// Sanitize a failure detail for audit-visible output
pub fn sanitize_detail(detail: &str) -> String {
    let redacted = SECRET_PATTERN.replace_all(detail, |caps: &Captures<'_>| {
        format!("{}{}***", &caps[1], &caps[2])
    });

    let unix = UNIX_PATH_PATTERN.replace_all(&redacted, |caps: &Captures<'_>| {
        last_component(caps[0].trim_end_matches('/'), '/')
    });

    let windows = WINDOWS_PATH_PATTERN.replace_all(&unix, |caps: &Captures<'_>| {
        last_component(&caps[0], '\\')
    });

    truncate(&windows, MAX_DETAIL_CHARS)
}

fn last_component(path: &str, separator: char) -> String {
    path.rsplit(separator)
        .find(|segment| !segment.is_empty())
        .unwrap_or("<path>")
        .to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
