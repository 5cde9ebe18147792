//! URL and filename validation utilities
//!
//! Provides security-focused validation for user inputs:
//! - URL policy (scheme, length, and private-range host blocklist)
//! - Filename sanitization for HTTP headers (prevent header injection)
//!
//! The URL policy is pattern-only by design: the server never dials the
//! user-supplied URL itself, only the extractor does, so textual matching of
//! loopback/link-local/RFC1918 hosts is the agreed posture.

use url::Url;

use crate::core::config::validation::{MAX_FILENAME_LENGTH, MAX_URL_LENGTH};

/// Host patterns that must never be handed to the extractor.
///
/// Matched case-insensitively against the host string. A trailing `*` matches
/// any suffix; plain entries require equality.
const BLOCKED_HOST_PATTERNS: &[&str] = &[
    "localhost",
    "127.*",
    "192.168.*",
    "10.*",
    "0.0.0.0",
    "::1",
];

/// Checks whether a host matches the blocklist, including the 172.16–31
/// private range which needs a numeric check rather than a glob.
fn host_is_blocked(host: &str) -> bool {
    let host = host.to_lowercase();

    for pattern in BLOCKED_HOST_PATTERNS {
        if let Some(prefix) = pattern.strip_suffix('*') {
            if host.starts_with(prefix) {
                return true;
            }
        } else if host == *pattern {
            return true;
        }
    }

    // 172.16.0.0/12: second octet 16 through 31
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next() {
            if let Ok(n) = second.parse::<u8>() {
                if (16..=31).contains(&n) {
                    return true;
                }
            }
        }
    }

    false
}

/// The URL admission predicate.
///
/// Accepts iff the input parses as an absolute http/https URL with a
/// non-empty host, is at most 2048 octets long, and the host does not match
/// the private-range blocklist. Returns only a boolean; callers surface a
/// single generic "invalid URL" error without leaking which rule fired.
///
/// Called both by the HTTP edge before admission and by the extractor client
/// before spawning (defense in depth).
pub fn is_url_allowed(raw: &str) -> bool {
    if raw.len() > MAX_URL_LENGTH {
        return false;
    }

    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return false,
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }

    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h,
        _ => return false,
    };

    // IPv6 hosts serialize with brackets; strip them before matching
    let host = host.trim_start_matches('[').trim_end_matches(']');
    !host_is_blocked(host)
}

/// Sanitizes a title into a filename safe for a Content-Disposition header.
///
/// Deliberately aggressive: everything outside `[A-Za-z0-9 _.-]` is dropped,
/// whitespace runs collapse to a single `_`, and the result is capped at 100
/// characters. An empty result falls back to the literal `"download"`.
/// The function is idempotent.
pub fn sanitize_header_filename(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-'))
        .collect();

    let mut out = String::with_capacity(filtered.len());
    let mut in_whitespace = false;
    for c in filtered.chars() {
        if c == ' ' {
            if !in_whitespace {
                out.push('_');
                in_whitespace = true;
            }
        } else {
            out.push(c);
            in_whitespace = false;
        }
    }

    let mut out: String = out.chars().take(MAX_FILENAME_LENGTH).collect();
    out = out.trim_matches('.').to_string();

    if out.is_empty() {
        "download".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== is_url_allowed Tests ====================

    #[test]
    fn test_url_allowed_valid() {
        let valid = vec![
            "https://example.com/watch?v=abc",
            "http://media.example.org/video/123",
            "https://cdn.example.net:8443/clip.mp4",
        ];
        for url in valid {
            assert!(is_url_allowed(url), "Should accept: {}", url);
        }
    }

    #[test]
    fn test_url_rejects_bad_scheme() {
        let invalid = vec![
            "ftp://example.com/file",
            "file:///etc/passwd",
            "javascript:alert(1)",
            "data:text/html,x",
        ];
        for url in invalid {
            assert!(!is_url_allowed(url), "Should reject: {}", url);
        }
    }

    #[test]
    fn test_url_rejects_blocked_hosts() {
        let invalid = vec![
            "http://localhost/x",
            "http://LOCALHOST/x",
            "http://127.0.0.1/x",
            "http://127.1.2.3:8080/x",
            "http://192.168.1.5/x",
            "http://10.0.0.1/x",
            "http://172.16.0.1/x",
            "http://172.31.255.255/x",
            "http://0.0.0.0/x",
            "http://[::1]/x",
        ];
        for url in invalid {
            assert!(!is_url_allowed(url), "Should reject: {}", url);
        }
    }

    #[test]
    fn test_url_allows_non_private_172() {
        // Only 172.16-31 is private; neighbours are routable
        assert!(is_url_allowed("http://172.15.0.1/x"));
        assert!(is_url_allowed("http://172.32.0.1/x"));
    }

    #[test]
    fn test_url_rejects_malformed() {
        let invalid = vec!["not a url", "example.com/no-scheme", ""];
        for url in invalid {
            assert!(!is_url_allowed(url), "Should reject: {}", url);
        }
    }

    #[test]
    fn test_url_rejects_oversize() {
        let long = format!("https://example.com/{}", "a".repeat(3000));
        assert!(!is_url_allowed(&long));
    }

    #[test]
    fn test_url_policy_is_deterministic() {
        let url = "https://example.com/v";
        assert_eq!(is_url_allowed(url), is_url_allowed(url));
    }

    // ==================== sanitize_header_filename Tests ====================

    #[test]
    fn test_sanitize_filename_plain() {
        assert_eq!(sanitize_header_filename("video.mp4"), "video.mp4");
        assert_eq!(sanitize_header_filename("my-clip_2024.webm"), "my-clip_2024.webm");
    }

    #[test]
    fn test_sanitize_filename_collapses_whitespace() {
        assert_eq!(sanitize_header_filename("My Great Video.mp4"), "My_Great_Video.mp4");
        assert_eq!(sanitize_header_filename("a   b.mp3"), "a_b.mp3");
    }

    #[test]
    fn test_sanitize_filename_strips_unsafe() {
        assert_eq!(sanitize_header_filename("ev\"il\r\nheader.mp4"), "evilheader.mp4");
        // Non-ASCII titles degrade to whatever ASCII survives
        assert_eq!(sanitize_header_filename("семпл.mp3"), "mp3");
        assert_eq!(sanitize_header_filename("a/b\\c.mp4"), "abc.mp4");
    }

    #[test]
    fn test_sanitize_filename_fallback() {
        assert_eq!(sanitize_header_filename(""), "download");
        assert_eq!(sanitize_header_filename("\"%\"#"), "download");
    }

    #[test]
    fn test_sanitize_filename_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_header_filename(&long).len(), 100);
    }

    #[test]
    fn test_sanitize_filename_idempotent() {
        let inputs = vec!["My Great Video.mp4", "ev\"il.mp4", "", "a   b  c.webm"];
        for input in inputs {
            let once = sanitize_header_filename(input);
            let twice = sanitize_header_filename(&once);
            assert_eq!(once, twice, "Not idempotent for: {}", input);
        }
    }

    #[test]
    fn test_sanitize_filename_preserves_extension() {
        let out = sanitize_header_filename("some title.mp4");
        assert!(out.ends_with(".mp4"));
    }
}
