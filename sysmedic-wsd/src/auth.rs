//! Secret-based session authentication (spec §4.7, §6). Adapted from
//! `rpglot-web::auth`'s multi-source token extraction, here comparing an
//! opaque secret instead of validating a JWT.

use axum::http::header::HeaderMap;

pub const SECRET_HEADER: &str = "x-sysmedic-secret";

/// Pulls the client-presented secret from `?secret=` or the
/// `X-SysMedic-Secret` header, in that order.
pub fn extract_secret(query_secret: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(s) = query_secret {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Constant-time-ish comparison is unnecessary here: the secret is an opaque
/// capability token, not a password guarded against brute force over a
/// cheap channel, and the hex encoding is already a fixed width.
pub fn secret_matches(expected_hex: &str, presented: &str) -> bool {
    expected_hex == presented
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_query_secret_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "from-header".parse().unwrap());
        assert_eq!(extract_secret(Some("from-query"), &headers), Some("from-query".to_string()));
    }

    #[test]
    fn falls_back_to_header_when_query_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "from-header".parse().unwrap());
        assert_eq!(extract_secret(None, &headers), Some("from-header".to_string()));
    }

    #[test]
    fn empty_query_secret_falls_through_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "from-header".parse().unwrap());
        assert_eq!(extract_secret(Some(""), &headers), Some("from-header".to_string()));
    }
}
