//! Locating the credential in a handshake.
//!
//! A client may present its token in the connection-scoped auth payload
//! (`{token}`) or as `Authorization: Bearer <token>`. Both are accepted
//! equivalently; when both are present the payload wins.

/// Token from an `Authorization` header value.
///
/// `Bearer` is matched case-insensitively. Any other scheme is passed through
/// whole so that validation classifies it as malformed instead of missing.
pub fn bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    if header.is_empty() || header.eq_ignore_ascii_case("bearer") {
        return None;
    }
    match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => {
            Some(rest.trim()).filter(|t| !t.is_empty())
        }
        _ => Some(header),
    }
}

/// Choose the credential to validate from the two handshake sources.
pub fn select_credential<'a>(
    payload_token: Option<&'a str>,
    authorization: Option<&'a str>,
) -> Option<&'a str> {
    payload_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| authorization.and_then(bearer_token))
}
