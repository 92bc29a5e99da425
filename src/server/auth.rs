//! Shared-secret authentication.
//!
//! Proxy endpoints take the token as the `auth` query parameter because
//! players follow rewritten manifest links without custom headers. An
//! `Authorization: Bearer` header is accepted as well for API clients.

use axum::http::{header, HeaderMap};
use base64::Engine as _;
use vodrelay_common::{Error, Result};

use crate::config::AuthConfig;

/// Check the supplied token against the configured one.
pub fn check_auth(auth_config: &AuthConfig, provided: Option<&str>) -> Result<()> {
    if !auth_config.enabled {
        return Ok(());
    }

    let expected = auth_config.token.as_deref().unwrap_or_default();
    match provided.filter(|t| !t.is_empty()) {
        None => Err(Error::Unauthorized("missing auth token".into())),
        Some(token) if !expected.is_empty() && constant_time_eq(token, expected) => Ok(()),
        Some(_) => Err(Error::Unauthorized("invalid auth token".into())),
    }
}

/// The token from `auth=` or, failing that, a bearer header.
pub fn request_token<'a>(query: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    query.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
    })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a random shared secret
pub fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    URL_SAFE_NO_PAD.encode(bytes)
}
