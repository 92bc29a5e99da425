//! Query parameters shared by the proxy and media endpoints.

use axum::http::{header, HeaderMap};
use serde::Deserialize;
use vodrelay_common::encoding::{decode_param, ParamKind};
use vodrelay_common::range::parse_size_spec;
use vodrelay_common::{ByteRangeSpec, Error, Result};

use crate::config::{Config, ServerConfig};
use crate::manifest::ContentKind;
use crate::origin::guard::validate_target;
use crate::origin::headers::{outbound_headers, parse_header_blob, randomize_user_agent};
use crate::origin::OriginTarget;

/// `/proxy` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub auth: Option<String>,
    #[serde(alias = "header")]
    pub headers: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub form: Option<String>,
}

/// `/media` and `/play/:id` query string.
#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    pub url: Option<String>,
    pub auth: Option<String>,
    #[serde(alias = "header")]
    pub headers: Option<String>,
    pub form: Option<String>,
    pub thread: Option<String>,
    pub size: Option<String>,
    /// Send a random browser User-Agent to the origin.
    #[serde(rename = "randUa", alias = "rand_ua")]
    pub rand_ua: Option<String>,
}

/// Query string for endpoints that only take the token.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub auth: Option<String>,
}

/// `form=base64` forces base64 decoding of `url` and `headers`.
pub fn forces_base64(form: Option<&str>) -> bool {
    form.is_some_and(|f| f.trim().eq_ignore_ascii_case("base64"))
}

/// Decode the `url` parameter into a validated target URL string.
pub fn decode_url_param(raw: Option<&str>, force_base64: bool) -> Result<String> {
    let raw = raw
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| Error::invalid_input("missing url parameter"))?;
    decode_param(raw, ParamKind::Url, force_base64)
}

/// Decode the `headers` parameter into name/value pairs.
pub fn decode_headers_param(raw: Option<&str>, force_base64: bool) -> Result<Vec<(String, String)>> {
    match raw.filter(|r| !r.trim().is_empty()) {
        None => Ok(Vec::new()),
        Some(raw) => parse_header_blob(&decode_param(raw, ParamKind::Json, force_base64)?),
    }
}

/// Validate the target URL and build its outbound headers.
///
/// `random_ua` replaces any configured or custom User-Agent with a random
/// browser one.
pub async fn build_target(
    config: &Config,
    url: &str,
    custom_headers: &[(String, String)],
    random_ua: bool,
) -> Result<OriginTarget> {
    let url = validate_target(url, config.origin.allow_private_networks).await?;
    let mut headers = outbound_headers(
        &config.origin.user_agent,
        custom_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    )?;
    if random_ua {
        randomize_user_agent(&mut headers);
    }
    Ok(OriginTarget::new(url, headers))
}

/// Boolean query flags: `1`/`true`/`yes`/`on` and `0`/`false`/`no`/`off`.
pub fn parse_flag(name: &str, raw: Option<&str>) -> Result<bool> {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        None | Some("" | "0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(Error::invalid_input(format!("invalid {name} flag '{other}'"))),
    }
}

/// `type=m3u8|file`
pub fn parse_kind(raw: Option<&str>) -> Result<Option<ContentKind>> {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => Ok(None),
        Some("m3u8" | "m3u" | "manifest") => Ok(Some(ContentKind::Manifest)),
        Some("file" | "binary") => Ok(Some(ContentKind::Binary)),
        Some(other) => Err(Error::invalid_input(format!("unknown type '{other}'"))),
    }
}

/// `thread=N`, a positive integer.
pub fn parse_threads(raw: Option<&str>) -> Result<Option<usize>> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(Error::invalid_input(format!("invalid thread count '{raw}'"))),
        },
    }
}

/// `size=256K`
pub fn parse_size(raw: Option<&str>) -> Result<Option<u64>> {
    raw.map(str::trim)
        .filter(|r| !r.is_empty())
        .map(parse_size_spec)
        .transpose()
}

/// The client `Range` header, parsed.
pub fn parse_range(headers: &HeaderMap) -> Result<Option<ByteRangeSpec>> {
    match headers.get(header::RANGE) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::invalid_input("Range header is not ASCII"))?;
            ByteRangeSpec::parse(value).map(Some)
        }
    }
}

/// The client `Range` header verbatim, for forwarding.
pub fn raw_range(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Base URL of this proxy as the client sees it, without a trailing slash.
///
/// `server.public_base_url` wins; otherwise it is derived from
/// `X-Forwarded-Proto` / `X-Forwarded-Host` / `Host`.
pub fn proxy_base(config: &ServerConfig, headers: &HeaderMap) -> String {
    if let Some(base) = config.public_base_url.as_deref().filter(|b| !b.is_empty()) {
        return base.trim_end_matches('/').to_string();
    }

    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let proto = first("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = first("x-forwarded-host")
        .or_else(|| first(header::HOST.as_str()))
        .unwrap_or_else(|| format!("{}:{}", config.host, config.port));
    format!("{proto}://{host}")
}
