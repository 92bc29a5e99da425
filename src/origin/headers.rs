//! Outbound request headers and the forwarded response header subset.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use vodrelay_common::{Error, Result};

/// Largest accepted serialized `headers` parameter.
pub const MAX_HEADER_BLOB_BYTES: usize = 8 * 1024;

/// Response headers copied from the origin to the client.
pub const FORWARDED_RESPONSE_HEADERS: [&str; 8] = [
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "last-modified",
    "etag",
    "cache-control",
    "expires",
];

/// Browser User-Agents picked from when a request asks for a random one.
const RANDOM_USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
];

/// One of the built-in browser User-Agents, chosen at random.
pub fn random_user_agent() -> &'static str {
    use rand::Rng as _;
    RANDOM_USER_AGENTS[rand::thread_rng().gen_range(0..RANDOM_USER_AGENTS.len())]
}

/// Replace the User-Agent in `headers` with a random browser one.
pub fn randomize_user_agent(headers: &mut HeaderMap) {
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
}

/// Parse a decoded `headers` parameter (a JSON object) into name/value pairs.
///
/// Non-string scalar values are stringified; `null` entries are dropped.
pub fn parse_header_blob(text: &str) -> Result<Vec<(String, String)>> {
    if text.len() > MAX_HEADER_BLOB_BYTES {
        return Err(Error::invalid_input(format!(
            "headers parameter exceeds {} bytes",
            MAX_HEADER_BLOB_BYTES
        )));
    }

    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)
        .map_err(|e| Error::invalid_input(format!("headers parameter is not a JSON object: {e}")))?;

    Ok(map
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((name, s)),
            other => Some((name, other.to_string())),
        })
        .collect())
}

/// Build outbound headers: `Accept: */*` and the configured User-Agent,
/// overlaid by the custom pairs (later names replace earlier ones).
pub fn outbound_headers<'a>(
    user_agent: &str,
    custom: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    if let Ok(ua) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, ua);
    }

    for (name, value) in custom {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::invalid_input(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::invalid_input(format!("invalid value for header {name}")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Copy the forwarded subset of `src` into `dst`.
pub fn copy_forwarded(src: &HeaderMap, dst: &mut HeaderMap) {
    for name in FORWARDED_RESPONSE_HEADERS {
        if let Some(value) = src.get(name) {
            dst.insert(HeaderName::from_static(name), value.clone());
        }
    }
}

/// Lower-cased Content-Type without parameters.
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_parsing_stringifies_scalars() {
        let pairs = parse_header_blob(r#"{"Referer":"http://r/","X-Num":5,"X-Null":null}"#).unwrap();
        assert!(pairs.contains(&("Referer".to_string(), "http://r/".to_string())));
        assert!(pairs.contains(&("X-Num".to_string(), "5".to_string())));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn blob_rejects_oversize_and_non_objects() {
        let big = format!(r#"{{"X":"{}"}}"#, "a".repeat(MAX_HEADER_BLOB_BYTES));
        assert_eq!(parse_header_blob(&big).unwrap_err().http_status(), 400);
        assert!(parse_header_blob("[1,2]").is_err());
        assert!(parse_header_blob("nope").is_err());
    }

    #[test]
    fn custom_headers_override_defaults() {
        let headers = outbound_headers(
            "vodrelay-test",
            [("user-agent", "Custom/1.0"), ("Cookie", "sid=1")],
        )
        .unwrap();
        assert_eq!(headers[USER_AGENT], "Custom/1.0");
        assert_eq!(headers[ACCEPT], "*/*");
        assert_eq!(headers["cookie"], "sid=1");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let err = outbound_headers("ua", [("bad name", "x")]).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn forwards_only_safe_subset() {
        let mut src = HeaderMap::new();
        src.insert("content-type", HeaderValue::from_static("video/mp4"));
        src.insert("set-cookie", HeaderValue::from_static("a=b"));
        src.insert("etag", HeaderValue::from_static("\"x\""));
        let mut dst = HeaderMap::new();
        copy_forwarded(&src, &mut dst);
        assert_eq!(dst.len(), 2);
        assert!(dst.get("set-cookie").is_none());
    }

    #[test]
    fn content_type_strips_parameters() {
        let mut h = HeaderMap::new();
        h.insert(
            "content-type",
            HeaderValue::from_static("Application/VND.Apple.MpegURL; charset=utf-8"),
        );
        assert_eq!(content_type(&h).as_deref(), Some("application/vnd.apple.mpegurl"));
    }

    #[test]
    fn random_user_agent_replaces_custom_one() {
        let mut headers = outbound_headers("vodrelay-test", [("User-Agent", "Custom/1.0")]).unwrap();
        randomize_user_agent(&mut headers);
        let ua = headers[USER_AGENT].to_str().unwrap();
        assert!(RANDOM_USER_AGENTS.contains(&ua));
        assert_eq!(headers[ACCEPT], "*/*");
    }
}
