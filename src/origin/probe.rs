//! Origin probing ladders.
//!
//! Each ladder establishes a [`ProbeResult`] for an [`OriginTarget`] and
//! stores it in the request cache under a ladder-specific prefix, so a
//! resource is probed at most once per TTL for each purpose.

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_RANGE, ETAG, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use vodrelay_common::range::parse_content_range_total;
use vodrelay_common::{CacheManager, Error, Result};

use super::client::declared_length;
use super::headers::{content_type, header_str};
use super::{OriginClient, OriginTarget};

/// Request cache holding probe outcomes.
pub type ProbeCache = CacheManager<ProbeResult>;

/// What a probe learned about an origin resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub supports_range: bool,
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl ProbeResult {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            supports_range: accepts_byte_ranges(headers),
            total_length: None,
            content_type: content_type(headers),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).map(str::to_string),
            etag: header_str(headers, ETAG.as_str()).map(str::to_string),
        }
    }
}

fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    header_str(headers, ACCEPT_RANGES.as_str())
        .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"))
}

fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_RANGE.as_str()).and_then(parse_content_range_total)
}

/// Range-cache probe: a `bytes=0-0` GET.
///
/// Range support requires a 206 plus `Accept-Ranges: bytes`, a
/// `Content-Range` header or `Content-Length: 1`. The total length comes
/// from `Content-Range`, or from `Content-Length` on a plain 200.
/// Cached under `range:<fingerprint>`.
pub async fn probe_range(
    client: &OriginClient,
    cache: &ProbeCache,
    target: &OriginTarget,
) -> Result<ProbeResult> {
    let key = format!("range:{}", target.fingerprint());
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }

    let timeout = client.config().probe_timeout();
    let response = client
        .send(Method::GET, target, Some("bytes=0-0"), Some(timeout))
        .await?;
    let status = response.status();
    let headers = response.headers();

    if status.is_client_error() || status.is_server_error() {
        return Err(Error::protocol(format!(
            "range probe answered {status} for {}",
            target.url
        )));
    }

    let mut result = ProbeResult::from_headers(headers);
    if status == StatusCode::PARTIAL_CONTENT {
        result.supports_range = accepts_byte_ranges(headers)
            || headers.contains_key(CONTENT_RANGE)
            || declared_length(headers) == Some(1);
        result.total_length = content_range_total(headers);
    } else {
        result.supports_range = false;
        result.total_length = declared_length(headers);
    }

    tracing::debug!(
        url = %target.url,
        status = %status,
        supports_range = result.supports_range,
        total_length = ?result.total_length,
        "Range probe"
    );

    cache.set(key, result.clone(), None);
    Ok(result)
}

/// Length ladder used by the parallel fetcher.
///
/// Tries HEAD (skipped when the outbound headers carry a cookie, since
/// cookie-gated origins often mishandle HEAD), then a `bytes=0-1` GET, then
/// a full GET dropped right after the headers. A result without
/// `total_length` means no step produced one. Successful results are cached
/// under `length:<fingerprint>`.
pub async fn probe_length(
    client: &OriginClient,
    cache: &ProbeCache,
    target: &OriginTarget,
) -> Result<ProbeResult> {
    let key = format!("length:{}", target.fingerprint());
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }

    let timeout = client.config().probe_timeout();
    let mut last_error = None;
    let mut fallback = None;

    if !target.has_cookie() {
        match client.send(Method::HEAD, target, None, Some(timeout)).await {
            Ok(resp) if resp.status().is_success() => {
                let mut result = ProbeResult::from_headers(resp.headers());
                result.total_length = declared_length(resp.headers()).filter(|len| *len > 0);
                // Without Accept-Ranges the ranged GET below settles range support.
                if result.total_length.is_some() && result.supports_range {
                    return Ok(remember(cache, key, target, "head", result));
                }
                fallback = Some(result);
            }
            Ok(resp) => {
                tracing::debug!(url = %target.url, status = %resp.status(), "HEAD probe rejected");
            }
            Err(e) => {
                tracing::debug!(url = %target.url, error = %e, "HEAD probe failed");
                last_error = Some(e);
            }
        }
    }

    match client
        .send(Method::GET, target, Some("bytes=0-1"), Some(timeout))
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            let headers = resp.headers();
            if status == StatusCode::PARTIAL_CONTENT {
                let mut result = ProbeResult::from_headers(headers);
                result.supports_range = true;
                result.total_length = content_range_total(headers);
                if result.total_length.is_some() {
                    return Ok(remember(cache, key, target, "range-get", result));
                }
                fallback.get_or_insert(result);
            } else if status.is_success() {
                let mut result = ProbeResult::from_headers(headers);
                result.total_length = declared_length(headers).filter(|len| *len > 0);
                if result.total_length.is_some() {
                    return Ok(remember(cache, key, target, "range-get", result));
                }
                fallback.get_or_insert(result);
            } else {
                tracing::debug!(url = %target.url, status = %status, "Ranged GET probe rejected");
            }
        }
        Err(e) => {
            tracing::debug!(url = %target.url, error = %e, "Ranged GET probe failed");
            last_error = Some(e);
        }
    }

    match client.send(Method::GET, target, None, Some(timeout)).await {
        Ok(resp) if resp.status().is_success() => {
            let mut result = ProbeResult::from_headers(resp.headers());
            result.total_length = declared_length(resp.headers()).filter(|len| *len > 0);
            // Dropping the response here closes the body after the headers.
            drop(resp);
            if result.total_length.is_some() {
                return Ok(remember(cache, key, target, "full-get", result));
            }
            fallback.get_or_insert(result);
        }
        Ok(resp) => {
            tracing::debug!(url = %target.url, status = %resp.status(), "Full GET probe rejected");
        }
        Err(e) => {
            tracing::debug!(url = %target.url, error = %e, "Full GET probe failed");
            last_error = Some(e);
        }
    }

    match (fallback, last_error) {
        (Some(result), _) => Ok(result),
        (None, Some(err)) => Err(err),
        (None, None) => Ok(ProbeResult::default()),
    }
}

fn remember(
    cache: &ProbeCache,
    key: String,
    target: &OriginTarget,
    step: &'static str,
    result: ProbeResult,
) -> ProbeResult {
    tracing::debug!(
        url = %target.url,
        step,
        total_length = ?result.total_length,
        supports_range = result.supports_range,
        "Resolved origin length"
    );
    cache.set(key, result.clone(), None);
    result
}

/// Short HEAD probe used by the manifest classifier.
///
/// Returns `None` on any failure. Successful results are cached under
/// `head:<fingerprint>`.
pub async fn probe_head(
    client: &OriginClient,
    cache: &ProbeCache,
    target: &OriginTarget,
) -> Option<ProbeResult> {
    let key = format!("head:{}", target.fingerprint());
    if let Some(hit) = cache.get(&key) {
        return Some(hit);
    }

    let timeout = client.config().probe_timeout();
    match client.send(Method::HEAD, target, None, Some(timeout)).await {
        Ok(resp) if resp.status().is_success() => {
            let mut result = ProbeResult::from_headers(resp.headers());
            result.total_length = declared_length(resp.headers());
            cache.set(key, result.clone(), None);
            Some(result)
        }
        Ok(resp) => {
            tracing::debug!(url = %target.url, status = %resp.status(), "HEAD classification probe rejected");
            None
        }
        Err(e) => {
            tracing::debug!(url = %target.url, error = %e, "HEAD classification probe failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginConfig;
    use reqwest::header::{HeaderValue, COOKIE};
    use url::Url;
    use vodrelay_common::CacheSettings;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup() -> (OriginClient, ProbeCache) {
        (
            OriginClient::new(&OriginConfig::default()).unwrap(),
            ProbeCache::new("probe-test", CacheSettings::default()),
        )
    }

    fn target(server: &MockServer) -> OriginTarget {
        OriginTarget::new(
            Url::parse(&format!("{}/v.mp4", server.uri())).unwrap(),
            HeaderMap::new(),
        )
    }

    #[tokio::test]
    async fn range_request_reads_content_range_total() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-0/5000")
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(vec![0u8]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let t = target(&server);
        let first = probe_range(&client, &cache, &t).await.unwrap();
        assert!(first.supports_range);
        assert_eq!(first.total_length, Some(5000));
        assert_eq!(first.content_type.as_deref(), Some("video/mp4"));

        // Second call is served from the cache (mock expects one hit).
        let second = probe_range(&client, &cache, &t).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn range_request_without_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let result = probe_range(&client, &cache, &target(&server)).await.unwrap();
        assert!(!result.supports_range);
    }

    #[tokio::test]
    async fn length_ladder_prefers_head() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "1234")
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let t = target(&server);
        let result = probe_length(&client, &cache, &t).await.unwrap();
        assert_eq!(result.total_length, Some(1234));
        assert!(cache.has(&format!("length:{}", t.fingerprint())));
    }

    #[tokio::test]
    async fn length_ladder_confirms_ranges_when_head_is_silent() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "4096"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let result = probe_length(&client, &cache, &target(&server)).await.unwrap();
        assert_eq!(result.total_length, Some(4096));
        assert!(!result.supports_range);
    }

    #[tokio::test]
    async fn length_ladder_skips_head_with_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "1"))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-1"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-1/777")
                    .set_body_bytes(vec![0u8, 1]),
            )
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let mut t = target(&server);
        t.headers.insert(COOKIE, HeaderValue::from_static("sid=1"));
        let result = probe_length(&client, &cache, &t).await.unwrap();
        assert_eq!(result.total_length, Some(777));
        assert!(result.supports_range);
    }

    #[tokio::test]
    async fn length_ladder_without_any_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let result = probe_length(&client, &cache, &target(&server)).await.unwrap();
        assert_eq!(result.total_length, None);
    }

    #[tokio::test]
    async fn head_request_caches_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/vnd.apple.mpegurl"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (client, cache) = setup();
        let t = target(&server);
        for _ in 0..2 {
            let result = probe_head(&client, &cache, &t).await.unwrap();
            assert_eq!(
                result.content_type.as_deref(),
                Some("application/vnd.apple.mpegurl")
            );
        }
    }
}
