//! Ranged media streaming.
//!
//! `/media` and `/play` are served by one of two backends, chosen by
//! `media.mode`:
//!
//! - **memory**: [`ParallelRangeFetcher`] splits the requested range into
//!   concurrent origin sub-fetches and streams them back in order.
//! - **disk**: [`RangeCacheStreamer`] downloads fixed-size chunks ahead of the
//!   reader into a per-URL directory and streams them in order.
//!
//! Both answer 200 for requests without a `Range` header, 206 with
//! `Content-Range` otherwise, and 416 for ranges past the end.

pub mod parallel;
pub mod range_cache;
pub mod sessions;

pub use parallel::ParallelRangeFetcher;
pub use range_cache::RangeCacheStreamer;
pub use sessions::{SessionGuard, SessionKind, SessionRegistry, SessionState, StreamSession};

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use vodrelay_common::{ByteRangeSpec, Error, RangeWindow, Result};

use crate::config::MediaMode;
use crate::origin::headers::copy_forwarded;
use crate::origin::{OriginClient, OriginTarget, ProbeResult};

/// One `/media` (or `/play`) request after parameter decoding.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub target: OriginTarget,
    pub method: Method,
    pub range: Option<ByteRangeSpec>,
    /// `thread` parameter
    pub threads: Option<usize>,
    /// `size` parameter in bytes
    pub chunk_size: Option<u64>,
}

/// The configured `/media` implementation.
#[derive(Clone)]
pub enum MediaBackend {
    Memory(Arc<ParallelRangeFetcher>),
    Disk(Arc<RangeCacheStreamer>),
}

impl MediaBackend {
    pub fn mode(&self) -> MediaMode {
        match self {
            MediaBackend::Memory(_) => MediaMode::Memory,
            MediaBackend::Disk(_) => MediaMode::Disk,
        }
    }

    pub async fn serve(&self, req: MediaRequest) -> Result<Response> {
        match self {
            MediaBackend::Memory(fetcher) => fetcher.serve(req).await,
            MediaBackend::Disk(streamer) => streamer.serve(req).await,
        }
    }
}

/// Map the client range onto a resource of `total` bytes.
///
/// Returns the window and whether the answer is partial (206).
pub(crate) fn map_request_range(
    range: Option<&ByteRangeSpec>,
    total: u64,
) -> Result<(RangeWindow, bool)> {
    match range {
        Some(spec) => Ok((spec.resolve(total)?, true)),
        None => RangeWindow::full(total)
            .map(|w| (w, false))
            .ok_or(Error::RangeNotSatisfiable { total }),
    }
}

/// Build a 200/206 response for a mapped range around `body`.
pub(crate) fn ranged_response(
    window: RangeWindow,
    partial: bool,
    total: u64,
    probe: &ProbeResult,
    body: Body,
) -> Result<Response> {
    let mut builder = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, window.len())
        .header(
            header::CONTENT_TYPE,
            probe
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        );
    if partial {
        builder = builder.header(header::CONTENT_RANGE, window.content_range(total));
    }
    if let Some(etag) = &probe.etag {
        builder = builder.header(header::ETAG, etag);
    }
    if let Some(modified) = &probe.last_modified {
        builder = builder.header(header::LAST_MODIFIED, modified);
    }
    builder
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Forward a single origin request unchanged (status, safe headers, body).
///
/// Used when no usable length can be established for ranged serving.
pub(crate) async fn passthrough(
    client: &OriginClient,
    sessions: &SessionRegistry,
    req: &MediaRequest,
) -> Result<Response> {
    let range = req.range.map(|r| r.to_string());
    let send = client.send(req.method.clone(), &req.target, range.as_deref(), None);
    let response = tokio::time::timeout(client.config().request_timeout(), send)
        .await
        .map_err(|_| Error::OriginTimeout {
            url: req.target.url.to_string(),
        })??;

    let status = response.status();
    let mut headers = HeaderMap::new();
    copy_forwarded(response.headers(), &mut headers);

    tracing::info!(url = %req.target.url, status = %status, "Serving media as passthrough");

    let body = if req.method == Method::HEAD {
        Body::empty()
    } else {
        let guard = sessions.register(
            SessionKind::Passthrough,
            req.target.url.as_str(),
            &req.target.url_key(),
        );
        guard.set_state(SessionState::Streaming);
        Body::from_stream(guarded(client.body_stream(response), guard))
    };

    let mut out = Response::builder()
        .status(status)
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()))?;
    *out.headers_mut() = headers;
    Ok(out)
}

/// Tie a body stream to its session: dropping the stream ends the session,
/// cancelling the session ends the stream with an error.
pub(crate) fn guarded<S>(stream: S, guard: SessionGuard) -> impl Stream<Item = Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let token = guard.token().clone();
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => None,
                item = stream.next() => Some(item),
            };
            match next {
                Some(Some(item)) => yield item,
                Some(None) => break,
                None => {
                    yield Err(Error::Internal("stream session cancelled".into()));
                    break;
                }
            }
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_range_maps_to_full_200() {
        let (window, partial) = map_request_range(None, 1000).unwrap();
        assert_eq!(window, RangeWindow::new(0, 999));
        assert!(!partial);
    }

    #[test]
    fn range_maps_to_206() {
        let spec = ByteRangeSpec::FromTo(500_000, 599_999);
        let (window, partial) = map_request_range(Some(&spec), 1_000_000).unwrap();
        assert!(partial);
        assert_eq!(window.len(), 100_000);
    }

    #[test]
    fn past_end_is_416() {
        let spec = ByteRangeSpec::From(999_999_999);
        let err = map_request_range(Some(&spec), 1_000_000).unwrap_err();
        assert_eq!(err.http_status(), 416);
    }

    #[test]
    fn ranged_response_headers() {
        let probe = ProbeResult {
            content_type: Some("video/mp4".into()),
            etag: Some("\"abc\"".into()),
            ..Default::default()
        };
        let resp = ranged_response(
            RangeWindow::new(500_000, 599_999),
            true,
            1_000_000,
            &probe,
            Body::empty(),
        )
        .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers()[header::CONTENT_RANGE],
            "bytes 500000-599999/1000000"
        );
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "100000");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(resp.headers()[header::ETAG], "\"abc\"");
    }
}
