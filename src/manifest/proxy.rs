//! Unified manifest / binary proxy.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use vodrelay_common::{CacheManager, Error, Result};

use super::classify::{classify, sniff_manifest, Classifier, ContentKind, Verdict};
use super::rewrite::{rewrite_manifest, LinkContext};
use crate::origin::client::declared_length;
use crate::origin::headers::{content_type, copy_forwarded};
use crate::origin::probe::ProbeCache;
use crate::origin::{OriginClient, OriginTarget};

/// Rewritten manifest text keyed by `manifest:<absolute url>`.
pub type ManifestCache = CacheManager<Bytes>;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// One `/proxy` request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub target: OriginTarget,
    pub method: Method,
    /// Client `Range` header, forwarded on the binary path.
    pub range: Option<String>,
    /// `type=m3u8|file`
    pub forced: Option<ContentKind>,
    pub link: LinkContext,
}

/// Classifies targets, rewrites and caches manifests, forwards binaries.
pub struct ManifestProxy {
    client: OriginClient,
    probe_cache: Arc<ProbeCache>,
    manifest_cache: Arc<ManifestCache>,
    classifiers: Vec<Classifier>,
}

impl ManifestProxy {
    pub fn new(
        client: OriginClient,
        probe_cache: Arc<ProbeCache>,
        manifest_cache: Arc<ManifestCache>,
    ) -> Self {
        Self {
            client,
            probe_cache,
            manifest_cache,
            classifiers: Classifier::chain(),
        }
    }

    /// Serve `req`, retrying on the other path when the first one fails.
    pub async fn handle(&self, req: ProxyRequest) -> Result<Response> {
        let verdict = match req.forced {
            Some(kind) => Verdict::forced(kind),
            None => {
                classify(
                    &self.classifiers,
                    &req.target,
                    &self.client,
                    &self.probe_cache,
                )
                .await
            }
        };

        match verdict.kind {
            ContentKind::Manifest => match self.serve_manifest(&req).await {
                Ok(resp) => Ok(resp),
                Err(first) => {
                    tracing::warn!(url = %req.target.url, error = %first, "Manifest path failed, retrying as binary");
                    self.serve_binary(&req, false)
                        .await
                        .map_err(|second| Error::proxy_failed(first, second))
                }
            },
            ContentKind::Binary => match self.serve_binary(&req, verdict.is_guess()).await {
                Ok(resp) => Ok(resp),
                Err(first) => {
                    tracing::warn!(url = %req.target.url, error = %first, "Binary path failed, retrying as manifest");
                    self.serve_manifest(&req)
                        .await
                        .map_err(|second| Error::proxy_failed(first, second))
                }
            },
        }
    }

    fn cache_key(target: &OriginTarget) -> String {
        format!("manifest:{}", target.url)
    }

    async fn serve_manifest(&self, req: &ProxyRequest) -> Result<Response> {
        let key = Self::cache_key(&req.target);
        if let Some(text) = self.manifest_cache.get(&key) {
            tracing::debug!(url = %req.target.url, "Manifest cache hit");
            return manifest_response(text);
        }

        let config = self.client.config();
        let fetched = self
            .client
            .fetch_limited(
                &req.target,
                config.manifest_timeout(),
                config.max_manifest_bytes,
            )
            .await?;

        if !sniff_manifest(&fetched.body) {
            tracing::debug!(
                url = %req.target.url,
                status = %fetched.status,
                "Body on manifest path is not a playlist, serving raw"
            );
            return raw_response(fetched.status, &fetched.headers, Body::from(fetched.body));
        }

        self.rewrite_and_cache(req, key, &fetched.body)
    }

    fn rewrite_and_cache(&self, req: &ProxyRequest, key: String, body: &[u8]) -> Result<Response> {
        let text = String::from_utf8_lossy(body);
        let rewritten = Bytes::from(rewrite_manifest(&text, &req.target.url, &req.link));
        self.manifest_cache.set(key, rewritten.clone(), None);
        tracing::debug!(url = %req.target.url, bytes = rewritten.len(), "Rewrote manifest");
        manifest_response(rewritten)
    }

    async fn serve_binary(&self, req: &ProxyRequest, sniff: bool) -> Result<Response> {
        let config = self.client.config();
        let send = self
            .client
            .send(req.method.clone(), &req.target, req.range.as_deref(), None);
        let response = tokio::time::timeout(config.request_timeout(), send)
            .await
            .map_err(|_| Error::OriginTimeout {
                url: req.target.url.to_string(),
            })??;

        let status = response.status();
        let headers = response.headers().clone();

        if req.method == Method::HEAD {
            return raw_response(status, &headers, Body::empty());
        }

        let mut body = self.client.body_stream(response).boxed();

        let sniffable = sniff
            && req.range.is_none()
            && status.is_success()
            && !content_type(&headers).is_some_and(|ct| {
                ct.starts_with("video/") || ct.starts_with("audio/") || ct.starts_with("image/")
            })
            && declared_length(&headers).map_or(true, |len| len <= config.max_manifest_bytes);

        if !sniffable {
            return raw_response(status, &headers, Body::from_stream(body));
        }

        // Peek at the first chunk; reuse it whatever the outcome.
        let first = match body.next().await {
            Some(chunk) => chunk?,
            None => return raw_response(status, &headers, Body::empty()),
        };

        if !sniff_manifest(&first) {
            let rest = stream::once(async move { Ok::<_, Error>(first) }).chain(body);
            return raw_response(status, &headers, Body::from_stream(rest));
        }

        let mut buf = BytesMut::from(&first[..]);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if (buf.len() + chunk.len()) as u64 > config.max_manifest_bytes {
                return Err(Error::protocol("sniffed manifest exceeds the size limit"));
            }
            buf.extend_from_slice(&chunk);
        }

        tracing::debug!(url = %req.target.url, "Binary path body sniffed as manifest");
        self.rewrite_and_cache(req, Self::cache_key(&req.target), &buf)
    }
}

fn manifest_response(text: Bytes) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONTENT_LENGTH, text.len())
        .body(Body::from(text))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Mirror the origin status and the forwarded header subset.
fn raw_response(status: StatusCode, origin_headers: &HeaderMap, body: Body) -> Result<Response> {
    let mut response = Response::builder()
        .status(status)
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()))?;
    copy_forwarded(origin_headers, response.headers_mut());
    Ok(response)
}
