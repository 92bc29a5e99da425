//! Parallel in-memory range fetching.
//!
//! The requested window is split into contiguous sub-ranges, each fetched
//! by its own task with its own `Range` header. Every task feeds a bounded
//! channel; the response drains the channels strictly in order, so bytes
//! reach the client in sequence while later sub-ranges download ahead.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_RANGE;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vodrelay_common::range::parse_content_range;
use vodrelay_common::{Error, RangeWindow, Result};

use super::sessions::{SessionGuard, SessionKind, SessionRegistry, SessionState};
use super::{map_request_range, passthrough, ranged_response, MediaRequest};
use crate::config::MediaConfig;
use crate::origin::client::declared_length;
use crate::origin::headers::header_str;
use crate::origin::probe::{probe_length, ProbeCache};
use crate::origin::{OriginClient, OriginTarget};

/// Serves `/media` by splitting ranges over concurrent origin connections.
pub struct ParallelRangeFetcher {
    client: OriginClient,
    probe_cache: Arc<ProbeCache>,
    sessions: SessionRegistry,
    config: MediaConfig,
}

impl ParallelRangeFetcher {
    pub fn new(
        client: OriginClient,
        probe_cache: Arc<ProbeCache>,
        sessions: SessionRegistry,
        config: MediaConfig,
    ) -> Self {
        Self {
            client,
            probe_cache,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub async fn serve(&self, req: MediaRequest) -> Result<Response> {
        let probe = probe_length(&self.client, &self.probe_cache, &req.target).await?;
        let Some(total) = probe.total_length.filter(|t| *t > 0) else {
            return passthrough(&self.client, &self.sessions, &req).await;
        };
        if !probe.supports_range {
            tracing::debug!(url = %req.target.url, "Origin ignores ranges, passing through");
            return passthrough(&self.client, &self.sessions, &req).await;
        }

        let (window, partial) = map_request_range(req.range.as_ref(), total)?;
        if req.method == Method::HEAD {
            return ranged_response(window, partial, total, &probe, Body::empty());
        }

        let threads = req
            .threads
            .unwrap_or(self.config.default_threads)
            .clamp(1, self.config.max_threads.max(1));
        let chunk_size = req.chunk_size.unwrap_or(self.config.default_chunk_size);
        let windows = plan_parts(window, threads, chunk_size);

        let guard = self.sessions.register(
            SessionKind::Parallel,
            req.target.url.as_str(),
            &req.target.url_key(),
        );
        guard.set_state(SessionState::Fetching);

        tracing::debug!(
            session_id = %guard.id(),
            url = %req.target.url,
            start = window.start,
            end = window.end,
            parts = windows.len(),
            "Starting parallel range fetch"
        );

        let stream = fetch_ordered(
            self.client.clone(),
            req.target.clone(),
            windows,
            self.config.segment_buffer,
            self.config.skip_failed_segments,
            guard,
        );
        ranged_response(window, partial, total, &probe, Body::from_stream(stream))
    }
}

/// Split `window` into `min(threads, ceil(len / chunk_size))` near-equal parts.
fn plan_parts(window: RangeWindow, threads: usize, chunk_size: u64) -> Vec<RangeWindow> {
    let by_size = window.len().div_ceil(chunk_size.max(1));
    let parts = (threads as u64).min(by_size).max(1);
    window.split_even(parts as usize)
}

fn fetch_ordered(
    client: OriginClient,
    target: OriginTarget,
    windows: Vec<RangeWindow>,
    buffer: usize,
    skip_failed: bool,
    guard: SessionGuard,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    let token = guard.token().clone();
    let mut tasks = JoinSet::new();
    let mut receivers = Vec::with_capacity(windows.len());
    for window in windows {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tasks.spawn(fetch_segment(
            client.clone(),
            target.clone(),
            window,
            tx,
            token.clone(),
        ));
        receivers.push((window, rx));
    }

    async_stream::stream! {
        // Dropping the set aborts any sub-fetch still running.
        let _tasks = tasks;
        guard.set_state(SessionState::Streaming);

        'segments: for (window, mut rx) in receivers {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => None,
                    item = rx.recv() => Some(item),
                };
                match next {
                    None => {
                        yield Err(Error::Internal("stream session cancelled".into()));
                        break 'segments;
                    }
                    Some(None) => break,
                    Some(Some(Ok(bytes))) => yield Ok(bytes),
                    Some(Some(Err(error))) if skip_failed => {
                        tracing::warn!(
                            session_id = %guard.id(),
                            range = %window.range_header(),
                            error = %error,
                            "Skipping failed sub-range"
                        );
                        break;
                    }
                    Some(Some(Err(error))) => {
                        tracing::error!(
                            session_id = %guard.id(),
                            range = %window.range_header(),
                            error = %error,
                            "Sub-range failed, aborting response"
                        );
                        token.cancel();
                        yield Err(error);
                        break 'segments;
                    }
                }
            }
        }
        drop(guard);
    }
}

async fn fetch_segment(
    client: OriginClient,
    target: OriginTarget,
    window: RangeWindow,
    tx: mpsc::Sender<Result<Bytes>>,
    token: CancellationToken,
) {
    let result = tokio::select! {
        _ = token.cancelled() => return,
        result = pump_segment(&client, &target, window, &tx) => result,
    };
    if let Err(e) = result {
        let _ = tx.send(Err(e)).await;
    }
}

/// Fetch one sub-range and forward exactly `window.len()` bytes.
async fn pump_segment(
    client: &OriginClient,
    target: &OriginTarget,
    window: RangeWindow,
    tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<()> {
    let range = window.range_header();
    let send = client.send(Method::GET, target, Some(&range), None);
    let response = tokio::time::timeout(client.config().request_timeout(), send)
        .await
        .map_err(|_| Error::OriginTimeout {
            url: target.url.to_string(),
        })??;

    let status = response.status();
    let headers = response.headers();
    match status {
        StatusCode::PARTIAL_CONTENT => {
            let reported = header_str(headers, CONTENT_RANGE.as_str())
                .and_then(parse_content_range)
                .and_then(|cr| cr.window);
            if let Some(reported) = reported {
                if reported.start != window.start || reported.end < window.end {
                    return Err(Error::protocol(format!(
                        "sub-range {} answered bytes {}-{}",
                        window.range_header(),
                        reported.start,
                        reported.end
                    )));
                }
            }
        }
        StatusCode::OK if window.start == 0 && declared_length(headers) == Some(window.len()) => {}
        _ => {
            return Err(Error::protocol(format!(
                "sub-range {} answered {status}",
                window.range_header()
            )));
        }
    }

    let mut remaining = window.len();
    let mut body = std::pin::pin!(client.body_stream(response));
    while remaining > 0 {
        let Some(chunk) = body.next().await else {
            return Err(Error::protocol(format!(
                "sub-range {} ended {remaining} bytes short",
                window.range_header()
            )));
        };
        let mut chunk = chunk?;
        if chunk.len() as u64 > remaining {
            chunk.truncate(remaining as usize);
        }
        remaining -= chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            // Response dropped.
            return Ok(());
        }
    }
    Ok(())
}
