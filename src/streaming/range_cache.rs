//! Disk-backed chunk cache streamer.
//!
//! A session splits the resource into fixed-size chunks. A bounded pool of
//! downloader tasks claims chunk indices in ascending order and writes each
//! one to `<dir>/<url key>/<session>-<index>.part`, renaming it to `.chunk`
//! once complete. A single reader task receives ready-chunk events,
//! reorders them, streams exactly the requested bytes and deletes each file
//! after it has been sent.
//!
//! Only one URL's chunks are kept on disk: starting a session for another
//! URL cancels sessions still streaming the previous one and purges its
//! directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::CONTENT_RANGE;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use vodrelay_common::range::parse_content_range;
use vodrelay_common::{Error, RangeWindow, Result};

use super::sessions::{SessionGuard, SessionKind, SessionRegistry, SessionState};
use super::{map_request_range, ranged_response, MediaRequest};
use crate::config::RangeCacheConfig;
use crate::origin::client::map_reqwest_error;
use crate::origin::headers::header_str;
use crate::origin::probe::{probe_range, ProbeCache};
use crate::origin::{OriginClient, OriginTarget};

/// Upper bound for the per-request `thread` override.
const MAX_POOL_SIZE: usize = 32;

/// Body chunks buffered between the reader and the client connection.
const BODY_BUFFER: usize = 4;

/// Fallback poll interval for workers waiting on the disk budget.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(50);

/// Serves ranged GET/HEAD requests through the on-disk chunk cache.
pub struct RangeCacheStreamer {
    client: OriginClient,
    probe_cache: Arc<ProbeCache>,
    sessions: SessionRegistry,
    config: RangeCacheConfig,
    current_key: Mutex<Option<String>>,
}

impl RangeCacheStreamer {
    pub fn new(
        client: OriginClient,
        probe_cache: Arc<ProbeCache>,
        sessions: SessionRegistry,
        config: RangeCacheConfig,
    ) -> Self {
        Self {
            client,
            probe_cache,
            sessions,
            config,
            current_key: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RangeCacheConfig {
        &self.config
    }

    /// URL key whose chunks are currently retained.
    pub fn current_key(&self) -> Option<String> {
        self.current_key.lock().clone()
    }

    pub async fn serve(&self, req: MediaRequest) -> Result<Response> {
        let probe = match probe_range(&self.client, &self.probe_cache, &req.target).await {
            Ok(probe) => probe,
            Err(Error::OriginProtocol(msg)) => {
                tracing::info!(url = %req.target.url, reason = %msg, "Range probe rejected, redirecting");
                return redirect(&req.target);
            }
            Err(e) => return Err(e),
        };

        let total = match (probe.supports_range, probe.total_length) {
            (true, Some(total)) if total > 0 => total,
            _ => {
                tracing::info!(url = %req.target.url, "Origin lacks range support, redirecting");
                return redirect(&req.target);
            }
        };

        let (window, partial) = map_request_range(req.range.as_ref(), total)?;
        if req.method == Method::HEAD {
            return ranged_response(window, partial, total, &probe, Body::empty());
        }

        let url_key = req.target.url_key();
        self.switch_current(&url_key).await;

        let dir = self.config.dir.join(&url_key);
        tokio::fs::create_dir_all(&dir).await?;

        let guard = self
            .sessions
            .register(SessionKind::RangeCache, req.target.url.as_str(), &url_key);
        guard.set_state(SessionState::RangeResolved);

        let pool_size = req
            .threads
            .unwrap_or(self.config.pool_size)
            .clamp(1, MAX_POOL_SIZE);
        let plan = ChunkPlan {
            window,
            total,
            chunk_size: self.config.chunk_size.max(1),
        };
        let shared = Arc::new(Shared {
            session_id: guard.id().to_string(),
            dir,
            target: req.target.clone(),
            plan,
            client: self.client.clone(),
            chunk_timeout: Duration::from_secs(self.config.chunk_timeout_secs),
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
            max_attempts: self.config.max_chunk_attempts.max(1),
            ahead_limit: (self.config.max_disk_bytes / plan.chunk_size).max(1),
            next_claim: AtomicU64::new(plan.first_index()),
            read_cursor: AtomicU64::new(plan.first_index()),
            progress: Notify::new(),
            token: guard.token().clone(),
        });

        tracing::debug!(
            session_id = %shared.session_id,
            url = %req.target.url,
            start = window.start,
            end = window.end,
            chunks = plan.chunk_count(),
            pool_size,
            "Starting range cache session"
        );

        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        tokio::spawn(run_session(shared, pool_size, body_tx, guard));

        ranged_response(
            window,
            partial,
            total,
            &probe,
            Body::from_stream(ReceiverStream::new(body_rx)),
        )
    }

    /// Remove every chunk directory, e.g. leftovers from a previous run.
    pub async fn purge_all(&self) -> usize {
        self.purge_except(None).await
    }

    /// Make `url_key` the retained key, cancelling and purging any other.
    async fn switch_current(&self, url_key: &str) {
        let previous = {
            let mut current = self.current_key.lock();
            if current.as_deref() == Some(url_key) {
                return;
            }
            current.replace(url_key.to_string())
        };

        let cancelled = self
            .sessions
            .cancel_where(|s| s.kind == SessionKind::RangeCache && s.url_key != url_key);
        let purged = self.purge_except(Some(url_key)).await;
        tracing::info!(
            previous = ?previous,
            current = %url_key,
            cancelled,
            purged,
            "Switched range cache key"
        );
    }

    async fn purge_except(&self, keep: Option<&str>) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.dir).await else {
            return 0;
        };
        let mut purged = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if Some(name) == keep || !is_url_key(name) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => {
                    tracing::debug!(dir = %name, error = %e, "Failed to purge chunk directory");
                }
            }
        }
        purged
    }
}

fn is_url_key(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn redirect(target: &OriginTarget) -> Result<Response> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, target.url.as_str())
        .body(Body::empty())
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Chunk arithmetic for one session.
#[derive(Debug, Clone, Copy)]
struct ChunkPlan {
    window: RangeWindow,
    total: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    fn first_index(&self) -> u64 {
        self.window.start / self.chunk_size
    }

    fn last_index(&self) -> u64 {
        self.window.end / self.chunk_size
    }

    fn chunk_count(&self) -> u64 {
        self.last_index() - self.first_index() + 1
    }

    /// Bytes of the resource covered by chunk `index`.
    fn chunk_window(&self, index: u64) -> RangeWindow {
        let start = index * self.chunk_size;
        let end = ((index + 1) * self.chunk_size).min(self.total) - 1;
        RangeWindow::new(start, end)
    }

    /// Offset and length inside chunk `index` that belong to the requested window.
    fn slice_of(&self, index: u64) -> Option<(usize, usize)> {
        let chunk = self.chunk_window(index);
        let wanted = chunk.intersect(&self.window)?;
        Some((
            (wanted.start - chunk.start) as usize,
            wanted.len() as usize,
        ))
    }
}

enum Claim {
    Index(u64),
    Wait,
    Done,
}

/// State shared by the reader and the downloaders of one session.
struct Shared {
    session_id: String,
    dir: PathBuf,
    target: OriginTarget,
    plan: ChunkPlan,
    client: OriginClient,
    chunk_timeout: Duration,
    retry_delay: Duration,
    max_attempts: u32,
    /// Chunks allowed between the read cursor and the next claim.
    ahead_limit: u64,
    next_claim: AtomicU64,
    read_cursor: AtomicU64,
    progress: Notify,
    token: CancellationToken,
}

impl Shared {
    fn chunk_path(&self, index: u64, ext: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.{}", self.session_id, index, ext))
    }

    fn file_prefix(&self) -> String {
        format!("{}-", self.session_id)
    }

    fn try_claim(&self) -> Claim {
        let last = self.plan.last_index();
        loop {
            let next = self.next_claim.load(Ordering::Acquire);
            if next > last {
                return Claim::Done;
            }
            let cursor = self.read_cursor.load(Ordering::Acquire);
            if next.saturating_sub(cursor) >= self.ahead_limit {
                return Claim::Wait;
            }
            if self
                .next_claim
                .compare_exchange(next, next + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Claim::Index(next);
            }
        }
    }
}

enum ChunkEvent {
    Ready { index: u64, path: PathBuf },
    Failed { index: u64, error: Error },
}

enum Outcome {
    Completed,
    ClientGone,
    Cancelled,
    Failed(Error),
}

async fn run_session(
    shared: Arc<Shared>,
    pool_size: usize,
    body_tx: mpsc::Sender<Result<Bytes>>,
    guard: SessionGuard,
) {
    let mut sweeper = FileSweeper {
        dir: shared.dir.clone(),
        prefix: shared.file_prefix(),
        armed: true,
    };

    let (event_tx, event_rx) = mpsc::channel(pool_size * 2);
    let mut workers = JoinSet::new();
    let worker_count = (pool_size as u64).min(shared.plan.chunk_count());
    for _ in 0..worker_count {
        workers.spawn(download_worker(shared.clone(), event_tx.clone()));
    }
    drop(event_tx);

    guard.set_state(SessionState::Streaming);
    let outcome = read_chunks(&shared, event_rx, &body_tx).await;

    match outcome {
        Outcome::Completed => {
            tracing::debug!(session_id = %shared.session_id, "Range cache session completed");
        }
        Outcome::ClientGone => {
            tracing::debug!(session_id = %shared.session_id, "Client disconnected");
        }
        Outcome::Cancelled => {
            tracing::info!(session_id = %shared.session_id, "Range cache session cancelled");
            let _ = body_tx
                .send(Err(Error::Internal("stream session cancelled".into())))
                .await;
        }
        Outcome::Failed(error) => {
            tracing::error!(session_id = %shared.session_id, error = %error, "Range cache session failed");
            let _ = body_tx.send(Err(error)).await;
        }
    }
    drop(body_tx);

    shared.token.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(session_id = %shared.session_id, "Chunk worker panicked");
            }
        }
    }

    remove_session_files(&shared.dir, &shared.file_prefix()).await;
    sweeper.armed = false;
    drop(guard);
}

async fn read_chunks(
    shared: &Shared,
    mut events: mpsc::Receiver<ChunkEvent>,
    body: &mpsc::Sender<Result<Bytes>>,
) -> Outcome {
    let mut pending: BTreeMap<u64, PathBuf> = BTreeMap::new();
    let mut cursor = shared.plan.first_index();
    let last = shared.plan.last_index();

    loop {
        while let Some(path) = pending.remove(&cursor) {
            let bytes = match read_slice(&shared.plan, cursor, &path).await {
                Ok(bytes) => bytes,
                Err(e) => return Outcome::Failed(e),
            };
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove consumed chunk");
            }
            shared.read_cursor.store(cursor + 1, Ordering::Release);
            shared.progress.notify_waiters();

            tokio::select! {
                sent = body.send(Ok(bytes)) => {
                    if sent.is_err() {
                        return Outcome::ClientGone;
                    }
                }
                _ = shared.token.cancelled() => return Outcome::Cancelled,
            }

            if cursor == last {
                return Outcome::Completed;
            }
            cursor += 1;
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(ChunkEvent::Ready { index, path }) => {
                    pending.insert(index, path);
                }
                Some(ChunkEvent::Failed { index, error }) => {
                    tracing::warn!(session_id = %shared.session_id, index, "Chunk exhausted its retries");
                    return Outcome::Failed(error);
                }
                None => {
                    return Outcome::Failed(Error::Internal(
                        "chunk workers exited before the range was complete".into(),
                    ));
                }
            },
            _ = body.closed() => return Outcome::ClientGone,
            _ = shared.token.cancelled() => return Outcome::Cancelled,
        }
    }
}

async fn read_slice(plan: &ChunkPlan, index: u64, path: &Path) -> Result<Bytes> {
    let data = Bytes::from(tokio::fs::read(path).await?);
    let expected = plan.chunk_window(index).len();
    if data.len() as u64 != expected {
        return Err(Error::Internal(format!(
            "chunk {index} has {} bytes, expected {expected}",
            data.len()
        )));
    }
    let (offset, len) = plan
        .slice_of(index)
        .ok_or_else(|| Error::Internal(format!("chunk {index} is outside the window")))?;
    Ok(data.slice(offset..offset + len))
}

async fn download_worker(shared: Arc<Shared>, events: mpsc::Sender<ChunkEvent>) {
    while let Some(index) = claim_next(&shared).await {
        let event = match fetch_chunk(&shared, index).await {
            None => return,
            Some(Ok(path)) => ChunkEvent::Ready { index, path },
            Some(Err(error)) => ChunkEvent::Failed { index, error },
        };
        let failed = matches!(event, ChunkEvent::Failed { .. });

        tokio::select! {
            sent = events.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = shared.token.cancelled() => return,
        }
        if failed {
            return;
        }
    }
}

/// Claim the next chunk index, waiting while the disk budget is used up.
async fn claim_next(shared: &Shared) -> Option<u64> {
    loop {
        if shared.token.is_cancelled() {
            return None;
        }
        match shared.try_claim() {
            Claim::Index(index) => return Some(index),
            Claim::Done => return None,
            Claim::Wait => {
                tokio::select! {
                    _ = shared.token.cancelled() => return None,
                    _ = shared.progress.notified() => {}
                    _ = tokio::time::sleep(BACKPRESSURE_POLL) => {}
                }
            }
        }
    }
}

/// Download chunk `index` with retries. `None` means the session was cancelled.
async fn fetch_chunk(shared: &Shared, index: u64) -> Option<Result<PathBuf>> {
    let ready = shared.chunk_path(index, "chunk");
    let part = shared.chunk_path(index, "part");
    let window = shared.plan.chunk_window(index);

    let mut attempt = 0;
    loop {
        attempt += 1;

        if let Ok(meta) = tokio::fs::metadata(&ready).await {
            if meta.len() == window.len() {
                return Some(Ok(ready));
            }
        }

        let result = tokio::select! {
            _ = shared.token.cancelled() => None,
            result = download(shared, window, &part) => Some(result),
        };
        let result = match result {
            Some(result) => result,
            None => {
                let _ = tokio::fs::remove_file(&part).await;
                return None;
            }
        };

        let result = match result {
            Ok(()) => tokio::fs::rename(&part, &ready).await.map_err(Error::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::trace!(session_id = %shared.session_id, index, "Chunk ready");
                return Some(Ok(ready));
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&part).await;
                if attempt >= shared.max_attempts {
                    return Some(Err(error));
                }
                tracing::warn!(
                    session_id = %shared.session_id,
                    index,
                    attempt,
                    error = %error,
                    "Chunk download failed, retrying"
                );
                tokio::select! {
                    _ = shared.token.cancelled() => return None,
                    _ = tokio::time::sleep(shared.retry_delay) => {}
                }
            }
        }
    }
}

async fn download(shared: &Shared, window: RangeWindow, part: &Path) -> Result<()> {
    let url = shared.target.url.as_str();
    let mut response = shared
        .client
        .send(
            Method::GET,
            &shared.target,
            Some(&window.range_header()),
            Some(shared.chunk_timeout),
        )
        .await?;

    let status = response.status();
    if status == StatusCode::PARTIAL_CONTENT {
        let reported = header_str(response.headers(), CONTENT_RANGE.as_str())
            .and_then(parse_content_range)
            .and_then(|cr| cr.window);
        if let Some(reported) = reported {
            if reported.start != window.start || reported.end < window.end {
                return Err(Error::protocol(format!(
                    "chunk request for {} answered {}",
                    window.range_header(),
                    reported.content_range(shared.plan.total)
                )));
            }
        }
    } else if !(status == StatusCode::OK
        && window.start == 0
        && window.len() == shared.plan.total)
    {
        return Err(Error::protocol(format!(
            "chunk request for {} answered {status}",
            window.range_header()
        )));
    }

    let mut file = tokio::fs::File::create(part).await?;
    let mut written = 0u64;
    while written < window.len() {
        let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(url, e))?
        else {
            break;
        };
        let take = (chunk.len() as u64).min(window.len() - written) as usize;
        file.write_all(&chunk[..take]).await?;
        written += take as u64;
    }
    file.flush().await?;

    if written != window.len() {
        return Err(Error::protocol(format!(
            "chunk {} ended after {written} of {} bytes",
            window.range_header(),
            window.len()
        )));
    }
    Ok(())
}

async fn remove_session_files(dir: &Path, prefix: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::debug!(path = %entry.path().display(), error = %e, "Failed to remove chunk file");
            }
        }
    }
}

/// Synchronous fallback removal of a session's files if its task unwinds.
struct FileSweeper {
    dir: PathBuf,
    prefix: String,
    armed: bool,
}

impl Drop for FileSweeper {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&self.prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}
