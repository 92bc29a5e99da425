//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`AppContext`] from a test
//! configuration, and [`RangeResponder`], a wiremock responder that serves
//! an in-memory resource with real byte-range semantics.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vodrelay::config::{Config, MediaMode};
use vodrelay::server::{create_router, AppContext};
use wiremock::{Request, Respond, ResponseTemplate};

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
}

impl TestHarness {
    /// Create a new harness with the default test configuration.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a new harness with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let ctx = AppContext::new(config).expect("failed to build app context");
        Self { ctx }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_config(test_config()).await
    }

    /// Start an Axum server with custom config on a random port.
    pub async fn with_server_config(config: Config) -> (Self, SocketAddr) {
        let harness = Self::with_config(config);
        let app = create_router(harness.ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }
}

/// Default configuration with loopback origins allowed, auth off and short
/// timeouts. Tests that exercise auth turn it back on with a token.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.auth.enabled = false;
    config.origin.allow_private_networks = true;
    config.origin.probe_timeout_secs = 2;
    config.origin.request_timeout_secs = 5;
    config.origin.manifest_timeout_secs = 5;
    config.origin.read_idle_timeout_secs = 5;
    config
}

/// Disk mode with chunks under `dir`.
pub fn disk_config(dir: &Path) -> Config {
    let mut config = test_config();
    config.media.mode = MediaMode::Disk;
    let rc = &mut config.media.range_cache;
    rc.dir = dir.to_path_buf();
    rc.chunk_size = 64 * 1024;
    rc.pool_size = 3;
    rc.chunk_timeout_secs = 5;
    rc.retry_delay_ms = 10;
    rc.max_chunk_attempts = 3;
    config
}

/// Deterministic, non-repeating-looking test payload.
pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31) ^ (i / 251)) as u8)
        .collect()
}

/// `?url=` value for `target`.
pub fn encoded(target: &str) -> String {
    vodrelay_common::encoding::encode_component(target)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Files (not directories) anywhere below `dir`.
pub fn files_below(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_below(&path));
        } else {
            found.push(path);
        }
    }
    found
}

/// Serves a byte buffer honouring single `Range` requests.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    content_type: &'static str,
    ranges: bool,
    head: bool,
    /// Ranged GETs (other than the `bytes=0-0` probe) that answer 500 first.
    failures: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            content_type: "video/mp4",
            ranges: true,
            head: true,
            failures: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Ignore `Range` and always answer 200 with the full body.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Answer HEAD with 405.
    pub fn without_head(mut self) -> Self {
        self.head = false;
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn template(&self, status: u16) -> ResponseTemplate {
        let template = ResponseTemplate::new(status).insert_header("content-type", self.content_type);
        let template = if self.ranges {
            template.insert_header("accept-ranges", "bytes")
        } else {
            template
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }

    fn window(&self, header: &str) -> Option<(u64, u64)> {
        let total = self.body.len() as u64;
        let spec = header.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let (start, end) = match (start.is_empty(), end.is_empty()) {
            (true, false) => {
                let n: u64 = end.parse().ok()?;
                (total.saturating_sub(n), total - 1)
            }
            (false, true) => (start.parse().ok()?, total - 1),
            (false, false) => (start.parse().ok()?, end.parse::<u64>().ok()?.min(total - 1)),
            (true, true) => return None,
        };
        Some((start, end))
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;

        if request.method.as_str() == "HEAD" {
            if !self.head {
                return ResponseTemplate::new(405);
            }
            return self.template(200).set_body_bytes(self.body.as_ref().clone());
        }

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let Some(range) = range.filter(|_| self.ranges) else {
            return self.template(200).set_body_bytes(self.body.as_ref().clone());
        };

        if range != "bytes=0-0" {
            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0
                && self
                    .failures
                    .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return ResponseTemplate::new(500);
            }
        }

        match self.window(&range) {
            Some((start, end)) if start < total && start <= end => self
                .template(206)
                .insert_header("content-range", format!("bytes {start}-{end}/{total}").as_str())
                .set_body_bytes(self.body[start as usize..=end as usize].to_vec()),
            _ => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{total}").as_str()),
        }
    }
}
