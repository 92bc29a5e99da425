use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use vodrelay_common::CacheSettings;

/// Browser-like User-Agent sent when the client supplies none.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub origin: OriginConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL used in rewritten manifests
    /// (e.g. `https://media.example.com`). Derived from request headers when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Allow `DELETE /cache`
    #[serde(default)]
    pub allow_cache_clear: bool,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require the `auth` query parameter on proxy endpoints. Turning this
    /// off makes the server an open proxy.
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,

    /// Shared secret (generate with `vodrelay generate-token`)
    #[serde(default)]
    pub token: Option<String>,
}

fn default_auth_enabled() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5757
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
            allow_cache_clear: false,
            auth: AuthConfig::default(),
        }
    }
}

/// Outbound connection settings shared by every origin fetch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OriginConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for a complete non-streamed request (manifests, passthrough headers)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for HEAD and ranged probes
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for downloading a manifest body
    #[serde(default = "default_manifest_timeout")]
    pub manifest_timeout_secs: u64,

    /// Maximum silence between two reads of a streamed body
    #[serde(default = "default_read_idle_timeout")]
    pub read_idle_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Skip TLS certificate verification (many media CDNs use broken chains)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Allow targets on loopback and private IPv4 networks
    #[serde(default)]
    pub allow_private_networks: bool,

    /// Bodies larger than this are never treated as manifests
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_manifest_timeout() -> u64 {
    15
}
fn default_read_idle_timeout() -> u64 {
    30
}
fn default_pool_max_idle() -> usize {
    32
}
fn default_pool_idle_timeout() -> u64 {
    90
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_max_manifest_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            manifest_timeout_secs: default_manifest_timeout(),
            read_idle_timeout_secs: default_read_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            user_agent: default_user_agent(),
            accept_invalid_certs: false,
            allow_private_networks: false,
            max_manifest_bytes: default_max_manifest_bytes(),
        }
    }
}

impl OriginConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Rewritten manifests, keyed by absolute URL
    #[serde(default)]
    pub manifest: CacheSection,

    /// Origin probe results (range support, lengths, HEAD content types)
    #[serde(default)]
    pub requests: CacheSection,
}

/// One cache instance. Unset fields take the instance's built-in default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default)]
    pub max_size: Option<usize>,

    #[serde(default)]
    pub ttl_secs: Option<u64>,

    #[serde(default)]
    pub cleanup_interval_secs: Option<u64>,

    #[serde(default)]
    pub pressure_threshold: Option<usize>,
}

impl CacheSection {
    /// Overlay the configured values on `defaults`.
    pub fn settings(&self, defaults: CacheSettings) -> CacheSettings {
        let max_size = self.max_size.unwrap_or(defaults.max_size);
        CacheSettings {
            max_size,
            default_ttl: self
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            cleanup_interval: self
                .cleanup_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            pressure_threshold: self
                .pressure_threshold
                .unwrap_or_else(|| defaults.pressure_threshold.max(max_size + max_size / 2)),
        }
    }
}

impl CacheConfig {
    pub fn manifest_settings(&self) -> CacheSettings {
        self.manifest.settings(CacheSettings {
            max_size: 200,
            default_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            pressure_threshold: 300,
        })
    }

    pub fn request_settings(&self) -> CacheSettings {
        self.requests.settings(CacheSettings {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            pressure_threshold: 1500,
        })
    }
}

/// How `/media` serves ranged content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    /// Parallel in-memory range fetching
    #[default]
    Memory,
    /// Disk-backed chunk cache
    Disk,
}

impl std::fmt::Display for MediaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaMode::Memory => write!(f, "memory"),
            MediaMode::Disk => write!(f, "disk"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub mode: MediaMode,

    /// Parallel connections when the request has no `thread` parameter
    #[serde(default = "default_threads")]
    pub default_threads: usize,

    /// Upper bound for the `thread` parameter
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Minimum sub-range size in bytes when the request has no `size` parameter
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,

    /// Skip failed sub-ranges instead of failing the response
    #[serde(default)]
    pub skip_failed_segments: bool,

    /// Bounded buffer (in body chunks) between each sub-fetch and the response
    #[serde(default = "default_segment_buffer")]
    pub segment_buffer: usize,

    #[serde(default)]
    pub range_cache: RangeCacheConfig,
}

fn default_threads() -> usize {
    1
}
fn default_max_threads() -> usize {
    16
}
fn default_chunk_size() -> u64 {
    128 * 1024
}
fn default_segment_buffer() -> usize {
    16
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            mode: MediaMode::default(),
            default_threads: default_threads(),
            max_threads: default_max_threads(),
            default_chunk_size: default_chunk_size(),
            skip_failed_segments: false,
            segment_buffer: default_segment_buffer(),
            range_cache: RangeCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeCacheConfig {
    /// Root directory for chunk files
    #[serde(default = "default_chunk_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_range_chunk_size")]
    pub chunk_size: u64,

    /// Downloader tasks per session
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// Disk budget for chunks downloaded ahead of the reader
    #[serde(default = "default_max_disk_bytes")]
    pub max_disk_bytes: u64,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,
}

fn default_chunk_dir() -> PathBuf {
    std::env::temp_dir().join("vodrelay-chunks")
}
fn default_range_chunk_size() -> u64 {
    256 * 1024
}
fn default_pool_size() -> usize {
    5
}
fn default_chunk_timeout() -> u64 {
    10
}
fn default_max_disk_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_retry_delay() -> u64 {
    500
}
fn default_max_chunk_attempts() -> u32 {
    5
}

impl Default for RangeCacheConfig {
    fn default() -> Self {
        Self {
            dir: default_chunk_dir(),
            chunk_size: default_range_chunk_size(),
            pool_size: default_pool_size(),
            chunk_timeout_secs: default_chunk_timeout(),
            max_disk_bytes: default_max_disk_bytes(),
            retry_delay_ms: default_retry_delay(),
            max_chunk_attempts: default_max_chunk_attempts(),
        }
    }
}

/// A named content source served by `/play/:id`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub id: String,

    pub url: String,

    /// Outbound headers (Referer, Cookie, ...) required by the origin
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
