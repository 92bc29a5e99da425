//! Outbound side of the proxy: the pooled HTTP client, target identity,
//! probing ladders, header handling and the target guard.

pub mod client;
pub mod guard;
pub mod headers;
pub mod probe;

pub use client::OriginClient;
pub use probe::ProbeResult;

use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};
use url::Url;

/// A remote resource plus the outbound headers needed to fetch it.
///
/// Two targets with the same URL but different headers (cookies, referer)
/// are distinct origin resources and never share probe results.
#[derive(Debug, Clone)]
pub struct OriginTarget {
    pub url: Url,
    pub headers: HeaderMap,
}

impl OriginTarget {
    pub fn new(url: Url, headers: HeaderMap) -> Self {
        Self { url, headers }
    }

    /// SHA-256 over the URL and the sorted, lower-cased header pairs.
    pub fn fingerprint(&self) -> String {
        let mut pairs: Vec<(String, &[u8])> = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_ascii_lowercase(), value.as_bytes()))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.url.as_str().as_bytes());
        for (name, value) in pairs {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value);
        }
        hex::encode(hasher.finalize())
    }

    /// SHA-256 hex of the URL alone. Names the range cache chunk directory.
    pub fn url_key(&self) -> String {
        hex::encode(Sha256::digest(self.url.as_str().as_bytes()))
    }

    pub fn has_cookie(&self) -> bool {
        self.headers.contains_key(reqwest::header::COOKIE)
    }
}
