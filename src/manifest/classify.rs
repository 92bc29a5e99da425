//! Manifest vs. binary classification.
//!
//! Classification runs an ordered list of [`Classifier`] strategies; the
//! first definite answer wins. Body sniffing is separate because it needs
//! downloaded bytes and only runs on the paths that already have them.

use crate::origin::probe::{probe_head, ProbeCache};
use crate::origin::{OriginClient, OriginTarget};

/// Definite kind of a proxied resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Manifest,
    Binary,
}

/// Answer of a single strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Manifest,
    Binary,
    Unknown,
}

/// Final decision plus the strategy that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub kind: ContentKind,
    pub source: Classifier,
}

impl Verdict {
    /// Forced by the caller (`type=m3u8|file`).
    pub fn forced(kind: ContentKind) -> Self {
        Self {
            kind,
            source: Classifier::Forced,
        }
    }

    /// Whether the binary path should still sniff the body for `#EXTM3U`.
    pub fn is_guess(&self) -> bool {
        self.source == Classifier::Default
    }
}

const MANIFEST_KEYWORDS: [&str; 9] = [
    "playlist", "live", "stream", "hls", "manifest", "m3u8", "ts", "segment", "chunk",
];

const MANIFEST_CONTENT_TYPES: [&str; 2] = ["application/vnd.apple.mpegurl", "application/x-mpegurl"];

/// A classification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classifier {
    /// URL path extension: `.m3u8`/`.m3u` manifest, `.ts` binary.
    Extension,
    /// Streaming keywords in host, path or query.
    Keyword,
    /// Content-Type of a short HEAD request.
    HeadProbe,
    /// Everything else is binary.
    Default,
    /// Not a strategy: marks caller-forced verdicts.
    Forced,
}

impl Classifier {
    /// The standard chain, in order.
    pub fn chain() -> Vec<Classifier> {
        vec![
            Classifier::Extension,
            Classifier::Keyword,
            Classifier::HeadProbe,
            Classifier::Default,
        ]
    }

    pub async fn classify(
        &self,
        target: &OriginTarget,
        client: &OriginClient,
        cache: &ProbeCache,
    ) -> Classification {
        match self {
            Classifier::Extension => by_extension(target),
            Classifier::Keyword => by_keyword(target),
            Classifier::HeadProbe => match probe_head(client, cache, target).await {
                Some(probe) => by_content_type(probe.content_type.as_deref()),
                None => Classification::Unknown,
            },
            Classifier::Default => Classification::Binary,
            Classifier::Forced => Classification::Unknown,
        }
    }
}

/// Run `chain` and return the first definite verdict (binary if none).
pub async fn classify(
    chain: &[Classifier],
    target: &OriginTarget,
    client: &OriginClient,
    cache: &ProbeCache,
) -> Verdict {
    for classifier in chain {
        let kind = match classifier.classify(target, client, cache).await {
            Classification::Manifest => ContentKind::Manifest,
            Classification::Binary => ContentKind::Binary,
            Classification::Unknown => continue,
        };
        tracing::debug!(url = %target.url, ?kind, ?classifier, "Classified target");
        return Verdict {
            kind,
            source: *classifier,
        };
    }
    Verdict {
        kind: ContentKind::Binary,
        source: Classifier::Default,
    }
}

fn by_extension(target: &OriginTarget) -> Classification {
    let path = target.url.path().to_ascii_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        Classification::Manifest
    } else if path.ends_with(".ts") {
        Classification::Binary
    } else {
        Classification::Unknown
    }
}

fn by_keyword(target: &OriginTarget) -> Classification {
    let haystack = format!(
        "{}{}?{}",
        target.url.host_str().unwrap_or_default(),
        target.url.path(),
        target.url.query().unwrap_or_default()
    )
    .to_ascii_lowercase();

    if MANIFEST_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        Classification::Manifest
    } else {
        Classification::Unknown
    }
}

fn by_content_type(content_type: Option<&str>) -> Classification {
    let Some(ct) = content_type else {
        return Classification::Unknown;
    };
    if MANIFEST_CONTENT_TYPES.contains(&ct) {
        Classification::Manifest
    } else if ct.starts_with("video/")
        || ct.starts_with("image/")
        || ct.starts_with("audio/")
        || ct == "application/pdf"
    {
        Classification::Binary
    } else {
        Classification::Unknown
    }
}

/// Whether `body` starts with `#EXTM3U`, ignoring a UTF-8 BOM and leading whitespace.
pub fn sniff_manifest(body: &[u8]) -> bool {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    body[start..].starts_with(b"#EXTM3U")
}
