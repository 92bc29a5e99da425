//! HLS manifest handling: classification, link rewriting and the unified proxy.

pub mod classify;
pub mod proxy;
pub mod rewrite;

pub use classify::{Classification, Classifier, ContentKind, Verdict};
pub use proxy::{ManifestCache, ManifestProxy, ProxyRequest};
pub use rewrite::LinkContext;
