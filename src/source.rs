//! Content sources for `/play/:id`.
//!
//! A resolver maps a stable source id to the origin URL and the outbound
//! headers needed to fetch it. Site-specific resolvers can implement
//! [`SourceResolver`]; the server ships with one backed by `[[sources]]`
//! entries in the configuration file.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use url::Url;
use vodrelay_common::{Error, Result};

use crate::config::SourceConfig;

/// Where a source id points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: Url,
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `id`, or fail with [`Error::NotFound`].
    async fn resolve(&self, id: &str) -> Result<ResolvedSource>;
}

/// Resolver over the statically configured `[[sources]]` table.
#[derive(Debug, Default)]
pub struct ConfigSourceResolver {
    sources: HashMap<String, ResolvedSource>,
}

impl ConfigSourceResolver {
    /// Build the table. Entries with an unparseable URL are skipped with a warning.
    pub fn new(sources: &[SourceConfig]) -> Self {
        let mut table = HashMap::with_capacity(sources.len());
        for source in sources {
            match Url::parse(&source.url) {
                Ok(url) => {
                    table.insert(
                        source.id.clone(),
                        ResolvedSource {
                            url,
                            headers: source.headers.clone(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(id = %source.id, url = %source.url, error = %e, "Skipping source with invalid URL");
                }
            }
        }
        Self { sources: table }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SourceResolver for ConfigSourceResolver {
    async fn resolve(&self, id: &str) -> Result<ResolvedSource> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("source", id))
    }
}
