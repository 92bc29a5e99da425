//! vodrelay-common: shared types for the vodrelay proxy.
//!
//! Provides the unified error type, the in-process LRU+TTL cache used for
//! manifests and origin probes, byte-range arithmetic, and query parameter
//! encoding helpers.

pub mod cache;
pub mod encoding;
pub mod error;
pub mod range;

// Re-export the most commonly used items at the crate root.
pub use cache::{CacheManager, CacheSettings, CacheStats};
pub use error::{Error, Result};
pub use range::{ByteRangeSpec, RangeWindow};
