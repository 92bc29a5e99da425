//! HTTP byte-range types.
//!
//! Parsing of client `Range` headers and origin `Content-Range` headers, and
//! the inclusive [`RangeWindow`] that the streaming components work in.

use std::fmt;

use crate::error::{Error, Result};

/// A single byte-range request as sent by a client (`Range: bytes=...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `bytes=s-e`
    FromTo(u64, u64),
    /// `bytes=s-`
    From(u64),
    /// `bytes=-n` (the last `n` bytes)
    Suffix(u64),
}

impl ByteRangeSpec {
    /// Parse a `Range` header value. Only single `bytes` ranges are accepted.
    pub fn parse(header: &str) -> Result<Self> {
        let invalid = || Error::invalid_input(format!("unsupported Range header: {header}"));

        let spec = header.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        if spec.contains(',') {
            return Err(invalid());
        }
        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => Ok(Self::Suffix(end.parse().map_err(|_| invalid())?)),
            (false, true) => Ok(Self::From(start.parse().map_err(|_| invalid())?)),
            (false, false) => Ok(Self::FromTo(
                start.parse().map_err(|_| invalid())?,
                end.parse().map_err(|_| invalid())?,
            )),
            (true, true) => Err(invalid()),
        }
    }

    /// Resolve against a resource of `total` bytes, clamping the end to `total - 1`.
    ///
    /// Fails with [`Error::RangeNotSatisfiable`] when the start lies at or past
    /// the end of the resource, when start > end, or for an empty suffix.
    pub fn resolve(&self, total: u64) -> Result<RangeWindow> {
        let unsatisfiable = Error::RangeNotSatisfiable { total };
        if total == 0 {
            return Err(unsatisfiable);
        }
        let last = total - 1;
        match *self {
            Self::FromTo(start, end) => {
                if start >= total || start > end {
                    return Err(unsatisfiable);
                }
                Ok(RangeWindow::new(start, end.min(last)))
            }
            Self::From(start) => {
                if start >= total {
                    return Err(unsatisfiable);
                }
                Ok(RangeWindow::new(start, last))
            }
            Self::Suffix(0) => Err(unsatisfiable),
            Self::Suffix(n) => Ok(RangeWindow::new(total.saturating_sub(n), last)),
        }
    }
}

impl fmt::Display for ByteRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromTo(s, e) => write!(f, "bytes={s}-{e}"),
            Self::From(s) => write!(f, "bytes={s}-"),
            Self::Suffix(n) => write!(f, "bytes=-{n}"),
        }
    }
}

/// Inclusive byte window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub end: u64,
}

impl RangeWindow {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "window start {start} past end {end}");
        Self { start, end }
    }

    /// The whole resource.
    pub fn full(total: u64) -> Option<Self> {
        (total > 0).then(|| Self::new(0, total - 1))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }

    /// `Range` value for an outbound request covering this window.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Split into at most `parts` contiguous windows of near-equal length.
    ///
    /// Earlier windows absorb the remainder, so lengths differ by at most one.
    pub fn split_even(&self, parts: usize) -> Vec<RangeWindow> {
        let len = self.len();
        let parts = (parts.max(1) as u64).min(len);
        let base = len / parts;
        let remainder = len % parts;

        let mut windows = Vec::with_capacity(parts as usize);
        let mut cursor = self.start;
        for i in 0..parts {
            let size = base + u64::from(i < remainder);
            windows.push(RangeWindow::new(cursor, cursor + size - 1));
            cursor += size;
        }
        windows
    }

    /// Intersection with another window, if any.
    pub fn intersect(&self, other: &RangeWindow) -> Option<RangeWindow> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then(|| RangeWindow::new(start, end))
    }
}

/// Content-Range as reported by an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `None` for the unsatisfied form `bytes */total`.
    pub window: Option<RangeWindow>,
    /// `None` when the origin reports `/*`.
    pub total: Option<u64>,
}

/// Parse a `Content-Range` header (`bytes 0-99/1000`, `bytes */1000`, `bytes 0-99/*`).
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let window = match range.trim() {
        "*" => None,
        r => {
            let (s, e) = r.split_once('-')?;
            let (s, e): (u64, u64) = (s.trim().parse().ok()?, e.trim().parse().ok()?);
            if s > e {
                return None;
            }
            Some(RangeWindow::new(s, e))
        }
    };
    Some(ContentRange { window, total })
}

/// Total resource length from a `Content-Range` header, if stated.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    parse_content_range(value)?.total
}

/// Parse a size like `256K`, `4m`, `1G` or plain bytes.
pub fn parse_size_spec(value: &str) -> Result<u64> {
    let value = value.trim();
    let invalid = || Error::invalid_input(format!("invalid size: {value}"));
    if value.is_empty() {
        return Err(invalid());
    }

    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1024u64),
        Some('m' | 'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let bytes = n.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes == 0 {
        return Err(invalid());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(
            ByteRangeSpec::parse("bytes=0-499").unwrap(),
            ByteRangeSpec::FromTo(0, 499)
        );
        assert_eq!(
            ByteRangeSpec::parse("bytes=500-").unwrap(),
            ByteRangeSpec::From(500)
        );
        assert_eq!(
            ByteRangeSpec::parse("bytes=-200").unwrap(),
            ByteRangeSpec::Suffix(200)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["items=0-1", "bytes=-", "bytes=a-b", "bytes=0-1,4-5", "bytes=5"] {
            let err = ByteRangeSpec::parse(bad).unwrap_err();
            assert_eq!(err.http_status(), 400, "{bad}");
        }
    }

    #[test]
    fn resolve_clamps_end() {
        let w = ByteRangeSpec::FromTo(900, 5000).resolve(1000).unwrap();
        assert_eq!(w, RangeWindow::new(900, 999));
        assert_eq!(w.len(), 100);
    }

    #[test]
    fn resolve_suffix_and_open() {
        assert_eq!(
            ByteRangeSpec::Suffix(100).resolve(1000).unwrap(),
            RangeWindow::new(900, 999)
        );
        assert_eq!(
            ByteRangeSpec::Suffix(5000).resolve(1000).unwrap(),
            RangeWindow::new(0, 999)
        );
        assert_eq!(
            ByteRangeSpec::From(10).resolve(1000).unwrap(),
            RangeWindow::new(10, 999)
        );
    }

    #[test]
    fn resolve_unsatisfiable() {
        for spec in [
            ByteRangeSpec::From(999_999_999),
            ByteRangeSpec::FromTo(1000, 1001),
            ByteRangeSpec::FromTo(10, 5),
            ByteRangeSpec::Suffix(0),
        ] {
            let err = spec.resolve(1000).unwrap_err();
            assert!(matches!(err, Error::RangeNotSatisfiable { total: 1000 }));
        }
    }

    #[test]
    fn single_byte_range_is_allowed() {
        let w = ByteRangeSpec::FromTo(7, 7).resolve(10).unwrap();
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn content_range_header() {
        let w = RangeWindow::new(500_000, 599_999);
        assert_eq!(w.content_range(1_000_000), "bytes 500000-599999/1000000");
        assert_eq!(w.range_header(), "bytes=500000-599999");
    }

    #[test]
    fn split_even_covers_window_in_order() {
        let w = RangeWindow::new(0, 999_999);
        let parts = w.split_even(4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], RangeWindow::new(0, 249_999));
        assert_eq!(parts[3].end, 999_999);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }

    #[test]
    fn split_even_spreads_remainder() {
        let parts = RangeWindow::new(10, 19).split_even(3);
        let lens: Vec<u64> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![4, 3, 3]);
        // Never more parts than bytes.
        assert_eq!(RangeWindow::new(0, 1).split_even(8).len(), 2);
    }

    #[test]
    fn intersect() {
        let a = RangeWindow::new(0, 99);
        assert_eq!(
            a.intersect(&RangeWindow::new(50, 150)),
            Some(RangeWindow::new(50, 99))
        );
        assert_eq!(a.intersect(&RangeWindow::new(100, 150)), None);
    }

    #[test]
    fn content_range_parsing() {
        let cr = parse_content_range("bytes 0-0/12345").unwrap();
        assert_eq!(cr.window, Some(RangeWindow::new(0, 0)));
        assert_eq!(cr.total, Some(12345));
        assert_eq!(parse_content_range_total("bytes */777"), Some(777));
        assert_eq!(parse_content_range_total("bytes 0-9/*"), None);
        assert!(parse_content_range("0-9/10").is_none());
    }

    #[test]
    fn size_spec() {
        assert_eq!(parse_size_spec("256K").unwrap(), 256 * 1024);
        assert_eq!(parse_size_spec("4m").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size_spec("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size_spec("1000").unwrap(), 1000);
        assert!(parse_size_spec("").is_err());
        assert!(parse_size_spec("0").is_err());
        assert!(parse_size_spec("12X").is_err());
    }
}
