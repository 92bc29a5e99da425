//! Query parameter encoding helpers.
//!
//! Clients pass target URLs and header blobs either percent-encoded or
//! base64-encoded. [`decode_param`] accepts both; [`encode_component`]
//! produces the percent-encoded form used in rewritten manifest links.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{Error, Result};

/// Characters left unescaped by `encodeURIComponent`: RFC 3986 unreserved plus `!*'()`.
const URI_COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// What a decoded parameter is expected to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// An absolute `http(s)` URL.
    Url,
    /// A JSON object.
    Json,
}

impl ParamKind {
    fn accepts(self, value: &str) -> bool {
        match self {
            ParamKind::Url => {
                let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
                lower.starts_with("http://") || lower.starts_with("https://")
            }
            ParamKind::Json => value.starts_with('{') && value.ends_with('}'),
        }
    }
}

/// Percent-encode a value the way `encodeURIComponent` does.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT_SET).to_string()
}

/// Decode a query parameter that the query extractor has already percent-decoded once.
///
/// Values that already look like `kind` are returned untouched. Otherwise a
/// further percent-decoding pass is tried, then standard and URL-safe base64.
/// When nothing produces a plausible value the input comes back unchanged
/// and the caller's own validation reports the problem.
///
/// With `force_base64` the value must be valid base64 of UTF-8 text.
pub fn decode_param(raw: &str, kind: ParamKind, force_base64: bool) -> Result<String> {
    let value = raw.trim();

    if force_base64 {
        return base64_text(value)
            .ok_or_else(|| Error::invalid_input("parameter is not valid base64"));
    }

    if kind.accepts(value) {
        return Ok(value.to_string());
    }

    if value.contains('%') {
        if let Ok(decoded) = percent_decode_str(value).decode_utf8() {
            if kind.accepts(decoded.trim()) {
                return Ok(decoded.trim().to_string());
            }
        }
    }

    for engine in [&STANDARD_LENIENT, &URL_SAFE_LENIENT] {
        if let Some(text) = engine
            .decode(value)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            if kind.accepts(text.trim()) {
                return Ok(text.trim().to_string());
            }
        }
    }

    Ok(value.to_string())
}

fn base64_text(value: &str) -> Option<String> {
    [&STANDARD_LENIENT, &URL_SAFE_LENIENT]
        .into_iter()
        .find_map(|engine| engine.decode(value).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(|text| text.trim().to_string())
}
