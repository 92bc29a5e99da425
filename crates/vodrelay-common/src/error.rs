//! Unified error type for vodrelay.
//!
//! Every component funnels its failures into [`Error`], which carries enough
//! context for the HTTP layer to derive a status code via [`Error::http_status`]
//! and a stable machine-readable code via [`Error::code`].

use std::fmt;

/// Unified error type covering the proxy's failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad URL, query parameter or Range header. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or mismatched shared secret.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The request is understood but refused (blocked target, disabled operation).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "source").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The requested byte range lies outside the resource.
    #[error("Range not satisfiable (resource length {total})")]
    RangeNotSatisfiable {
        /// Total length of the resource, echoed in `Content-Range: bytes */total`.
        total: u64,
    },

    /// The origin could not be reached (DNS, connect, TLS, reset).
    #[error("Origin unreachable [{url}]: {message}")]
    OriginUnreachable {
        /// The origin URL that failed.
        url: String,
        /// Human-readable error description.
        message: String,
    },

    /// The origin did not answer within the configured timeout.
    #[error("Origin timed out [{url}]")]
    OriginTimeout {
        /// The origin URL that timed out.
        url: String,
    },

    /// The origin answered, but not in a way this component can use.
    #[error("Origin protocol violation: {0}")]
    OriginProtocol(String),

    /// Both the primary and the fallback handling path failed.
    #[error("Proxy failed: {first}; fallback: {second}")]
    ProxyFailed {
        /// Error from the first attempted path.
        first: Box<Error>,
        /// Error from the fallback path.
        second: Box<Error>,
    },

    /// A local I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound { .. } => 404,
            Error::RangeNotSatisfiable { .. } => 416,
            Error::OriginUnreachable { .. } => 502,
            Error::OriginTimeout { .. } => 504,
            Error::OriginProtocol(_) => 502,
            Error::ProxyFailed { .. } => 502,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound { .. } => "not_found",
            Error::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Error::OriginUnreachable { .. } => "origin_unreachable",
            Error::OriginTimeout { .. } => "origin_timeout",
            Error::OriginProtocol(_) => "origin_protocol",
            Error::ProxyFailed { .. } => "proxy_failed",
            Error::Io { .. } => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the failure came from the origin side rather than the client.
    pub fn is_origin_failure(&self) -> bool {
        matches!(
            self,
            Error::OriginUnreachable { .. }
                | Error::OriginTimeout { .. }
                | Error::OriginProtocol(_)
                | Error::ProxyFailed { .. }
        )
    }

    /// Convenience constructor for [`Error::InvalidInput`].
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::OriginUnreachable`].
    pub fn unreachable(url: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::OriginUnreachable {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::OriginProtocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::OriginProtocol(msg.into())
    }

    /// Combine the errors of a primary attempt and its fallback.
    pub fn proxy_failed(first: Error, second: Error) -> Self {
        Error::ProxyFailed {
            first: Box::new(first),
            second: Box::new(second),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
