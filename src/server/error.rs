//! Error-to-HTTP response conversion.
//!
//! Handlers return `Result<Response, AppError>`; every [`Error`] becomes a
//! JSON body `{error, message, code}` with the status from
//! [`Error::http_status`].

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use vodrelay_common::Error;

/// Wrapper so we can implement `IntoResponse` for the shared error type.
#[derive(Debug)]
pub struct AppError(pub Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, code = self.0.code(), error = %self.0, "Request failed");
        } else {
            tracing::debug!(status = %status, code = self.0.code(), error = %self.0, "Request rejected");
        }

        let body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.0.to_string(),
            "code": self.0.code(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Error::RangeNotSatisfiable { total } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
