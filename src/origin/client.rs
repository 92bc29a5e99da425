//! Pooled outbound HTTP client shared by every origin fetch.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, LOCATION, RANGE};
use reqwest::{Method, Response, StatusCode};
use url::Url;
use vodrelay_common::{Error, Result};

use super::guard::validate_target;
use super::OriginTarget;
use crate::config::OriginConfig;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// A fully buffered origin response.
#[derive(Debug)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Keep-alive connection pool plus the timeouts every fetch carries.
///
/// There is no client-wide total timeout: short requests set one per
/// request, long streamed bodies are guarded by a per-read idle timeout.
#[derive(Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    config: OriginConfig,
}

impl OriginClient {
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .tcp_keepalive(Duration::from_secs(60))
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        // Redirect targets must pass the private-network guard, which needs
        // DNS, so hops are followed by hand in `send`.
        let client = if config.allow_private_networks {
            client
        } else {
            client.redirect(reqwest::redirect::Policy::none())
        };
        let client = client
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    /// Send one request to `target`.
    ///
    /// `range` is sent verbatim as the `Range` header. `timeout` bounds each
    /// exchange including the body, so leave it unset for streams. When
    /// private networks are off every redirect hop is re-validated.
    pub async fn send(
        &self,
        method: Method,
        target: &OriginTarget,
        range: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut method = method;
        let mut url = target.url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .send_once(method.clone(), &url, &target.headers, range, timeout)
                .await?;
            if self.config.allow_private_networks || !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(next) = redirect_location(&url, &response) else {
                return Ok(response);
            };

            url = validate_target(next.as_str(), false).await?;
            if response.status() == StatusCode::SEE_OTHER && method != Method::HEAD {
                method = Method::GET;
            }
            tracing::debug!(from = %target.url, to = %url, "Following origin redirect");
        }

        Err(Error::protocol(format!(
            "more than {MAX_REDIRECTS} redirects from {}",
            target.url
        )))
    }

    async fn send_once(
        &self,
        method: Method,
        url: &Url,
        headers: &HeaderMap,
        range: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        tracing::trace!(method = %method, url = %url, range = ?range, "Origin request");
        request
            .send()
            .await
            .map_err(|e| map_reqwest_error(url.as_str(), e))
    }

    /// GET `target` and buffer the body, refusing bodies over `max_bytes`.
    pub async fn fetch_limited(
        &self,
        target: &OriginTarget,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<FetchedBody> {
        let mut response = self.send(Method::GET, target, None, Some(timeout)).await?;
        let status = response.status();
        let headers = response.headers().clone();

        if let Some(len) = declared_length(&headers) {
            if len > max_bytes {
                return Err(Error::protocol(format!(
                    "body of {len} bytes exceeds the {max_bytes} byte limit"
                )));
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(target.url.as_str(), e))?
        {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(Error::protocol(format!(
                    "body exceeds the {max_bytes} byte limit"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedBody {
            status,
            headers,
            body: body.freeze(),
        })
    }

    /// Turn a response into a body stream guarded by the idle read timeout.
    pub fn body_stream(
        &self,
        response: Response,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        body_stream(response, self.config.read_idle_timeout())
    }
}

/// Stream `response` chunk by chunk, failing when no data arrives for `idle`.
pub fn body_stream(
    mut response: Response,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    let url = response.url().to_string();
    async_stream::try_stream! {
        loop {
            let next = tokio::time::timeout(idle, response.chunk())
                .await
                .map_err(|_| Error::OriginTimeout { url: url.clone() })?
                .map_err(|e| map_reqwest_error(&url, e))?;
            match next {
                Some(bytes) => yield bytes,
                None => break,
            }
        }
    }
}

/// Absolute target of a redirect response, if it carries a usable `Location`.
fn redirect_location(current: &Url, response: &Response) -> Option<Url> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    current.join(location.trim()).ok()
}

/// `Content-Length` of a response, if present and numeric.
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Classify a reqwest failure as a timeout or an unreachable origin.
pub fn map_reqwest_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::OriginTimeout {
            url: url.to_string(),
        }
    } else {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Error::unreachable(url, message)
    }
}
