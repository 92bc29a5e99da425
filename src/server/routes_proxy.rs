//! `/proxy`: manifest rewriting and binary forwarding.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{HeaderMap, Method},
    response::Response,
    routing::get,
    Router,
};
use vodrelay_common::Error;

use super::auth::{check_auth, request_token};
use super::params::{
    build_target, decode_headers_param, decode_url_param, forces_base64, parse_kind, proxy_base,
    raw_range, ProxyQuery,
};
use super::{AppContext, AppError};
use crate::manifest::{LinkContext, ProxyRequest};

pub fn proxy_routes() -> Router<AppContext> {
    Router::new().route("/proxy", get(proxy))
}

async fn proxy(
    State(ctx): State<AppContext>,
    method: Method,
    headers: HeaderMap,
    query: Result<Query<ProxyQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|e| Error::invalid_input(e.body_text()))?;

    let token = request_token(query.auth.as_deref(), &headers);
    check_auth(&ctx.config.server.auth, token)?;

    let force = forces_base64(query.form.as_deref());
    let url = decode_url_param(query.url.as_deref(), force)?;
    let custom = decode_headers_param(query.headers.as_deref(), force)?;
    let target = build_target(&ctx.config, &url, &custom, false).await?;

    let request = ProxyRequest {
        target,
        method,
        range: raw_range(&headers),
        forced: parse_kind(query.kind.as_deref())?,
        link: LinkContext {
            proxy_base: proxy_base(&ctx.config.server, &headers),
            auth_token: token.map(str::to_string),
            headers_param: query.headers.clone(),
        },
    };

    tracing::debug!(url = %request.target.url, method = %request.method, "Proxy request");
    Ok(ctx.proxy.handle(request).await?)
}
