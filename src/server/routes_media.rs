//! `/media` and `/play/:id`: ranged media streaming.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, Method},
    response::Response,
    routing::get,
    Router,
};
use vodrelay_common::Error;

use super::auth::{check_auth, request_token};
use super::params::{
    build_target, decode_headers_param, decode_url_param, forces_base64, parse_flag, parse_range,
    parse_size, parse_threads, MediaQuery,
};
use super::{AppContext, AppError};
use crate::origin::OriginTarget;
use crate::streaming::MediaRequest;

pub fn media_routes() -> Router<AppContext> {
    Router::new()
        .route("/media", get(media))
        .route("/play/:id", get(play))
}

async fn media(
    State(ctx): State<AppContext>,
    method: Method,
    headers: HeaderMap,
    query: Result<Query<MediaQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|e| Error::invalid_input(e.body_text()))?;
    check_auth(
        &ctx.config.server.auth,
        request_token(query.auth.as_deref(), &headers),
    )?;

    let force = forces_base64(query.form.as_deref());
    let url = decode_url_param(query.url.as_deref(), force)?;
    let custom = decode_headers_param(query.headers.as_deref(), force)?;
    let random_ua = parse_flag("randUa", query.rand_ua.as_deref())?;
    let target = build_target(&ctx.config, &url, &custom, random_ua).await?;

    serve(&ctx, target, method, &headers, &query).await
}

async fn play(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
    query: Result<Query<MediaQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|e| Error::invalid_input(e.body_text()))?;
    check_auth(
        &ctx.config.server.auth,
        request_token(query.auth.as_deref(), &headers),
    )?;

    let source = ctx.resolver.resolve(&id).await?;

    // Request headers override the source's configured ones.
    let mut custom: Vec<(String, String)> = source.headers.into_iter().collect();
    custom.extend(decode_headers_param(
        query.headers.as_deref(),
        forces_base64(query.form.as_deref()),
    )?);
    let random_ua = parse_flag("randUa", query.rand_ua.as_deref())?;
    let target = build_target(&ctx.config, source.url.as_str(), &custom, random_ua).await?;

    tracing::debug!(id = %id, url = %target.url, "Resolved play source");
    serve(&ctx, target, method, &headers, &query).await
}

async fn serve(
    ctx: &AppContext,
    target: OriginTarget,
    method: Method,
    headers: &HeaderMap,
    query: &MediaQuery,
) -> Result<Response, AppError> {
    let request = MediaRequest {
        target,
        method,
        range: parse_range(headers)?,
        threads: parse_threads(query.thread.as_deref())?,
        chunk_size: parse_size(query.size.as_deref())?,
    };

    tracing::debug!(
        url = %request.target.url,
        mode = %ctx.media.mode(),
        range = ?request.range,
        "Media request"
    );
    Ok(ctx.media.serve(request).await?)
}
