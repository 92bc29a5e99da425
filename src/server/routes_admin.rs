//! Health, status and cache management routes.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use vodrelay_common::{CacheStats, Error};

use super::auth::{check_auth, request_token};
use super::params::AuthQuery;
use super::{AppContext, AppError};
use crate::config::MediaMode;
use crate::streaming::StreamSession;

/// Endpoints listed by `/status`.
const ENDPOINTS: [&str; 6] = [
    "GET|HEAD /proxy?url=&auth=&headers=&type=",
    "GET|HEAD /media?url=&auth=&headers=&form=&thread=&size=",
    "GET|HEAD /play/:id",
    "DELETE /cache?auth=",
    "GET /health",
    "GET /status",
];

pub fn admin_routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/cache", axum::routing::delete(clear_cache))
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CachesResponse {
    pub manifest: CacheStats,
    pub requests: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub caches: CachesResponse,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub media_mode: MediaMode,
    pub caches: CachesResponse,
    pub sessions: Vec<StreamSession>,
    pub endpoints: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub cleared: bool,
    /// Entries removed from the manifest cache
    pub manifest: usize,
    /// Entries removed from the request cache
    pub requests: usize,
}

// ============================================================================
// Handlers
// ============================================================================

fn cache_stats(ctx: &AppContext) -> CachesResponse {
    CachesResponse {
        manifest: ctx.manifest_cache.stats(),
        requests: ctx.request_cache.stats(),
    }
}

async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        caches: cache_stats(&ctx),
    })
}

async fn status(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    query: Result<Query<AuthQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    let Query(query) = query.map_err(|e| Error::invalid_input(e.body_text()))?;
    check_auth(
        &ctx.config.server.auth,
        request_token(query.auth.as_deref(), &headers),
    )?;

    let mut sessions = ctx.sessions.list();
    sessions.sort_by_key(|s| s.started_at);

    Ok(Json(StatusResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        started_at: ctx.started_at,
        uptime_secs: (Utc::now() - ctx.started_at).num_seconds(),
        media_mode: ctx.media.mode(),
        caches: cache_stats(&ctx),
        sessions,
        endpoints: ENDPOINTS.to_vec(),
    }))
}

async fn clear_cache(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    query: Result<Query<AuthQuery>, QueryRejection>,
) -> Result<Json<ClearCacheResponse>, AppError> {
    let Query(query) = query.map_err(|e| Error::invalid_input(e.body_text()))?;
    check_auth(
        &ctx.config.server.auth,
        request_token(query.auth.as_deref(), &headers),
    )?;

    if !ctx.config.server.allow_cache_clear {
        return Err(Error::Forbidden("cache clearing is disabled".into()).into());
    }

    let manifest = ctx.manifest_cache.size();
    let requests = ctx.request_cache.size();
    ctx.manifest_cache.clear();
    ctx.request_cache.clear();
    tracing::info!(manifest, requests, "Cleared caches");

    Ok(Json(ClearCacheResponse {
        cleared: true,
        manifest,
        requests,
    }))
}
