use crate::config::{Config, MediaMode};
use crate::manifest::{ManifestCache, ManifestProxy};
use crate::origin::probe::ProbeCache;
use crate::origin::OriginClient;
use crate::source::{ConfigSourceResolver, SourceResolver};
use crate::streaming::{
    sessions, MediaBackend, ParallelRangeFetcher, RangeCacheStreamer, SessionRegistry,
};
use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    response::{IntoResponse, Response},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use vodrelay_common::{CacheManager, Error};

pub mod auth;
pub mod error;
pub mod params;
pub mod routes_admin;
pub mod routes_media;
pub mod routes_proxy;

pub use error::AppError;

/// Interval of the stale-session sweep.
const SESSION_CLEANUP_SECS: u64 = 30;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Pooled outbound client shared by every component
    pub client: OriginClient,
    /// Rewritten manifests
    pub manifest_cache: Arc<ManifestCache>,
    /// Probe results (HEAD, range and length ladders)
    pub request_cache: Arc<ProbeCache>,
    pub proxy: Arc<ManifestProxy>,
    /// `/media` implementation selected by `media.mode`
    pub media: MediaBackend,
    /// Active stream sessions
    pub sessions: SessionRegistry,
    /// Resolver behind `/play/:id`
    pub resolver: Arc<dyn SourceResolver>,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Wire every component from the configuration.
    pub fn new(config: Config) -> vodrelay_common::Result<Self> {
        let client = OriginClient::new(&config.origin)?;
        let manifest_cache = Arc::new(CacheManager::new(
            "manifest",
            config.cache.manifest_settings(),
        ));
        let request_cache = Arc::new(CacheManager::new(
            "requests",
            config.cache.request_settings(),
        ));
        let sessions = SessionRegistry::new();

        let proxy = Arc::new(ManifestProxy::new(
            client.clone(),
            request_cache.clone(),
            manifest_cache.clone(),
        ));

        let media = match config.media.mode {
            MediaMode::Memory => MediaBackend::Memory(Arc::new(ParallelRangeFetcher::new(
                client.clone(),
                request_cache.clone(),
                sessions.clone(),
                config.media.clone(),
            ))),
            MediaMode::Disk => MediaBackend::Disk(Arc::new(RangeCacheStreamer::new(
                client.clone(),
                request_cache.clone(),
                sessions.clone(),
                config.media.range_cache.clone(),
            ))),
        };

        let resolver: Arc<dyn SourceResolver> =
            Arc::new(ConfigSourceResolver::new(&config.sources));

        Ok(Self {
            config: Arc::new(config),
            client,
            manifest_cache,
            request_cache,
            proxy,
            media,
            sessions,
            resolver,
            started_at: Utc::now(),
        })
    }

    /// Replace the `/play/:id` resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Start cache sweeps and the stale-session sweep.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.manifest_cache.start_cleanup_task(),
            self.request_cache.start_cleanup_task(),
            sessions::start_cleanup_task(self.sessions.clone(), SESSION_CLEANUP_SECS),
        ]
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
        ]);

    Router::new()
        .merge(routes_proxy::proxy_routes())
        .merge(routes_media::media_routes())
        .merge(routes_admin::admin_routes())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    AppError(Error::Internal(format!("handler panicked: {detail}"))).into_response()
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let ctx = AppContext::new(config).context("Failed to initialize proxy components")?;

    if let MediaBackend::Disk(streamer) = &ctx.media {
        let purged = streamer.purge_all().await;
        if purged > 0 {
            tracing::info!("Removed {} leftover chunk directories", purged);
        }
    }

    let background = ctx.start_background_tasks();
    let sessions = ctx.sessions.clone();
    let app = create_router(ctx);

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;

    for handle in background {
        handle.abort();
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(sessions: SessionRegistry) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    // Open streams would otherwise hold the graceful shutdown.
    let cancelled = sessions.cancel_all();
    tracing::info!("Shutdown signal received, cancelled {} stream sessions", cancelled);
}
