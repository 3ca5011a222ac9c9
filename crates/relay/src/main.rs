mod api;
mod auth;
mod cells;
mod config;
mod cors;
mod db;
mod error;
mod rooms;
mod snapshot;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use url::Url;

use crate::auth::{CollabTokenService, TokenVerifier};
use crate::cells::{CellCache, CellValueStore, MemoryCellStore, PgCellStore};
use crate::config::RelayConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::rooms::{RelayTuning, RoomRegistry};
use crate::snapshot::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared handles behind every HTTP and websocket handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: Arc<RoomRegistry>,
    pub(crate) tokens: Arc<CollabTokenService>,
    pub(crate) verifier: Arc<TokenVerifier>,
    pub(crate) cells: CellCache,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) internal_token: Arc<str>,
}

impl AppState {
    /// Fully in-memory state, for dev runs without a database and for tests.
    pub(crate) fn in_memory(token_secret: &str, internal_token: &str) -> Result<AppState> {
        AppState::assemble(
            token_secret,
            internal_token,
            None,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemoryCellStore::new()),
        )
    }

    fn with_postgres(config: &RelayConfig, pool: PgPool) -> Result<AppState> {
        AppState::assemble(
            &config.token_secret,
            &config.internal_token,
            config.verify_url.as_deref(),
            Arc::new(PgSnapshotStore::new(pool.clone())),
            Arc::new(PgCellStore::new(pool)),
        )
    }

    fn assemble(
        token_secret: &str,
        internal_token: &str,
        verify_url: Option<&str>,
        snapshots: Arc<dyn SnapshotStore>,
        cell_store: Arc<dyn CellValueStore>,
    ) -> Result<AppState> {
        let tokens = Arc::new(
            CollabTokenService::new(token_secret).context("invalid collaboration token secret")?,
        );
        let verifier = match verify_url {
            Some(raw) => {
                let url = Url::parse(raw).context("invalid token verify endpoint url")?;
                Arc::new(TokenVerifier::http(url))
            }
            None => Arc::new(TokenVerifier::local(tokens.clone())),
        };
        let registry = Arc::new(RoomRegistry::new(snapshots.clone(), RelayTuning::default()));
        let cells = CellCache::new(cell_store, snapshots.clone());

        Ok(AppState {
            registry,
            tokens,
            verifier,
            cells,
            snapshots,
            internal_token: internal_token.into(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_token_secret() {
        warn!("using the built-in development token secret");
    }
    if config.is_dev_internal_token() {
        warn!("using the built-in development internal token");
    }

    let state = match &config.database_url {
        Some(url) => {
            let pool = db::create_pg_pool(url, db::PoolConfig::from_env())
                .await
                .context("failed to connect to the snapshot database")?;
            db::run_migrations(&pool).await.context("failed to run database migrations")?;
            db::check_pool_health(&pool).await.context("database health check failed")?;
            info!("snapshot and cell stores backed by postgres");
            AppState::with_postgres(&config, pool)?
        }
        None => {
            info!("no database configured; snapshots are in-memory only");
            AppState::in_memory(&config.token_secret, &config.internal_token)?
        }
    };

    let app = build_router(state);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.bind_addr))?;

    info!(listen_addr = %config.bind_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub(crate) fn build_router(state: AppState) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router())
            .merge(api::router())
            .with_state(state),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
        .layer(cors::cors_layer())
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Tags the request with an id, runs the handler inside that id's scope so
/// error envelopes pick it up, and logs one line per request.
async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
