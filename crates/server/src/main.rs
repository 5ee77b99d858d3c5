use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use ctxsync_server::{
    api::{self, AppState},
    cache::{CacheBackend, PolicyTable, TokenStore},
    config::{LogFormat, ServerConfig},
    context::WorkspaceContextStore,
    db::{
        migrations::run_migrations,
        pool::{create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    hierarchy::SessionHierarchyManager,
    persistence::DurableStore,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    let policies = match &config.policy_file {
        Some(path) => PolicyTable::load_from(path)?,
        None => PolicyTable::default(),
    };

    let (backend, durable) = connect_stores(&config).await?;
    let tokens = TokenStore::new(backend.clone(), policies);
    let hierarchy = SessionHierarchyManager::new(tokens.clone(), durable);
    let context = WorkspaceContextStore::with_pattern_redactor(tokens, config.max_scan_bytes);
    let state = AppState::new(hierarchy, context);

    spawn_purge_task(backend, state.hierarchy.clone(), config.purge_interval);

    let app = build_router(state);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting ctxsync server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("ctxsync server exited unexpectedly")
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn connect_stores(config: &ServerConfig) -> anyhow::Result<(CacheBackend, DurableStore)> {
    let durable = match &config.database_url {
        Some(url) => {
            let pool = create_pg_pool(url, PoolConfig::from_env())
                .await
                .context("failed to connect durable store")?;
            run_migrations(&pool).await?;
            DurableStore::Postgres(pool)
        }
        None => {
            warn!("CTXSYNC_DATABASE_URL is not set; durable state lives in memory only");
            DurableStore::memory()
        }
    };

    let backend = match &config.cache_url {
        Some(url) => {
            let pool = create_pg_pool(url, PoolConfig::from_env())
                .await
                .context("failed to connect token cache")?;
            run_migrations(&pool).await?;
            CacheBackend::connect(pool).await?
        }
        None => {
            warn!("no cache URL configured; token cache is process-local");
            CacheBackend::memory()
        }
    };

    Ok((backend, durable))
}

fn spawn_purge_task(
    backend: CacheBackend,
    hierarchy: Arc<SessionHierarchyManager>,
    every: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match backend.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired cache entries"),
                Err(err) => warn!(error = %err, "cache purge failed"),
            }
            match hierarchy.sweep_orphaned_workspaces().await {
                Ok(0) => {}
                Ok(flushed) => info!(flushed, "flushed workspaces without live sessions"),
                Err(err) => warn!(error = %err, "orphaned workspace sweep failed"),
            }
            hierarchy.locks().prune_idle();
        }
    });
}

fn build_router(state: AppState) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(api::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
