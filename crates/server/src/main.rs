mod api;
mod auth;
mod chat;
mod config;
mod cors;
mod db;
mod error;
mod etag;
mod feed;
mod hub;
mod lifecycle;
mod media;
mod metrics;
mod presence;
mod store;
mod sweeper;
mod validation;
mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::jwt::UserTokenService,
    config::{LogFormat, ServerConfig},
    cors::cors_layer,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, ServerError,
    },
    hub::StreamHub,
    metrics::ServerMetrics,
    store::StreamStore,
    validation::MAX_REST_BODY_BYTES,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid server configuration")?;
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("SCROLLLIVE_JWT_SECRET is not set; using the development secret");
    }

    let token_service = Arc::new(
        UserTokenService::new(&config.jwt_secret).context("invalid SCROLLLIVE_JWT_SECRET")?,
    );
    let store = build_store(&config).await?;
    let (media_tokens, rooms) = media::from_config(&config.media)?;
    let hub = StreamHub::new(
        store,
        rooms,
        media_tokens,
        config.streams.clone(),
        config.media.client_ws_url.clone(),
    );

    let metrics = Arc::new(ServerMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = sweeper::spawn(hub.clone(), shutdown_rx);

    let app = build_router(hub, token_service, config.cors_origins.as_deref(), metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting scrolllive server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly");

    let _ = shutdown_tx.send(true);
    if let Err(join_error) = sweeper.await {
        error!(?join_error, "cleanup sweeper task failed");
    }

    served
}

fn init_tracing(config: &ServerConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_store(config: &ServerConfig) -> anyhow::Result<StreamStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("SCROLLLIVE_DATABASE_URL is not set; sessions are kept in memory only");
        return Ok(StreamStore::memory());
    };

    let pool = db::pool::create_pg_pool(database_url, db::pool::PoolConfig::from_env()).await?;
    db::pool::check_pool_health(&pool).await?;
    db::migrations::run_migrations(&pool).await?;
    info!("connected to PostgreSQL and applied migrations");

    Ok(StreamStore::Postgres(pool))
}

fn build_router(
    hub: StreamHub,
    token_service: Arc<UserTokenService>,
    cors_origins: Option<&str>,
    metrics: Arc<ServerMetrics>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(move || render_metrics(Arc::clone(&metrics))))
            .merge(api::router(hub, token_service)),
    )
    .layer(cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(metrics: Arc<ServerMetrics>) -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], metrics.render_prometheus())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for Ctrl+C");
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
                error!(%err, "failed to install SIGTERM handler");
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
            ServerError::from_code(ErrorCode::Internal).into_response()
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

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
