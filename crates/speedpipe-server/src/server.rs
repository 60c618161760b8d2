use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    middleware,
    routing::{get, post},
};
use speedpipe_api::TransactionId;
use speedpipe_auth::AuthState;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::cache::LatestValueCache;
use crate::echo::EchoSink;
use crate::pipeline::PublishPipeline;
use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PublishPipeline>,
    /// Echo subscription handler, read for its drop count
    pub echo_sink: Arc<EchoSink>,
    pub cache: LatestValueCache,
    pub auth: AuthState,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn build_app(cfg: &AppConfig, state: AppState) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        // Health endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        // Token issuance and latest value
        .route(
            "/v1",
            post(handlers::issue_token).get(handlers::latest_speed),
        )
        .route("/v1/publish", post(handlers::publish))
        .with_state(state)
        // Middleware stack (outermost last: transaction id -> cors -> trace -> timeout -> body limit)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(cfg.request_timeout()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let transaction_id = req
                        .extensions()
                        .get::<TransactionId>()
                        .map(|id| id.to_string())
                        .unwrap_or_default();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        transaction_id = %transaction_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(app_middleware::transaction_id))
}

pub struct SpeedpipeServer {
    addr: SocketAddr,
    app: Router,
    shutdown_timeout: Duration,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    state: AppState,
}

impl ServerBuilder {
    pub fn new(state: AppState) -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            state,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn build(self) -> SpeedpipeServer {
        let app = build_app(&self.config, self.state);

        SpeedpipeServer {
            addr: self.addr,
            app,
            shutdown_timeout: self.config.shutdown_timeout(),
        }
    }
}

impl SpeedpipeServer {
    /// Serve until SIGINT/SIGTERM or until `shutdown` is cancelled, then drain
    /// in-flight requests for at most the configured shutdown timeout.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let drain = shutdown.clone();
        let serve = axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .into_future();
        let mut serve = std::pin::pin!(serve);

        tokio::select! {
            result = &mut serve => return result.map_err(Into::into),
            _ = shutdown_signal(shutdown) => {}
        }

        match tokio::time::timeout(self.shutdown_timeout, serve).await {
            Ok(result) => result?,
            Err(_) => tracing::warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "graceful drain timed out, dropping remaining connections"
            ),
        }
        Ok(())
    }
}

/// Resolves on SIGINT, SIGTERM or external cancellation, and cancels
/// `shutdown` so every long-lived task sees it.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown signal received"),
        _ = terminate => tracing::info!("terminate signal received"),
        _ = shutdown.cancelled() => tracing::info!("shutdown requested"),
    }
    shutdown.cancel();
}
