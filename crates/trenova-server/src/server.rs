use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use trenova_auth::{AuthService, AuthState, InMemoryUserRepository, require_session};
use trenova_cache::CacheStore;

use crate::config::AppConfig;
use crate::lifecycle::{Hook, Lifecycle};
use crate::middleware::{RequestId, request_id};
use crate::websocket::{Hub, handlers as ws};
use crate::handlers;

/// Process-wide components shared by every handler.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub cache: Arc<dyn CacheStore>,
    pub auth: AuthState,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;

    let realtime = Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/broadcast", post(ws::broadcast))
        .route("/org-members", get(ws::org_members))
        .route("/room-members", get(ws::room_members))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_session,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(realtime)
        .with_state(state.clone())
        .merge(trenova_auth::http::router(state.auth))
        // Middleware stack (inner to outer: body limit -> cors -> trace -> request id)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<RequestId>()
                        .map(|id| id.0.as_str())
                        .unwrap_or("");
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
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
        .layer(middleware::from_fn(request_id))
}

pub struct ServerBuilder {
    config: AppConfig,
    cache: Option<Arc<dyn CacheStore>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            cache: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Use an existing cache instead of connecting to Redis.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn build(self) -> anyhow::Result<TrenovaServer> {
        let cfg = self.config;

        let cache = match self.cache {
            Some(cache) => cache,
            None => trenova_cache::connect(&cfg.redis, &cfg.breaker)
                .await
                .context("connecting to redis")?,
        };

        let users = InMemoryUserRepository::from_bootstrap(&cfg.auth.bootstrap_users)
            .context("seeding bootstrap users")?;
        tracing::info!(users = users.len(), "user repository ready");

        let service = Arc::new(AuthService::new(cache.clone(), Arc::new(users), &cfg.auth));
        let auth =
            AuthState::new(service, cfg.auth.cookie.clone()).with_proxy(cfg.auth.proxy.clone());
        let hub = Hub::new(cache.clone(), cfg.websocket.clone());

        let mut lifecycle = Lifecycle::new();
        lifecycle.append(Hook::new("cache").on_after_stop({
            let cache = cache.clone();
            move || async move {
                cache.close();
                Ok(())
            }
        }));
        lifecycle.append(
            Hook::new("websocket-hub")
                .on_start({
                    let hub = hub.clone();
                    move || async move {
                        hub.start();
                        Ok(())
                    }
                })
                .on_stop({
                    let hub = hub.clone();
                    move || async move {
                        hub.shutdown().await;
                        Ok(())
                    }
                }),
        );

        let state = AppState { hub, cache, auth };
        let app = build_app(state.clone(), &cfg);

        Ok(TrenovaServer {
            addr: cfg.addr(),
            app,
            state,
            lifecycle,
        })
    }
}

pub struct TrenovaServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    lifecycle: Lifecycle,
}

impl TrenovaServer {
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Starts the lifecycle, serves until `shutdown` resolves, then stops it.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let TrenovaServer {
            app,
            state,
            mut lifecycle,
            ..
        } = self;

        if let Err(e) = lifecycle.start().await {
            lifecycle.stop().await;
            return Err(e);
        }

        let addr = listener.local_addr()?;
        tracing::info!(%addr, server_id = %state.hub.server_id(), "listening");

        // upgraded sockets are not tracked by graceful shutdown
        let hub = state.hub.clone();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            hub.disconnect_all();
        })
        .await;

        lifecycle.stop().await;
        result.context("http server failed")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("binding {}", self.addr))?;
        self.serve(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
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
    tracing::info!("shutdown signal received");
}
