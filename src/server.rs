use crate::{app_state::HttpServerState, config, handler, metrics};
use anyhow::Result;
use axum::{extract::FromRef, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct ServerState {
    pub http_state: Arc<HttpServerState>,
    pub metrics_handle: metrics::PrometheusHandle,
}

impl FromRef<ServerState> for Arc<HttpServerState> {
    fn from_ref(state: &ServerState) -> Self {
        state.http_state.clone()
    }
}

impl FromRef<ServerState> for metrics::PrometheusHandle {
    fn from_ref(state: &ServerState) -> Self {
        state.metrics_handle.clone()
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/.well-known/nostr.json",
            get(handler::handle_nostr_json).options(handler::handle_nostr_json_preflight),
        )
        .route("/health", get(handler::handle_health))
        .route("/metrics", get(handler::handle_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    settings: config::ServerSettings,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let metrics_handle = metrics::setup_metrics()?;
    let http_state = Arc::new(HttpServerState::new(&settings)?);

    info!("Proxying nostr.json to {}", settings.nip05_upstream);
    let router = build_router(ServerState {
        http_state,
        metrics_handle,
    });

    let addr = settings.local_addr.parse::<SocketAddr>()?;
    let handle = axum_server::Handle::new();
    let handle_clone = handle.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Cannot listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                cancellation_token.cancel();
            }
            _ = cancellation_token.cancelled() => {}
        }
        handle_clone.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!("Starting server on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
