use crate::qan::status::StatusBoard;
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Registry, TextEncoder};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub status: StatusBoard,
    pub registry: Registry,
}

/// Routes: `/health`, `/status` and `/metrics`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::SERVER,
                    HeaderValue::from_static(concat!("qan_agent/", env!("CARGO_PKG_VERSION"))),
                )),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(state.status.snapshot())
}

async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.registry.gather()) {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Bind the status server. Without `listen`, try `[::]` and fall back to `0.0.0.0`.
///
/// # Errors
///
/// Returns an error if `listen` is not an IP address or the port cannot be bound.
pub async fn bind(port: u16, listen: Option<&str>) -> Result<TcpListener> {
    if let Some(listen) = listen {
        let ip: IpAddr = listen
            .parse()
            .map_err(|_| anyhow!("invalid listen address: {listen}"))?;
        let addr = SocketAddr::new(ip, port);
        return TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"));
    }

    match TcpListener::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!(error = %e, "IPv6 not available, binding to 0.0.0.0");
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))
        }
    }
}

/// Serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("status server failed")
}
