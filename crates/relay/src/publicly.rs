//! The relay's public HTTP surfaces: the health probe and the
//! Prometheus `/metrics` route.
//!
//! Warn: neither server carries any authentication; bind them to
//! loopback or a monitoring network, not to the relay's public address.

use std::net::SocketAddr;

use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;

use crate::statistics::generate_metrics;

/// start health http server
///
/// Answers `GET /health` with a plain `ok` while the relay process is
/// alive, which is all an init system or load balancer probe needs.
pub async fn start_health_server(listen: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(|| async { "ok" }));

    let listener = TcpListener::bind(listen).await?;
    log::info!("health server listening={:?}", listen);

    axum::serve(listener, app).await?;
    Ok(())
}

/// start metrics http server
///
/// Exposes the process-wide Prometheus registry on `/metrics`.
pub async fn start_metrics_server(listen: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(|| async move {
            let mut metrics_bytes = Vec::with_capacity(4096);

            if generate_metrics(&mut metrics_bytes).is_err() {
                StatusCode::EXPECTATION_FAILED.into_response()
            } else {
                ([(CONTENT_TYPE, "text/plain")], metrics_bytes).into_response()
            }
        }),
    );

    let listener = TcpListener::bind(listen).await?;
    log::info!("metrics server listening={:?}", listen);

    axum::serve(listener, app).await?;
    Ok(())
}
