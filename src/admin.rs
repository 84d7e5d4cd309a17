//! Admin HTTP API — health checks, Prometheus metrics, routing status.
//!
//! Spawned as a background task when `admin_port` is configured.
//! Endpoints:
//!   GET /health  — 200 OK, for load balancer health checks
//!   GET /metrics — Prometheus exposition format
//!   GET /status  — JSON snapshot of host pool and scheduler state

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::scheduler::Scheduler;

#[derive(Clone)]
struct AdminState {
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<Metrics>,
}

/// Start the admin HTTP server on the given port and serve until it errors.
pub async fn run(port: u16, scheduler: Arc<dyn Scheduler>, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let state = AdminState { scheduler, metrics };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/status", get(status))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind admin port");
            return Err(e);
        }
    };
    info!(addr = %addr, "admin API listening");
    axum::serve(listener, app).await
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/json")], r#"{"status":"ok"}"#)
}

async fn metrics_endpoint(State(state): State<AdminState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn status(State(state): State<AdminState>) -> Response {
    let hosts = state.scheduler.hosts().snapshot();
    let scores = state.scheduler.stats();

    let mut json = String::with_capacity(1024);
    json.push_str("{\n  \"hosts\": [");
    for (i, h) in hosts.iter().enumerate() {
        if i > 0 {
            json.push(',');
        }
        json.push_str(&format!(
            "\n    {{\"addr\": \"{}\", \"idle\": {}, \"throttled\": {}}}",
            h.addr, h.idle, h.throttled
        ));
    }
    if !hosts.is_empty() {
        json.push('\n');
    }
    json.push_str("  ],\n");

    json.push_str("  \"buckets\": {");
    let mut first = true;
    for (bucket, score_vec) in &scores {
        if !first {
            json.push(',');
        }
        first = false;
        let rendered: Vec<String> = score_vec.iter().map(|s| format!("{s:.3}")).collect();
        json.push_str(&format!("\n    \"{bucket}\": [{}]", rendered.join(", ")));
    }
    if !scores.is_empty() {
        json.push('\n');
        json.push_str("  ");
    }
    json.push_str("}\n}\n");

    (StatusCode::OK, [("content-type", "application/json")], json).into_response()
}
