//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! HTTP surface for the point table.
//!
//! Operators write `_control` points here and workers refresh their `_time`
//! points. The same API is what [`crate::HttpPointReader`] talks to.
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::point::{Point, PointValue};
use crate::PointBus;

type SharedBus = Arc<dyn PointBus>;

/// Handle to the running point API.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Address actually bound (resolves port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Build the point API router over `bus`.
pub fn router(bus: SharedBus) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/points", get(list_points))
        .route("/api/points/:name", get(get_point).put(put_point))
        .with_state(bus)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the point API until [`ApiServer::shutdown`].
pub fn spawn_api_server(bus: SharedBus, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind point API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure point API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to resolve point API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let app = router(bus);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "point api listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "point api exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

#[derive(Debug, Serialize)]
struct NamedPoint {
    name: String,
    #[serde(flatten)]
    point: Point,
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    value: PointValue,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_points(State(bus): State<SharedBus>) -> Result<Json<Vec<NamedPoint>>, ApiError> {
    let points = bus.list().await.map_err(ApiError::internal)?;
    Ok(Json(
        points
            .into_iter()
            .map(|(name, point)| NamedPoint { name, point })
            .collect(),
    ))
}

async fn get_point(
    State(bus): State<SharedBus>,
    Path(name): Path<String>,
) -> Result<Json<Point>, ApiError> {
    match bus.read(&name).await.map_err(ApiError::internal)? {
        Some(point) => Ok(Json(point)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("point {name} not found"),
        )),
    }
}

async fn put_point(
    State(bus): State<SharedBus>,
    Path(name): Path<String>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<Point>, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty point name"));
    }
    let point = bus
        .write(&name, request.value)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(point))
}
