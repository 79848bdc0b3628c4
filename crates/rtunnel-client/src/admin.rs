//! Operator HTTP API served next to the client

use crate::error::{ClientError, Result};
use crate::service::{RunState, Service};
use crate::status::{StatusExporter, WorkingDetail, WorkingStatus};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Error body shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: RunState,
    pub run_id: String,
    pub proxies: Vec<WorkingStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProxyRequest {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub name: String,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: u16,
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: ClientError) -> ApiError {
    let status = match &err {
        ClientError::ProxyNotFound(_) => StatusCode::NOT_FOUND,
        ClientError::ProxyAlreadyExists(_) => StatusCode::CONFLICT,
        ClientError::UnknownProxyType(_) | ClientError::ConfigError(_) => StatusCode::BAD_REQUEST,
        ClientError::NotConnected | ClientError::ManagerClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/status", get(all_status))
        .route("/api/status/{name}", get(proxy_status))
        .route("/api/proxies", post(create_proxy))
        .route("/api/proxies/{name}", get(proxy_detail))
        .with_state(service)
}

/// Serve the admin API on `addr` until `shutdown` fires
pub async fn serve(service: Arc<Service>, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn all_status(State(service): State<Arc<Service>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: service.state(),
        run_id: service.run_id(),
        proxies: service.get_all_proxy_status().await,
    })
}

async fn proxy_status(
    State(service): State<Arc<Service>>,
    Path(name): Path<String>,
) -> std::result::Result<Json<WorkingStatus>, ApiError> {
    service
        .status_exporter()
        .get_proxy_status(&name)
        .await
        .map(Json)
        .ok_or_else(|| api_error(ClientError::ProxyNotFound(name)))
}

async fn create_proxy(
    State(service): State<Arc<Service>>,
    Json(req): Json<CreateProxyRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    service
        .create_proxy(
            &req.proxy_type,
            &req.name,
            &req.local_ip,
            req.local_port,
            req.remote_port,
        )
        .await
        .map_err(api_error)?;
    Ok(StatusCode::CREATED)
}

async fn proxy_detail(
    State(service): State<Arc<Service>>,
    Path(name): Path<String>,
) -> std::result::Result<Json<WorkingDetail>, ApiError> {
    service
        .get_proxy_detail(&name)
        .await
        .map(Json)
        .ok_or_else(|| api_error(ClientError::ProxyNotFound(name)))
}
