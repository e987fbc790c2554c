use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::WifiError;
use crate::manager::WifiManager;
use crate::models::{
    ConnectReport, ConnectionState, CurrentConnection, DiagnosticsReport, NetworkObservation,
    OperationReport, PingResult, SavedNetwork, Security,
};

type AppState = Arc<WifiManager>;

/// Facade error rendered as `{success: false, message}`.
pub struct ApiError(WifiError);

impl From<WifiError> for ApiError {
    fn from(e: WifiError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WifiError::InvalidArgument(_)
            | WifiError::SecretRequired(_)
            | WifiError::AuthFailure(_)
            | WifiError::NetworkNotFound(_) => StatusCode::BAD_REQUEST,
            WifiError::BackendUnavailable
            | WifiError::NoWifiInterface
            | WifiError::ExecutableNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorBody {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(manager: Arc<WifiManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/current", get(current))
        .route("/api/scan", get(scan))
        .route("/api/saved", get(saved))
        .route("/api/state", get(state))
        .route("/api/connect", post(connect))
        .route("/api/save", post(save))
        .route("/api/forget", post(forget))
        .route("/api/label", post(label))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/ping", post(ping))
        .layer(middleware::from_fn_with_state(manager.clone(), require_auth))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

pub async fn run_server(manager: Arc<WifiManager>) -> anyhow::Result<()> {
    let web = manager.settings().web.clone();
    let addr = format!("{}:{}", web.bind, web.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("Starting server at http://{addr}");
    tracing::info!(%addr, auth = web.credentials().is_some(), "Serving web API");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Could not listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

/// Enforces basic auth when both web credentials are configured.
async fn require_auth(State(manager): State<AppState>, request: Request, next: Next) -> Response {
    let Some((user, pass)) = manager.settings().web.credentials() else {
        return next.run(request).await;
    };

    if basic_credentials(request.headers()).is_some_and(|(u, p)| u == user && p == pass) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Login Required\"")],
        "Login required",
    )
        .into_response()
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn current(State(manager): State<AppState>) -> ApiResult<CurrentConnection> {
    Ok(Json(manager.current().await?))
}

async fn scan(State(manager): State<AppState>) -> ApiResult<Vec<NetworkObservation>> {
    Ok(Json(manager.scan().await?))
}

async fn saved(State(manager): State<AppState>) -> ApiResult<Vec<SavedNetwork>> {
    Ok(Json(manager.list_saved().await?))
}

#[derive(Serialize)]
struct StateView {
    #[serde(flatten)]
    state: ConnectionState,
    backend: Option<String>,
}

async fn state(State(manager): State<AppState>) -> Json<StateView> {
    Json(StateView {
        state: manager.state(),
        backend: manager.backend_kind().await.map(|k| k.to_string()),
    })
}

fn default_security() -> Security {
    Security::Wpa2
}

#[derive(Deserialize)]
struct ConnectRequest {
    ssid: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_security")]
    security: Security,
}

async fn connect(
    State(manager): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<ConnectReport> {
    let report = manager
        .connect(&req.ssid, req.password.as_deref(), req.security)
        .await?;
    Ok(Json(report))
}

/// Same body as connect; the network is stored but not joined.
async fn save(
    State(manager): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<OperationReport> {
    let report = manager
        .save_network(&req.ssid, req.password.as_deref(), req.security)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ForgetRequest {
    ssid: String,
}

async fn forget(
    State(manager): State<AppState>,
    Json(req): Json<ForgetRequest>,
) -> ApiResult<OperationReport> {
    Ok(Json(manager.forget(&req.ssid).await?))
}

#[derive(Deserialize)]
struct LabelRequest {
    ssid: String,
    #[serde(default)]
    label: Option<String>,
}

async fn label(
    State(manager): State<AppState>,
    Json(req): Json<LabelRequest>,
) -> ApiResult<OperationReport> {
    Ok(Json(manager.set_label(&req.ssid, req.label).await?))
}

async fn diagnostics(State(manager): State<AppState>) -> Json<DiagnosticsReport> {
    Json(manager.diagnostics().await)
}

#[derive(Deserialize)]
struct PingRequest {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    count: Option<u32>,
}

async fn ping(
    State(manager): State<AppState>,
    Json(req): Json<PingRequest>,
) -> ApiResult<PingResult> {
    Ok(Json(manager.ping(req.target.as_deref(), req.count).await?))
}
