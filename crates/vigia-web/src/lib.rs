//! Axum JSON API for Vigia.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

use vigia_core::{
    Alert, PermissionDecision, PermissionRequest, RequestStatus, RequestType, ResolveAction, Role,
};
use vigia_scan::{resolve_alert, AlertScanner, ScanResult};
use vigia_storage::{AlertStore, ListingRepository, PermissionStore, StorageError};

pub const CRATE_NAME: &str = "vigia-web";

#[derive(Clone)]
pub struct AppState {
    pub scanner: Arc<AlertScanner>,
    pub alerts: Arc<dyn AlertStore>,
    pub listings: Arc<dyn ListingRepository>,
    pub permissions: Arc<dyn PermissionStore>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/alerts/generate-and-notify", post(generate_and_notify_handler))
        .route("/alerts/resolve", post(resolve_handler))
        .route("/alerts/my-alerts", get(my_alerts_handler))
        .route(
            "/permission-requests",
            post(create_request_handler).get(list_requests_handler),
        )
        .route("/permission-requests/{id}/decide", post(decide_request_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("VIGIA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    success: bool,
    alerts_processed: usize,
    results: Vec<ScanResult>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug, Serialize)]
struct OkBody {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    alert_id: Uuid,
    listing_id: Uuid,
    action_type: ResolveAction,
}

#[derive(Debug, Deserialize)]
struct MyAlertsQuery {
    user_id: Uuid,
    user_role: Role,
}

#[derive(Debug, Serialize)]
struct AlertsBody {
    success: bool,
    alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
struct CreateRequestBody {
    listing_id: Uuid,
    requester_id: Uuid,
    request_type: RequestType,
    justification: String,
}

#[derive(Debug, Serialize)]
struct RequestBody {
    success: bool,
    request: PermissionRequest,
}

#[derive(Debug, Serialize)]
struct RequestsBody {
    success: bool,
    requests: Vec<PermissionRequest>,
}

#[derive(Debug, Deserialize)]
struct ListRequestsQuery {
    status: Option<RequestStatus>,
}

#[derive(Debug, Deserialize)]
struct DecideBody {
    reviewer_id: Uuid,
    #[serde(flatten)]
    decision: PermissionDecision,
}

async fn generate_and_notify_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scanner.run_once().await {
        Ok(summary) => Json(ScanResponse {
            success: true,
            alerts_processed: summary.alerts_processed,
            results: summary.results,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResolveBody>,
) -> Response {
    match resolve_alert(
        state.alerts.as_ref(),
        state.listings.as_ref(),
        body.alert_id,
        body.listing_id,
        body.action_type,
    )
    .await
    {
        Ok(_) => Json(OkBody { success: true }).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn my_alerts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MyAlertsQuery>,
) -> Response {
    match state
        .alerts
        .alerts_for_user(query.user_id, query.user_role)
        .await
    {
        Ok(alerts) => Json(AlertsBody {
            success: true,
            alerts,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn create_request_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRequestBody>,
) -> Response {
    let request = PermissionRequest::new(
        body.listing_id,
        body.requester_id,
        body.request_type,
        body.justification,
        Utc::now(),
    );
    match state.permissions.create_request(request).await {
        Ok(request) => Json(RequestBody {
            success: true,
            request,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn list_requests_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRequestsQuery>,
) -> Response {
    match state.permissions.requests_by_status(query.status).await {
        Ok(requests) => Json(RequestsBody {
            success: true,
            requests,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn decide_request_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<DecideBody>,
) -> Response {
    match state
        .permissions
        .decide_request(id, body.reviewer_id, body.decision, Utc::now())
        .await
    {
        Ok(request) => Json(RequestBody {
            success: true,
            request,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            success: false,
            error: format!("{err:#}"),
        }),
    )
        .into_response()
}

fn storage_error(err: StorageError) -> Response {
    let status = match &err {
        StorageError::AlertNotFound(_)
        | StorageError::ListingNotFound(_)
        | StorageError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        StorageError::AlertNotActive(_)
        | StorageError::ListingMismatch { .. }
        | StorageError::Decision(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            success: false,
            error: err.to_string(),
        }),
    )
        .into_response()
}
