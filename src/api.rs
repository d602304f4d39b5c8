//! HTTP API for GovShield
//!
//! | Route                                | Description                         |
//! |--------------------------------------|-------------------------------------|
//! | `GET  /health`                       | Liveness probe                      |
//! | `POST /api/v1/governance/screen`     | Full pipeline for one text          |
//! | `POST /api/v1/governance/detect`     | Detection only                      |
//! | `POST /api/v1/governance/transform`  | Detect and de-identify              |
//! | `POST /api/v1/governance/restore`    | Reverse tokenized values            |
//! | `POST /api/v1/governance/evaluate`   | Guardrail decision for a prompt     |
//! | `GET  /api/v1/compliance/report`     | Per-framework compliance status     |
//! | `GET  /api/v1/audit/events`          | Windowed audit log                  |
//! | `GET  /api/v1/audit/health`          | Audit failure counter               |
//! | `POST /api/v1/access/check`          | Ask the access authority            |
//! | `POST /api/v1/datasets/encrypt`      | Provision a CMEK-bound dataset      |
//!
//! Errors use the `{"error": {"code", "message"}}` envelope.

use crate::audit::EventType;
use crate::error::Error;
use crate::external::EncryptionRequest;
use crate::pipeline::{GovernanceEngine, ScreenRequest};
use crate::privacy::detector::Category;
use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for governance handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<GovernanceEngine>,
}

/// Build the complete HTTP application
pub fn build_app(engine: Arc<GovernanceEngine>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(governance_router(ApiState { engine }))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Create the governance router
pub fn governance_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/governance/screen", post(screen))
        .route("/api/v1/governance/detect", post(detect))
        .route("/api/v1/governance/transform", post(transform))
        .route("/api/v1/governance/restore", post(restore))
        .route("/api/v1/governance/evaluate", post(evaluate))
        .route("/api/v1/compliance/report", get(compliance_report))
        .route("/api/v1/audit/events", get(audit_events))
        .route("/api/v1/audit/health", get(audit_health))
        .route("/api/v1/access/check", post(access_check))
        .route("/api/v1/datasets/encrypt", post(encrypt_dataset))
        .with_state(state)
}

// =============================================================================
// Error envelope
// =============================================================================

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: ApiErrorDetail,
}

/// API error detail
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiErrorDetail {
                code: "BAD_REQUEST".to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::InvalidInput(_) | Error::Crypto(_) => StatusCode::BAD_REQUEST,
            Error::DetectorUnavailable(_) | Error::AuditWrite(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = e.code(), error = %e, "Request failed");
        }
        Self {
            status,
            error: ApiErrorDetail {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Body plus the audit persistence flag the core types keep out of JSON
#[derive(Debug, Serialize)]
struct Audited<T: Serialize> {
    #[serde(flatten)]
    body: T,
    audit_ok: bool,
}

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
struct DetectBody {
    #[serde(default = "default_subject")]
    subject: String,
    text: String,
    #[serde(default)]
    categories: Option<BTreeSet<Category>>,
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EvaluateBody {
    #[serde(default = "default_subject")]
    subject: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct AccessBody {
    principal: String,
    resource: String,
    permission: String,
}

#[derive(Debug, Deserialize)]
struct EncryptBody {
    #[serde(default = "default_subject")]
    subject: String,
    #[serde(flatten)]
    request: EncryptionRequest,
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    days: Option<i64>,
    /// Comma-separated event types
    types: Option<String>,
}

fn default_subject() -> String {
    "anonymous".to_string()
}

const DEFAULT_REPORT_DAYS: i64 = 30;

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/v1/governance/screen
async fn screen(
    State(state): State<ApiState>,
    Json(request): Json<ScreenRequest>,
) -> ApiResult<crate::pipeline::ScreenOutcome> {
    Ok(Json(state.engine.screen(&request).await?))
}

/// POST /api/v1/governance/detect
async fn detect(
    State(state): State<ApiState>,
    Json(body): Json<DetectBody>,
) -> ApiResult<Audited<crate::privacy::backend::DetectionReport>> {
    let categories = state.engine.resolve_categories(body.categories.as_ref())?;
    let report = state
        .engine
        .detector()
        .scan(&body.text, &categories, &body.subject)
        .await?;
    let audit_ok = report.audit_ok;
    Ok(Json(Audited {
        body: report,
        audit_ok,
    }))
}

#[derive(Debug, Serialize)]
struct TransformResponse {
    scan_id: String,
    degraded: bool,
    text: String,
    log: Vec<crate::privacy::transform::TransformRecord>,
    audit_ok: bool,
}

/// POST /api/v1/governance/transform
async fn transform(
    State(state): State<ApiState>,
    Json(body): Json<DetectBody>,
) -> ApiResult<TransformResponse> {
    let engine = &state.engine;
    let categories = engine.resolve_categories(body.categories.as_ref())?;
    let report = engine
        .detector()
        .scan(&body.text, &categories, &body.subject)
        .await?;
    let transformed = engine
        .transformer()
        .apply(&body.text, &report, &body.subject)
        .await?;

    Ok(Json(TransformResponse {
        scan_id: report.scan_id,
        degraded: report.degraded,
        text: transformed.text,
        log: transformed.log,
        audit_ok: report.audit_ok && transformed.audit_ok,
    }))
}

/// POST /api/v1/governance/restore
async fn restore(
    State(state): State<ApiState>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<serde_json::Value> {
    let text = state.engine.transformer().restore(&body.text)?;
    Ok(Json(serde_json::json!({ "text": text })))
}

/// POST /api/v1/governance/evaluate
async fn evaluate(
    State(state): State<ApiState>,
    Json(body): Json<EvaluateBody>,
) -> ApiResult<Audited<crate::guardrail::Decision>> {
    let decision = state
        .engine
        .guardrails()
        .evaluate(&body.prompt, &body.subject)
        .await;
    let audit_ok = decision.audit_ok;
    Ok(Json(Audited {
        body: decision,
        audit_ok,
    }))
}

/// GET /api/v1/compliance/report?days=N
async fn compliance_report(
    State(state): State<ApiState>,
    Query(params): Query<ReportQuery>,
) -> ApiResult<crate::compliance::ComplianceReport> {
    let days = params.days.unwrap_or(DEFAULT_REPORT_DAYS);
    Ok(Json(state.engine.compliance_report(days).await?))
}

/// GET /api/v1/audit/events?days=N&types=a,b
async fn audit_events(
    State(state): State<ApiState>,
    Query(params): Query<EventsQuery>,
) -> ApiResult<Vec<crate::audit::AuditEvent>> {
    let types = params
        .types
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .filter(|t| !t.trim().is_empty())
                .map(str::parse::<EventType>)
                .collect::<crate::Result<Vec<_>>>()
        })
        .transpose()?;
    let days = params.days.unwrap_or(DEFAULT_REPORT_DAYS);
    Ok(Json(state.engine.audit_events(days, types.as_deref()).await?))
}

#[derive(Debug, Serialize)]
struct AuditHealth {
    status: &'static str,
    recorder: String,
    write_failures: u64,
}

/// GET /api/v1/audit/health
async fn audit_health(State(state): State<ApiState>) -> impl IntoResponse {
    let auditor = state.engine.auditor();
    let failures = auditor.failure_count();
    Json(AuditHealth {
        status: if failures == 0 { "ok" } else { "degraded" },
        recorder: auditor.recorder().name().to_string(),
        write_failures: failures,
    })
}

/// POST /api/v1/access/check
async fn access_check(
    State(state): State<ApiState>,
    Json(body): Json<AccessBody>,
) -> ApiResult<Audited<crate::external::AccessDecision>> {
    if body.principal.trim().is_empty() || body.resource.trim().is_empty() {
        return Err(ApiError::bad_request("principal and resource are required"));
    }
    let decision = state
        .engine
        .access()
        .authorize(&body.principal, &body.resource, &body.permission)
        .await?;
    let audit_ok = decision.audit_ok;
    Ok(Json(Audited {
        body: decision,
        audit_ok,
    }))
}

/// POST /api/v1/datasets/encrypt
async fn encrypt_dataset(
    State(state): State<ApiState>,
    Json(body): Json<EncryptBody>,
) -> ApiResult<Audited<crate::external::EncryptionOutcome>> {
    let outcome = state
        .engine
        .encryption()
        .provision(&body.request, &body.subject)
        .await?;
    let audit_ok = outcome.audit_ok;
    Ok(Json(Audited {
        body: outcome,
        audit_ok,
    }))
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}
