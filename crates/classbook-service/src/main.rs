use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use classbook_api::{
    ApiError, ApiResult, CalendarQuery, ClassbookApi, IdentityConfig, IdentityToolkitVerifier,
    IdentityVerifier, StoredCalendarEntry, API_CONTRACT_VERSION,
};
use classbook_core::{CalendarEntry, ChatMessage, ClassRecord, ScheduleEntry};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

mod config;
mod page;

use config::Args;
use page::IndexPage;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../openapi/openapi.yaml");
const STATIC_CACHE_CONTROL: &str = "max-age=300";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ClassbookApi,
    verifier: Arc<dyn IdentityVerifier>,
    index: IndexPage,
    resources_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct VerifyResponse {
    verified: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ScheduleParams {
    uid: String,
    semester: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ClassListParams {
    period: String,
    semester: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TokenParams {
    token: String,
}

impl ServiceError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: "internal",
            error: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let (status, code) = match &err {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::WriteFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "write_failure"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, code, "request failed");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    let static_files = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(STATIC_CACHE_CONTROL),
        ))
        .service(ServeDir::new(state.resources_dir.join("res")));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/classes", get(classes))
        .route("/classList", get(class_list))
        .route("/calendar", get(calendar))
        .route("/chat", get(chat))
        .route("/verify", post(verify))
        .route("/calEdit", post(cal_edit))
        .route("/classListEdit", post(class_list_edit))
        .nest_service("/res", static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    config::init_tracing();
    let args = Args::parse();

    let identity = IdentityConfig::from_file(&args.identity_config)?;
    let index = IndexPage::load(&args.resources_dir, args.local)?;
    let state = ServiceState {
        api: ClassbookApi::new(args.db.clone()),
        verifier: Arc::new(IdentityToolkitVerifier::new(identity)),
        index,
        resources_dir: args.resources_dir.clone(),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        resources_dir = %args.resources_dir.display(),
        local = args.local,
        "classbook service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run a store or identity call on the blocking pool.
async fn run_blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> ApiResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => Err(ServiceError::internal(format!("blocking task failed: {err}"))),
    }
}

async fn index(State(state): State<ServiceState>) -> Result<Html<String>, ServiceError> {
    tracing::info!("index.html");
    match state.index.render() {
        Ok(html) => Ok(Html(html)),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "failed to expand template");
            Err(ServiceError::internal(format!("{err:#}")))
        }
    }
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn classes(
    State(state): State<ServiceState>,
    Query(params): Query<ScheduleParams>,
) -> Result<Json<Vec<ClassRecord>>, ServiceError> {
    let classes = state.api.schedule_classes(&params.uid, &params.semester)?;
    Ok(Json(classes))
}

async fn class_list(
    State(state): State<ServiceState>,
    Query(params): Query<ClassListParams>,
) -> Result<Json<Vec<ClassRecord>>, ServiceError> {
    let classes = state.api.class_list(&params.period, &params.semester)?;
    Ok(Json(classes))
}

async fn calendar(
    State(state): State<ServiceState>,
    Query(query): Query<CalendarQuery>,
) -> Result<Json<Vec<CalendarEntry>>, ServiceError> {
    let today = OffsetDateTime::now_utc().date();
    let window = state.api.calendar(&query, today)?;
    Ok(Json(window))
}

async fn chat(State(state): State<ServiceState>) -> Json<Vec<ChatMessage>> {
    Json(state.api.chat_feed())
}

async fn verify(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<VerifyResponse>, ServiceError> {
    let token = String::from_utf8(body.to_vec())
        .map_err(|err| ApiError::Validation(format!("token is not UTF-8: {err}")))?;
    run_blocking(move || state.api.verify_token(state.verifier.as_ref(), &token)).await?;
    Ok(Json(VerifyResponse { verified: true }))
}

async fn cal_edit(
    State(state): State<ServiceState>,
    Query(params): Query<TokenParams>,
    body: Bytes,
) -> Result<Json<StoredCalendarEntry>, ServiceError> {
    let stored = run_blocking(move || {
        state.api.edit_calendar(state.verifier.as_ref(), &params.token, &body)
    })
    .await?;
    Ok(Json(stored))
}

async fn class_list_edit(
    State(state): State<ServiceState>,
    Query(params): Query<TokenParams>,
    body: Bytes,
) -> Result<Json<ScheduleEntry>, ServiceError> {
    let schedule = run_blocking(move || {
        state.api.edit_schedule(state.verifier.as_ref(), &params.token, &body)
    })
    .await?;
    Ok(Json(schedule))
}
