use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use serde::Deserialize;

use crate::clients::{AnalysisResolver, AppsService, Permissions, authorized_external_ids};
use crate::controller::{Controller, TimeLimit, UrlReady};
use crate::error::{ExposerError, Result};
use crate::external::{EndpointOptions, ExternalService, IngressOptions, ServiceOptions};
use crate::job::Job;
use crate::listing::ViceListing;
use crate::logs::{LogOpts, LogService};

/* ============================= PROMETHEUS ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static LAUNCHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("vice_launches_total", "Total analysis launches accepted")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static EXITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("vice_exits_total", "Total analysis teardowns")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static STATUS_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "vice_status_events_total",
            "Job-state notifications delivered to the status sink",
        ),
        &["state"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static WATCH_RESTARTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("vice_watch_restarts_total", "Watch streams restarted")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub logs: LogService,
    pub external: ExternalService,
    pub apps: Arc<dyn AppsService>,
    pub permissions: Arc<dyn Permissions>,
    pub resolver: Arc<dyn AnalysisResolver>,
    pub ready: Arc<AtomicBool>,
}

/* ============================= QUERIES ============================= */

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeLimitQuery {
    user: Option<String>,
    delta: Option<i64>,
}

fn require_user(user: Option<String>) -> Result<String> {
    user.filter(|u| !u.is_empty())
        .ok_or_else(|| ExposerError::unauthorised("the user query parameter is required"))
}

/// Host-scoped routes authorise through the resolver + permissions pair.
async fn authorize_host(state: &AppState, host: &str, user: &str) -> Result<()> {
    let analysis_id = state.resolver.analysis_id_for_host(host).await?;
    if !state.permissions.is_allowed(user, &analysis_id).await? {
        return Err(ExposerError::unauthorised(format!(
            "user {user} may not access analysis {analysis_id}"
        )));
    }
    Ok(())
}

/// Analysis-scoped routes map the analysis id to the external id through
/// the apps service, which also acts as the ownership check.
async fn resolve_external_id(
    apps: &dyn AppsService,
    user: &str,
    analysis_id: &str,
) -> Result<String> {
    let mut ids = authorized_external_ids(apps, user, analysis_id).await?;
    Ok(ids.remove(0))
}

/// Guard shared by every non-admin analysis-scoped route: the caller must
/// name a user, and that user must own (or have access to) the analysis.
/// Returns the external id the controller operates on. The admin mirrors
/// bypass this and take the external id directly.
async fn authorize_analysis(
    apps: &dyn AppsService,
    user: Option<String>,
    analysis_id: &str,
) -> Result<String> {
    let user = require_user(user)?;
    resolve_external_id(apps, &user, analysis_id).await
}

/* ============================= ROUTER ============================= */

/// Liveness/readiness/metrics endpoints; stateless apart from the ready
/// flag so they stay testable without a cluster.
pub fn health_router<S>(ready: Arc<AtomicBool>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::Relaxed) {
                        (StatusCode::OK, "READY")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
                    }
                }
            }),
        )
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(greeting))
        .route("/vice/launch", post(launch))
        .route("/vice/listing", get(listing_everything))
        .route("/vice/listing/", get(listing_everything))
        .route("/vice/listing/deployments", get(listing_deployments))
        .route("/vice/listing/pods", get(listing_pods))
        .route("/vice/listing/configmaps", get(listing_configmaps))
        .route("/vice/listing/services", get(listing_services))
        .route("/vice/listing/ingresses", get(listing_ingresses))
        .route("/vice/:id/download-input-files", post(download_input_files))
        .route("/vice/:id/save-output-files", post(save_output_files))
        .route("/vice/:id/exit", post(exit))
        .route("/vice/:id/save-and-exit", post(save_and_exit))
        .route("/vice/:id/pods", get(pods_for_analysis))
        .route("/vice/:id/logs", get(logs_for_analysis))
        .route(
            "/vice/:id/time-limit",
            get(get_time_limit).post(set_time_limit),
        )
        .route("/vice/:id/url-ready", get(url_ready))
        .route("/vice/:id/description", get(describe))
        .route(
            "/vice/admin/:id/download-input-files",
            post(admin_download_input_files),
        )
        .route(
            "/vice/admin/:id/save-output-files",
            post(admin_save_output_files),
        )
        .route("/vice/admin/:id/exit", post(admin_exit))
        .route("/vice/admin/:id/save-and-exit", post(admin_save_and_exit))
        .route(
            "/vice/admin/:id/time-limit",
            get(admin_get_time_limit).post(admin_set_time_limit),
        )
        .route("/vice/admin/:id/url-ready", get(admin_url_ready))
        .route("/vice/admin/:id/description", get(admin_describe))
        .route(
            "/service/:name",
            post(upsert_external_service)
                .put(upsert_external_service)
                .get(get_external_service)
                .delete(delete_external_service),
        )
        .route(
            "/endpoint/:name",
            post(upsert_external_endpoint)
                .put(upsert_external_endpoint)
                .get(get_external_endpoint)
                .delete(delete_external_endpoint),
        )
        .route(
            "/ingress/:name",
            post(upsert_external_ingress)
                .put(upsert_external_ingress)
                .get(get_external_ingress)
                .delete(delete_external_ingress),
        )
        .merge(health_router(state.ready.clone()))
        .with_state(state)
}

/* ============================= BASIC HANDLERS ============================= */

async fn greeting() -> &'static str {
    "Hello from vice-exposer.\n"
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= LIFECYCLE HANDLERS ============================= */

async fn launch(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode> {
    let job: Job = serde_json::from_value(body)
        .map_err(|e| ExposerError::invalid(format!("malformed job submission: {e}")))?;
    state.controller.launch(&job).await?;
    Ok(StatusCode::OK)
}

async fn download_input_files(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode> {
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    state.controller.trigger_downloads(&id, false).await?;
    Ok(StatusCode::OK)
}

async fn save_output_files(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode> {
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    state.controller.trigger_uploads(&id, false).await?;
    Ok(StatusCode::OK)
}

async fn exit(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode> {
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    state.controller.exit(&id).await?;
    Ok(StatusCode::OK)
}

async fn save_and_exit(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode> {
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    state.controller.save_and_exit(&id);
    Ok(StatusCode::OK)
}

async fn admin_download_input_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.controller.trigger_downloads(&id, false).await?;
    Ok(StatusCode::OK)
}

async fn admin_save_output_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.controller.trigger_uploads(&id, false).await?;
    Ok(StatusCode::OK)
}

async fn admin_exit(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.controller.exit(&id).await?;
    Ok(StatusCode::OK)
}

async fn admin_save_and_exit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    state.controller.save_and_exit(&id);
    StatusCode::OK
}

/* ============================= POD & LOG HANDLERS ============================= */

async fn pods_for_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Response> {
    let user = require_user(query.user)?;
    let listing = state.logs.list_pods(&analysis_id, &user).await?;
    Ok(Json(listing).into_response())
}

async fn logs_for_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(user_query): Query<UserQuery>,
    Query(opts): Query<LogOpts>,
) -> Result<Response> {
    let user = require_user(user_query.user)?;

    if opts.follow() {
        let body = state.logs.stream_logs(&analysis_id, &user, &opts).await?;
        Ok(streaming_response(body))
    } else {
        let payload = state.logs.collect_logs(&analysis_id, &user, &opts).await?;
        Ok(Json(payload).into_response())
    }
}

fn streaming_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/* ============================= TIME-LIMIT HANDLERS ============================= */

async fn get_time_limit(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<TimeLimit>> {
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    Ok(Json(state.controller.get_time_limit(&id).await?))
}

async fn set_time_limit(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(query): Query<TimeLimitQuery>,
) -> Result<Json<TimeLimit>> {
    let delta = query
        .delta
        .ok_or_else(|| ExposerError::invalid("the delta query parameter is required"))?;
    let id = authorize_analysis(state.apps.as_ref(), query.user, &analysis_id).await?;
    Ok(Json(state.controller.set_time_limit(&id, delta).await?))
}

async fn admin_get_time_limit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TimeLimit>> {
    Ok(Json(state.controller.get_time_limit(&id).await?))
}

async fn admin_set_time_limit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TimeLimitQuery>,
) -> Result<Json<TimeLimit>> {
    let delta = query
        .delta
        .ok_or_else(|| ExposerError::invalid("the delta query parameter is required"))?;
    Ok(Json(state.controller.set_time_limit(&id, delta).await?))
}

/* ============================= HOST HANDLERS ============================= */

async fn url_ready(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UrlReady>> {
    let user = require_user(query.user)?;
    authorize_host(&state, &host, &user).await?;
    Ok(Json(state.controller.url_ready(&host).await?))
}

async fn describe(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ViceListing>> {
    let user = require_user(query.user)?;
    authorize_host(&state, &host, &user).await?;
    Ok(Json(state.controller.describe_host(&host).await?))
}

async fn admin_url_ready(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<UrlReady>> {
    Ok(Json(state.controller.url_ready(&host).await?))
}

async fn admin_describe(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<ViceListing>> {
    Ok(Json(state.controller.describe_host(&host).await?))
}

/* ============================= LISTING HANDLERS ============================= */

async fn listing_everything(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Json<ViceListing>> {
    Ok(Json(state.controller.listing().everything(&filter).await?))
}

async fn listing_deployments(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let items = state.controller.listing().deployments(&filter).await?;
    Ok(Json(serde_json::json!({ "deployments": items })).into_response())
}

async fn listing_pods(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let items = state.controller.listing().pods(&filter).await?;
    Ok(Json(serde_json::json!({ "pods": items })).into_response())
}

async fn listing_configmaps(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let items = state.controller.listing().configmaps(&filter).await?;
    Ok(Json(serde_json::json!({ "configmaps": items })).into_response())
}

async fn listing_services(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let items = state.controller.listing().services(&filter).await?;
    Ok(Json(serde_json::json!({ "services": items })).into_response())
}

async fn listing_ingresses(
    State(state): State<AppState>,
    Query(filter): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let items = state.controller.listing().ingresses(&filter).await?;
    Ok(Json(serde_json::json!({ "ingresses": items })).into_response())
}

/* ============================= EXTERNAL CRUD HANDLERS ============================= */

async fn upsert_external_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ServiceOptions>> {
    let opts: ServiceOptions = serde_json::from_value(body)
        .map_err(|e| ExposerError::invalid(format!("malformed service options: {e}")))?;
    Ok(Json(state.external.upsert_service(&name, &opts).await?))
}

async fn get_external_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceOptions>> {
    Ok(Json(state.external.get_service(&name).await?))
}

async fn delete_external_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.external.delete_service(&name).await?;
    Ok(StatusCode::OK)
}

async fn upsert_external_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<EndpointOptions>> {
    let opts: EndpointOptions = serde_json::from_value(body)
        .map_err(|e| ExposerError::invalid(format!("malformed endpoint options: {e}")))?;
    Ok(Json(state.external.upsert_endpoints(&name, &opts).await?))
}

async fn get_external_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EndpointOptions>> {
    Ok(Json(state.external.get_endpoints(&name).await?))
}

async fn delete_external_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.external.delete_endpoints(&name).await?;
    Ok(StatusCode::OK)
}

async fn upsert_external_ingress(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<IngressOptions>> {
    let opts: IngressOptions = serde_json::from_value(body)
        .map_err(|e| ExposerError::invalid(format!("malformed ingress options: {e}")))?;
    Ok(Json(state.external.upsert_ingress(&name, &opts).await?))
}

async fn get_external_ingress(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<IngressOptions>> {
    Ok(Json(state.external.get_ingress(&name).await?))
}

async fn delete_external_ingress(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.external.delete_ingress(&name).await?;
    Ok(StatusCode::OK)
}

/* ============================= TESTS ============================= */
