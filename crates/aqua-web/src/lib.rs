//! Axum + Askama web surface for AquaSense.

use std::sync::Arc;

use aqua_core::{AnalysisMode, AnalysisRecord, Project};
use aqua_inference::ImagePayload;
use aqua_pipeline::{
    BatchReport, PipelineError, ProjectMetrics, Services, Session, SpeciesCatalog,
    SpeciesCategory, SpeciesEntry,
};
use askama::Template;
use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{FixedOffset, Local};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "aqua-web";

/// Header carrying the caller's user id, set by the upstream identity proxy.
pub const USER_HEADER: &str = "x-aqua-user";

const APP_CSS: &str = include_str!("../assets/app.css");
const RECENT_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

type SharedState = State<Arc<AppState>>;

/// Error body for the JSON API and the pages.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::Access { .. } => StatusCode::FORBIDDEN,
            PipelineError::MissingId(_) | PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::Store(_) | PipelineError::Inference(_) => return Self::internal(err),
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(pipeline) => pipeline.into(),
            Err(other) => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// The signed-in caller, taken from [`USER_HEADER`].
pub struct CurrentUser(pub Session);

fn session_from_headers(headers: &HeaderMap) -> Result<Session, ApiError> {
    let value = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    Session::new(value).map_err(|_| ApiError {
        status: StatusCode::UNAUTHORIZED,
        message: format!("missing {USER_HEADER} header"),
    })
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        session_from_headers(&parts.headers).map(CurrentUser)
    }
}

#[derive(Debug, Deserialize, Default)]
struct ZoneQuery {
    /// Minutes east of UTC; the server's zone when absent.
    tz_offset_minutes: Option<i32>,
}

impl ZoneQuery {
    /// `None` means the server's zone, applied per record.
    fn offset(&self) -> Result<Option<FixedOffset>, ApiError> {
        self.tz_offset_minutes
            .map(|minutes| {
                minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| {
                        ApiError::bad_request(format!("invalid tz_offset_minutes {minutes}"))
                    })
            })
            .transpose()
    }
}

async fn zoned_metrics(
    services: &Services,
    session: &Session,
    project_id: &str,
    zone: &ZoneQuery,
) -> Result<ProjectMetrics, ApiError> {
    let metrics = match zone.offset()? {
        Some(tz) => services.records.project_metrics(session, project_id, &tz).await?,
        None => services.records.project_metrics_local(session, project_id).await?,
    };
    Ok(metrics)
}

#[derive(Debug, Deserialize, Default)]
struct AnalyzeQuery {
    mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SpeciesQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct NewProject {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPatch {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMember {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    email: String,
    display_name: Option<String>,
}

struct RecentRow {
    species: String,
    /// Catalog entry the label maps to, linked from the dashboard.
    species_id: Option<String>,
    image_url: String,
    confidence: String,
    date: String,
}

impl RecentRow {
    fn new(record: &AnalysisRecord, catalog: &SpeciesCatalog) -> Self {
        Self {
            species: record.species.clone(),
            species_id: catalog.for_label(&record.species).map(|e| e.id.clone()),
            image_url: record.image_url.clone(),
            confidence: record
                .confidence()
                .map(|c| format!("{:.0}%", c * 100.0))
                .unwrap_or_else(|| "n/a".to_string()),
            date: record
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    signed_in: bool,
    projects: Vec<Project>,
    recent: Vec<RecentRow>,
    species_count: usize,
}

struct SpeciesGroup<'a> {
    label: &'static str,
    entries: Vec<&'a SpeciesEntry>,
}

#[derive(Template)]
#[template(path = "species.html")]
struct SpeciesTemplate<'a> {
    query: String,
    groups: Vec<SpeciesGroup<'a>>,
}

#[derive(Template)]
#[template(path = "metrics.html")]
struct MetricsTemplate {
    project_id: String,
    project_name: String,
    avg_confidence_pct: f64,
    metrics: ProjectMetrics,
}

pub fn app(state: AppState) -> Router {
    let config = &state.services.config;
    let body_limit = config
        .max_file_bytes
        .saturating_mul(config.max_batch)
        .saturating_add(1024 * 1024);

    Router::new()
        .route("/", get(index_handler))
        .route("/species", get(species_handler))
        .route("/projects/{id}/metrics", get(metrics_page_handler))
        .route("/projects/{id}/metrics/chart", get(metrics_chart_handler))
        .route("/projects/{id}/export.csv", get(export_csv_handler))
        .route("/assets/app.css", get(app_css_handler))
        .route("/api/health", get(health_handler))
        .route("/api/users/me", post(register_handler))
        .route("/api/projects", get(list_projects_handler).post(create_project_handler))
        .route(
            "/api/projects/{id}",
            get(get_project_handler)
                .patch(update_project_handler)
                .delete(delete_project_handler),
        )
        .route("/api/projects/{id}/members", post(add_member_handler))
        .route("/api/projects/{id}/members/{user_id}", delete(remove_member_handler))
        .route("/api/projects/{id}/analyses", get(project_analyses_handler))
        .route("/api/projects/{id}/metrics", get(project_metrics_handler))
        .route("/api/projects/{id}/analyze", post(analyze_handler))
        .route("/api/analyses/recent", get(recent_analyses_handler))
        .route("/api/analyses/{id}", delete(delete_analysis_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

pub async fn serve(services: Services) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(Services::from_env().await?).await
}

async fn index_handler(State(state): SharedState, headers: HeaderMap) -> Response {
    let services = &state.services;
    let species_count = services.catalog.all().len();
    let Ok(session) = session_from_headers(&headers) else {
        return render_html(IndexTemplate {
            signed_in: false,
            projects: Vec::new(),
            recent: Vec::new(),
            species_count,
        });
    };

    let projects = match services.projects.list_for_user(&session).await {
        Ok(projects) => projects,
        Err(err) => return page_error(err.into()),
    };
    let recent = match services.records.load_recent(&session, RECENT_LIMIT).await {
        Ok(records) => records
            .iter()
            .map(|r| RecentRow::new(r, &services.catalog))
            .collect(),
        Err(err) => return page_error(err.into()),
    };
    render_html(IndexTemplate {
        signed_in: true,
        projects,
        recent,
        species_count,
    })
}

fn species_groups<'a>(catalog: &'a SpeciesCatalog, query: &str) -> Vec<SpeciesGroup<'a>> {
    let matches = catalog.search(query);
    SpeciesCategory::ALL
        .iter()
        .map(|category| SpeciesGroup {
            label: category.label(),
            entries: SpeciesCatalog::by_category(&matches, *category),
        })
        .collect()
}

async fn species_handler(State(state): SharedState, Query(query): Query<SpeciesQuery>) -> Response {
    let query = query.q.unwrap_or_default();
    let groups = species_groups(&state.services.catalog, &query);
    render_html(SpeciesTemplate { query, groups })
}

async fn metrics_page_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Query(zone): Query<ZoneQuery>,
) -> Response {
    let services = &state.services;
    let result = async {
        let project = services.projects.get(&session, &id).await?;
        let metrics = zoned_metrics(services, &session, &id, &zone).await?;
        Ok::<_, ApiError>(MetricsTemplate {
            project_id: project.id,
            project_name: project.name,
            avg_confidence_pct: metrics.avg_confidence * 100.0,
            metrics,
        })
    }
    .await;
    match result {
        Ok(tpl) => render_html(tpl),
        Err(err) => page_error(err),
    }
}

async fn metrics_chart_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Query(zone): Query<ZoneQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics = zoned_metrics(&state.services, &session, &id, &zone).await?;
    let x: Vec<String> = metrics.timeline_data.iter().map(|p| p.date.to_string()).collect();
    let y: Vec<usize> = metrics.timeline_data.iter().map(|p| p.count).collect();
    Ok(Json(json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "marker": {"color": "#0080e6"}
        }],
        "layout": {
            "title": "Analyses per day",
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f7fafc"
        }
    })))
}

async fn export_csv_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Query(zone): Query<ZoneQuery>,
) -> Result<Response, ApiError> {
    let records = &state.services.records;
    let csv = match zone.offset()? {
        Some(tz) => records.export_project_csv(&session, &id, &tz).await?,
        None => records.export_project_csv(&session, &id, &Local).await?,
    };
    let disposition = format!(
        "attachment; filename=\"aquasense-export-{}.csv\"",
        Local::now().format("%Y-%m-%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn register_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Json(body): Json<Registration>,
) -> Result<Response, ApiError> {
    let user = state
        .services
        .users
        .ensure(&session, &body.email, body.display_name.as_deref())
        .await?;
    Ok(Json(user).into_response())
}

async fn list_projects_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let projects = state.services.projects.list_for_user(&session).await?;
    Ok(Json(projects.iter().map(project_json).collect()))
}

async fn create_project_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Json(body): Json<NewProject>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let project = state
        .services
        .projects
        .create(&session, &body.name, &body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(project_json(&project))))
}

async fn get_project_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state.services.projects.get(&session, &id).await?;
    Ok(Json(project_json(&project)))
}

async fn update_project_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<ProjectPatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = &state.services.projects;
    let mut project = projects.get(&session, &id).await?;
    if let Some(name) = &body.name {
        project = projects.rename(&session, &id, name).await?;
    }
    if let Some(description) = &body.description {
        project = projects.describe(&session, &id, description).await?;
    }
    Ok(Json(project_json(&project)))
}

async fn delete_project_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.services.projects.delete(&session, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_member_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<NewMember>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state
        .services
        .projects
        .add_member(&session, &id, &body.user_id)
        .await?;
    Ok(Json(project_json(&project)))
}

async fn remove_member_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state
        .services
        .projects
        .remove_member(&session, &id, &user_id)
        .await?;
    Ok(Json(project_json(&project)))
}

async fn project_analyses_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<AnalysisRecord>>, ApiError> {
    let records = state
        .services
        .records
        .load_project_records(&session, &id)
        .await?;
    Ok(Json(records))
}

async fn project_metrics_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Query(zone): Query<ZoneQuery>,
) -> Result<Json<ProjectMetrics>, ApiError> {
    Ok(Json(zoned_metrics(&state.services, &session, &id, &zone).await?))
}

async fn read_images(mut multipart: Multipart) -> Result<Vec<ImagePayload>, ApiError> {
    let mut images = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let Some(filename) = field.file_name().map(ToString::to_string) else {
            continue;
        };
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        images.push(ImagePayload {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Ok(images)
}

async fn analyze_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<AnalyzeQuery>,
    multipart: Multipart,
) -> Result<Json<BatchReport>, ApiError> {
    let mode = match query.mode.as_deref() {
        None => AnalysisMode::SingleLabel,
        Some(raw) => raw
            .parse::<AnalysisMode>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
    };
    let images = read_images(multipart).await?;
    let report = state
        .services
        .ingestor
        .analyze_batch(&session, &id, mode, images)
        .await?;
    Ok(Json(report))
}

async fn recent_analyses_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<AnalysisRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(RECENT_LIMIT).clamp(1, 100);
    let records = state.services.records.load_recent(&session, limit).await?;
    Ok(Json(records))
}

async fn delete_analysis_handler(
    State(state): SharedState,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.services.records.delete_record(&session, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn project_json(project: &Project) -> serde_json::Value {
    json!({
        "id": project.id,
        "name": project.name,
        "description": project.description,
        "userId": project.owner_user_id,
        "members": project.members,
        "createdAt": project.created_at,
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => page_error(ApiError::internal(err)),
    }
}

fn page_error(err: ApiError) -> Response {
    (err.status, Html(format!("Error: {}", err.message))).into_response()
}
