use crate::auth::{self, Session, SharedState};
use crate::extraction::CaptureInput;
use crate::live;
use crate::models::{List, NewTask, Recipe, StagingItem, Task, TaskPatch};
use crate::recipe;
use crate::staging::Resolution;
use crate::store::{JoinOutcome, StoreError, TriageOutcome};
use crate::triage::TriageError;
use crate::world::{Command, Event, TaskQuery, WorldError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<WorldError> for ApiError {
    fn from(e: WorldError) -> Self {
        ApiError::Store(StoreError::World(e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(StoreError::Persist(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(StoreError::UsernameTaken) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::Triage(TriageError::Empty)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Triage(TriageError::NotFrontCard)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::World(e)) => match e {
                WorldError::TaskNotFound
                | WorldError::ListNotFound
                | WorldError::RecipeNotFound
                | WorldError::StagingNotFound
                | WorldError::CandidateNotFound => StatusCode::NOT_FOUND,
                WorldError::EmptyContent | WorldError::EmptyPatch | WorldError::InvalidRecurrence => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                WorldError::Forbidden => StatusCode::FORBIDDEN,
                WorldError::InvalidTransition
                | WorldError::VersionConflict { .. }
                | WorldError::AlreadyJoined
                | WorldError::NothingToWake => StatusCode::CONFLICT,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Router ─────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task).patch(update_task).delete(delete_task))
        .route("/api/tasks/:id/complete", post(complete_task))
        .route("/api/capture", post(quick_capture))
        .route("/api/share", post(share))
        .route("/api/triage", get(triage_view))
        .route("/api/triage/:id/swipe", post(triage_swipe))
        .route("/api/lists", get(list_lists).post(create_list))
        .route("/api/lists/:id", axum::routing::patch(update_list).delete(delete_list))
        .route("/api/lists/join/:shared_id", post(join_list))
        .route("/api/recipes", get(list_recipes).post(create_recipe))
        .route("/api/recipes/:id", axum::routing::delete(delete_recipe))
        .route("/api/recipes/:id/run", post(run_recipe))
        .route("/api/staging", get(list_staging).post(capture))
        .route("/api/staging/active", get(active_staging))
        .route("/api/staging/:id", axum::routing::delete(discard_staging))
        .route("/api/staging/:id/refine", post(refine_staging))
        .route("/api/staging/:id/candidates/:cid/accept", post(accept_candidate))
        .route("/api/staging/:id/candidates/:cid/reject", post(reject_candidate))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        // Auth (REST, JSON, once per session)
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/guest", post(auth::guest))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/health", get(health))
        // Live feed authenticates inside the socket
        .route("/api/live", get(live::ws_handler))
        .merge(protected)
        .with_state(state)
}

// GET /api/health
async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "revision": state.store.revision() }))
}

// ── Tasks ──────────────────────────────────────────────────────

// GET /api/tasks
async fn list_tasks(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Vec<Task>> {
    Ok(Json(state.store.tasks(&session, &query)))
}

// POST /api/tasks
async fn create_task(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.store.add_task(&session, payload)?;
    Ok((StatusCode::CREATED, Json(task)))
}

// GET /api/tasks/:id
async fn get_task(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    Ok(Json(state.store.task(&session, id)?))
}

// PATCH /api/tasks/:id
async fn update_task(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Task> {
    Ok(Json(state.store.update_task(&session, id, patch)?))
}

// DELETE /api/tasks/:id
async fn delete_task(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    Ok(Json(state.store.delete_task(&session, id)?))
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    task: Task,
    next: Option<Task>,
}

// POST /api/tasks/:id/complete
async fn complete_task(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<CompleteResponse> {
    let (task, next) = state.store.complete_task(&session, id)?;
    Ok(Json(CompleteResponse { task, next }))
}

// ── Capture ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickCaptureRequest {
    text: String,
    #[serde(default)]
    tz_offset_minutes: i32,
}

// POST /api/capture
async fn quick_capture(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<QuickCaptureRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.store.quick_capture(&session, &payload.text, payload.tz_offset_minutes)?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    title: Option<String>,
    text: Option<String>,
    url: Option<String>,
}

// POST /api/share
async fn share(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<ShareRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.store.share(
        &session,
        payload.title.as_deref(),
        payload.text.as_deref(),
        payload.url.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(task)))
}

// ── Triage ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriageView {
    front: Option<Task>,
    remaining: usize,
    inbox_zero: bool,
}

// GET /api/triage
async fn triage_view(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> ApiResult<TriageView> {
    let (queue, inbox_zero) = state.store.triage_queue(&session);
    Ok(Json(TriageView { front: queue.front().cloned(), remaining: queue.len(), inbox_zero }))
}

#[derive(Debug, Deserialize)]
struct SwipeRequest {
    dx: f64,
    #[serde(default)]
    dy: f64,
}

// POST /api/triage/:id/swipe
async fn triage_swipe(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SwipeRequest>,
) -> ApiResult<TriageOutcome> {
    Ok(Json(state.store.triage_swipe(&session, id, payload.dx, payload.dy)?))
}

// ── Lists ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListView {
    #[serde(flatten)]
    list: List,
    /// The viewer's role, derived per request.
    role: Option<crate::models::ListRole>,
}

impl ListView {
    fn new(list: List, session: &Session) -> Self {
        let role = list.role_of(session.user_id);
        ListView { list, role }
    }
}

fn expect_list(event: Event) -> Result<List, ApiError> {
    match event {
        Event::ListCreated { list, .. } | Event::ListUpdated { list, .. } | Event::ListDeleted { list, .. } => Ok(list),
        other => Err(ApiError::Internal(format!("unexpected event {}", other.name()))),
    }
}

// GET /api/lists
async fn list_lists(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> ApiResult<Vec<ListView>> {
    let lists = state.store.lists(&session);
    Ok(Json(lists.into_iter().map(|l| ListView::new(l, &session)).collect()))
}

#[derive(Debug, Deserialize)]
struct CreateListRequest {
    name: String,
    #[serde(default = "default_color")]
    color: String,
    #[serde(default)]
    icon: Option<String>,
}

fn default_color() -> String {
    "slate".to_string()
}

// POST /api/lists
async fn create_list(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<CreateListRequest>,
) -> Result<(StatusCode, Json<ListView>), ApiError> {
    let event = state.store.execute(&session, Command::CreateList {
        name: payload.name,
        color: payload.color,
        icon: payload.icon,
    })?;
    Ok((StatusCode::CREATED, Json(ListView::new(expect_list(event)?, &session))))
}

#[derive(Debug, Deserialize)]
struct UpdateListRequest {
    name: Option<String>,
    color: Option<String>,
    icon: Option<String>,
}

// PATCH /api/lists/:id
async fn update_list(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateListRequest>,
) -> ApiResult<ListView> {
    let event = state.store.execute(&session, Command::UpdateList {
        list_id: id,
        name: payload.name,
        color: payload.color,
        icon: payload.icon,
    })?;
    Ok(Json(ListView::new(expect_list(event)?, &session)))
}

// DELETE /api/lists/:id
async fn delete_list(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.execute(&session, Command::DeleteList { list_id: id })?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    list: ListView,
    already_joined: bool,
}

// POST /api/lists/join/:shared_id
async fn join_list(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(shared_id): Path<Uuid>,
) -> ApiResult<JoinResponse> {
    let (list, already_joined) = match state.store.join_list(&session, shared_id)? {
        JoinOutcome::Joined(list) => (list, false),
        JoinOutcome::AlreadyJoined(list) => (list, true),
    };
    Ok(Json(JoinResponse { list: ListView::new(list, &session), already_joined }))
}

// ── Recipes ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RecipeView {
    #[serde(flatten)]
    recipe: Recipe,
    variables: Vec<String>,
}

impl From<Recipe> for RecipeView {
    fn from(recipe: Recipe) -> Self {
        let variables = recipe::recipe_variables(&recipe);
        RecipeView { recipe, variables }
    }
}

// GET /api/recipes
async fn list_recipes(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> ApiResult<Vec<RecipeView>> {
    Ok(Json(state.store.recipes(&session).into_iter().map(RecipeView::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecipeRequest {
    name: String,
    #[serde(default)]
    template: String,
    task_templates: Vec<String>,
    #[serde(default = "default_color")]
    color: String,
}

// POST /api/recipes
async fn create_recipe(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<CreateRecipeRequest>,
) -> Result<(StatusCode, Json<RecipeView>), ApiError> {
    let event = state.store.execute(&session, Command::CreateRecipe {
        name: payload.name,
        template: payload.template,
        task_templates: payload.task_templates,
        color: payload.color,
    })?;
    match event {
        Event::RecipeCreated { recipe, .. } => Ok((StatusCode::CREATED, Json(RecipeView::from(recipe)))),
        other => Err(ApiError::Internal(format!("unexpected event {}", other.name()))),
    }
}

// DELETE /api/recipes/:id
async fn delete_recipe(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.execute(&session, Command::DeleteRecipe { recipe_id: id })?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RunRecipeRequest {
    #[serde(default)]
    values: HashMap<String, String>,
}

// POST /api/recipes/:id/run
async fn run_recipe(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RunRecipeRequest>,
) -> Result<(StatusCode, Json<Vec<Task>>), ApiError> {
    match state.store.execute(&session, Command::RunRecipe { recipe_id: id, values: payload.values })? {
        Event::TasksCreated { tasks, .. } => Ok((StatusCode::CREATED, Json(tasks))),
        other => Err(ApiError::Internal(format!("unexpected event {}", other.name()))),
    }
}

// ── Staging ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "audio_base64")]
    audio_base64: Option<String>,
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
}

impl CaptureRequest {
    fn into_input(self) -> Result<CaptureInput, ApiError> {
        if let Some(audio) = self.audio_base64.filter(|a| !a.is_empty()) {
            let bytes = STANDARD.decode(audio.as_bytes())
                .map_err(|_| ApiError::BadRequest("audio is not valid base64".to_string()))?;
            return Ok(CaptureInput::Audio { bytes, mime_type: self.mime_type.unwrap_or_default() });
        }
        match self.text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
            Some(text) => Ok(CaptureInput::Text(text)),
            None => Err(ApiError::BadRequest("either text or audio is required".to_string())),
        }
    }
}

// GET /api/staging
async fn list_staging(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> ApiResult<Vec<StagingItem>> {
    Ok(Json(state.store.staging_items(&session)))
}

// POST /api/staging
async fn capture(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<StagingItem>), ApiError> {
    let pending = state.pipeline.capture(&session, payload.into_input()?)?;
    Ok((StatusCode::ACCEPTED, Json(pending.item)))
}

// GET /api/staging/active
async fn active_staging(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> ApiResult<Option<StagingItem>> {
    Ok(Json(state.pipeline.active(&session)))
}

// POST /api/staging/:id/refine
async fn refine_staging(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<StagingItem>), ApiError> {
    let pending = state.pipeline.refine(&session, id, payload.into_input()?)?;
    Ok((StatusCode::ACCEPTED, Json(pending.item)))
}

// POST /api/staging/:id/candidates/:cid/accept
async fn accept_candidate(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path((id, cid)): Path<(Uuid, Uuid)>,
) -> ApiResult<Resolution> {
    Ok(Json(state.pipeline.accept(&session, id, cid)?))
}

// POST /api/staging/:id/candidates/:cid/reject
async fn reject_candidate(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path((id, cid)): Path<(Uuid, Uuid)>,
) -> ApiResult<Resolution> {
    Ok(Json(state.pipeline.reject(&session, id, cid)?))
}

// DELETE /api/staging/:id
async fn discard_staging(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> ApiResult<StagingItem> {
    Ok(Json(state.pipeline.discard(&session, id)?))
}
