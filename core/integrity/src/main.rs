use anyhow::Result;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::{Local, NaiveDate};
use farmstead_integrity::{
    CycleScheduler, Database, IntegrityConfig, IntegrityError, NewTask, RolloverEngine,
    TaskFilter, TaskUpdate, UpdateOptions,
};
use farmstead_schemas::{
    CycleId, CycleTimeframe, EntityKind, EntityRef, RecordId, RelationCandidate, RelationId,
    TaskState,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    config: Arc<IntegrityConfig>,
    scheduler: CycleScheduler,
    rollover: RolloverEngine,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = std::result::Result<Json<Value>, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Farmstead Integrity Service v0.1.0");

    let config = IntegrityConfig::from_env();

    // Create directory if it doesn't exist
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::new(&config.db_path)?;
    info!("Database initialized at: {}", config.db_path.display());

    let scheduler = CycleScheduler::new();
    let cycles = scheduler.ensure_cycles_exist(
        &db,
        config.months_ahead,
        config.months_behind,
        Local::now().date_naive(),
    )?;
    info!("{} cycles on record", cycles.len());

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        config: Arc::new(config),
        scheduler,
        rollover: RolloverEngine::new(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))

        // Cycles
        .route("/cycles", get(list_cycles).post(create_cycle))
        .route("/cycles/current", get(current_cycle))
        .route("/cycles/ensure", post(ensure_cycles))
        .route("/cycles/generate", post(generate_cycles))
        .route("/cycles/rollover", post(rollover))
        .route("/cycles/:cycle_id", get(get_cycle).patch(update_cycle))
        .route("/cycles/:cycle_id/progress", get(cycle_progress))

        // Tasks and relations
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:task_id/state", put(set_task_state))
        .route("/tasks/:task_id/relations", get(task_relations))
        .route("/tasks/:task_id/blockers", get(task_blockers))
        .route("/relations", post(create_relation))
        .route("/relations/:relation_id", put(update_relation).delete(delete_relation))

        // Any record kind
        .route("/records/:kind/:id/text", put(save_text))
        .route("/records/:kind/:id/parent", put(set_parent))
        .route("/records/:kind/:id/ancestors", get(ancestors))
        .route("/records/:kind/:id/descendants", get(descendants))
        .route("/records/:kind/:id/referenced-by", get(referenced_by))

        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Starting HTTP server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn reject(err: IntegrityError) -> ApiError {
    match &err {
        IntegrityError::Validation(validation) => {
            warn!("Rejected write: {}", validation);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": validation.code(), "message": validation.to_string() })),
            )
        }
        IntegrityError::NotFound { .. }
        | IntegrityError::CycleNotFound(_)
        | IntegrityError::RelationNotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": err.to_string() })),
        ),
        IntegrityError::NotHierarchical(_) | IntegrityError::InvalidMonth { .. } => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "bad_request", "message": err.to_string() })),
        ),
        IntegrityError::Storage(_) => {
            error!("Storage failure: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage", "message": err.to_string() })),
            )
        }
    }
}

fn bad_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "message": message })),
    )
}

fn parse_kind(raw: &str) -> std::result::Result<EntityKind, ApiError> {
    raw.parse::<EntityKind>().map_err(|e| bad_request(e.to_string()))
}

fn today_or(today: Option<NaiveDate>) -> NaiveDate {
    today.unwrap_or_else(|| Local::now().date_naive())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "service": "integrity",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

// ========== CYCLES ==========

#[derive(Debug, Default, Deserialize)]
struct CycleQuery {
    timeframe: Option<CycleTimeframe>,
    today: Option<NaiveDate>,
}

async fn list_cycles(
    State(state): State<AppState>,
    query: Option<Query<CycleQuery>>,
) -> ApiResult {
    let Query(query) = query.unwrap_or_default();
    let db = state.db.lock().await;

    let cycles = state
        .scheduler
        .list_cycles(
            &db,
            query.timeframe.unwrap_or(CycleTimeframe::All),
            today_or(query.today),
        )
        .map_err(reject)?;

    Ok(Json(json!({ "cycles": cycles })))
}

#[derive(Debug, Deserialize)]
struct CreateCycleRequest {
    name: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

async fn create_cycle(
    State(state): State<AppState>,
    Json(request): Json<CreateCycleRequest>,
) -> ApiResult {
    let db = state.db.lock().await;
    let cycle = state
        .scheduler
        .create_cycle(&db, &request.name, request.start_date, request.end_date)
        .map_err(reject)?;

    Ok(Json(json!(cycle)))
}

#[derive(Debug, Deserialize)]
struct UpdateCycleRequest {
    name: Option<String>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

async fn update_cycle(
    State(state): State<AppState>,
    Path(cycle_id): Path<i64>,
    Json(request): Json<UpdateCycleRequest>,
) -> ApiResult {
    let db = state.db.lock().await;
    let cycle = state
        .scheduler
        .update_cycle(
            &db,
            CycleId(cycle_id),
            request.name.as_deref(),
            request.start_date,
            request.end_date,
        )
        .map_err(reject)?;

    Ok(Json(json!(cycle)))
}

async fn get_cycle(State(state): State<AppState>, Path(cycle_id): Path<i64>) -> ApiResult {
    let db = state.db.lock().await;
    let cycle = state
        .scheduler
        .get_cycle(&db, CycleId(cycle_id))
        .map_err(reject)?
        .ok_or_else(|| reject(IntegrityError::CycleNotFound(CycleId(cycle_id))))?;

    Ok(Json(json!(cycle)))
}

async fn cycle_progress(State(state): State<AppState>, Path(cycle_id): Path<i64>) -> ApiResult {
    let db = state.db.lock().await;
    let progress = state
        .scheduler
        .cycle_progress(&db, CycleId(cycle_id))
        .map_err(reject)?;

    Ok(Json(json!(progress)))
}

#[derive(Debug, Default, Deserialize)]
struct TodayQuery {
    today: Option<NaiveDate>,
}

async fn current_cycle(
    State(state): State<AppState>,
    query: Option<Query<TodayQuery>>,
) -> ApiResult {
    let Query(query) = query.unwrap_or_default();
    let today = today_or(query.today);
    let db = state.db.lock().await;

    if state.config.rollover_on_current {
        let (cycle, report) = state
            .rollover
            .current_cycle_with_rollover(&db, today)
            .map_err(reject)?;
        return Ok(Json(json!({ "cycle": cycle, "rollover": report })));
    }

    let cycle = state.scheduler.current_cycle(&db, today).map_err(reject)?;
    Ok(Json(json!({ "cycle": cycle })))
}

#[derive(Debug, Default, Deserialize)]
struct EnsureRequest {
    months_ahead: Option<u32>,
    months_behind: Option<u32>,
    today: Option<NaiveDate>,
}

async fn ensure_cycles(
    State(state): State<AppState>,
    request: Option<Json<EnsureRequest>>,
) -> ApiResult {
    let Json(request) = request.unwrap_or_default();
    let db = state.db.lock().await;

    let cycles = state
        .scheduler
        .ensure_cycles_exist(
            &db,
            request.months_ahead.unwrap_or(state.config.months_ahead),
            request.months_behind.unwrap_or(state.config.months_behind),
            today_or(request.today),
        )
        .map_err(reject)?;

    Ok(Json(json!({ "cycles": cycles })))
}

fn default_duration() -> u32 {
    7
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    start_date: NaiveDate,
    count: u32,
    #[serde(default = "default_duration")]
    duration_days: u32,
}

async fn generate_cycles(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult {
    let db = state.db.lock().await;
    let cycles = state
        .scheduler
        .generate_cycles(&db, request.start_date, request.count, request.duration_days)
        .map_err(reject)?;

    Ok(Json(json!({ "cycles": cycles })))
}

async fn rollover(
    State(state): State<AppState>,
    query: Option<Query<TodayQuery>>,
) -> ApiResult {
    let Query(query) = query.unwrap_or_default();
    let db = state.db.lock().await;

    let report = state
        .rollover
        .rollover_from_past_cycles(&db, today_or(query.today))
        .map_err(reject)?;

    Ok(Json(json!(report)))
}

// ========== TASKS ==========

#[derive(Debug, Default, Deserialize)]
struct TaskQuery {
    state: Option<TaskState>,
    cycle_id: Option<i64>,
    parent_id: Option<RecordId>,
    plan_id: Option<RecordId>,
    #[serde(default)]
    unscheduled: bool,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    blocked: bool,
}

async fn list_tasks(
    State(state): State<AppState>,
    query: Option<Query<TaskQuery>>,
) -> ApiResult {
    let Query(query) = query.unwrap_or_default();
    let filter = TaskFilter {
        state: query.state,
        cycle_id: query.cycle_id.map(CycleId),
        parent_id: query.parent_id,
        plan_id: query.plan_id,
        unscheduled: query.unscheduled,
        active: query.active,
        blocked: query.blocked,
    };

    let db = state.db.lock().await;
    let tasks = db.list_tasks(&filter).map_err(reject)?;

    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    description: Option<String>,
    state: Option<TaskState>,
    cycle_id: Option<i64>,
    parent_id: Option<RecordId>,
    plan_id: Option<RecordId>,
    #[serde(default)]
    suppress_derived_effects: bool,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult {
    let new = NewTask {
        title: request.title,
        description: request.description,
        state: request.state,
        cycle_id: request.cycle_id.map(CycleId),
        parent_id: request.parent_id,
        plan_id: request.plan_id,
    };
    let options = UpdateOptions {
        suppress_derived_effects: request.suppress_derived_effects,
    };

    let db = state.db.lock().await;
    let saved = db.create_task(&new, options).map_err(reject)?;

    Ok(Json(json!(saved)))
}

#[derive(Debug, Deserialize)]
struct StateRequest {
    state: TaskState,
}

async fn set_task_state(
    State(state): State<AppState>,
    Path(task_id): Path<RecordId>,
    Json(request): Json<StateRequest>,
) -> ApiResult {
    let update = TaskUpdate {
        state: Some(request.state),
        ..Default::default()
    };

    let db = state.db.lock().await;
    let saved = db
        .update_task(task_id, &update, UpdateOptions::default())
        .map_err(reject)?;

    Ok(Json(json!(saved.record)))
}

async fn task_relations(State(state): State<AppState>, Path(task_id): Path<RecordId>) -> ApiResult {
    let db = state.db.lock().await;
    let relations = db.relations_for_task(task_id).map_err(reject)?;

    Ok(Json(json!({ "relations": relations })))
}

async fn task_blockers(State(state): State<AppState>, Path(task_id): Path<RecordId>) -> ApiResult {
    let db = state.db.lock().await;
    let blockers = db.blockers_of(task_id).map_err(reject)?;
    let blocking = db.blocked_by(task_id).map_err(reject)?;
    let is_blocked = db.is_blocked(task_id).map_err(reject)?;

    Ok(Json(json!({
        "blocked_by": blockers,
        "blocking": blocking,
        "is_blocked": is_blocked
    })))
}

async fn create_relation(
    State(state): State<AppState>,
    Json(candidate): Json<RelationCandidate>,
) -> ApiResult {
    let db = state.db.lock().await;
    let relation = db.create_task_relation(&candidate).map_err(reject)?;

    Ok(Json(json!(relation)))
}

async fn update_relation(
    State(state): State<AppState>,
    Path(relation_id): Path<i64>,
    Json(candidate): Json<RelationCandidate>,
) -> ApiResult {
    let db = state.db.lock().await;
    let relation = db
        .update_task_relation(RelationId(relation_id), &candidate)
        .map_err(reject)?;

    Ok(Json(json!(relation)))
}

async fn delete_relation(
    State(state): State<AppState>,
    Path(relation_id): Path<i64>,
) -> ApiResult {
    let db = state.db.lock().await;
    let deleted = db
        .delete_task_relation(RelationId(relation_id))
        .map_err(reject)?;

    if !deleted {
        return Err(reject(IntegrityError::RelationNotFound(RelationId(relation_id))));
    }
    Ok(Json(json!({ "deleted": relation_id })))
}

// ========== RECORDS ==========

#[derive(Debug, Deserialize)]
struct TextRequest {
    text: Option<String>,
    #[serde(default)]
    suppress_derived_effects: bool,
}

async fn save_text(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, RecordId)>,
    Json(request): Json<TextRequest>,
) -> ApiResult {
    let owner = EntityRef::new(parse_kind(&kind)?, id);
    let options = UpdateOptions {
        suppress_derived_effects: request.suppress_derived_effects,
    };

    let db = state.db.lock().await;
    let report = db
        .save_text(owner, request.text.as_deref(), options)
        .map_err(reject)?;

    Ok(Json(json!({ "owner": owner, "sync": report })))
}

#[derive(Debug, Deserialize)]
struct ParentRequest {
    parent_id: Option<RecordId>,
}

async fn set_parent(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, RecordId)>,
    Json(request): Json<ParentRequest>,
) -> ApiResult {
    let kind = parse_kind(&kind)?;

    let db = state.db.lock().await;
    db.set_parent(kind, id, request.parent_id).map_err(reject)?;

    Ok(Json(json!({ "kind": kind, "id": id, "parent_id": request.parent_id })))
}

async fn ancestors(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, RecordId)>,
) -> ApiResult {
    let kind = parse_kind(&kind)?;
    let db = state.db.lock().await;
    let ancestors = db.ancestors(kind, id).map_err(reject)?;

    Ok(Json(json!({ "ancestors": ancestors })))
}

async fn descendants(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, RecordId)>,
) -> ApiResult {
    let kind = parse_kind(&kind)?;
    let db = state.db.lock().await;
    let descendants = db.descendants(kind, id).map_err(reject)?;

    Ok(Json(json!({ "descendants": descendants })))
}

async fn referenced_by(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, RecordId)>,
) -> ApiResult {
    let target = EntityRef::new(parse_kind(&kind)?, id);
    let db = state.db.lock().await;
    let owners = db.referencing_owners(target).map_err(reject)?;

    Ok(Json(json!({ "target": target, "referenced_by": owners })))
}
