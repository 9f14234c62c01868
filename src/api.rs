//! The management API: JSON over HTTP under `/api/v1` on the dashboard
//! port. CRUD for provider endpoints, workspace lifecycle and mux rules,
//! session activation, and the audit-log readout.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::warn;

use crate::mux::MuxRule;
use crate::providers::{AuthKind, EndpointRegistry, ProviderEndpoint, ProviderKind};
use crate::session::SessionRegistry;
use crate::stats::Stats;
use crate::storage::Db;
use crate::workspaces::{WorkspaceError, WorkspaceRegistry, WorkspaceState};

pub struct ApiState {
    pub workspaces: Arc<WorkspaceRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub db: Option<Arc<Db>>,
    pub stats: Arc<Stats>,
}

impl ApiState {
    fn persist_workspace(&self, name: &str) {
        let (Some(db), Some(ws)) = (&self.db, self.workspaces.get(name)) else {
            return;
        };
        if let Err(e) = db.save_workspace(&ws) {
            warn!("failed to persist workspace {name}: {e}");
        }
    }

    fn persist_session(&self) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_session(&self.sessions.current()) {
                warn!("failed to persist session: {e}");
            }
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/provider-endpoints", get(list_endpoints).post(create_endpoint))
        .route(
            "/api/v1/provider-endpoints/:id",
            put(update_endpoint).delete(delete_endpoint),
        )
        .route("/api/v1/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/v1/workspaces/archive", get(list_archived))
        .route(
            "/api/v1/workspaces/archive/:name",
            delete(hard_delete_workspace),
        )
        .route(
            "/api/v1/workspaces/:name",
            put(update_workspace).delete(archive_workspace),
        )
        .route("/api/v1/workspaces/:name/muxes", get(get_muxes).put(set_muxes))
        .route("/api/v1/workspaces/:name/activate", post(activate_workspace))
        .route("/api/v1/workspaces/:name/recover", post(recover_workspace))
        .route("/api/v1/prompts", get(list_prompts))
        .route("/api/v1/alerts", get(list_alerts))
        .with_state(state)
}

pub async fn run(state: Arc<ApiState>, listener: TcpListener) {
    let app = router(state);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("management API server failed: {e}");
    }
}

fn workspace_error(err: WorkspaceError) -> Response {
    let status = match err {
        WorkspaceError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkspaceError::AlreadyExists(_) => StatusCode::CONFLICT,
        WorkspaceError::DefaultImmutable
        | WorkspaceError::NotArchived(_)
        | WorkspaceError::InvalidName(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "stats": state.stats.snapshot(),
    }))
    .into_response()
}

async fn list_endpoints(State(state): State<Arc<ApiState>>) -> Response {
    let endpoints: Vec<ProviderEndpoint> = state.endpoints.read().as_ref().clone();
    Json(endpoints).into_response()
}

#[derive(Debug, Deserialize)]
struct EndpointBody {
    name: String,
    kind: ProviderKind,
    base_url: String,
    #[serde(default)]
    auth: AuthKind,
    #[serde(default)]
    api_key: Option<String>,
}

async fn create_endpoint(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<EndpointBody>,
) -> Response {
    if state.endpoints.get_by_name(&body.name).is_some() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "endpoint name already exists"})),
        )
            .into_response();
    }
    let mut endpoint = ProviderEndpoint::named(&body.name, body.kind, &body.base_url);
    endpoint.auth = body.auth;
    endpoint.api_key = body.api_key;
    state.endpoints.upsert(endpoint.clone());
    if let Some(db) = &state.db {
        if let Err(e) = db.save_endpoint(&endpoint) {
            warn!("failed to persist endpoint: {e}");
        }
    }
    (StatusCode::CREATED, Json(endpoint)).into_response()
}

async fn update_endpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<EndpointBody>,
) -> Response {
    let Some(mut endpoint) = state.endpoints.get_by_id(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such endpoint"}))).into_response();
    };
    endpoint.name = body.name;
    endpoint.kind = body.kind;
    endpoint.base_url = body.base_url.trim_end_matches('/').to_string();
    endpoint.auth = body.auth;
    if body.api_key.is_some() {
        endpoint.api_key = body.api_key;
    }
    state.endpoints.upsert(endpoint.clone());
    if let Some(db) = &state.db {
        if let Err(e) = db.save_endpoint(&endpoint) {
            warn!("failed to persist endpoint: {e}");
        }
    }
    Json(endpoint).into_response()
}

async fn delete_endpoint(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    if !state.endpoints.remove(&id) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such endpoint"}))).into_response();
    }
    if let Some(db) = &state.db {
        if let Err(e) = db.delete_endpoint(&id) {
            warn!("failed to delete persisted endpoint: {e}");
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_workspaces(State(state): State<Arc<ApiState>>) -> Response {
    let active_id = state.sessions.current().active_workspace_id;
    let workspaces: Vec<_> = state
        .workspaces
        .list(WorkspaceState::Active)
        .into_iter()
        .map(|ws| {
            let is_active = ws.id == active_id;
            json!({
                "id": ws.id,
                "name": ws.name,
                "is_active": is_active,
                "custom_instructions": ws.custom_instructions,
                "created_at": ws.created_at,
            })
        })
        .collect();
    Json(workspaces).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceBody {
    name: String,
    #[serde(default)]
    custom_instructions: Option<String>,
}

async fn create_workspace(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateWorkspaceBody>,
) -> Response {
    let ws = match state.workspaces.create(&body.name) {
        Ok(ws) => ws,
        Err(e) => return workspace_error(e),
    };
    if body.custom_instructions.is_some() {
        if let Err(e) = state
            .workspaces
            .set_custom_instructions(&ws.name, body.custom_instructions)
        {
            return workspace_error(e);
        }
    }
    state.persist_workspace(&ws.name);
    (StatusCode::CREATED, Json(state.workspaces.get(&ws.name))).into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateWorkspaceBody {
    #[serde(default)]
    custom_instructions: Option<String>,
}

async fn update_workspace(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(body): Json<UpdateWorkspaceBody>,
) -> Response {
    if let Err(e) = state
        .workspaces
        .set_custom_instructions(&name, body.custom_instructions)
    {
        return workspace_error(e);
    }
    state.persist_workspace(&name);
    Json(state.workspaces.get(&name)).into_response()
}

async fn archive_workspace(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    if let Err(e) = state.workspaces.archive(&name) {
        return workspace_error(e);
    }
    // An archived workspace cannot stay active; fall back to default.
    let session = state.sessions.current();
    if let Some(ws) = state.workspaces.get(&name) {
        if ws.id == session.active_workspace_id {
            if let Some(default) = state.workspaces.get(crate::workspaces::DEFAULT_WORKSPACE) {
                state.sessions.activate_workspace(&default.id);
            }
        }
    }
    state.persist_workspace(&name);
    state.persist_session();
    StatusCode::NO_CONTENT.into_response()
}

async fn list_archived(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.workspaces.list(WorkspaceState::Archived)).into_response()
}

async fn recover_workspace(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    if let Err(e) = state.workspaces.recover(&name) {
        return workspace_error(e);
    }
    state.persist_workspace(&name);
    StatusCode::NO_CONTENT.into_response()
}

async fn hard_delete_workspace(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    if let Err(e) = state.workspaces.hard_delete(&name) {
        return workspace_error(e);
    }
    if let Some(db) = &state.db {
        if let Err(e) = db.delete_workspace(&name) {
            warn!("failed to delete persisted workspace: {e}");
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn get_muxes(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    match state.workspaces.get(&name) {
        Some(ws) => Json(ws.mux_rules).into_response(),
        None => workspace_error(WorkspaceError::NotFound(name)),
    }
}

async fn set_muxes(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(rules): Json<Vec<MuxRule>>,
) -> Response {
    if let Err(e) = state.workspaces.set_mux_rules(&name, rules) {
        return workspace_error(e);
    }
    state.persist_workspace(&name);
    Json(state.workspaces.get(&name).map(|ws| ws.mux_rules)).into_response()
}

async fn activate_workspace(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(ws) = state.workspaces.get(&name) else {
        return workspace_error(WorkspaceError::NotFound(name));
    };
    if ws.state != WorkspaceState::Active {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "cannot activate an archived workspace"})),
        )
            .into_response();
    }
    let session = state.sessions.activate_workspace(&ws.id);
    state.persist_session();
    Json(session).into_response()
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_prompts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let Some(db) = &state.db else {
        return Json(json!([])).into_response();
    };
    match db.list_prompts(query.limit) {
        Ok(prompts) => Json(prompts).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn list_alerts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let Some(db) = &state.db else {
        return Json(json!([])).into_response();
    };
    match db.list_alerts(query.limit) {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_state() -> Arc<ApiState> {
        Arc::new(ApiState {
            workspaces: Arc::new(WorkspaceRegistry::new()),
            endpoints: Arc::new(EndpointRegistry::new()),
            sessions: Arc::new(SessionRegistry::new("default-id")),
            db: Some(Arc::new(Db::open_in_memory().unwrap())),
            stats: Stats::new(),
        })
    }

    #[test]
    fn router_builds() {
        let _ = router(api_state());
    }

    #[tokio::test]
    async fn default_workspace_archive_maps_to_400() {
        let state = api_state();
        let response = archive_workspace(State(state), Path("default".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn workspace_lifecycle_over_handlers() {
        let state = api_state();
        let created = create_workspace(
            State(state.clone()),
            Json(CreateWorkspaceBody {
                name: "w1".into(),
                custom_instructions: None,
            }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);

        let dup = create_workspace(
            State(state.clone()),
            Json(CreateWorkspaceBody {
                name: "w1".into(),
                custom_instructions: None,
            }),
        )
        .await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let archived = archive_workspace(State(state.clone()), Path("w1".to_string())).await;
        assert_eq!(archived.status(), StatusCode::NO_CONTENT);

        let recovered = recover_workspace(State(state.clone()), Path("w1".to_string())).await;
        assert_eq!(recovered.status(), StatusCode::NO_CONTENT);

        // Hard delete requires the workspace to be archived again.
        archive_workspace(State(state.clone()), Path("w1".to_string())).await;
        let deleted = hard_delete_workspace(State(state.clone()), Path("w1".to_string())).await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        assert!(state.workspaces.get("w1").is_none());
    }

    #[tokio::test]
    async fn activation_updates_session() {
        let state = api_state();
        create_workspace(
            State(state.clone()),
            Json(CreateWorkspaceBody {
                name: "w1".into(),
                custom_instructions: None,
            }),
        )
        .await;
        let response = activate_workspace(State(state.clone()), Path("w1".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let ws = state.workspaces.get("w1").unwrap();
        assert_eq!(state.sessions.current().active_workspace_id, ws.id);
    }
}
