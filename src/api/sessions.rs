//! Session listing and lifecycle endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    Json,
};

use crate::error::Result;
use crate::host::HostId;
use crate::orchestrator::{CreateSpec, PaneKind};
use crate::registry::{PermissionMode, Room, RoomConfigPatch, RoomId};

use super::routes::AppState;
use super::types::*;

async fn session_info(state: &AppState, room: &Room) -> SessionInfo {
    let key = room.id.canonical();
    SessionInfo {
        name: key.clone(),
        path: room.path.to_string_lossy().to_string(),
        voice: room.voice.clone(),
        machine: room.id.host.machine().to_string(),
        bypass_permissions: room.mode == PermissionMode::Bypass,
        restricted: room.mode == PermissionMode::Restricted,
        activity: state.hub.activity_state(&key).await,
        branch: room.id.branch.clone(),
    }
}

/// GET /api/sessions - Sessions grouped by host, freshly reconciled.
pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<SessionsResponse>> {
    for host in state.registry.known_hosts() {
        // Coalesced: list storms reconcile at most once per window.
        if let Err(e) = state.registry.reconcile(&host, false).await {
            tracing::debug!("reconcile of {} during listing failed: {}", host, e);
        }
    }

    let mut local = Vec::new();
    let mut by_machine: Vec<MachineSessions> = state
        .config
        .machines
        .keys()
        .map(|id| MachineSessions {
            id: id.clone(),
            session_count: 0,
            sessions: Vec::new(),
        })
        .collect();
    by_machine.sort_by(|a, b| a.id.cmp(&b.id));

    for room in state.registry.list().await {
        let info = session_info(&state, &room).await;
        match &room.id.host {
            HostId::Local => local.push(info),
            HostId::Remote(machine) => {
                if let Some(entry) = by_machine.iter_mut().find(|m| &m.id == machine) {
                    entry.sessions.push(info);
                    entry.session_count += 1;
                }
            }
        }
    }

    Ok(Json(SessionsResponse {
        local: HostSessions { sessions: local },
        machines: by_machine,
    }))
}

/// Assemble the canonical id from a create request.
fn canonical_from_request(req: &CreateSessionRequest) -> Result<RoomId> {
    let mut name = req.name.clone();
    if req.worktree {
        if let Some(branch) = &req.branch {
            if !name.contains('/') {
                name = format!("{}/{}", name, branch);
            }
        }
    }
    if let Some(machine) = &req.machine {
        if machine != "local" && !name.contains('@') {
            name = format!("{}@{}", name, machine);
        }
    }
    RoomId::parse(&name)
}

/// POST /api/create - Create a session (optionally worktree-backed).
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>> {
    let id = canonical_from_request(&req)?;

    let mut roles = req.roles.clone();
    if let Some(template) = &req.template {
        if !roles.contains(template) {
            roles.insert(0, template.clone());
        }
    }

    let mut spec = CreateSpec::new(id.clone());
    spec.path = req.path.as_ref().map(PathBuf::from);
    spec.mode = PermissionMode::from_flags(req.bypass_permissions, req.restricted);
    spec.voice = req.voice.clone();
    spec.roles = roles;

    let room = state.orchestrator.create(spec).await?;
    tracing::info!("created session '{}'", room.id);

    Ok(Json(CreateSessionResponse {
        success: true,
        name: room.id.canonical(),
        path: room.path.to_string_lossy().to_string(),
        branch: room.id.branch.clone(),
        machine: room.id.host.machine().to_string(),
    }))
}

/// DELETE /api/sessions/{name} - Kill a session and its worktree.
pub async fn destroy(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<SuccessResponse>> {
    let id = RoomId::parse(&name)?;
    let key = id.canonical();
    state.orchestrator.kill(&key).await?;
    tracing::info!("killed session '{}'", key);
    Ok(Json(SuccessResponse::with_message(format!(
        "session '{}' killed",
        key
    ))))
}

/// POST /api/session/{name}/recreate - Kill and re-create in place.
pub async fn recreate(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<CreateSessionResponse>> {
    let id = RoomId::parse(&name)?;
    let room = state.orchestrator.recreate(&id.canonical()).await?;
    Ok(Json(CreateSessionResponse {
        success: true,
        name: room.id.canonical(),
        path: room.path.to_string_lossy().to_string(),
        branch: room.id.branch.clone(),
        machine: room.id.host.machine().to_string(),
    }))
}

/// POST /api/session/{name}/fork - Copy conversation state into a new session.
pub async fn fork(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<ForkRequest>,
) -> Result<Json<CreateSessionResponse>> {
    let source = RoomId::parse(&name)?.canonical();
    let target = RoomId::parse(&req.target)?;
    let room = state.orchestrator.fork(&source, target).await?;
    Ok(Json(CreateSessionResponse {
        success: true,
        name: room.id.canonical(),
        path: room.path.to_string_lossy().to_string(),
        branch: room.id.branch.clone(),
        machine: room.id.host.machine().to_string(),
    }))
}

/// POST /api/session/{name}/spawn-sibling - Add a worker pane.
pub async fn spawn_sibling(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<SpawnSiblingRequest>,
) -> Result<Json<SpawnSiblingResponse>> {
    let id = RoomId::parse(&name)?;
    let kind = match req.kind.as_deref() {
        Some(raw) => PaneKind::parse(raw)?,
        None => PaneKind::Worker,
    };
    let pane = state
        .orchestrator
        .spawn_pane(&id.canonical(), kind, req.branch.as_deref())
        .await?;
    Ok(Json(SpawnSiblingResponse { success: true, pane }))
}

/// POST /api/session/{name}/restart-service - Bounce the speech-service
/// forwards for the session's machine.
pub async fn restart_service(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<SuccessResponse>> {
    let id = RoomId::parse(&name)?;
    let machine = id.host.machine().to_string();
    let restarted = state.tunnels.restart_for_machine(&machine).await;
    Ok(Json(SuccessResponse::with_message(format!(
        "restarted {} forward(s) for {}",
        restarted, machine
    ))))
}

/// POST /api/session/{name}/config - Update per-room settings.
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(patch): Json<RoomConfigPatch>,
) -> Result<Json<SuccessResponse>> {
    let id = RoomId::parse(&name)?;
    state.registry.update_config(&id.canonical(), patch).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// GET /api/check-path - Is this a git repository, and on which branch?
pub async fn check_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckPathQuery>,
) -> Result<Json<CheckPathResponse>> {
    let host = HostId::parse(query.machine.as_deref().unwrap_or("local"));
    let (is_git, current_branch) = state.orchestrator.check_path(&host, &query.path).await?;
    Ok(Json(CheckPathResponse {
        is_git,
        current_branch,
    }))
}

/// GET /api/check-branches - Branches matching a prefix.
pub async fn check_branches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckBranchesQuery>,
) -> Result<Json<CheckBranchesResponse>> {
    let host = HostId::parse(query.machine.as_deref().unwrap_or("local"));
    let existing = state
        .orchestrator
        .check_branches(&host, &query.path, &query.prefix)
        .await?;
    Ok(Json(CheckBranchesResponse { existing }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortalError;

    fn base_request() -> CreateSessionRequest {
        CreateSessionRequest {
            name: "api".to_string(),
            path: None,
            voice: None,
            machine: None,
            worktree: false,
            branch: None,
            bypass_permissions: false,
            restricted: false,
            template: None,
            roles: Vec::new(),
        }
    }

    #[test]
    fn canonical_assembly_plain() {
        let id = canonical_from_request(&base_request()).unwrap();
        assert_eq!(id.canonical(), "api");
    }

    #[test]
    fn canonical_assembly_worktree_and_machine() {
        let mut req = base_request();
        req.worktree = true;
        req.branch = Some("feat".to_string());
        req.machine = Some("gpu1".to_string());
        let id = canonical_from_request(&req).unwrap();
        assert_eq!(id.canonical(), "api/feat@gpu1");
    }

    #[test]
    fn canonical_assembly_rejects_junk() {
        let mut req = base_request();
        req.name = "bad name".to_string();
        assert!(matches!(
            canonical_from_request(&req),
            Err(PortalError::BadName(_))
        ));
    }

    #[test]
    fn explicit_local_machine_is_elided() {
        let mut req = base_request();
        req.machine = Some("local".to_string());
        let id = canonical_from_request(&req).unwrap();
        assert_eq!(id.canonical(), "api");
    }
}
