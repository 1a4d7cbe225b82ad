//! HTTP admin surface and WebSocket upgrade.
//!
//! Routes:
//! - `GET  /health`              — liveness + basic stats
//! - `GET  /api/projects`        — list projects
//! - `POST /api/projects`        — create a project
//! - `GET  /api/projects/{id}`   — project details or 404
//! - `GET  /ws/{project_id}`     — upgrade to the binary protocol

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::connection;
use crate::document::Document;
use crate::protocol::{PeerInfo, PROTOCOL_VERSION};
use crate::server::{validate_project_id, CollabServer};
use crate::storage::ProjectMeta;

pub fn router(server: Arc<CollabServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{project_id}", get(get_project))
        .route("/ws/{project_id}", get(ws_upgrade))
        .with_state(server)
        .layer(cors)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    protocol_version: u8,
    uptime_seconds: u64,
    active_projects: usize,
    active_peers: u64,
}

async fn health(State(server): State<Arc<CollabServer>>) -> impl IntoResponse {
    let stats = server.stats().await;
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        active_projects: stats.active_projects,
        active_peers: stats.active_peers,
    })
}

#[derive(Debug, Serialize)]
struct ProjectSummary {
    project_id: String,
    name: String,
    peer_count: usize,
    created_at: i64,
}

#[derive(Debug, Serialize)]
struct ProjectListResponse {
    projects: Vec<ProjectSummary>,
    total: usize,
}

async fn list_projects(State(server): State<Arc<CollabServer>>) -> impl IntoResponse {
    let metas = match server.store().list_projects() {
        Ok(metas) => metas,
        Err(e) => {
            log::error!("project listing failed: {e}");
            Vec::new()
        }
    };

    let mut projects = Vec::with_capacity(metas.len());
    for meta in metas {
        let peer_count = match server.room(&meta.project_id).await {
            Some(room) => room.peer_count(),
            None => 0,
        };
        projects.push(ProjectSummary {
            project_id: meta.project_id,
            name: meta.name,
            peer_count,
            created_at: meta.created_at,
        });
    }

    let total = projects.len();
    Json(ProjectListResponse { projects, total })
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateProjectResponse {
    project_id: String,
    name: String,
    created_at: i64,
}

async fn create_project(
    State(server): State<Arc<CollabServer>>,
    Json(payload): Json<CreateProjectRequest>,
) -> Result<Json<CreateProjectResponse>, StatusCode> {
    let project_id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let name = payload
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Project {}", &project_id[..4]));

    let meta = ProjectMeta::new(&project_id, &name);
    server.store().put_meta(&meta).map_err(|e| {
        log::error!("project metadata save failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // Open the room eagerly so the project is immediately joinable.
    server.get_or_open_room(&project_id).await.map_err(|e| {
        log::error!("room open failed for new project {project_id}: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    log::info!("created project {name} ({project_id})");
    Ok(Json(CreateProjectResponse {
        project_id: meta.project_id,
        name: meta.name,
        created_at: meta.created_at,
    }))
}

#[derive(Debug, Serialize)]
struct ProjectDetailResponse {
    project_id: String,
    name: String,
    created_at: i64,
    peers: Vec<PeerInfo>,
    file_count: usize,
    folder_count: usize,
}

async fn get_project(
    State(server): State<Arc<CollabServer>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectDetailResponse>, StatusCode> {
    let meta = server
        .store()
        .get_meta(&project_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let (peers, file_count, folder_count) = match server.room(&project_id).await {
        Some(room) => match room.details().await {
            Ok(details) => (details.peers, details.file_count, details.folder_count),
            Err(_) => (Vec::new(), 0, 0),
        },
        // Cold project: read the counts straight off the snapshot.
        None => {
            let snapshot = server
                .store()
                .load_snapshot(&project_id)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .unwrap_or_default();
            match Document::load(&meta.name, &snapshot) {
                Ok(doc) => (Vec::new(), doc.file_count(), doc.folder_count()),
                Err(_) => (Vec::new(), 0, 0),
            }
        }
    };

    Ok(Json(ProjectDetailResponse {
        project_id: meta.project_id,
        name: meta.name,
        created_at: meta.created_at,
        peers,
        file_count,
        folder_count,
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    State(server): State<Arc<CollabServer>>,
) -> Result<impl IntoResponse, StatusCode> {
    if !validate_project_id(&project_id) {
        return Err(StatusCode::BAD_REQUEST);
    }
    log::debug!("websocket upgrade for project {project_id}");
    Ok(ws.on_upgrade(move |socket| connection::serve_socket(socket, project_id, server)))
}
