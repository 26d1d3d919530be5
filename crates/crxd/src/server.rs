//! HTTP server for crxd
//!
//! Serves the update manifest built from the coordinator's snapshot and the
//! cached packages it points at.

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use crx_common::config::STATUS_PATH;
use crx_common::{codebase_url, compare_versions, GUpdate};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::coordinator::Coordinator;

pub const CRX_CONTENT_TYPE: &str = "application/x-chrome-extension";

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// External base URL, no trailing slash
    pub base: String,
    /// Package path prefix, leading slash, no trailing slash
    pub prefix: String,
}

pub fn router(state: AppState, manifest_path: &str) -> Router {
    let package_route = format!("{}/:id/:file", state.prefix);

    Router::new()
        .route(manifest_path, get(manifest))
        .route(&package_route, get(package))
        .route(STATUS_PATH, get(status))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Manifest
// ============================================================================

/// Versions asked for through `x=id%3D<id>%26v%3D<version>` parameters.
///
/// `None` when the request has no `x` parameter at all.
fn requested_versions(params: &[(String, String)]) -> Option<HashMap<String, String>> {
    let mut wanted = None;
    for (key, value) in params {
        if key != "x" {
            continue;
        }
        let wanted = wanted.get_or_insert_with(HashMap::new);

        let mut id = None;
        let mut version = "0".to_string();
        for pair in value.split('&') {
            match pair.split_once('=') {
                Some(("id", v)) => id = Some(v.to_string()),
                Some(("v", v)) if !v.is_empty() => version = v.to_string(),
                _ => {}
            }
        }
        match id {
            Some(id) => {
                wanted.insert(id, version);
            }
            None => debug!("Ignoring x parameter without id: {:?}", value),
        }
    }
    wanted
}

async fn manifest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let wanted = requested_versions(&params);

    let mut doc = GUpdate::default();
    for (id, entry) in state.coordinator.snapshot() {
        if let Some(wanted) = &wanted {
            match wanted.get(&id) {
                Some(min) if compare_versions(&entry.version, min) != Ordering::Less => {}
                _ => continue,
            }
        }
        let codebase = codebase_url(&state.base, &state.prefix, &id, &entry.version);
        doc.push_entry(&entry, codebase);
    }

    match doc.to_xml() {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(e) => {
            error!("Failed to render manifest: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Packages
// ============================================================================

async fn package(
    State(state): State<Arc<AppState>>,
    Path((id, file)): Path<(String, String)>,
    request: Request,
) -> Response {
    let Some(version) = file.strip_suffix(".crx") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Only the current version is served
    let Some(entry) = state
        .coordinator
        .entry(&id)
        .filter(|entry| entry.version == version)
    else {
        debug!("No cached package {} {}", id, version);
        return StatusCode::NOT_FOUND.into_response();
    };

    let response = match ServeFile::new(&entry.path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let mut response = response.map(Body::new);
    if response.status().is_success() {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(CRX_CONTENT_TYPE),
        );
    }
    response
}

// ============================================================================
// Status
// ============================================================================

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": crx_common::VERSION,
        "extensions": state.coordinator.snapshot(),
    }))
}
