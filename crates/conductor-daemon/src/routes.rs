//! Axum router and all HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Form, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conductor_backend::ConductorError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status/", get(get_status).post(post_status))
        .route("/query/", post(post_query))
        .route("/poolsize/", post(post_poolsize))
        .route("/healthz", get(healthz))
        .fallback(serve_static)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /healthz
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok\n")
}

// ---------------------------------------------------------------------------
// GET /status/
// ---------------------------------------------------------------------------

async fn get_status(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let (_, _, snapshot) = st.backend.status(None, 0).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        snapshot.text,
    )
}

// ---------------------------------------------------------------------------
// POST /status/
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StatusForm {
    id: Option<String>,
    seen: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    seen: u64,
    status: serde_json::Value,
}

async fn post_status(State(st): State<Arc<AppState>>, Form(form): Form<StatusForm>) -> impl IntoResponse {
    let seen = form.seen.unwrap_or(0);
    let (id, generation, snapshot) = st.backend.status(form.id.as_deref(), seen).await;
    (
        StatusCode::OK,
        Json(StatusResponse {
            id,
            seen: generation,
            status: json!({ "stats": snapshot.stats, "text": snapshot.text }),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /query/
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QueryForm {
    query: Option<String>,
}

async fn post_query(State(st): State<Arc<AppState>>, Form(form): Form<QueryForm>) -> Response {
    let query = match form.query.filter(|q| !q.is_empty()) {
        Some(q) => q,
        None => return client_error(400, "Must provide query"),
    };

    match st.backend.execute_query(&query).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "query": result.query,
                "advice": result.advice,
                "ip": result.ip,
                "url": result.url,
                "rows": result.rows,
            })),
        )
            .into_response(),
        Err(err) => conductor_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// POST /poolsize/
// ---------------------------------------------------------------------------

async fn post_poolsize(State(st): State<Arc<AppState>>, Form(sizes): Form<HashMap<String, String>>) -> Response {
    for (poolname, size) in &sizes {
        let size: i64 = match size.parse() {
            Ok(n) => n,
            Err(_) => return client_error(400, &format!("Can't parse size {size}")),
        };
        if let Err(err) = st.backend.set_pool_size(poolname, size) {
            return conductor_error_response(err);
        }
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "OK\n").into_response()
}

// ---------------------------------------------------------------------------
// Static file fallback
// ---------------------------------------------------------------------------

async fn serve_static(State(st): State<Arc<AppState>>, method: axum::http::Method, uri: axum::http::Uri) -> Response {
    if method != axum::http::Method::GET {
        return client_error(404, &format!("No such endpoint: {}", uri.path()));
    }
    let path_component = uri.path().trim_start_matches('/');

    let mut path = st.static_dir.clone();
    for part in path_component.split('/') {
        if part == "." || part == ".." {
            return client_error(400, "invalid path");
        }
        path.push(part);
    }
    if path_component.is_empty() || path_component.ends_with('/') {
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = guess_content_type(&path);
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], Bytes::from(bytes)).into_response()
        }
        Err(_) => client_error(404, &format!("No such file: {}", path.display())),
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "text/plain; charset=utf-8",
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn client_error(code: u16, msg: &str) -> Response {
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST),
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{msg}\n"),
    )
        .into_response()
}

fn conductor_error_response(err: ConductorError) -> Response {
    let code = err.status_code();
    tracing::error!(%err, code, "request failed");
    client_error(code, &err.to_string())
}
