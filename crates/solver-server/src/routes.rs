use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use solver_core::scheduler::{RunController, RunError};
use solver_core::tracker::TrackerError;
use solver_core::RunTrigger;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn tracker_status(e: &TrackerError) -> StatusCode {
    match e {
        TrackerError::Unauthorized => StatusCode::UNAUTHORIZED,
        TrackerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    }
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct StartBody {
    pub project_slug: String,
    pub work_directory: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ProjectBody {
    pub project_slug: String,
}

#[derive(Deserialize)]
pub(crate) struct ProjectQuery {
    pub project: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct SessionsQuery {
    pub project: Option<String>,
    pub limit: Option<i64>,
}

// ── Settings groups ───────────────────────────────────────────────────────

pub(crate) const GIT_KEYS: &[&str] = &[
    "git_default_branch",
    "git_remote",
    "git_branch_prefix",
    "git_include_issue_id",
    "git_include_timestamp",
    "git_pull_before_fix",
    "git_auto_push",
    "git_author_name",
    "git_author_email",
    "commit_message_prefix",
    "commit_message_format",
];

pub(crate) const FILTER_KEYS: &[&str] = &[
    "issue_min_severity",
    "issue_environments",
    "issue_min_occurrences",
    "issue_max_age_days",
    "max_issues_per_run",
    "check_interval_minutes",
    "apply_threshold",
    "resolve_threshold",
    "max_apply_attempts",
];

/// Stored settings are strings; hand them back typed.
pub(crate) fn typed(s: &str) -> Value {
    if let Ok(b) = s.parse::<bool>() {
        return json!(b);
    }
    if let Ok(n) = s.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    json!(s)
}

fn settings_group(state: &AppState, keys: &[&str]) -> Value {
    let current = state.config.load_from_db(&state.db);
    let obj: serde_json::Map<String, Value> = current
        .runtime_entries()
        .into_iter()
        .filter(|(k, _)| keys.contains(k))
        .map(|(k, v)| (k.to_string(), typed(&v)))
        .collect();
    Value::Object(obj)
}

fn put_group(state: &AppState, keys: &[&str], body: &Value) -> Result<usize, StatusCode> {
    let map = body.as_object().ok_or(StatusCode::BAD_REQUEST)?;
    let mut updated = 0usize;
    for (key, val) in map {
        if !keys.contains(&key.as_str()) {
            continue;
        }
        let s = match val {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        state.db.set_config(key, &s).map_err(internal)?;
        updated += 1;
    }
    if updated > 0 {
        info!("updated {updated} settings, effective from the next run");
    }
    Ok(updated)
}

fn project_or_default(state: &AppState, project: Option<String>) -> Result<String, StatusCode> {
    project
        .filter(|p| !p.is_empty())
        .or_else(|| Some(state.config.sentry_project.clone()).filter(|p| !p.is_empty()))
        .ok_or(StatusCode::BAD_REQUEST)
}

fn controller(state: &AppState, project: &str) -> Result<Arc<RunController>, StatusCode> {
    state.registry.get(project).ok_or(StatusCode::NOT_FOUND)
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

pub(crate) async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let projects = state.sentry.list_projects().await.map_err(|e| {
        tracing::warn!("listing sentry projects failed: {e}");
        tracker_status(&e)
    })?;
    Ok(Json(json!(projects)))
}

// Solver control

pub(crate) async fn solver_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBody>,
) -> Result<Json<Value>, StatusCode> {
    if body.project_slug.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let c = state
        .registry
        .get_or_create(&body.project_slug, body.work_directory.as_deref());
    let started = c.start();
    Ok(Json(json!({ "started": started, "status": c.status() })))
}

pub(crate) async fn solver_stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProjectBody>,
) -> Result<Json<Value>, StatusCode> {
    let c = controller(&state, &body.project_slug)?;
    c.stop();
    Ok(Json(json!({ "stopped": true, "status": c.status() })))
}

pub(crate) async fn solver_run_once(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProjectBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.project_slug.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "project_slug is required" })),
        ));
    }
    let c = state.registry.get_or_create(&body.project_slug, None);
    match c.run_cycle(RunTrigger::Manual).await {
        Ok(session) => Ok(Json(json!(session))),
        Err(RunError::Busy) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": RunError::Busy.to_string() })),
        )),
        Err(e) => Err((
            internal(format!("{e:#}")),
            Json(json!({ "error": "run failed, see logs" })),
        )),
    }
}

pub(crate) async fn solver_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectQuery>,
) -> Result<Json<Value>, StatusCode> {
    match q.project.filter(|p| !p.is_empty()) {
        Some(project) => Ok(Json(json!(controller(&state, &project)?.status()))),
        None => {
            let all: Vec<_> = state.registry.all().iter().map(|c| c.status()).collect();
            Ok(Json(json!(all)))
        }
    }
}

// Records

pub(crate) async fn list_issues(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectQuery>,
) -> Result<Json<Value>, StatusCode> {
    let project = project_or_default(&state, q.project)?;
    let records = state.db.list_records(&project).map_err(internal)?;
    let counts: serde_json::Map<String, Value> = state
        .db
        .record_counts(&project)
        .map_err(internal)?
        .into_iter()
        .map(|(k, n)| (k, json!(n)))
        .collect();
    Ok(Json(json!({ "project": project, "counts": counts, "records": records })))
}

pub(crate) async fn list_issue_fixes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<ProjectQuery>,
) -> Result<Json<Value>, StatusCode> {
    let project = project_or_default(&state, q.project)?;
    let record = state.db.get_record(&project, &id).map_err(internal)?;
    let fixes = state.db.list_fixes(&project, &id).map_err(internal)?;
    if record.is_none() && fixes.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "record": record, "fixes": fixes })))
}

pub(crate) async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let project = project_or_default(&state, q.project)?;
    let limit = q.limit.unwrap_or(20).clamp(1, 500);
    let sessions = state.db.list_sessions(&project, limit).map_err(internal)?;
    Ok(Json(json!(sessions)))
}

// Settings

pub(crate) async fn get_git_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(settings_group(&state, GIT_KEYS))
}

pub(crate) async fn put_git_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let updated = put_group(&state, GIT_KEYS, &body)?;
    Ok(Json(json!({ "updated": updated, "settings": settings_group(&state, GIT_KEYS) })))
}

pub(crate) async fn get_filter_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(settings_group(&state, FILTER_KEYS))
}

pub(crate) async fn put_filter_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let updated = put_group(&state, FILTER_KEYS, &body)?;
    Ok(Json(json!({ "updated": updated, "settings": settings_group(&state, FILTER_KEYS) })))
}

// Logs

pub(crate) async fn recent_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let lines: Vec<Value> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    Json(json!(lines))
}

// SSE logs: replays ring buffer history then streams live events

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_strings_come_back_typed() {
        assert_eq!(typed("true"), json!(true));
        assert_eq!(typed("30"), json!(30));
        assert_eq!(typed("0.6"), json!(0.6));
        assert_eq!(typed("production,staging"), json!("production,staging"));
        assert_eq!(typed("NaN"), json!("NaN"));
    }

    #[test]
    fn groups_do_not_expose_secrets() {
        for key in GIT_KEYS.iter().chain(FILTER_KEYS) {
            assert!(!key.contains("token"));
        }
    }

    #[test]
    fn tracker_errors_map_to_statuses() {
        assert_eq!(tracker_status(&TrackerError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            tracker_status(&TrackerError::Transport("x".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}
