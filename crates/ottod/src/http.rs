//! HTTP facade.
//!
//! Read-only core surface plus the HITL decision endpoint and the webhook
//! trigger receiver:
//!
//! - `GET  /metrics`
//! - `GET  /runs/{public_id}`
//! - `GET  /runs/{run_id}/policy-checks`
//! - `GET  /runs/{run_id}/deviations`
//! - `POST /hitl/{run_id}`
//! - `POST /hooks/{schedule_id}`

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use otto_common::plan::Plan;
use otto_common::run::Run;
use otto_common::services::{Services, SubmitError};
use otto_common::triggers::{WebhookReject, WebhookValidator};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub struct AppState {
    pub services: Arc<Services>,
    /// One validator per webhook-triggered schedule id.
    pub hooks: Mutex<HashMap<String, (WebhookValidator, String)>>,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let mut hooks = HashMap::new();
        for schedule in &services.config.schedules {
            if let Some(webhook) = &schedule.webhook {
                let secret = resolve_hook_secret(&services, &webhook.secret);
                hooks.insert(
                    schedule.id.clone(),
                    (
                        WebhookValidator::new(secret.as_bytes(), webhook.replay_window_secs),
                        schedule.template.clone(),
                    ),
                );
            }
        }
        Arc::new(Self {
            services,
            hooks: Mutex::new(hooks),
        })
    }
}

fn resolve_hook_secret(services: &Services, spec: &str) -> String {
    if let Some(rest) = spec.strip_prefix("secrets://") {
        let (service, key) = match rest.split_once('/') {
            Some((s, k)) => (Some(s), k),
            None => (None, rest),
        };
        let mut masker = otto_common::secrets::Masker::default();
        if let Ok(secret) = services.secrets.resolve(service, key, &mut masker) {
            return secret.expose().to_string();
        }
        tracing::warn!("webhook secret '{spec}' could not be resolved");
    }
    spec.to_string()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/runs/:id", get(run_by_public_id))
        .route("/runs/:id/policy-checks", get(policy_checks))
        .route("/runs/:id/deviations", get(deviations))
        .route("/hitl/:id", post(hitl))
        .route("/hooks/:id", post(hook))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn internal(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let services = &state.services;
    match otto_common::metrics::snapshot(
        &services.store,
        services.scheduler.depth_peak(),
        chrono::Utc::now(),
    ) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => internal(e),
    }
}

/// External view of a run: masked, no internal ids or plan paths.
fn public_view(run: &Run) -> serde_json::Value {
    json!({
        "public_id": run.public_id,
        "plan_name": run.plan_name,
        "state": run.state,
        "queue": run.queue,
        "priority": run.priority,
        "created_at": run.created_at,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "risk_flags": run.manifest.risk_flags,
        "steps": run.step_results.iter().map(|s| json!({
            "index": s.step_index,
            "status": s.status,
            "duration_ms": s.duration_ms,
            "error": s.error.as_ref().map(|e| e.code.as_str()),
        })).collect::<Vec<_>>(),
    })
}

async fn run_by_public_id(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Response {
    match state.services.store.get_run_by_public_id(&public_id) {
        Ok(Some(run)) => Json(public_view(&run)).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal(e),
    }
}

async fn policy_checks(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<i64>,
) -> Response {
    match state.services.store.policy_decisions(run_id) {
        Ok(decisions) if !decisions.is_empty() => Json(decisions).into_response(),
        Ok(_) => not_found(),
        Err(e) => internal(e),
    }
}

async fn deviations(State(state): State<Arc<AppState>>, Path(run_id): Path<i64>) -> Response {
    match state.services.store.deviations(run_id) {
        Ok(devs) => Json(devs).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
struct HitlBody {
    decision: String,
    #[serde(default)]
    approver_role: Option<String>,
}

async fn hitl(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<i64>,
    Json(body): Json<HitlBody>,
) -> Response {
    let approve = match body.decision.as_str() {
        "approve" => true,
        "deny" => false,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unknown decision '{other}'")})),
            )
                .into_response()
        }
    };
    let services = &state.services;
    if let Err(e) = services.decide_hitl(run_id, approve, body.approver_role.as_deref()) {
        return (StatusCode::CONFLICT, Json(json!({"error": e.to_string()}))).into_response();
    }
    // Resume through the queue so worker concurrency rules still apply.
    match services.store.get_run(run_id) {
        Ok(Some(run)) => {
            if let Err(e) = services.scheduler.enqueue(&run.queue, run_id, run.priority) {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": e.code.as_str()})),
                )
                    .into_response();
            }
            Json(json!({"run_id": run_id, "decision": body.decision})).into_response()
        }
        Ok(None) => not_found(),
        Err(e) => internal(e),
    }
}

async fn hook(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let event_id = headers
        .get("x-event-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let template = {
        let mut hooks = state.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let Some((validator, template)) = hooks.get_mut(&schedule_id) else {
            return not_found();
        };
        match validator.validate(&body, &signature, &event_id, chrono::Utc::now()) {
            Ok(()) => template.clone(),
            Err(WebhookReject::BadSignature) => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "bad signature"})),
                )
                    .into_response()
            }
            Err(WebhookReject::DuplicateEvent) => {
                // At-least-once delivery: duplicates acknowledge silently.
                return Json(json!({"deduplicated": true})).into_response();
            }
        }
    };

    let services = state.services.clone();
    let plan = match Plan::from_file(std::path::Path::new(&template)) {
        Ok(p) => p,
        Err(e) => return internal(e),
    };
    let mut variables = BTreeMap::new();
    variables.insert("webhook_event_id".to_string(), json!(event_id));
    match services.submit(plan, &format!("webhook:{schedule_id}"), variables) {
        Ok(submission) => Json(json!({
            "run_id": submission.run.run_id,
            "public_id": submission.run.public_id,
            "enqueued": submission.enqueued,
        }))
        .into_response(),
        Err(SubmitError::QueueFull(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "QUEUE_FULL"})),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_common::config::ConfigSet;
    use otto_common::testutil::{FakeOsAdapter, FakeWebEngine};
    use tower::util::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let config = ConfigSet::defaults_at(dir.path());
        let services = Arc::new(
            Services::new(
                config,
                Arc::new(FakeOsAdapter::new()),
                Arc::new(FakeWebEngine::default()),
            )
            .unwrap(),
        );
        AppState::new(services)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let (status, body) = get_json(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("window_24h").is_some());
        assert!(body.get("failure_clusters").is_some());
    }

    #[tokio::test]
    async fn test_run_view_is_masked_by_public_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let plan = Plan::from_yaml_str(
            "dsl_version: \"1.1\"\nname: web\nsteps:\n  - policy_guard:\n",
        )
        .unwrap();
        let submission = state
            .services
            .submit(plan, "plans/private-path.yaml", BTreeMap::new())
            .unwrap();
        let uri = format!("/runs/{}", submission.run.public_id);
        let (status, body) = get_json(router(state), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["public_id"], submission.run.public_id);
        // The internal plan path must not leak through the public view.
        assert!(body.get("plan_ref").is_none());
        assert!(!body.to_string().contains("private-path"));
    }

    #[tokio::test]
    async fn test_policy_checks_endpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let plan = Plan::from_yaml_str(
            "dsl_version: \"1.1\"\nname: p\nsteps:\n  - policy_guard:\n",
        )
        .unwrap();
        let submission = state.services.submit(plan, "inline", BTreeMap::new()).unwrap();
        let uri = format!("/runs/{}/policy-checks", submission.run.run_id);
        let (status, body) = get_json(router(state), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_404s() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let (status, _) = get_json(router(state), "/runs/no-such-id").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
