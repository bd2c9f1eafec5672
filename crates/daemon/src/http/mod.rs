// Local HTTP surface: message intake, listing, push, and target status.

pub mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, rejection::QueryRejection, DefaultBodyLimit, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chatlog_common::protocol::http::{
    CreateMessageRequest, ListMessagesQuery, MessageEnvelope, MessagesPage, PushStatus,
    TargetStatus, TargetsEnvelope,
};
use chatlog_common::types::MAX_CONTENT_BYTES;
use tower_http::cors::CorsLayer;
use tracing::info;

use self::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope, ApiError,
    ErrorCode,
};
use crate::sync::{SweepTrigger, SyncEngine, SyncMode, TargetRecord, TargetSpec};

/// JSON framing on top of the largest accepted message.
const MAX_REQUEST_BODY_BYTES: usize = MAX_CONTENT_BYTES * 2;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    /// Present when a background scheduler is running.
    pub trigger: Option<SweepTrigger>,
    pub sync_on_append: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/messages", post(create_message).get(list_messages))
        .route("/push", post(push))
        .route("/targets", get(list_targets))
        .route("/targets/{name}/resume", post(resume_target))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(CorsLayer::permissive())
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn create_message(
    State(state): State<AppState>,
    payload: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageEnvelope>), ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let message = state.engine.store().append(&request.content)?;
    info!(message_id = message.id, bytes = message.content.len(), "message accepted");

    if state.sync_on_append {
        if let Some(trigger) = &state.trigger {
            trigger.request_sweep();
        }
    }
    Ok((StatusCode::CREATED, Json(MessageEnvelope { status: PushStatus::Success, message })))
}

async fn list_messages(
    State(state): State<AppState>,
    query: Result<Query<ListMessagesQuery>, QueryRejection>,
) -> Result<Json<MessagesPage>, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let messages = state.engine.store().list(query.since)?;
    Ok(Json(MessagesPage { messages }))
}

async fn push(State(state): State<AppState>) -> Response {
    let report = state.engine.sweep(SyncMode::OnDemand).await;
    let status = match report.status {
        PushStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
        PushStatus::Success | PushStatus::Partial => StatusCode::OK,
    };
    (status, Json(report.to_response())).into_response()
}

async fn list_targets(State(state): State<AppState>) -> Result<Json<TargetsEnvelope>, ApiError> {
    // One read for every row; rows for targets no longer configured are left out.
    let mut records: HashMap<String, TargetRecord> = state
        .engine
        .store()
        .target_records()?
        .into_iter()
        .map(|record| (record.spec.name.clone(), record))
        .collect();

    let targets = state
        .engine
        .targets()
        .iter()
        .map(|spec| {
            let record = records.remove(&spec.name).ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InternalError,
                    format!("configured target `{}` is not registered", spec.name),
                )
            })?;
            target_status(&state, spec, record)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(TargetsEnvelope { targets }))
}

async fn resume_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TargetStatus>, ApiError> {
    let Some(spec) = state.engine.target(&name) else {
        return Err(ApiError::not_found(format!("unknown target `{name}`")));
    };
    state.engine.store().resume(&name)?;
    info!(target_name = %name, "target resumed by operator");

    if let Some(trigger) = &state.trigger {
        trigger.request_sweep();
    }
    let record = state.engine.store().target_record(&name)?;
    Ok(Json(target_status(&state, spec, record)?))
}

fn target_status(
    state: &AppState,
    spec: &TargetSpec,
    record: TargetRecord,
) -> Result<TargetStatus, ApiError> {
    let pending = state.engine.store().pending_count(&spec.name)?;
    let threshold = state.engine.settings().unhealthy_threshold;
    let health = record.health;

    Ok(TargetStatus {
        name: spec.name.clone(),
        owner: spec.owner.clone(),
        repo: spec.repo.clone(),
        branch: spec.branch.clone(),
        path_prefix: spec.path_prefix.clone(),
        cursor: record.cursor,
        healthy: health.is_healthy(threshold),
        suspended: health.suspended,
        suspended_reason: health.suspended_reason,
        consecutive_failures: health.consecutive_failures,
        pending,
        last_attempt_at: health.last_attempt_at,
        last_success_at: health.last_success_at,
        last_error: health.last_error,
    })
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use axum::body::to_bytes;
    use axum::http::Method;
    use chatlog_common::protocol::http::PushResponse;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::store::MessageStore;
    use crate::sync::{CommitError, CommitReceipt, CommitRequest, RemoteRepositoryClient, SyncSettings};

    /// Succeeds for every target except those named in `rejects`.
    struct FakeRemote {
        rejects: Vec<String>,
    }

    impl RemoteRepositoryClient for FakeRemote {
        fn commit(
            &self,
            target: &TargetSpec,
            request: CommitRequest,
        ) -> Pin<Box<dyn Future<Output = Result<CommitReceipt, CommitError>> + Send>> {
            let result = if self.rejects.contains(&target.name) {
                Err(CommitError::Auth { reason: "401 Unauthorized: Bad credentials".into() })
            } else {
                Ok(CommitReceipt::single(format!("sha-{}", &request.idempotency_key[..8])))
            };
            Box::pin(async move { result })
        }
    }

    fn spec(name: &str) -> TargetSpec {
        TargetSpec {
            name: name.into(),
            owner: "octo".into(),
            repo: format!("{name}-log"),
            branch: "main".into(),
            path_prefix: "messages".into(),
        }
    }

    fn app_with(targets: &[&str], rejects: &[&str]) -> Router {
        app_on(Arc::new(MessageStore::open_in_memory().unwrap()), targets, rejects)
    }

    fn app_on(store: Arc<MessageStore>, targets: &[&str], rejects: &[&str]) -> Router {
        let client = Arc::new(FakeRemote { rejects: rejects.iter().map(|s| s.to_string()).collect() });
        let engine = SyncEngine::new(
            store,
            client,
            targets.iter().map(|t| spec(t)).collect(),
            SyncSettings::default(),
        )
        .unwrap();
        router(AppState { engine: Arc::new(engine), trigger: None, sync_on_append: true })
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn healthz_has_request_id_header() {
        let app = app_with(&["a"], &[]);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let app = app_with(&["a"], &[]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/messages")
                    .header("x-request-id", "trace-me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "trace-me");
    }

    #[tokio::test]
    async fn create_message_returns_created_with_pending_deliveries() {
        let app = app_with(&["a", "b"], &[]);
        let (status, body) =
            send(&app, Method::POST, "/messages", Some(json!({ "content": "hello" }))).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"]["content"], "hello");
        assert_eq!(body["message"]["deliveries"]["a"]["state"], "pending");
        assert_eq!(body["message"]["deliveries"]["b"]["state"], "pending");
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let app = app_with(&["a"], &[]);
        let (status, body) = send(&app, Method::POST, "/messages", Some(json!({ "content": "  " }))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "VALIDATION_FAILED");

        let (_, listing) = send(&app, Method::GET, "/messages", None).await;
        assert_eq!(listing["messages"], json!([]));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let app = app_with(&["a"], &[]);
        let content = "x".repeat(MAX_CONTENT_BYTES + 1);
        let (status, body) = send(&app, Method::POST, "/messages", Some(json!({ "content": content }))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");
        assert!(body["message"].as_str().unwrap().contains("65536"));

        let at_limit = "x".repeat(MAX_CONTENT_BYTES);
        let (status, _) = send(&app, Method::POST, "/messages", Some(json!({ "content": at_limit }))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn malformed_body_is_a_validation_error() {
        let app = app_with(&["a"], &[]);
        let (status, body) = send(&app, Method::POST, "/messages", Some(json!({ "text": "wrong field" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn list_honours_since() {
        let app = app_with(&["a"], &[]);
        for content in ["one", "two", "three"] {
            send(&app, Method::POST, "/messages", Some(json!({ "content": content }))).await;
        }

        let (status, body) = send(&app, Method::GET, "/messages?since=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<_> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["two", "three"]);

        let (status, _) = send(&app, Method::GET, "/messages?since=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_commits_and_annotates_messages() {
        let app = app_with(&["a"], &[]);
        send(&app, Method::POST, "/messages", Some(json!({ "content": "hello" }))).await;

        let (status, body) = send(&app, Method::POST, "/push", None).await;
        assert_eq!(status, StatusCode::OK);
        let response: PushResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.status, PushStatus::Success);
        assert_eq!(response.results["a"].outcome, "committed");
        assert_eq!(response.results["a"].cursor, Some(1));

        let (_, listing) = send(&app, Method::GET, "/messages", None).await;
        assert_eq!(listing["messages"][0]["deliveries"]["a"]["state"], "committed");
    }

    #[tokio::test]
    async fn push_reports_partial_when_a_target_fails() {
        let app = app_with(&["a", "b"], &["b"]);
        send(&app, Method::POST, "/messages", Some(json!({ "content": "hello" }))).await;

        let (status, body) = send(&app, Method::POST, "/push", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "partial");
        assert_eq!(body["results"]["a"]["outcome"], "committed");
        assert_eq!(body["results"]["b"]["outcome"], "failed");

        let (_, targets) = send(&app, Method::GET, "/targets", None).await;
        let b = targets["targets"].as_array().unwrap().iter().find(|t| t["name"] == "b").unwrap().clone();
        assert_eq!(b["suspended"], true);
        assert_eq!(b["healthy"], false);
        assert_eq!(b["pending"], 1);
    }

    #[tokio::test]
    async fn targets_follow_configured_order_and_hide_retired_rows() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        store.register_target(&spec("retired")).unwrap();
        let app = app_on(store, &["b", "a"], &[]);
        send(&app, Method::POST, "/messages", Some(json!({ "content": "hello" }))).await;

        let (status, body) = send(&app, Method::GET, "/targets", None).await;
        assert_eq!(status, StatusCode::OK);
        let targets = body["targets"].as_array().unwrap();
        let names: Vec<_> = targets.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["b", "a"]);
        assert!(targets.iter().all(|t| t["pending"] == 1 && t["repo"].as_str().unwrap().ends_with("-log")));
    }

    #[tokio::test]
    async fn resume_clears_suspension() {
        let app = app_with(&["a"], &["a"]);
        send(&app, Method::POST, "/messages", Some(json!({ "content": "hello" }))).await;
        send(&app, Method::POST, "/push", None).await;

        let (status, body) = send(&app, Method::POST, "/targets/a/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["suspended"], false);
        assert_eq!(body["name"], "a");
    }

    #[tokio::test]
    async fn resume_unknown_target_is_not_found() {
        let app = app_with(&["a"], &[]);
        let (status, body) = send(&app, Method::POST, "/targets/ghost/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn cors_preflight_is_allowed() {
        let app = app_with(&["a"], &[]);
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/messages")
                    .header("origin", "http://localhost:5173")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }
}
