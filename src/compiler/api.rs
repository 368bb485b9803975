use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;

use super::events::ProgressEmitter;
use super::models::{PreLessonKit, Stage};
use super::orchestrator::{CompileRequest, Orchestrator};
use crate::errors::CompileError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Per-run event channel capacity for streaming compiles.
    pub stream_buffer: usize,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RetryRequest {
    pub version: i64,
    pub stage: String,
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub objective_id: String,
    pub learner_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CompileError> for ApiError {
    fn from(err: CompileError) -> Self {
        let message = err.to_string();
        match err {
            CompileError::ObjectiveNotFound { .. }
            | CompileError::LessonNotFound { .. }
            | CompileError::VersionNotFound { .. } => ApiError::NotFound(message),
            CompileError::StageNotRetryable { .. } | CompileError::PersistenceConflict { .. } => {
                ApiError::Conflict(message)
            }
            CompileError::ServiceUnavailable(_) => ApiError::Unavailable(message),
            CompileError::Persistence(e) | CompileError::Other(e) => {
                ApiError::Internal(format!("{:#}", e))
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/compile", post(compile))
        .route("/api/objectives/{objective_id}/lesson", get(get_objective_lesson))
        .route("/api/lessons/{lesson_id}", get(get_current_version))
        .route("/api/lessons/{lesson_id}/retry", post(retry_stage))
        .route("/api/lessons/{lesson_id}/versions", get(list_versions))
        .route("/api/lessons/{lesson_id}/versions/{version}", get(get_version))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{session_id}", get(get_session))
        .route("/api/sessions/{session_id}/touch", post(touch_session))
        .route(
            "/api/learners/{learner_id}/kits/{objective_id}",
            put(save_kit).get(get_kit),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Synchronous compile: blocks until the run finishes and returns the
/// final document. Streaming clients use the `/api/compile/ws` socket instead.
async fn compile(
    State(state): State<SharedState>,
    Json(req): Json<CompileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.objective_id.trim().is_empty() {
        return Err(ApiError::BadRequest("objective_id is required".into()));
    }
    let outcome = state
        .orchestrator
        .compile(req, ProgressEmitter::detached())
        .await?;
    Ok(Json(outcome))
}

async fn get_objective_lesson(
    State(state): State<SharedState>,
    Path(objective_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .orchestrator
        .lesson_for_objective(&objective_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No lesson compiled for {}", objective_id)))?;
    Ok(Json(record))
}

async fn retry_stage(
    State(state): State<SharedState>,
    Path(lesson_id): Path<i64>,
    Json(req): Json<RetryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = Stage::from_str(&req.stage).map_err(ApiError::BadRequest)?;
    let outcome = state
        .orchestrator
        .retry_stage(lesson_id, req.version, stage)
        .await?;
    Ok(Json(serde_json::json!({
        "lesson_id": outcome.lesson_id,
        "version": outcome.version,
        "stage": outcome.stage,
        "status": outcome.status,
        "document": outcome.document,
    })))
}

async fn get_current_version(
    State(state): State<SharedState>,
    Path(lesson_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.orchestrator.current_version(lesson_id).await?;
    Ok(Json(current))
}

async fn list_versions(
    State(state): State<SharedState>,
    Path(lesson_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state.orchestrator.history(lesson_id).await?;
    Ok(Json(versions))
}

async fn get_version(
    State(state): State<SharedState>,
    Path((lesson_id, version)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let stored = state.orchestrator.version(lesson_id, version).await?;
    Ok(Json(stored))
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .create_session(&req.objective_id, req.learner_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .sessions()
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", session_id)))?;
    Ok(Json(session))
}

async fn touch_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .sessions()
        .touch(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", session_id)))?;
    Ok(Json(session))
}

async fn save_kit(
    State(state): State<SharedState>,
    Path((learner_id, objective_id)): Path<(String, String)>,
    Json(kit): Json<PreLessonKit>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .db()
        .call(move |db| db.save_kit(&learner_id, &objective_id, &kit))
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_kit(
    State(state): State<SharedState>,
    Path((learner_id, objective_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (learner, objective) = (learner_id.clone(), objective_id.clone());
    let kit = state
        .orchestrator
        .db()
        .call(move |db| db.get_kit(&learner, &objective))
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
        .ok_or_else(|| {
            ApiError::NotFound(format!("No kit for learner {} on {}", learner_id, objective_id))
        })?;
    Ok(Json(kit))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::compiler::db::{DbHandle, LessonDb};
    use crate::compiler::generator::scripted::ScriptedGenerator;
    use crate::compiler::graph::InMemoryGraph;
    use crate::compiler::models::Objective;
    use crate::compiler::orchestrator::OrchestratorConfig;
    use crate::compiler::session::{SessionManager, SystemClock};

    pub fn test_state(generator: Arc<ScriptedGenerator>) -> SharedState {
        let graph = Arc::new(InMemoryGraph::new());
        graph
            .add_objective(Objective {
                id: "X:1".into(),
                description: "Can order a drink at a café".into(),
                topic: "café".into(),
                level: None,
                skill: None,
            })
            .unwrap();
        let sessions = Arc::new(SessionManager::new(
            Arc::new(SystemClock),
            Duration::from_secs(7200),
            Duration::from_secs(3600),
            16,
        ));
        let orchestrator = Orchestrator::new(
            generator,
            graph,
            DbHandle::new(LessonDb::new_in_memory().unwrap()),
            sessions,
            OrchestratorConfig::default(),
        );
        Arc::new(AppState {
            orchestrator: Arc::new(orchestrator),
            stream_buffer: 64,
            keepalive: Duration::from_secs(15),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_state;
    use super::*;
    use crate::compiler::generator::Schema;
    use crate::compiler::generator::scripted::ScriptedGenerator;
    use crate::compiler::models::{CardKind, LessonDocument};
    use crate::errors::GenerationError;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator::new());
        (api_router().with_state(test_state(generator.clone())), generator)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_compile_returns_final_document() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request("POST", "/api/compile", serde_json::json!({"objective_id": "X:1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["version"], 4);
        assert_eq!(body["document"]["cards"].as_array().unwrap().len(), 9);
        assert!(body.get("kit_usage").is_none());
    }

    #[tokio::test]
    async fn test_compile_unknown_objective_is_404() {
        let (app, generator) = test_app();
        let response = app
            .oneshot(json_request("POST", "/api/compile", serde_json::json!({"objective_id": "X:2"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("X:2"));
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_compile_requires_objective_id() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request("POST", "/api/compile", serde_json::json!({"objective_id": " "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_flow_and_versions() {
        let (app, generator) = test_app();
        generator.push(
            Schema::Card(CardKind::GuidedDialogue),
            Err(GenerationError::Timeout),
        );

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/compile", serde_json::json!({"objective_id": "X:1"})))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        let lesson_id = body["lesson_id"].as_i64().unwrap();
        let version = body["version"].as_i64().unwrap();
        assert_eq!(
            body["document"]["metadata"]["generation_status"]["production"],
            "failed: timeout"
        );

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/lessons/{}/retry", lesson_id),
                serde_json::json!({"version": version, "stage": "production"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let retried: Value = body_json(response.into_body()).await;
        assert_eq!(retried["status"], "complete");
        assert_eq!(retried["version"], version + 1);

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/lessons/{}/versions", lesson_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let versions: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(versions.len() as i64, version + 1);

        let response = app
            .clone()
            .oneshot(get_request(&format!(
                "/api/lessons/{}/versions/{}",
                lesson_id,
                version + 1
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: Value = body_json(response.into_body()).await;

        let response = app
            .oneshot(get_request(&format!("/api/lessons/{}", lesson_id)))
            .await
            .unwrap();
        let current: Value = body_json(response.into_body()).await;
        assert_eq!(current["version"], version + 1);
        assert_eq!(
            stored["document"]["metadata"]["generation_status"]["production"],
            "complete"
        );
    }

    #[tokio::test]
    async fn test_retry_rejects_bad_stage_and_rebases_old_version() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/compile", serde_json::json!({"objective_id": "X:1"})))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        let lesson_id = body["lesson_id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/lessons/{}/retry", lesson_id),
                serde_json::json!({"version": 1, "stage": "warmup"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Version 1 is older than the current one; the retry builds on the current version.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/lessons/{}/retry", lesson_id),
                serde_json::json!({"version": 1, "stage": "interaction"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["version"], 5);
        assert_eq!(body["document"]["cards"].as_array().unwrap().len(), 9);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/lessons/999/retry",
                serde_json::json!({"version": 1, "stage": "content"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_of_pending_stage_is_409() {
        let state = test_state(Arc::new(ScriptedGenerator::new()));
        let lesson_id = state
            .orchestrator
            .db()
            .call(|db| {
                let record = db.upsert_lesson_record("X:1")?;
                db.try_persist_version(record.id, &LessonDocument::new("X:1", "en", "m"))?;
                Ok(record.id)
            })
            .await
            .unwrap();
        let app = api_router().with_state(state);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/lessons/{}/retry", lesson_id),
                serde_json::json!({"version": 1, "stage": "interaction"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("pending"));
    }

    #[tokio::test]
    async fn test_versions_of_unknown_lesson_is_404() {
        let (app, _) = test_app();
        let response = app
            .oneshot(get_request("/api/lessons/5/versions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/sessions",
                serde_json::json!({"objective_id": "X:1", "learner_id": "l-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let session: Value = body_json(response.into_body()).await;
        let id = session["session_id"].as_str().unwrap().to_string();
        assert_eq!(session["stages"]["content"], "pending");

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request("POST", &format!("/api/sessions/{}/touch", id), Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request("/api/sessions/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/sessions",
                serde_json::json!({"objective_id": "X:2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kit_round_trip_feeds_compile() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/learners/l-1/kits/X:1",
                serde_json::json!({
                    "context": "At a café",
                    "words": [{"surface": "coffee"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(get_request("/api/learners/l-1/kits/X:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/compile",
                serde_json::json!({"objective_id": "X:1", "learner_id": "l-1"}),
            ))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["kit_usage"]["words"]["total"], 1);
        assert_eq!(body["version"], 5);
    }

    #[tokio::test]
    async fn test_compile_error_mapping() {
        let not_found: ApiError = CompileError::LessonNotFound { lesson_id: 1 }.into();
        assert!(matches!(not_found, ApiError::NotFound(_)));
        let conflict: ApiError = CompileError::PersistenceConflict {
            lesson_id: 1,
            attempts: 5,
        }
        .into();
        assert!(matches!(conflict, ApiError::Conflict(_)));
        let unavailable: ApiError = CompileError::ServiceUnavailable("graph down".into()).into();
        assert!(matches!(unavailable, ApiError::Unavailable(_)));
        let internal: ApiError = CompileError::Other(anyhow::anyhow!("boom")).into();
        assert!(matches!(internal, ApiError::Internal(_)));
    }
}
