use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use sdjobs_core::{
    ConvertParams, GenerateParams, InvocationError, Job, JobKind, JobStatus, JobUpdate,
};

use crate::config::SdConfig;
use crate::service::{JobService, spawn_reaper};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }
}

impl From<InvocationError> for AppError {
    fn from(err: InvocationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A job without its log history.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub kind: Option<JobKind>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub log_count: usize,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            result: job.result.clone(),
            log_count: job.logs.len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub result: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: JobService,
    /// Fired on server shutdown; ends every open event stream.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs).delete(delete_jobs))
        .route("/api/jobs/convert", post(create_convert))
        .route("/api/jobs/generate", post(create_generate))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/events", get(job_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: &SdConfig) -> Result<()> {
    let service = JobService::new(config)?;
    let shutdown = CancellationToken::new();
    let reaper = spawn_reaper(
        service.registry.clone(),
        config.max_age,
        config.reap_interval,
        shutdown.child_token(),
    );

    let app = build_router(AppState {
        service: service.clone(),
        shutdown: shutdown.clone(),
    });
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.bind, config.port))?;
    tracing::info!("sdjobs serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let on_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            on_signal.cancel();
        })
        .await?;

    let stopped = service.supervisor.cancel_all();
    if stopped > 0 {
        tracing::info!(stopped, "cancelled running jobs");
    }
    let settle = async {
        while !service.supervisor.active_jobs().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), settle)
        .await
        .is_err()
    {
        tracing::warn!("some jobs did not stop in time");
    }
    let _ = reaper.await;

    tracing::info!("sdjobs serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    let jobs = state.service.registry.list_all();
    Json(jobs.iter().map(JobSummary::from).collect())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    state
        .service
        .registry
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))
}

async fn create_convert(
    State(state): State<AppState>,
    Json(params): Json<ConvertParams>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.service.submit_convert(&params)?;
    Ok((StatusCode::ACCEPTED, Json(JobSummary::from(&job))))
}

async fn create_generate(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.service.submit_generate(&params)?;
    Ok((StatusCode::ACCEPTED, Json(JobSummary::from(&job))))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.service.supervisor.cancel(id) {
        return Ok(Json(serde_json::json!({ "cancelled": true })));
    }
    match state.service.registry.get(id) {
        None => Err(AppError::not_found(format!("job {id} not found"))),
        Some(job) => Err(AppError::conflict(format!(
            "job {id} is already {}",
            job.status
        ))),
    }
}

/// Server-sent events: one `log` or `finished` event per update, each
/// carrying the JSON-encoded update. The stream closes after `finished`.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    if state.service.registry.get(id).is_none() {
        return Err(AppError::not_found(format!("job {id} not found")));
    }

    let updates = state
        .service
        .subscriptions
        .subscribe(id, state.shutdown.child_token());
    let events = updates.map(|update| {
        let name = match &update {
            JobUpdate::Log { .. } => "log",
            JobUpdate::Finished { .. } => "finished",
        };
        Event::default().event(name).json_data(&update)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn delete_jobs(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Json<serde_json::Value> {
    let deleted = state
        .service
        .registry
        .delete_by_result(|file| file == query.result);
    tracing::info!(deleted, result = %query.result, "deleted jobs by result");
    Json(serde_json::json!({ "deleted": deleted }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::SdConfig;

    const LIMIT: Duration = Duration::from_secs(10);

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    /// An installation root whose `bin/sd-cli` runs `body`.
    fn fake_install(body: &str) -> (tempfile::TempDir, AppState) {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("sd-cli");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = SdConfig {
            root: tmp.path().to_path_buf(),
            models_dir: tmp.path().join("models"),
            output_dir: tmp.path().join("output"),
            bind: "127.0.0.1".to_string(),
            port: 0,
            supervisor: Default::default(),
            max_age: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(3600),
        };
        let state = AppState {
            service: JobService::new(&config).unwrap(),
            shutdown: CancellationToken::new(),
        };
        (tmp, state)
    }

    async fn send(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let app = build_router(state.clone());
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        tokio::time::timeout(LIMIT, axum::body::to_bytes(response.into_body(), 1_048_576))
            .await
            .expect("response body did not finish")
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    async fn wait_for(state: &AppState, id: Uuid, status: JobStatus) {
        tokio::time::timeout(LIMIT, async {
            while state.service.registry.get(id).map(|j| j.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job never reached {status}"));
    }

    fn convert_body() -> serde_json::Value {
        serde_json::json!({ "model": "in.safetensors", "output": "out.gguf", "type": "q8_0" })
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let (_tmp, state) = fake_install("exit 0");
        let resp = send(&state, "GET", "/api/jobs", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let (_tmp, state) = fake_install("exit 0");
        let id = Uuid::now_v7();

        for uri in [format!("/api/jobs/{id}"), format!("/api/jobs/{id}/events")] {
            let resp = send(&state, "GET", &uri, None).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
            let body = body_json(resp).await;
            assert!(body["error"].as_str().unwrap().contains("not found"));
        }

        let resp = send(&state, "POST", &format!("/api/jobs/{id}/cancel"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params_are_rejected() {
        let (_tmp, state) = fake_install("exit 0");
        let body = serde_json::json!({ "model": "", "output": "out.gguf", "type": "q8_0" });
        let resp = send(&state, "POST", "/api/jobs/convert", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            serde_json::json!("model is required")
        );
        assert!(state.service.registry.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_convert_job_streams_to_completion() {
        let (tmp, state) = fake_install("echo \"converting $4\"\necho 'done'");

        let resp = send(&state, "POST", "/api/jobs/convert", Some(convert_body())).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let created = body_json(resp).await;
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
        assert_eq!(created["kind"], "convert");

        let resp = send(&state, "GET", &format!("/api/jobs/{id}/events"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let sse = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(sse.contains("event: log"), "{sse}");
        assert!(sse.contains("converting in.safetensors"), "{sse}");
        assert_eq!(sse.matches("event: finished").count(), 1, "{sse}");
        assert!(sse.contains("\"status\":\"completed\""), "{sse}");

        let resp = send(&state, "GET", &format!("/api/jobs/{id}"), None).await;
        let job = body_json(resp).await;
        assert_eq!(job["status"], "completed");
        let expected = tmp.path().join("models").join("out.gguf");
        assert_eq!(job["result"], expected.display().to_string());
        assert!(job["logs"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (_tmp, state) = fake_install("exec sleep 30");
        let body = serde_json::json!({ "model": "v1.safetensors", "prompt": "a red fox" });
        let resp = send(&state, "POST", "/api/jobs/generate", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id: Uuid = body_json(resp).await["id"].as_str().unwrap().parse().unwrap();
        wait_for(&state, id, JobStatus::Running).await;

        let resp = send(&state, "POST", &format!("/api/jobs/{id}/cancel"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cancelled"], true);

        let resp = send(&state, "POST", &format!("/api/jobs/{id}/cancel"), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let job = state.service.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.result, Some(format!("Job {id} has been cancelled")));
    }

    #[tokio::test]
    async fn test_delete_by_result_file() {
        let (_tmp, state) = fake_install("exit 0");
        let resp = send(&state, "POST", "/api/jobs/convert", Some(convert_body())).await;
        let id: Uuid = body_json(resp).await["id"].as_str().unwrap().parse().unwrap();
        wait_for(&state, id, JobStatus::Completed).await;
        let result = state.service.registry.get(id).unwrap().result.unwrap();

        let resp = send(&state, "DELETE", "/api/jobs?result=%2Fnowhere.png", None).await;
        assert_eq!(body_json(resp).await["deleted"], 0);

        let uri = format!("/api/jobs?result={}", result.replace('/', "%2F"));
        let resp = send(&state, "DELETE", &uri, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["deleted"], 1);
        assert!(state.service.registry.get(id).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_event_streams() {
        let (_tmp, state) = fake_install("exec sleep 30");
        let body = serde_json::json!({ "model": "v1.safetensors", "prompt": "x" });
        let resp = send(&state, "POST", "/api/jobs/generate", Some(body)).await;
        let id: Uuid = body_json(resp).await["id"].as_str().unwrap().parse().unwrap();
        wait_for(&state, id, JobStatus::Running).await;

        let resp = send(&state, "GET", &format!("/api/jobs/{id}/events"), None).await;
        state.shutdown.cancel();
        let sse = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(!sse.contains("event: finished"), "{sse}");

        state.service.supervisor.cancel(id);
    }
}
