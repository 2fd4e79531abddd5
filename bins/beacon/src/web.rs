use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use beacon_core::task::{NewTask, TaskView};
use crate::module::{Module, ModuleCtx};
use crate::registry::{AddError, TaskRegistry};

#[derive(Clone)]
struct AppState {
    registry: Arc<TaskRegistry>,
}

#[derive(Serialize)]
struct TaskList {
    tasks: Vec<TaskView>,
}

pub struct WebServer {
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(addr: SocketAddr) -> Self { Self { addr } }
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(ctx.registry.clone());

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;

            Ok(())
        })
    }
}

/// Routes of the control plane.
pub fn router(registry: Arc<TaskRegistry>) -> Router {
    Router::new()
        .route("/tasks", get(tasks_list))
        .route("/tasks/add", post(tasks_add))
        .route("/tasks/:id", get(tasks_get))
        .route("/tasks/:id/pause", post(tasks_pause))
        .route("/tasks/:id/delete", post(tasks_delete))
        .route("/healthz", get(healthz).post(healthz))
        .with_state(AppState { registry })
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

fn not_found() -> Response {
    error(StatusCode::NOT_FOUND, "task not found")
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

// Registry calls may block on the lock and on a snapshot fsync, so they run
// on the blocking pool rather than on a runtime worker.
async fn blocking<T, F>(registry: &Arc<TaskRegistry>, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&TaskRegistry) -> T + Send + 'static,
{
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || f(&registry)).await.map_err(|e| {
        tracing::error!("registry call failed: {}", e);
        error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })
}

async fn tasks_list(State(state): State<AppState>) -> Response {
    match blocking(&state.registry, |r| r.list()).await {
        Ok(tasks) => Json(TaskList { tasks }).into_response(),
        Err(resp) => resp,
    }
}

async fn tasks_get(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match blocking(&state.registry, move |r| r.get(&id)).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found(),
        Err(resp) => resp,
    }
}

async fn tasks_add(State(state): State<AppState>, payload: Result<Json<NewTask>, JsonRejection>) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => {
            debug!("add rejected: {}", e.body_text());
            return error(StatusCode::BAD_REQUEST, e.body_text());
        }
    };
    match blocking(&state.registry, move |r| r.add(&req)).await {
        Ok(Ok(id)) => Json(json!({ "id": id })).into_response(),
        Ok(Err(e @ AddError::Invalid(_))) => error(StatusCode::BAD_REQUEST, e.to_string()),
        Ok(Err(e @ AddError::Persist(_))) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(resp) => resp,
    }
}

async fn tasks_pause(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match blocking(&state.registry, move |r| r.pause(&id)).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => not_found(),
        Err(resp) => resp,
    }
}

async fn tasks_delete(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match blocking(&state.registry, move |r| r.remove(&id)).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => not_found(),
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use beacon_core::store::SnapshotStore;
    use serde_json::Value;
    use std::fs;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::runner::HttpExecutor;

    struct Harness {
        _dir: TempDir,
        store: SnapshotStore,
        app: Router,
        server: MockServer,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("config.json"));
        let registry = Arc::new(TaskRegistry::new(store.clone(), HttpExecutor::new().unwrap()));
        Harness { _dir: dir, store, app: router(registry), server }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn add_body(h: &Harness, method: &str) -> Value {
        json!({
            "interval_seconds": 60,
            "url": format!("{}/ping", h.server.uri()),
            "method": method,
            "description": "ping"
        })
    }

    #[tokio::test]
    async fn healthz_answers_get_and_post() {
        let h = harness().await;
        for m in ["GET", "POST"] {
            let (status, body) = call(&h.app, m, "/healthz", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "ok": true }));
        }
    }

    #[tokio::test]
    async fn task_lifecycle_over_http() {
        let h = harness().await;

        let (status, body) = call(&h.app, "POST", "/tasks/add", Some(add_body(&h, "get"))).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(&h.app, "GET", "/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], id.as_str());
        assert_eq!(tasks[0]["interval_seconds"], 60);
        assert_eq!(tasks[0]["method"], "GET");
        assert_eq!(tasks[0]["description"], "ping");
        assert_eq!(tasks[0]["status"], "running");

        let (status, body) = call(&h.app, "POST", &format!("/tasks/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let (_, body) = call(&h.app, "GET", &format!("/tasks/{id}"), None).await;
        assert_eq!(body["status"], "paused");

        let (status, _) = call(&h.app, "POST", &format!("/tasks/{id}/delete"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&h.app, "GET", &format!("/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "task not found" }));

        let (_, body) = call(&h.app, "GET", "/tasks", None).await;
        assert_eq!(body, json!({ "tasks": [] }));
    }

    #[tokio::test]
    async fn unknown_ids_are_404() {
        let h = harness().await;
        for (m, uri) in [("POST", "/tasks/nope/pause"), ("POST", "/tasks/nope/delete"), ("GET", "/tasks/nope")] {
            let (status, body) = call(&h.app, m, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{m} {uri}");
            assert_eq!(body["error"], "task not found");
        }
    }

    #[tokio::test]
    async fn bad_add_requests_are_400() {
        let h = harness().await;

        let (status, body) = call(&h.app, "POST", "/tasks/add", Some(add_body(&h, "DELETE"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("GET or POST"));

        let mut b = add_body(&h, "GET");
        b["interval_seconds"] = json!(86_401);
        let (status, _) = call(&h.app, "POST", "/tasks/add", Some(b)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.app, "POST", "/tasks/add", Some(json!({ "url": "http://a.test" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (_, body) = call(&h.app, "GET", "/tasks", None).await;
        assert_eq!(body, json!({ "tasks": [] }));
    }

    #[tokio::test]
    async fn persistence_failure_is_500() {
        let h = harness().await;
        fs::create_dir(h.store.tmp_path()).unwrap();

        let (status, body) = call(&h.app, "POST", "/tasks/add", Some(add_body(&h, "GET"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().starts_with("persist snapshot"));

        let (_, body) = call(&h.app, "GET", "/tasks", None).await;
        assert_eq!(body, json!({ "tasks": [] }));
    }
}
