//! On-demand HTTP trigger for sync runs.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tpsync_core::{RunMode, RunStatus, SyncRunSummary};
use tpsync_sync::{RunError, SyncOrchestrator};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tpsync-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    /// When set, trigger routes require `Authorization: Bearer <token>`.
    pub trigger_token: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            trigger_token: None,
        }
    }

    pub fn with_trigger_token(mut self, token: Option<String>) -> Self {
        self.trigger_token = token.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    mode: Option<String>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let triggers = Router::new()
        .route("/sync", post(sync_handler))
        .route("/sync/{job}", post(sync_job_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));
    Router::new()
        .route("/health", get(health_handler))
        .merge(triggers)
        .with_state(state)
}

pub fn web_port_from_env() -> u16 {
    std::env::var("TPSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "sync trigger listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn require_token(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.trigger_token.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected sync trigger without valid token");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid bearer token" })),
        )
            .into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let jobs = state
        .orchestrator
        .registry()
        .jobs
        .iter()
        .map(|j| json!({ "name": j.name, "table": j.table, "enabled": j.enabled, "heavy": j.heavy }))
        .collect::<Vec<_>>();
    Json(json!({ "status": "ok", "jobs": jobs })).into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let mode = match query.mode.as_deref() {
        None | Some("full") => RunMode::Full,
        Some("light") | Some("lightweight") => RunMode::Lightweight,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown mode {other:?}; use full or light") })),
            )
                .into_response()
        }
    };
    run_response(state.orchestrator.run(mode).await)
}

async fn sync_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
) -> Response {
    run_response(state.orchestrator.run_job(&job).await)
}

fn run_response(result: Result<SyncRunSummary, RunError>) -> Response {
    match result {
        Ok(summary) => {
            let status = match summary.status {
                RunStatus::Completed => StatusCode::OK,
                RunStatus::PartiallyCompleted => StatusCode::MULTI_STATUS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(summary)).into_response()
        }
        Err(err @ RunError::UnknownJob(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Err(err @ RunError::JobDisabled(_)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use tpsync_adapters::NameAliases;
    use tpsync_core::{SessionCredential, SourceFormat};
    use tpsync_storage::memory::MemoryDestination;
    use tpsync_storage::{
        BiApi, BiCredentials, CredentialError, CredentialManager, CredentialStore, FeedApi,
        FetchError, SourceFetcher,
    };
    use tpsync_sync::{JobRegistry, TableSynchronizer};

    struct Stub;

    #[async_trait]
    impl BiApi for Stub {
        async fn login(&self, _u: &str, _p: &str) -> Result<String, FetchError> {
            Ok("token".into())
        }
        async fn query(&self, _t: &str, q: u64, _f: SourceFormat) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: format!("https://bi.test/api/card/{q}/query"),
                body: "maintenance".into(),
            })
        }
    }

    #[async_trait]
    impl FeedApi for Stub {
        async fn get(&self, _url: &str) -> Result<String, FetchError> {
            Ok(r#"[{"keyword":"Algebra","file_link":"https://x/1"}]"#.into())
        }
    }

    #[async_trait]
    impl CredentialStore for Stub {
        async fn load(&self) -> Result<Option<SessionCredential>, CredentialError> {
            Ok(None)
        }
        async fn save(&self, _c: &SessionCredential) -> Result<(), CredentialError> {
            Ok(())
        }
    }

    const REGISTRY: &str = r#"
jobs:
  - name: learning_materials
    table: learning_materials
    transform: learning_materials
    source: { kind: feed, url: "https://feeds.example.test/materials.json" }
  - name: class_schedule
    table: class_schedule
    transform: class_schedule
    source: { kind: bi_question, question_id: 101 }
  - name: archived
    table: archived
    transform: learning_materials
    source: { kind: feed, url: "https://feeds.example.test/old.json" }
    enabled: false
"#;

    fn state(token: Option<&str>) -> AppState {
        let stub = Arc::new(Stub);
        let credentials = Arc::new(CredentialManager::new(
            stub.clone(),
            BiCredentials {
                username: "u".into(),
                password: "p".into(),
            },
            stub.clone(),
        ));
        let orchestrator = SyncOrchestrator::new(
            JobRegistry::from_yaml_str(REGISTRY, "test").unwrap(),
            Arc::new(SourceFetcher::new(stub.clone(), stub, credentials)),
            TableSynchronizer::new(Arc::new(MemoryDestination::default()), 100),
            NameAliases::default(),
        )
        .with_job_delay(Duration::ZERO);
        AppState::new(Arc::new(orchestrator)).with_trigger_token(token.map(str::to_string))
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_lists_jobs() {
        let resp = app(state(None))
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn single_job_trigger_runs_only_that_job() {
        let resp = app(state(None)).oneshot(post("/sync/learning_materials")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "COMPLETED");
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(body["jobs"][0]["record_count"], 1);
    }

    #[tokio::test]
    async fn partial_run_reports_multi_status() {
        let resp = app(state(None)).oneshot(post("/sync?mode=light")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "PARTIALLY_COMPLETED");
        assert_eq!(body["jobs"][1]["failure_kind"], "source_unavailable");
    }

    #[tokio::test]
    async fn unknown_disabled_and_bad_mode_are_client_errors() {
        let app = app(state(None));
        let unknown = app.clone().oneshot(post("/sync/nope")).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let disabled = app.clone().oneshot(post("/sync/archived")).await.unwrap();
        assert_eq!(disabled.status(), StatusCode::CONFLICT);
        let bad_mode = app.oneshot(post("/sync?mode=weekly")).await.unwrap();
        assert_eq!(bad_mode.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_token_is_enforced_but_health_stays_open() {
        let app = app(state(Some("s3cret")));
        let denied = app.clone().oneshot(post("/sync/learning_materials")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/learning_materials")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let health = app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
