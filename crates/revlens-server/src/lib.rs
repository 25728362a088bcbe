//! HTTP API for RevLens: job submission, SSE progress streaming,
//! cancellation, report retrieval, and health.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use revlens_connectors::{connectors_from_registry, SourceRegistry};
use revlens_core::{JobStatus, StreamFrame};
use revlens_inference::{OllamaClient, OllamaConfig};
use revlens_pipeline::{Orchestrator, PipelineConfig};
use revlens_store::{Db, HttpClientConfig, HttpFetcher, JobStore, ReportCache};
use serde::Deserialize;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revlens-server";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub db: Option<Arc<Db>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/analyze", post(analyze_handler))
        .route("/api/stream/{job_id}", get(stream_handler))
        .route("/api/cancel/{job_id}", post(cancel_handler))
        .route("/api/report/{job_id}", get(report_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Assemble the full stack (connectors, inference, storage) from the
/// environment.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let sources_path =
        std::env::var("REVLENS_SOURCES").unwrap_or_else(|_| "sources.yaml".to_string());

    let yaml = tokio::fs::read_to_string(&sources_path).await?;
    let registry = SourceRegistry::from_yaml(&yaml)?;
    let connectors = connectors_from_registry(&registry);
    tracing::info!(count = connectors.len(), "connectors registered");

    let db = match Db::connect_from_env().await {
        Some(db) => {
            db.ensure_schema().await?;
            Some(Arc::new(db))
        }
        None => None,
    };

    let inference = OllamaClient::new(OllamaConfig::from_env())
        .map_err(|e| anyhow::anyhow!("building inference client: {e}"))?;
    let config = PipelineConfig {
        store: Arc::new(JobStore::new()),
        cache: Arc::new(ReportCache::default()),
        db: db.clone(),
        http: Arc::new(HttpFetcher::new(HttpClientConfig::default())?),
        inference: Arc::new(inference),
        connectors: Arc::new(connectors),
    };
    Ok(AppState {
        orchestrator: Arc::new(Orchestrator::new(config)),
        db,
    })
}

/// Assemble the full stack from the environment and serve until shutdown.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("REVLENS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = build_state_from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    query: String,
    #[serde(default = "default_use_cache")]
    use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Response {
    let query = request.query.trim();
    if query.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "query must not be empty");
    }
    let job = state.orchestrator.submit(query, request.use_cache).await;
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "job_id": job.id,
            "status": job.status,
        })),
    )
        .into_response()
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Response {
    let Some((history, rx)) = state.orchestrator.store().subscribe(job_id).await else {
        return error_json(StatusCode::NOT_FOUND, "unknown job");
    };
    Sse::new(frame_stream(history, rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Replay buffered frames, then follow the live channel until a terminal
/// frame closes the stream. A lagged receiver skips ahead; the terminal frame
/// is always delivered because it is the last one sent.
fn frame_stream(
    history: Vec<StreamFrame>,
    mut rx: tokio::sync::broadcast::Receiver<StreamFrame>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut done = false;
        for frame in history {
            done = frame.is_terminal();
            yield Ok(frame_event(&frame));
            if done {
                break;
            }
        }
        while !done {
            match rx.recv().await {
                Ok(frame) => {
                    done = frame.is_terminal();
                    yield Ok(frame_event(&frame));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "stream subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn frame_event(frame: &StreamFrame) -> Event {
    match Event::default().json_data(frame) {
        Ok(event) => event,
        Err(err) => {
            tracing::error!(%err, "unserializable frame");
            Event::default().data("{\"type\":\"error\",\"message\":\"internal\",\"code\":\"internal\"}")
        }
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Response {
    state.orchestrator.cancel(job_id).await;
    Json(serde_json::json!({ "status": "cancellation_requested" })).into_response()
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Response {
    let store = state.orchestrator.store();
    let Some(job) = store.get(job_id).await else {
        return error_json(StatusCode::NOT_FOUND, "unknown job");
    };
    match job.status {
        JobStatus::Complete => match store.report(job_id).await {
            Some(report) => Json(report).into_response(),
            None => error_json(StatusCode::INTERNAL_SERVER_ERROR, "report missing"),
        },
        JobStatus::Cancelled | JobStatus::Failed => (
            StatusCode::GONE,
            Json(serde_json::json!({ "status": job.status })),
        )
            .into_response(),
        _ => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": job_id, "status": job.status })),
        )
            .into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = match &state.db {
        Some(db) => db.ping().await,
        None => false,
    };
    let status = if db_ok { "ok" } else { "degraded" };
    Json(serde_json::json!({ "status": status, "database": db_ok })).into_response()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use revlens_connectors::{ConnectorError, EnrichedQuery, RawRecord, ReviewBatch, SourceConnector};
    use revlens_inference::{Inference, InferenceError};
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubInference;

    #[async_trait]
    impl Inference for StubInference {
        async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
            if prompt.contains("alternate names") {
                return Ok("[]".to_string());
            }
            if prompt.contains("Score the sentiment") {
                return Ok(r#"[{"index": 0, "aspects": {"build quality": 0.7}}]"#.to_string());
            }
            if prompt.contains("grouped together by topic") {
                return Ok("build quality praise".to_string());
            }
            Ok(r#"{
                "executive_summary": "Solid all around.",
                "who_should_buy": "Most people.",
                "who_should_skip": "Nobody in particular.",
                "verdict": "Recommended."
            }"#
            .to_string())
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| (0..4).map(|d| ((i + d) % 5) as f32).collect())
                .collect())
        }
    }

    struct StubConnector;

    #[async_trait]
    impl SourceConnector for StubConnector {
        fn source_id(&self) -> &'static str {
            "amazon"
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _query: &EnrichedQuery,
        ) -> Result<ReviewBatch, ConnectorError> {
            Ok(ReviewBatch {
                source: "amazon".into(),
                records: (0..12)
                    .map(|i| RawRecord {
                        native_id: format!("r{i}"),
                        text: format!("Review {i}: sturdy frame, good value, zero complaints so far."),
                        raw_rating: Some(4.0),
                        rating_scale: 5.0,
                        posted_at: Some("2024-04-01".into()),
                        verified: true,
                        helpful_votes: i,
                        reviewer_id: None,
                    })
                    .collect(),
            })
        }
    }

    fn test_state() -> AppState {
        let config = PipelineConfig {
            store: Arc::new(JobStore::new()),
            cache: Arc::new(ReportCache::default()),
            db: None,
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            inference: Arc::new(StubInference),
            connectors: Arc::new(vec![Box::new(StubConnector) as Box<dyn SourceConnector>]),
        };
        AppState {
            orchestrator: Arc::new(Orchestrator::new(config)),
            db: None,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn analyze_rejects_blank_queries() {
        let app = app(test_state());
        let response = app
            .oneshot(post_json("/api/analyze", r#"{"query": "   "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn analyze_accepts_a_job_and_report_becomes_available() {
        let state = test_state();
        let app = app(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/api/analyze", r#"{"query": "acme widget"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        let job_id = json["job_id"].as_str().unwrap().to_string();

        // Poll the report route until the pipeline lands.
        let mut report = None;
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/api/report/{job_id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            match response.status() {
                StatusCode::OK => {
                    report = Some(body_json(response).await);
                    break;
                }
                StatusCode::ACCEPTED => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => panic!("unexpected report status {other}"),
            }
        }
        let report = report.expect("report never completed");
        assert_eq!(report["total_reviews_analyzed"], 12);
        assert_eq!(report["executive_summary"], "Solid all around.");
    }

    #[tokio::test]
    async fn stream_replays_history_through_the_terminal_frame() {
        let state = test_state();
        let job = state.orchestrator.submit("acme widget", true).await;
        // Wait for the job to finish so the SSE body has a bounded length.
        for _ in 0..100 {
            let status = state.orchestrator.store().get(job.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let app = app(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/stream/{}", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#""type":"progress""#));
        assert!(text.contains(r#""type":"complete""#));
    }

    #[tokio::test]
    async fn stream_for_unknown_job_is_404() {
        let app = app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/stream/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_is_always_ok_even_for_unknown_jobs() {
        let app = app(test_state());
        let response = app
            .oneshot(post_json(&format!("/api/cancel/{}", Uuid::new_v4()), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "cancellation_requested");
    }

    #[tokio::test]
    async fn report_for_unknown_job_is_404() {
        let app = app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/report/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_database_state() {
        let app = app(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["database"], false);
    }
}
