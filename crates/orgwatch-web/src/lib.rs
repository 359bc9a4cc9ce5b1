//! Read-only JSON API over the ledger, plus free-form questions about one
//! entity answered by the insight generator.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use orgwatch_adapters::{Insight, InsightGenerator, InsightRequest};
use orgwatch_core::{FieldChange, ScorePair};
use orgwatch_storage::{EntityDetail, LedgerStore};
use orgwatch_sync::narrate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "orgwatch-web";

pub const EXPLAIN_FALLBACK: &str = "AI could not generate an explanation at this time.";

const HISTORY_LIMIT: i64 = 50;
const EXPLAIN_CHANGES: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub insights: Arc<dyn InsightGenerator>,
    pub insight_timeout: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, insights: Arc<dyn InsightGenerator>) -> Self {
        Self {
            store,
            insights,
            insight_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_insight_timeout(mut self, timeout: Duration) -> Self {
        self.insight_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn clamped(&self, default: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, 100)
    }
}

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExplainResponse {
    pub external_key: String,
    pub question: String,
    pub answer: String,
    pub model: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/entities/{external_key}", get(entity_handler))
        .route("/entities/{external_key}/explain", post(explain_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving orgwatch api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.now().await {
        Ok(now) => Json(json!({"status": "ok", "store_time": now})).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn entity_handler(
    State(state): State<Arc<AppState>>,
    Path(external_key): Path<String>,
) -> Response {
    match state.store.entity_detail(&external_key, HISTORY_LIMIT).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => not_found(&external_key),
        Err(err) => server_error(err.into()),
    }
}

async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.leaderboard(query.clamped(10)).await {
        Ok(board) => Json(board).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.recent_runs(query.clamped(20)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn explain_handler(
    State(state): State<Arc<AppState>>,
    Path(external_key): Path<String>,
    Json(body): Json<ExplainRequest>,
) -> Response {
    let question = body.question.trim().to_string();
    if question.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "question must not be empty"})),
        )
            .into_response();
    }

    let detail = match state.store.entity_detail(&external_key, HISTORY_LIMIT).await {
        Ok(Some(detail)) => detail,
        Ok(None) => return not_found(&external_key),
        Err(err) => return server_error(err.into()),
    };

    let request = explain_request(detail, question.clone());
    let (answer, model) =
        match narrate(state.insights.as_ref(), &request, state.insight_timeout).await {
            Insight::Generated { content, model } => (content, Some(model)),
            Insight::Absent(_) => (EXPLAIN_FALLBACK.to_string(), None),
        };
    Json(ExplainResponse {
        external_key,
        question,
        answer,
        model,
    })
    .into_response()
}

/// Latest snapshot, the most recent changes and the current score.
fn explain_request(detail: EntityDetail, question: String) -> InsightRequest {
    let changes = detail
        .changes
        .iter()
        .take(EXPLAIN_CHANGES)
        .map(|c| FieldChange {
            change_type: c.change_type,
            old_value: c.old_value.clone(),
            new_value: c.new_value.clone(),
        })
        .collect();
    InsightRequest {
        external_key: detail.entity.external_key,
        name: detail.entity.name,
        domain: detail.entity.domain,
        fields: detail
            .snapshots
            .into_iter()
            .next()
            .map(|s| s.fields)
            .unwrap_or_default(),
        changes,
        scores: detail
            .score
            .map(|s| s.pair())
            .unwrap_or(ScorePair::BASELINE),
        question: Some(question),
    }
}

fn not_found(external_key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no entity with key {external_key}")})),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("Server error: {err}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use orgwatch_adapters::DisabledInsights;
    use orgwatch_core::IncomingRecord;
    use orgwatch_storage::MemoryLedgerStore;
    use orgwatch_sync::{IngestPipeline, IngestSettings};
    use serde_json::Value;
    use tower::ServiceExt;

    struct EchoInsights;

    #[async_trait]
    impl InsightGenerator for EchoInsights {
        async fn generate(&self, request: &InsightRequest) -> Insight {
            Insight::Generated {
                content: format!(
                    "{} saw {} recent changes; asked: {}",
                    request.name,
                    request.changes.len(),
                    request.question.as_deref().unwrap_or("-")
                ),
                model: "echo".into(),
            }
        }
    }

    fn record(key: &str, stage: &str) -> IncomingRecord {
        IncomingRecord {
            external_key: Some(key.into()),
            name: Some(key.to_uppercase()),
            stage: Some(stage.into()),
            tags: Some(vec!["b2b".into()]),
            ..Default::default()
        }
    }

    async fn seeded_store() -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        let pipeline = IngestPipeline::new(
            Arc::new(store.clone()),
            Arc::new(DisabledInsights),
            IngestSettings::default(),
        );
        for rec in [
            record("acme", "Seed"),
            record("globex", "Seed"),
            record("acme", "Series A"),
        ] {
            pipeline.ingest(rec).await.unwrap();
        }
        store
    }

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn explain(key: &str, question: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/entities/{key}/explain"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"question": question}).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_store_time() {
        let store = MemoryLedgerStore::new();
        let app = app(AppState::new(Arc::new(store.clone()), Arc::new(DisabledInsights)));

        let resp = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");

        store.close();
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn entity_detail_lists_history_newest_first() {
        let store = seeded_store().await;
        let app = app(AppState::new(Arc::new(store), Arc::new(DisabledInsights)));

        let resp = app.clone().oneshot(get("/entities/acme")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let detail = body_json(resp).await;
        assert_eq!(detail["entity"]["external_key"], "acme");
        assert_eq!(detail["snapshots"].as_array().unwrap().len(), 2);
        assert_eq!(detail["snapshots"][0]["fields"]["stage"], "Series A");
        assert_eq!(detail["changes"][0]["change_type"], "STAGE_CHANGE");
        assert_eq!(detail["score"]["momentum_score"], 2);

        let resp = app.oneshot(get("/entities/initech")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn leaderboard_ranks_by_momentum() {
        let store = seeded_store().await;
        let app = app(AppState::new(Arc::new(store), Arc::new(DisabledInsights)));

        let resp = app.oneshot(get("/leaderboard?limit=5")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let board = body_json(resp).await;
        assert_eq!(board["top_momentum"][0]["external_key"], "acme");
        assert_eq!(board["most_stable"].as_array().unwrap().len(), 2);
        assert_eq!(board["recently_changed"][0]["external_key"], "acme");
    }

    #[tokio::test]
    async fn runs_endpoint_returns_recorded_runs() {
        let store = MemoryLedgerStore::new();
        let pipeline = IngestPipeline::new(
            Arc::new(store.clone()),
            Arc::new(DisabledInsights),
            IngestSettings::default(),
        );
        let mut source =
            orgwatch_adapters::StaticSource::new("fixture", vec![record("acme", "Seed")], 10);
        pipeline.run(&mut source).await.unwrap();

        let app = app(AppState::new(Arc::new(store), Arc::new(DisabledInsights)));
        let resp = app.oneshot(get("/runs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runs = body_json(resp).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "completed");
        assert_eq!(runs[0]["stats"]["new"], 1);
    }

    #[tokio::test]
    async fn explain_answers_from_the_generator() {
        let store = seeded_store().await;
        let app = app(AppState::new(Arc::new(store), Arc::new(EchoInsights)));

        let resp = app
            .oneshot(explain("acme", "Why did the stage move?"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let answer: ExplainResponse = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(answer.model.as_deref(), Some("echo"));
        assert_eq!(
            answer.answer,
            "ACME saw 1 recent changes; asked: Why did the stage move?"
        );
    }

    #[tokio::test]
    async fn explain_falls_back_when_insights_are_disabled() {
        let store = seeded_store().await;
        let app = app(AppState::new(Arc::new(store), Arc::new(DisabledInsights)));

        let resp = app.clone().oneshot(explain("acme", "Is it growing?")).await.unwrap();
        let answer: ExplainResponse = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(answer.answer, EXPLAIN_FALLBACK);
        assert_eq!(answer.model, None);

        let resp = app.clone().oneshot(explain("acme", "   ")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(explain("initech", "Anyone?")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
