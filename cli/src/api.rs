use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::routing::get;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use wsproxy_capture::MemoryStore;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

pub fn router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/prompts", get(prompts))
        .route("/prompts/count", get(count))
        .route("/prompts/stats", get(stats))
        .with_state(store)
}

pub async fn serve(store: Arc<MemoryStore>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    info!("prompt API listening on http://{addr}");
    axum::serve(listener, router(store))
        .await
        .context("prompt API server failed")
}

#[derive(Debug, Default, Deserialize)]
struct PromptsQuery {
    limit: Option<usize>,
    skip: Option<usize>,
    user: Option<String>,
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "Windsurf Prompt Interceptor API",
        "endpoints": {
            "GET /prompts": "Captured prompts, paginated (limit, skip, user)",
            "GET /prompts/count": "Total prompt count",
            "GET /prompts/stats": "Aggregated statistics",
            "GET /health": "Health check",
        },
    }))
}

async fn health(State(store): State<Arc<MemoryStore>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "stored_prompts": store.count(None),
    }))
}

async fn prompts(
    State(store): State<Arc<MemoryStore>>,
    Query(query): Query<PromptsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let skip = query.skip.unwrap_or(0);
    let user = query.user.as_deref();

    let page = store.recent(limit, skip, user);
    let returned = page.len();
    Json(json!({
        "prompts": page,
        "total": store.count(user),
        "limit": limit,
        "skip": skip,
        "returned": returned,
    }))
}

async fn count(
    State(store): State<Arc<MemoryStore>>,
    Query(query): Query<PromptsQuery>,
) -> Json<Value> {
    Json(json!({ "count": store.count(query.user.as_deref()) }))
}

async fn stats(State(store): State<Arc<MemoryStore>>) -> Json<Value> {
    Json(json!(store.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wsproxy_capture::CaptureMethod;
    use wsproxy_capture::DocumentStore as _;
    use wsproxy_capture::InterceptedPrompt;
    use wsproxy_capture::Message;
    use wsproxy_capture::PromptMetadata;
    use wsproxy_capture::Source;
    use wsproxy_capture::StoredDocument;

    fn store_with_docs(count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..count {
            let prompt = InterceptedPrompt {
                id: Uuid::new_v4(),
                timestamp: Utc::now() + chrono::Duration::seconds(i as i64),
                source: Source::Windsurf,
                user_agent: String::new(),
                url: "http://d.localhost:1/x".to_string(),
                method: "POST".to_string(),
                prompt: format!("captured prompt number {i}"),
                messages: vec![Message::user(format!("captured prompt number {i}"))],
                response: None,
                metadata: PromptMetadata {
                    model: Some("MODEL_X".to_string()),
                    ..PromptMetadata::default()
                },
                capture_method: CaptureMethod::LoopbackSniffer,
            };
            store
                .insert(StoredDocument::from_prompt(&prompt, "alice"))
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn prompts_endpoint_paginates() {
        let store = store_with_docs(5);
        let Json(body) = prompts(
            State(store),
            Query(PromptsQuery {
                limit: Some(2),
                skip: Some(1),
                user: None,
            }),
        )
        .await;

        assert_eq!(body["total"], 5);
        assert_eq!(body["returned"], 2);
        assert_eq!(body["prompts"][0]["prompt"], "captured prompt number 3");
    }

    #[tokio::test]
    async fn limit_is_clamped_to_the_allowed_range() {
        let store = store_with_docs(3);
        let Json(body) = prompts(
            State(store),
            Query(PromptsQuery {
                limit: Some(0),
                ..PromptsQuery::default()
            }),
        )
        .await;
        assert_eq!(body["limit"], 1);
        assert_eq!(body["returned"], 1);
    }

    #[tokio::test]
    async fn health_and_count_report_the_store() {
        let store = store_with_docs(2);
        let Json(health_body) = health(State(store.clone())).await;
        assert_eq!(health_body["status"], "healthy");
        assert_eq!(health_body["stored_prompts"], 2);

        let Json(count_body) = count(State(store), Query(PromptsQuery::default())).await;
        assert_eq!(count_body["count"], 2);
    }

    #[tokio::test]
    async fn stats_endpoint_serializes_aggregates() {
        let store = store_with_docs(4);
        let Json(body) = stats(State(store)).await;
        assert_eq!(body["total_prompts"], 4);
        assert_eq!(body["model_usage"]["MODEL_X"], 4);
    }
}
