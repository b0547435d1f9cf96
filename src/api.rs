//! REST API server for the finance insight orchestrator
//!
//! Exposes job submission and inspection over HTTP. Jobs run
//! asynchronously: POST /jobs returns a job id immediately and progress is
//! polled through the read endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Capabilities;
use crate::error::OrchestrationError;
use crate::jobs::JobManager;
use crate::models::Request;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<JobManager>,
    pub capabilities: Capabilities,
    /// When set, requests must carry it as a bearer token or X-API-Key.
    pub api_key: Option<String>,
}

/// =============================
/// Auth Guard
/// =============================

/// Health stays open; everything else requires the key when one is
/// configured.
fn check_auth(state: &ApiState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ApiResponse>)> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    if bearer == Some(expected.as_str()) || header_key == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::error("unauthorized".to_string())),
        ))
    }
}

fn error_response(e: OrchestrationError) -> (StatusCode, Json<ApiResponse>) {
    let status = match &e {
        OrchestrationError::JobNotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::State(_) => StatusCode::CONFLICT,
        OrchestrationError::FatalConfig(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn get_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    check_auth(&state, &headers)?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "capabilities": {
            "llm": state.capabilities.llm,
            "market_data": state.capabilities.market_data(),
            "twelve_data": state.capabilities.twelve_data,
            "fundamentals": state.capabilities.fundamentals,
            "news_search": state.capabilities.news_search,
        }
    }))))
}

async fn submit_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<Request>,
) -> Result<(StatusCode, Json<ApiResponse>), (StatusCode, Json<ApiResponse>)> {
    check_auth(&state, &headers)?;
    if request.query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".to_string())),
        ));
    }

    info!("Received research request: {}", request.query);
    let job_id = state.jobs.submit(request).await.map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(
            serde_json::json!({ "job_id": job_id }),
        )),
    ))
}

async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    check_auth(&state, &headers)?;
    let snapshot = state.jobs.snapshot(job_id).await.map_err(error_response)?;
    let traces = state.jobs.traces(job_id);
    Ok(Json(ApiResponse::success(serde_json::json!({
        "job": snapshot,
        "trace": traces,
    }))))
}

async fn get_job_result(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    check_auth(&state, &headers)?;
    let report = state.jobs.result(job_id).await.map_err(error_response)?;
    Ok(Json(ApiResponse::success(report)))
}

async fn cancel_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    check_auth(&state, &headers)?;
    let status = state.jobs.cancel(job_id).await.map_err(error_response)?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "job_id": job_id, "status": status }),
    )))
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/result", get(get_job_result))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::llm::ScriptedLlm;
    use crate::orchestrator::Orchestrator;
    use crate::providers::testing::{article, StaticMarketProvider, StaticNewsProvider};
    use crate::providers::ProviderChain;
    use crate::state::InMemoryContextStore;
    use crate::trace::MemoryTraceSink;
    use std::time::Duration;

    fn api_state(api_key: Option<String>) -> ApiState {
        let chain = Arc::new(ProviderChain::new(vec![
            Arc::new(StaticMarketProvider {
                name: "feed",
                closes: (0..60).map(|i| 100.0 + i as f64 * 0.5).collect(),
            }),
            Arc::new(StaticNewsProvider {
                articles: vec![article("Apple beats estimates", "https://news/a")],
            }),
        ]));
        let trace = Arc::new(MemoryTraceSink::new());
        let llm = ScriptedLlm::single(
            "{\"use_research\": true, \"use_quant\": true, \"symbol\": \"AAPL\"}",
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(llm),
            chain,
            OrchestratorConfig::default(),
            trace.clone(),
        ));
        ApiState {
            jobs: Arc::new(JobManager::new(
                orchestrator,
                Arc::new(InMemoryContextStore::new()),
                trace,
                Duration::from_secs(30),
            )),
            capabilities: Capabilities::all(),
            api_key,
        }
    }

    #[test]
    fn auth_guard_accepts_bearer_and_header_key() {
        let state = api_state(Some("secret".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(check_auth(&state, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(check_auth(&state, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(check_auth(&state, &headers).is_err());

        assert!(check_auth(&state, &HeaderMap::new()).is_err());
    }

    #[test]
    fn auth_guard_is_open_without_a_configured_key() {
        let state = api_state(None);
        assert!(check_auth(&state, &HeaderMap::new()).is_ok());
    }

    #[tokio::test]
    async fn submit_and_poll_through_the_handlers() {
        let state = api_state(None);
        let mut request = Request::from_query("How is AAPL doing?");
        request.tickers = vec!["AAPL".to_string()];

        let (status, Json(response)) =
            submit_job(State(state.clone()), HeaderMap::new(), Json(request))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id: Uuid = serde_json::from_value(
            response.data.unwrap()["job_id"].clone(),
        )
        .unwrap();

        for _ in 0..200 {
            let Json(snapshot) = get_job(
                State(state.clone()),
                HeaderMap::new(),
                Path(job_id),
            )
            .await
            .unwrap();
            let status = snapshot.data.unwrap()["job"]["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status == "completed" {
                let Json(result) = get_job_result(
                    State(state.clone()),
                    HeaderMap::new(),
                    Path(job_id),
                )
                .await
                .unwrap();
                assert!(result.success);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never completed");
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let state = api_state(None);
        let result = submit_job(
            State(state),
            HeaderMap::new(),
            Json(Request::from_query("  ")),
        )
        .await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_returns_not_found() {
        let state = api_state(None);
        let result = get_job(State(state), HeaderMap::new(), Path(Uuid::new_v4())).await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
