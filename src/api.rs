//! REST API server for the analytics engine
//!
//! Exposes question answering and session history over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::AnalyticsEngine;
use crate::error::AnalyticsError;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AskRequest {
    pub question: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

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
    pub engine: Arc<AnalyticsEngine>,
}

/// =============================
/// Helpers
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

/// Session key for a caller-supplied id; a fresh one when absent.
fn session_key(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => uuid::Uuid::parse_str(v.trim())
            .unwrap_or_else(|_| stable_uuid_from_string(v.trim()))
            .to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

fn status_for(error: &AnalyticsError) -> StatusCode {
    match error {
        AnalyticsError::InvalidInput(_) | AnalyticsError::Classification { .. } => {
            StatusCode::BAD_REQUEST
        }
        AnalyticsError::NoData { .. } => StatusCode::NOT_FOUND,
        AnalyticsError::MissingDriver { .. }
        | AnalyticsError::UndefinedValue(_)
        | AnalyticsError::Reconciliation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AnalyticsError::Transport { .. }
        | AnalyticsError::QueryRejected(_)
        | AnalyticsError::LlmError(_)
        | AnalyticsError::HttpError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Question Endpoint
/// =============================

async fn ask(
    State(state): State<ApiState>,
    Json(req): Json<AskRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let session_id = session_key(req.session_id.as_deref());
    info!(session_id = %session_id, "Received question: {}", req.question);

    match state.engine.handle(&req.question, &session_id).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_msg) = req.messages.iter().rev().find(|m| m.role == "user") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        );
    };

    // Only the latest user message is asked; the session store carries context.
    let ask_req = AskRequest {
        question: user_msg.content.clone(),
        session_id: req.chat_id.clone(),
    };
    let session_id = session_key(ask_req.session_id.as_deref());
    info!("chat_handler ids => chat_id={:?} session_id={}", req.chat_id, session_id);

    let (status, Json(mut response)) = ask(
        State(state),
        Json(AskRequest {
            session_id: Some(session_id.clone()),
            ..ask_req
        }),
    )
    .await;
    if response.success {
        if let Some(data) = response.data.as_mut() {
            data["chat_id"] = serde_json::json!(req.chat_id.unwrap_or_else(|| session_id.clone()));
            data["answer"] = data["summary"].clone();
        }
    }
    (status, Json(response))
}

/// =============================
/// Session Endpoints
/// =============================

async fn session_turns(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let session_id = session_key(Some(&id));
    let turns = state.engine.store().turns(&session_id).await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id,
            "turns": turns,
        }))),
    )
}

async fn reset_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let session_id = session_key(Some(&id));
    let cleared = state.engine.store().clear(&session_id).await;
    let status = if cleared {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id,
            "cleared": cleared,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<AnalyticsEngine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/ask", post(ask))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions/:id/turns", get(session_turns))
        .route("/api/sessions/:id", axum::routing::delete(reset_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<AnalyticsEngine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::resolver::{DisconnectedSource, FallbackDataset};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = EngineConfig {
            live_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let engine = AnalyticsEngine::new(
            config,
            Arc::new(DisconnectedSource),
            Arc::new(FallbackDataset::embedded()),
            None,
        )
        .unwrap();
        create_router(Arc::new(engine))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_stable_session_key() {
        assert_eq!(session_key(Some("chat-42")), session_key(Some("chat-42")));
        assert_ne!(session_key(Some("chat-42")), session_key(Some("chat-43")));

        let id = "6f1c2a3e-1b7d-4c59-9a0e-2d4f5b6c7d8e";
        assert_eq!(session_key(Some(id)), id);
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ask_reports_provenance() {
        let (status, body) = call(
            router(),
            post_json(
                "/api/ask",
                serde_json::json!({"question": "What is EBITDA for FY2025?", "session_id": "s1"}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["analysis"]["type"], "descriptive");
        assert_eq!(body["data"]["results"][0]["source"], "fallback");
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let router = router();

        let (status, body) = call(
            router.clone(),
            post_json("/api/ask", serde_json::json!({"question": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            router,
            post_json(
                "/api/ask",
                serde_json::json!({"question": "What is forecast gross margin for wheat?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_and_session_lifecycle() {
        let router = router();

        let (status, body) = call(
            router.clone(),
            post_json(
                "/api/chat",
                serde_json::json!({
                    "chat_id": "chat-7",
                    "messages": [
                        {"role": "assistant", "content": "Hello"},
                        {"role": "user", "content": "What is revenue for FY2025?"}
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["chat_id"], "chat-7");
        assert!(body["data"]["answer"].as_str().unwrap().contains("revenue"));

        let turns = Request::builder()
            .uri("/api/sessions/chat-7/turns")
            .body(Body::empty())
            .unwrap();
        let (_, body) = call(router.clone(), turns).await;
        assert_eq!(body["data"]["turns"].as_array().unwrap().len(), 1);

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/api/sessions/chat-7")
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = call(router.clone(), delete()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router, delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
