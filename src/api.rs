//! REST API server for the research agent
//!
//! Exposes `process_request` and `chat` over HTTP

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
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::models::ResultStatus;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessRequest {
    pub request: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
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

    /// Error that still carries the structured result
    pub fn error_with<T: Serialize>(message: String, data: T) -> Self {
        Self {
            data: serde_json::to_value(data).ok(),
            ..Self::error(message)
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// =============================
/// Health & Tools
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let memory = state.orchestrator.memory();
    Json(serde_json::json!({
        "status": "healthy",
        "memory_backend": memory.backend_name(),
        "memory_degraded": memory.is_degraded(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_tools(State(state): State<ApiState>) -> Json<ApiResponse> {
    let tools: Vec<serde_json::Value> = state
        .orchestrator
        .available_tools()
        .into_iter()
        .map(|(name, description)| serde_json::json!({ "name": name, "description": description }))
        .collect();

    Json(ApiResponse::success(tools))
}

/// =============================
/// Process Endpoint
/// =============================

async fn process_handler(
    State(state): State<ApiState>,
    Json(req): Json<ProcessRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.request.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Request text is empty".into())),
        );
    }

    info!("Received process request: {}", req.request);

    let result = state
        .orchestrator
        .process_request(&req.request, non_blank(req.session_id.as_deref()))
        .await;

    match (&result.status, &result.error) {
        (ResultStatus::Error, Some(error)) => {
            warn!(session_id = %result.session_id, code = %error.code, "Process request failed");
            let message = format!("{}: {}", error.code, error.message);
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error_with(message, &result)),
            )
        }
        _ => (StatusCode::OK, Json(ApiResponse::success(&result))),
    }
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_msg) = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.content.trim().is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        );
    };

    let user_id = non_blank(req.user_id.as_deref()).unwrap_or("default");
    let session_id = non_blank(req.session_id.as_deref());

    info!(
        "chat_handler ids => session_id={:?} user_id={}",
        session_id, user_id
    );

    // Only the current user turn is planned; earlier turns come from the
    // session's stored conversation history
    let response = state
        .orchestrator
        .chat_for_user(user_id, &user_msg.content, session_id)
        .await;

    match (&response.status, &response.detailed_result.error) {
        (ResultStatus::Error, error) => {
            let message = error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| response.response.clone());
            warn!(session_id = %response.session_id, "Chat turn failed: {}", message);
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error_with(message, &response)),
            )
        }
        _ => (StatusCode::OK, Json(ApiResponse::success(&response))),
    }
}

/// =============================
/// Session History
/// =============================

async fn session_history(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.session_history(&session_id).await {
        Ok(history) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "session_id": session_id,
                "history": history,
            }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to load history: {}", e))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/process", post(process_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions/:session_id/history", get(session_history))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Capabilities;
    use crate::config::AgentConfig;
    use crate::memory::MemoryManager;
    use crate::models::{ToolInput, ToolOutput};
    use crate::tools::{Tool, ToolRegistry};
    use crate::Result;
    use serde_json::json;

    struct AnswerTool;

    #[async_trait::async_trait]
    impl Tool for AnswerTool {
        fn name(&self) -> &'static str {
            "general_analysis"
        }

        fn description(&self) -> &'static str {
            "answers everything"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(json!({"answer": "定投适合长期投资者。"})))
        }
    }

    fn state() -> ApiState {
        let config = AgentConfig::default();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(AnswerTool));
        let capabilities = Capabilities {
            tools: Arc::new(registry),
            knowledge: None,
            formatter: None,
        };
        let memory = Arc::new(MemoryManager::in_memory(config.ttl.clone(), 10));
        ApiState {
            orchestrator: Arc::new(Orchestrator::new(capabilities, memory, &config)),
        }
    }

    #[tokio::test]
    async fn test_process_endpoint() {
        let (status, Json(body)) = process_handler(
            State(state()),
            Json(ProcessRequest {
                request: "什么是基金定投".into(),
                session_id: Some("api-1".into()),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let data = body.data.unwrap();
        assert_eq!(data["session_id"], json!("api-1"));
        assert_eq!(data["response"], json!("定投适合长期投资者。"));
    }

    #[tokio::test]
    async fn test_process_rejects_blank_request() {
        let (status, Json(body)) = process_handler(
            State(state()),
            Json(ProcessRequest {
                request: "   ".into(),
                session_id: None,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_chat_then_history() {
        let state = state();
        let request = ChatRequest {
            session_id: Some("chat-9".into()),
            user_id: Some("u1".into()),
            messages: vec![
                ChatMessage {
                    role: "assistant".into(),
                    content: "您好".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: "什么是基金定投".into(),
                },
            ],
        };

        let (status, Json(body)) = chat_handler(State(state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap()["session_id"], json!("chat-9"));

        let (status, Json(body)) =
            session_history(State(state), Path("chat-9".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let history = &body.data.unwrap()["history"];
        assert_eq!(history.as_array().map(Vec::len), Some(1));
        assert_eq!(history[0]["user_message"], json!("什么是基金定投"));
    }

    #[tokio::test]
    async fn test_chat_without_user_message() {
        let request = ChatRequest {
            session_id: None,
            user_id: None,
            messages: vec![],
        };
        let (status, _) = chat_handler(State(state()), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tools_endpoint() {
        let Json(body) = list_tools(State(state())).await;
        let data = body.data.unwrap();
        assert_eq!(data[0]["name"], json!("general_analysis"));
    }

    struct NoPlanner;

    #[async_trait::async_trait]
    impl crate::planner::Planner for NoPlanner {
        async fn plan(
            &self,
            _request: &str,
            _history: &[crate::models::ChatTurn],
            _hints: Option<&crate::models::PlanningContext>,
            _session_id: &str,
        ) -> Result<Vec<crate::models::Task>> {
            Err(crate::OrchestrationError::PlanningError("no plan shape".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_chat_turn_reports_error() {
        let config = AgentConfig::default();
        let capabilities = Capabilities {
            tools: Arc::new(ToolRegistry::new()),
            knowledge: None,
            formatter: None,
        };
        let memory = Arc::new(MemoryManager::in_memory(config.ttl.clone(), 10));
        let state = ApiState {
            orchestrator: Arc::new(Orchestrator::with_planner(
                Box::new(NoPlanner),
                capabilities,
                memory,
                &config,
            )),
        };
        let request = ChatRequest {
            session_id: Some("chat-err".into()),
            user_id: None,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "分析市场".into(),
            }],
        };

        let (status, Json(body)) = chat_handler(State(state), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert!(body.error.unwrap().starts_with("PLANNING_ERROR"));
        assert_eq!(body.data.unwrap()["session_id"], json!("chat-err"));
    }
}
