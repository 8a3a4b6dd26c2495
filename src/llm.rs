//! LLM client
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (DashScope's
//! compatible mode by default). Uses a long-lived reqwest::Client for
//! connection pooling.

use crate::config::LlmConfig;
use crate::error::OrchestrationError;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// One completion with a rough confidence score
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub confidence: f32,
}

/// Chat-completion seam used by tools and the response formatter
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<LlmReply>;
}

/// Reusable chat client (connection-pooled)
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    temperature: f32,
}

impl LlmClient {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            temperature: 0.3,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait::async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, system: &str, user: &str) -> Result<LlmReply> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        };

        debug!(model = %self.config.model, prompt_chars = user.len(), "Calling LLM");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("LLM request failed: {}", e);
                OrchestrationError::LlmError(format!("LLM request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, "LLM error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "LLM returned {}: {}",
                status, error_text
            )));
        }

        let completion: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse LLM response: {}", e);
            OrchestrationError::LlmError(format!("LLM parse error: {}", e))
        })?;

        let choice = completion
            .choices
            .first()
            .ok_or_else(|| OrchestrationError::LlmError("No choices in LLM response".to_string()))?;

        let content = choice.message.content.clone().unwrap_or_default();
        if content.trim().is_empty() {
            return Err(OrchestrationError::LlmError(
                "Empty response from LLM".to_string(),
            ));
        }

        let confidence = calculate_confidence(choice.finish_reason.as_deref(), content.len());
        info!(model = %self.config.model, confidence, "LLM response received");

        Ok(LlmReply {
            content,
            confidence,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Heuristic confidence from finish reason and answer length
fn calculate_confidence(finish_reason: Option<&str>, response_length: usize) -> f32 {
    let base_confidence: f32 = 0.85;

    let finish_confidence = match finish_reason {
        Some("stop") => 1.0,
        Some("length") => 0.8,
        Some("content_filter") => 0.6,
        _ => 0.7,
    };

    let length_confidence = if response_length < 50 {
        0.6
    } else if response_length > 2000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence).clamp(0.5, 0.98)
}

/// Strip a ```json fence and parse; `None` when the text is not JSON
pub fn parse_json_reply(content: &str) -> Option<serde_json::Value> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "qwen-plus",
            messages: vec![ChatMessage {
                role: "user",
                content: "今日市场热点?",
            }],
            temperature: 0.3,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], json!("qwen-plus"));
        assert_eq!(value["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn test_response_deserialization() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("ok"));
    }

    #[test]
    fn test_confidence_bounds() {
        assert!((calculate_confidence(Some("stop"), 500) - 0.85).abs() < 1e-6);
        assert_eq!(calculate_confidence(Some("content_filter"), 10), 0.5);
    }

    #[test]
    fn test_parse_json_reply() {
        let fenced = "```json\n{\"title\": \"a\", \"summary\": \"b\"}\n```";
        assert_eq!(
            parse_json_reply(fenced),
            Some(json!({"title": "a", "summary": "b"}))
        );
        assert_eq!(parse_json_reply("plain text"), None);
    }
}
