//! Runtime configuration
//!
//! Loaded from the process environment (and `.env` when present).
//! Every value has a default so the agent runs with no configuration at all.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Time-to-live per memory namespace
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub task_result: Duration,
    pub conversation: Duration,
    pub user_preferences: Duration,
    pub intermediate: Duration,
    pub interaction: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            task_result: Duration::from_secs(24 * 3600),
            conversation: Duration::from_secs(3600),
            user_preferences: Duration::from_secs(7 * 86_400),
            intermediate: Duration::from_secs(30 * 60),
            interaction: Duration::from_secs(7 * 86_400),
        }
    }
}

/// OpenAI-compatible chat endpoint settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on PLAN/EXECUTE/REFLECT/DECIDE passes per turn
    pub max_iterations: u32,
    /// Pause before re-executing a plan on RETRY
    pub retry_delay: Duration,
    /// Hard limit on a single tool invocation
    pub tool_timeout: Duration,
    pub knowledge_top_k: usize,
    /// Knowledge hits below this similarity are dropped by the planner
    pub similarity_floor: f32,
    pub interaction_log_cap: usize,
    pub chat_history_limit: usize,
    pub ttl: TtlPolicy,
    /// Period of the background sweep over expired memory entries
    pub cleanup_interval: Duration,
    pub redis_url: Option<String>,
    pub llm: Option<LlmConfig>,
    pub tools_api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub api_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            retry_delay: Duration::from_secs(1),
            tool_timeout: Duration::from_secs(60),
            knowledge_top_k: 5,
            similarity_floor: 0.1,
            interaction_log_cap: 10,
            chat_history_limit: 20,
            ttl: TtlPolicy::default(),
            cleanup_interval: Duration::from_secs(300),
            redis_url: None,
            llm: None,
            tools_api_base_url: None,
            database_url: None,
            api_port: 8080,
        }
    }
}

impl AgentConfig {
    /// Build the configuration from `.env` + process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let max_iterations = parse_var("AGENT_MAX_ITERATIONS", defaults.max_iterations)?;
        if max_iterations == 0 {
            return Err(OrchestrationError::ConfigError(
                "AGENT_MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }

        let retry_delay_ms: u64 = parse_var(
            "AGENT_RETRY_DELAY_MS",
            defaults.retry_delay.as_millis() as u64,
        )?;
        let tool_timeout_secs: u64 = parse_var(
            "AGENT_TOOL_TIMEOUT_SECS",
            defaults.tool_timeout.as_secs(),
        )?;

        let cleanup_secs: u64 = parse_var(
            "AGENT_CLEANUP_INTERVAL_SECS",
            defaults.cleanup_interval.as_secs(),
        )?;
        if cleanup_secs == 0 {
            return Err(OrchestrationError::ConfigError(
                "AGENT_CLEANUP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        let api_port = match non_empty("PORT").or_else(|| non_empty("API_PORT")) {
            Some(raw) => raw.parse().map_err(|_| {
                OrchestrationError::ConfigError(format!("Invalid port: {}", raw))
            })?,
            None => defaults.api_port,
        };

        Ok(Self {
            max_iterations,
            retry_delay: Duration::from_millis(retry_delay_ms),
            tool_timeout: Duration::from_secs(tool_timeout_secs),
            knowledge_top_k: parse_var("AGENT_KNOWLEDGE_TOP_K", defaults.knowledge_top_k)?,
            similarity_floor: defaults.similarity_floor,
            interaction_log_cap: defaults.interaction_log_cap,
            chat_history_limit: defaults.chat_history_limit,
            ttl: TtlPolicy::default(),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            redis_url: redis_url_from_env()?,
            llm: llm_from_env(),
            tools_api_base_url: non_empty("TOOLS_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            database_url: non_empty("DATABASE_URL"),
            api_port,
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match non_empty(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            OrchestrationError::ConfigError(format!("Invalid value for {}: {}", name, raw))
        }),
        None => Ok(default),
    }
}

/// `REDIS_URL` wins; otherwise assembled from `REDIS_HOST` / `REDIS_PORT` / `REDIS_DB`
fn redis_url_from_env() -> Result<Option<String>> {
    if let Some(url) = non_empty("REDIS_URL") {
        return Ok(Some(url));
    }

    let Some(host) = non_empty("REDIS_HOST") else {
        return Ok(None);
    };
    let port: u16 = parse_var("REDIS_PORT", 6379)?;
    let db: u32 = parse_var("REDIS_DB", 0)?;

    Ok(Some(format!("redis://{}:{}/{}", host, port, db)))
}

fn llm_from_env() -> Option<LlmConfig> {
    let api_key = non_empty("LLM_API_KEY").or_else(|| non_empty("DASHSCOPE_API_KEY"))?;
    let base_url = non_empty("LLM_BASE_URL")
        .or_else(|| non_empty("DASHSCOPE_BASE_URL"))
        .unwrap_or_else(|| "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string());
    let model = non_empty("LLM_MODEL").unwrap_or_else(|| "qwen-plus".to_string());

    Some(LlmConfig {
        api_key,
        base_url: base_url.trim_end_matches('/').to_string(),
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.interaction_log_cap, 10);
        assert!((config.similarity_floor - 0.1).abs() < f32::EPSILON);
        assert!(config.redis_url.is_none());
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_default_ttl_policy() {
        let ttl = TtlPolicy::default();
        assert_eq!(ttl.task_result, Duration::from_secs(86_400));
        assert_eq!(ttl.conversation, Duration::from_secs(3600));
        assert_eq!(ttl.user_preferences, Duration::from_secs(604_800));
        assert_eq!(ttl.intermediate, Duration::from_secs(1800));
        assert_eq!(ttl.interaction, Duration::from_secs(604_800));
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        let value: u32 = parse_var("WEALTH_AGENT_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
