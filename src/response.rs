//! Final answer formatting
//!
//! The template formatter renders task outputs directly; the LLM formatter
//! asks the model to write an answer from the collected title/summary pairs.

use crate::llm::ChatModel;
use crate::models::{IterationRecord, TaskResult};
use crate::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Shown when no task produced anything usable
pub fn not_found_message(request: &str) -> String {
    format!(
        "关于您的问题 '{}'，我未能找到相关信息。请尝试提供更具体的问题或关键词，以便我能更好地为您服务。",
        request
    )
}

/// Shown when even the template formatter fails
pub const GENERATION_FAILED: &str =
    "我已完成任务执行，但在生成回答时遇到了技术问题。请稍后再试或提供更具体的问题。";

/// Turns the last iteration into the user-facing answer
#[async_trait::async_trait]
pub trait ResponseFormatter: Send + Sync {
    async fn format(&self, request: &str, iteration: &IterationRecord) -> Result<String>;
}

//
// ================= Template =================
//

/// Summary-like fields, checked before `parsed_data` and `data`
const SUMMARY_KEYS: &[&str] = &[
    "summary",
    "analysis",
    "conclusion",
    "market_summary",
    "investment_advice",
    "answer",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateFormatter;

impl TemplateFormatter {
    /// Render every successful result, skipping repeated passages
    pub fn render(&self, request: &str, results: &[TaskResult]) -> String {
        let mut seen = HashSet::new();
        let mut parts = Vec::new();

        for data in results
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.data.as_ref())
        {
            for part in extract_parts(data) {
                if seen.insert(part.clone()) {
                    parts.push(part);
                }
            }
        }

        if parts.is_empty() {
            not_found_message(request)
        } else {
            parts.join("\n\n")
        }
    }
}

#[async_trait::async_trait]
impl ResponseFormatter for TemplateFormatter {
    async fn format(&self, request: &str, iteration: &IterationRecord) -> Result<String> {
        Ok(self.render(request, &iteration.results))
    }
}

fn extract_parts(data: &Value) -> Vec<String> {
    let summaries: Vec<String> = SUMMARY_KEYS
        .iter()
        .filter_map(|key| data.get(*key))
        .map(render_value)
        .filter(|s| !s.trim().is_empty())
        .collect();
    if !summaries.is_empty() {
        return summaries;
    }

    if let Some(parsed) = data.get("parsed_data") {
        let pairs = title_summary_pairs(parsed);
        if !pairs.is_empty() {
            return pairs
                .into_iter()
                .map(|(title, summary)| format!("**{}**\n{}", title, summary))
                .collect();
        }
        let rendered = render_value(parsed);
        return if rendered.trim().is_empty() {
            vec![]
        } else {
            vec![rendered]
        };
    }

    match data.get("data") {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        Some(Value::Array(items)) if !items.is_empty() => {
            vec![format!("找到 {} 条相关数据。", items.len())]
        }
        _ => vec![],
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => match (map.get("title"), map.get("summary")) {
            (Some(Value::String(title)), Some(summary)) => {
                format!("**{}**\n{}", title, render_value(summary))
            }
            _ => map
                .iter()
                .map(|(key, v)| format!("{}: {}", key, render_value(v)))
                .collect::<Vec<_>>()
                .join("\n"),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `title`/`summary` pairs from a parsed record or a list of them
fn title_summary_pairs(parsed: &Value) -> Vec<(String, String)> {
    let pair = |item: &Value| -> Option<(String, String)> {
        let title = item.get("title")?.as_str()?;
        let summary = item.get("summary")?;
        Some((title.to_string(), render_value(summary)))
    };

    match parsed {
        Value::Array(items) => items.iter().filter_map(pair).collect(),
        Value::Object(_) => pair(parsed).into_iter().collect(),
        _ => vec![],
    }
}

//
// ================= LLM =================
//

const RESPONSE_SYSTEM_PROMPT: &str = r#"You are a professional financial research assistant.
Answer the user's request using only the task outputs provided.
Be structured and concise, note risks where relevant, and answer in the language of the request."#;

pub struct LlmResponseFormatter {
    llm: Arc<dyn ChatModel>,
    fallback: TemplateFormatter,
}

impl LlmResponseFormatter {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self {
            llm,
            fallback: TemplateFormatter,
        }
    }
}

/// Title/summary passages of successful results, deduplicated on the pair
fn collect_task_outputs(results: &[TaskResult]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut outputs = Vec::new();

    for parsed in results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.data.as_ref())
        .filter_map(|data| data.get("parsed_data"))
    {
        for (title, summary) in title_summary_pairs(parsed) {
            if seen.insert(format!("{}|{}", title, summary)) {
                outputs.push(format!("标题: {}\n摘要: {}", title, summary));
            } else {
                debug!(title = %title, "Skipping duplicate task output");
            }
        }
    }

    outputs
}

#[async_trait::async_trait]
impl ResponseFormatter for LlmResponseFormatter {
    async fn format(&self, request: &str, iteration: &IterationRecord) -> Result<String> {
        let outputs = collect_task_outputs(&iteration.results);
        if outputs.is_empty() {
            debug!("No title/summary outputs; using template response");
            return self.fallback.format(request, iteration).await;
        }

        info!(outputs = outputs.len(), "Generating response from task outputs");
        let prompt = format!(
            "用户问题: {}\n\n任务结果:\n{}",
            request,
            outputs.join("\n\n")
        );
        let reply = self.llm.chat(RESPONSE_SYSTEM_PROMPT, &prompt).await?;
        Ok(reply.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrchestrationError, TaskErrorKind};
    use crate::llm::LlmReply;
    use crate::models::{
        Completeness, Decision, Evaluation, Level, PlanReflection, SuccessGrade, Task, TaskType,
    };
    use chrono::Utc;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct CapturingModel {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ChatModel for CapturingModel {
        async fn chat(&self, _system: &str, user: &str) -> Result<LlmReply> {
            self.prompts.lock().unwrap().push(user.to_string());
            if self.fail {
                return Err(OrchestrationError::LlmError("quota exceeded".into()));
            }
            Ok(LlmReply {
                content: "市场整体震荡上行。".into(),
                confidence: 0.9,
            })
        }
    }

    fn task(id: &str, tool: &str) -> Task {
        Task {
            id: id.into(),
            name: tool.into(),
            description: String::new(),
            tool_name: tool.into(),
            parameters: Map::new(),
            dependencies: vec![],
            task_type: TaskType::DataAnalysis,
            timestamp: Utc::now(),
            session_id: "s1".into(),
        }
    }

    fn record(results: Vec<TaskResult>) -> IterationRecord {
        IterationRecord {
            iteration: 0,
            tasks: vec![],
            reflection: PlanReflection {
                reflection_id: "plan_reflection_test".into(),
                total_tasks: results.len(),
                successful_tasks: results.iter().filter(|r| r.is_success()).count(),
                failed_tasks: 0,
                success_rate: 1.0,
                total_execution_time: 0.0,
                avg_execution_time: 0.0,
                evaluation: Evaluation {
                    success: SuccessGrade::Excellent,
                    efficiency: Level::High,
                    robustness: Level::High,
                    completeness: Completeness::Complete,
                },
                improvements: vec![],
                learning_points: vec![],
                action_plan: vec![],
                failed_tools: BTreeMap::new(),
                dominant_failure_tool: None,
                timestamp: Utc::now(),
            },
            decision: Decision::finish("done"),
            results,
        }
    }

    fn parsed(id: &str, data: Value) -> TaskResult {
        TaskResult::success(&task(id, "data_analysis"), json!({ "parsed_data": data }), 0.2)
    }

    #[tokio::test]
    async fn test_template_dedupes_parsed_records() {
        let item = json!({"title": "A股周报", "summary": "沪指上涨1.2%"});
        let iteration = record(vec![
            parsed("task_0", json!([item.clone()])),
            parsed("task_1", item),
        ]);

        let response = TemplateFormatter.format("分析最近一周的市场行情", &iteration).await.unwrap();
        assert_eq!(response, "**A股周报**\n沪指上涨1.2%");
    }

    #[tokio::test]
    async fn test_template_prefers_summary_fields_and_skips_failures() {
        let ok = TaskResult::success(
            &task("task_0", "news_analysis"),
            json!({"summary": {"market_trend": "偏强"}, "data": "ignored"}),
            0.1,
        );
        let failed = TaskResult::failure(
            &task("task_1", "web_scraping"),
            TaskErrorKind::ToolExecutionError,
            "503",
            vec![],
            Some(json!({"summary": "stale"})),
            0.1,
        );

        let response = TemplateFormatter.render("今天有什么财经热点", &[ok, failed]);
        assert_eq!(response, "market_trend: 偏强");
    }

    #[tokio::test]
    async fn test_template_not_found() {
        let response = TemplateFormatter.render("某只不存在的基金", &[]);
        assert!(response.contains("某只不存在的基金"));
        assert!(response.contains("未能找到相关信息"));
    }

    #[tokio::test]
    async fn test_llm_formatter_sends_deduped_outputs() {
        let model = Arc::new(CapturingModel {
            prompts: Mutex::new(vec![]),
            fail: false,
        });
        let formatter = LlmResponseFormatter::new(model.clone());

        let item = json!({"title": "A股周报", "summary": "沪指上涨1.2%"});
        let iteration = record(vec![
            parsed("task_0", json!([item.clone(), item])),
        ]);

        let response = formatter.format("分析最近一周的市场行情", &iteration).await.unwrap();
        assert_eq!(response, "市场整体震荡上行。");

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].matches("标题: A股周报").count(), 1);
    }

    #[tokio::test]
    async fn test_llm_formatter_without_outputs_uses_template() {
        let model = Arc::new(CapturingModel {
            prompts: Mutex::new(vec![]),
            fail: true,
        });
        let formatter = LlmResponseFormatter::new(model.clone());

        let answer = TaskResult::success(
            &task("task_0", "general_query"),
            json!({"answer": "定投适合长期投资者。"}),
            0.1,
        );
        let response = formatter.format("什么是定投", &record(vec![answer])).await.unwrap();

        assert_eq!(response, "定投适合长期投资者。");
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_llm_formatter_error_propagates() {
        let formatter = LlmResponseFormatter::new(Arc::new(CapturingModel {
            prompts: Mutex::new(vec![]),
            fail: true,
        }));
        let iteration = record(vec![parsed(
            "task_0",
            json!({"title": "t", "summary": "s"}),
        )]);

        let err = formatter.format("q", &iteration).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXECUTION_ERROR");
    }
}
