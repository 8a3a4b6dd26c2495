//! Tool trait and registry
//!
//! Tools are resolved by name at startup into a registry of trait objects.
//! HTTP-backed tools call the scraping service, LLM-backed tools call the
//! chat endpoint, and `risk_assessment` reads Postgres.
//!
//! Tools own their backend. A tool whose backend is not configured is left
//! out of the registry, so the planner routes around it.

use crate::config::AgentConfig;
use crate::error::OrchestrationError;
use crate::llm::{parse_json_reply, ChatModel, LlmClient};
use crate::models::{ToolInput, ToolOutput};
use crate::planner::KnowledgeSource;
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod database;
pub use database::DatabaseTool;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up tools by name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// `(name, description)` pairs, sorted by name
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        let mut described: Vec<_> = self
            .tools
            .values()
            .map(|t| (t.name(), t.description()))
            .collect();
        described.sort_unstable();
        described
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn require_query(input: &ToolInput) -> Result<&str> {
    input.str_param("query").ok_or_else(|| {
        OrchestrationError::InvalidToolInput("Expected 'query' in tool parameters".to_string())
    })
}

/// Text handed over by upstream tasks, concatenated in dependency-id order.
///
/// Failed dependencies contribute their partial data when they kept any.
fn dependency_text(input: &ToolInput) -> Option<String> {
    let parts: Vec<String> = input
        .dependency_results
        .values()
        .filter_map(|result| result.data.as_ref())
        .filter_map(render_payload)
        .filter(|s| !s.trim().is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn render_payload(data: &Value) -> Option<String> {
    for key in ["data", "summary", "parsed_data", "result", "answer"] {
        match data.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Array(items)) if !items.is_empty() => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                return Some(joined);
            }
            Some(value @ Value::Object(_)) => return Some(value.to_string()),
            _ => {}
        }
    }

    data.as_str().map(str::to_string)
}

/// Input text for LLM tools: explicit text, then upstream results, then the query
fn source_text(input: &ToolInput) -> Option<String> {
    input
        .str_param("text")
        .or_else(|| input.str_param("content"))
        .map(str::to_string)
        .or_else(|| dependency_text(input))
        .or_else(|| input.str_param("query").map(str::to_string))
}

// ================= Scraping service =================

#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::ToolError(format!("Service request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::ToolError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolError(format!(
                "Service returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

/// `web_scraping`: collect financial articles for a query
pub struct WebScrapingTool {
    api: ServiceClient,
}

impl WebScrapingTool {
    pub fn new(api: ServiceClient) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl Tool for WebScrapingTool {
    fn name(&self) -> &'static str {
        "web_scraping"
    }

    fn description(&self) -> &'static str {
        "Collect financial news and market data via /api/v1/scrape"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_query(input)?;

        let response = self
            .api
            .post_json(
                "/api/v1/scrape",
                &json!({
                    "query": query,
                    "data_type": "financial_news",
                }),
            )
            .await?;

        let data = response.get("data").cloned().unwrap_or(response);
        let count = data.as_array().map(|items| items.len()).unwrap_or(1);

        if count == 0 {
            return Ok(ToolOutput::failed(
                format!("No articles found for '{}'", query),
                json!({ "data": [], "count": 0, "query": query }),
            ));
        }

        Ok(ToolOutput::ok(json!({
            "data": data,
            "count": count,
            "query": query,
            "source": "scrape_service",
        })))
    }
}

// ================= LLM-backed tools =================

const PARSE_SYSTEM_PROMPT: &str = "你是一个文本结构化处理工具，只负责对已有文本进行字段提取与重组，\
不进行任何分析、判断、推测或价值评价，也不新增任何信息。";

const PARSE_USER_PROMPT: &str = "请严格基于输入文本本身，对每条新闻进行结构化整理，仅提取已有信息。\
如果某字段在原文中不存在，则返回空字符串。请按 JSON 数组输出，每个元素形如 \
{\"title\": \"原文标题\", \"summary\": \"简要描述\"}。\n\n需要处理的原文如下：\n";

const SUMMARY_SYSTEM_PROMPT: &str = "你是一个金融分析师，负责从多篇财经新闻或报告中提取并总结市场热点、\
趋势与投资建议等关键信息。请确保内容健康合规。";

const SUMMARY_USER_PROMPT: &str = "请根据以下财经新闻或报告提炼市场热点，总结行情趋势和投资建议，\
按 JSON 输出：{\"topic\": \"主题\", \"market_trend\": \"行情趋势\", \
\"investment_advice\": \"投资建议\", \"hotspot_summary\": \"热点总结\"}。\n\n文章内容：\n";

const ADVISOR_SYSTEM_PROMPT: &str = r#"You are a professional financial advisor and analyst.

Guidelines:
- Provide accurate and educational financial information
- Be structured and concise
- Emphasize research and risk awareness
- Answer in the language of the question"#;

/// Structure raw text into title/summary records
pub struct LlmParseTool {
    tool_name: &'static str,
    tool_description: &'static str,
    llm: Arc<dyn ChatModel>,
}

impl LlmParseTool {
    pub fn new(
        tool_name: &'static str,
        tool_description: &'static str,
        llm: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            tool_name,
            tool_description,
            llm,
        }
    }
}

#[async_trait::async_trait]
impl Tool for LlmParseTool {
    fn name(&self) -> &'static str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        self.tool_description
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let text = source_text(input).ok_or_else(|| {
            OrchestrationError::InvalidToolInput("Nothing to parse".to_string())
        })?;

        debug!(tool_name = self.tool_name, text_len = text.len(), "Parsing text");
        let reply = self
            .llm
            .chat(PARSE_SYSTEM_PROMPT, &format!("{}{}", PARSE_USER_PROMPT, text))
            .await?;

        let parsed = parse_json_reply(&reply.content).unwrap_or(Value::String(reply.content));

        Ok(ToolOutput::ok(json!({
            "parsed_data": parsed,
            "original_text_length": text.chars().count(),
            "confidence": reply.confidence,
        })))
    }
}

/// Condense articles into hotspots, trend and advice
pub struct LlmSummarizeTool {
    tool_name: &'static str,
    tool_description: &'static str,
    llm: Arc<dyn ChatModel>,
}

impl LlmSummarizeTool {
    pub fn new(
        tool_name: &'static str,
        tool_description: &'static str,
        llm: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            tool_name,
            tool_description,
            llm,
        }
    }
}

#[async_trait::async_trait]
impl Tool for LlmSummarizeTool {
    fn name(&self) -> &'static str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        self.tool_description
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let content = source_text(input).ok_or_else(|| {
            OrchestrationError::InvalidToolInput("Nothing to summarize".to_string())
        })?;

        let reply = self
            .llm
            .chat(SUMMARY_SYSTEM_PROMPT, &format!("{}{}", SUMMARY_USER_PROMPT, content))
            .await?;

        let summary_length = reply.content.chars().count();
        let summary = parse_json_reply(&reply.content).unwrap_or(Value::String(reply.content));

        Ok(ToolOutput::ok(json!({
            "summary": summary,
            "original_content_length": content.chars().count(),
            "summary_length": summary_length,
        })))
    }
}

/// `general_query`: answer the request directly
pub struct GeneralQueryTool {
    llm: Arc<dyn ChatModel>,
}

impl GeneralQueryTool {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Tool for GeneralQueryTool {
    fn name(&self) -> &'static str {
        "general_query"
    }

    fn description(&self) -> &'static str {
        "Answer a financial question directly with the language model"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_query(input)?;

        let mut prompt = format!("User query: {}", query);
        if let Some(context) = input.parameters.get("knowledge_context") {
            prompt.push_str(&format!("\n\nReference material:\n{}", context));
        }

        let reply = self.llm.chat(ADVISOR_SYSTEM_PROMPT, &prompt).await?;

        Ok(ToolOutput::ok(json!({
            "answer": reply.content,
            "confidence": reply.confidence,
            "tool": "general_query",
        })))
    }
}

// ================= Knowledge base =================

/// `knowledge_base_tool`: vector lookup over the local knowledge store
pub struct KnowledgeBaseTool {
    knowledge: KnowledgeSource,
    top_k: usize,
    similarity_floor: f32,
}

impl KnowledgeBaseTool {
    pub fn new(knowledge: KnowledgeSource, top_k: usize, similarity_floor: f32) -> Self {
        Self {
            knowledge,
            top_k,
            similarity_floor,
        }
    }
}

#[async_trait::async_trait]
impl Tool for KnowledgeBaseTool {
    fn name(&self) -> &'static str {
        "knowledge_base_tool"
    }

    fn description(&self) -> &'static str {
        "Retrieve related passages from the local knowledge base"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_query(input)?;

        let hits = self
            .knowledge
            .retrieve(query, self.top_k, self.similarity_floor)
            .await?;

        if hits.is_empty() {
            return Ok(ToolOutput::failed(
                format!("No knowledge matched '{}'", query),
                json!({ "data": [], "count": 0, "query": query }),
            ));
        }

        let passages: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        Ok(ToolOutput::ok(json!({
            "data": passages,
            "hits": hits,
            "count": hits.len(),
            "query": query,
        })))
    }
}

// ================= Registry =================

/// Chat model shared by the LLM-backed tools and the response formatter
pub fn build_chat_model(config: &AgentConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    match &config.llm {
        Some(llm_config) => {
            let client = LlmClient::new(llm_config.clone(), config.tool_timeout)?;
            info!(model = %client.model(), "LLM client ready");
            Ok(Some(Arc::new(client)))
        }
        None => Ok(None),
    }
}

/// Register the tools whose backend is configured.
///
/// Skipped tools are logged once here; the planner falls through to the
/// next candidate for a stage when a tool is missing.
pub fn create_default_registry(
    config: &AgentConfig,
    llm: Option<Arc<dyn ChatModel>>,
    knowledge: Option<KnowledgeSource>,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    match &config.tools_api_base_url {
        Some(url) => registry.register(Arc::new(WebScrapingTool::new(ServiceClient::new(
            url,
            config.tool_timeout,
        )?))),
        None => warn!("TOOLS_API_BASE_URL not set; web_scraping disabled"),
    }

    match llm {
        Some(llm) => {
            registry.register(Arc::new(LlmParseTool::new(
                "data_analysis",
                "Structure collected market data into title/summary records",
                llm.clone(),
            )));
            registry.register(Arc::new(LlmParseTool::new(
                "general_analysis",
                "General-purpose structuring of the request or upstream results",
                llm.clone(),
            )));
            registry.register(Arc::new(LlmSummarizeTool::new(
                "news_analysis",
                "Summarize financial news into hotspots, trend and advice",
                llm.clone(),
            )));
            registry.register(Arc::new(LlmSummarizeTool::new(
                "summary_tool",
                "Summarize upstream task results",
                llm.clone(),
            )));
            registry.register(Arc::new(GeneralQueryTool::new(llm)));
        }
        None => warn!("No LLM configured; LLM-backed tools disabled"),
    }

    match config.database_url.as_deref() {
        Some(url) => match DatabaseTool::from_url(url) {
            Ok(tool) => registry.register(Arc::new(tool)),
            Err(e) => warn!("risk_assessment disabled: {}", e),
        },
        None => debug!("DATABASE_URL not set; risk_assessment disabled"),
    }

    match knowledge {
        Some(source) => registry.register(Arc::new(KnowledgeBaseTool::new(
            source,
            config.knowledge_top_k,
            config.similarity_floor,
        ))),
        None => debug!("No knowledge source; knowledge_base_tool disabled"),
    }

    info!(tools = ?registry.list(), "Tool registry ready");
    Ok(registry)
}
