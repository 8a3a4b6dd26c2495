//! Planner trait and implementations
//!
//! The planner decomposes a research request into a short, ordered task list.
//! Each stage of a plan shape names candidate tools in preference order; the
//! first one present in the registry is chosen, so a plan never references a
//! tool that cannot be resolved.

use crate::classifier::{extract_query, RequestCategory, RequestClassifier};
use crate::error::OrchestrationError;
use crate::models::{ChatTurn, KnowledgeHit, PlanningContext, Task, TaskType};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub mod knowledge;
pub use knowledge::{
    Embedder, HashingEmbedder, InMemoryKnowledgeIndex, KnowledgeLookup, KnowledgeSource,
};

/// Trait for plan generation
#[async_trait]
pub trait Planner: Send + Sync {
    /// Create a plan for `request`, optionally steered by hints from the
    /// previous iteration's reflection
    async fn plan(
        &self,
        request: &str,
        history: &[ChatTurn],
        hints: Option<&PlanningContext>,
        session_id: &str,
    ) -> Result<Vec<Task>>;
}

//
// ================= Plan shapes =================
//

struct Stage {
    name: &'static str,
    description: &'static str,
    candidates: &'static [&'static str],
}

const COLLECT: Stage = Stage {
    name: "数据采集",
    description: "从财经网站采集相关数据",
    candidates: &["web_scraping", "knowledge_base_tool"],
};

const ANALYZE: Stage = Stage {
    name: "数据分析",
    description: "分析采集到的数据",
    candidates: &["data_analysis", "general_analysis"],
};

const NEWS: Stage = Stage {
    name: "新闻分析",
    description: "分析财经新闻",
    candidates: &["news_analysis", "summary_tool"],
};

const RISK: Stage = Stage {
    name: "风险评估",
    description: "评估投资风险",
    candidates: &["risk_assessment", "general_analysis"],
};

const GENERAL: Stage = Stage {
    name: "通用分析",
    description: "通用分析任务",
    candidates: &["general_analysis", "knowledge_base_tool", "general_query"],
};

const FALLBACK: Stage = Stage {
    name: "通用问答",
    description: "直接回答用户问题",
    candidates: &["general_query"],
};

fn task_type_for(tool_name: &str) -> TaskType {
    match tool_name {
        "web_scraping" => TaskType::DataCollection,
        "data_analysis" => TaskType::DataAnalysis,
        "news_analysis" => TaskType::NewsAnalysis,
        "summary_tool" => TaskType::Summary,
        "risk_assessment" => TaskType::RiskAssessment,
        "knowledge_base_tool" => TaskType::KnowledgeLookup,
        "general_query" => TaskType::GeneralQuery,
        _ => TaskType::GeneralAnalysis,
    }
}

/// Reorder `candidates` by the hints: avoided tools go last, preferred tools
/// go first. Tools outside the candidate list are never introduced.
fn order_candidates(candidates: &[&'static str], hints: Option<&PlanningContext>) -> Vec<&'static str> {
    let mut ordered = candidates.to_vec();
    let Some(hints) = hints else {
        return ordered;
    };

    for suggestion in &hints.adjustment_suggestions {
        if let Some(avoid) = suggestion.avoid_tool.as_deref() {
            if let Some(pos) = ordered.iter().position(|c| *c == avoid) {
                let tool = ordered.remove(pos);
                ordered.push(tool);
            }
        }
    }

    for suggestion in &hints.adjustment_suggestions {
        if let Some(preferred) = suggestion.preferred_tool.as_deref() {
            if let Some(pos) = ordered.iter().position(|c| *c == preferred) {
                let tool = ordered.remove(pos);
                ordered.insert(0, tool);
            }
        }
    }

    ordered
}

//
// ================= Rule Planner =================
//

/// Knowledge lookup settings for the planner
#[derive(Clone)]
pub struct PlannerKnowledge {
    pub source: KnowledgeSource,
    pub top_k: usize,
    /// Hits below this similarity are discarded
    pub similarity_floor: f32,
}

/// Keyword-routed planner
pub struct RulePlanner {
    available_tools: HashSet<String>,
    counter: AtomicU64,
    knowledge: Option<PlannerKnowledge>,
}

impl RulePlanner {
    pub fn new<I, S>(available_tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available_tools: available_tools.into_iter().map(Into::into).collect(),
            counter: AtomicU64::new(0),
            knowledge: None,
        }
    }

    pub fn with_knowledge(mut self, knowledge: PlannerKnowledge) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    fn next_task_id(&self) -> String {
        format!("task_{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn resolve(&self, stage: &Stage, hints: Option<&PlanningContext>) -> Option<&'static str> {
        order_candidates(stage.candidates, hints)
            .into_iter()
            .find(|tool| self.available_tools.contains(*tool))
    }

    fn build_task(
        &self,
        stage: &Stage,
        tool_name: &str,
        mut parameters: Map<String, Value>,
        dependencies: Vec<String>,
        shared: &Map<String, Value>,
        session_id: &str,
    ) -> Task {
        for (key, value) in shared {
            parameters.insert(key.clone(), value.clone());
        }

        Task {
            id: self.next_task_id(),
            name: stage.name.to_string(),
            description: stage.description.to_string(),
            tool_name: tool_name.to_string(),
            parameters,
            dependencies,
            task_type: task_type_for(tool_name),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
        }
    }

    /// Knowledge hits for `request`; lookup failures only cost the context
    async fn knowledge_context(&self, request: &str) -> Vec<KnowledgeHit> {
        let Some(knowledge) = &self.knowledge else {
            return Vec::new();
        };

        match knowledge
            .source
            .retrieve(request, knowledge.top_k, knowledge.similarity_floor)
            .await
        {
            Ok(hits) => {
                debug!(hits = hits.len(), "Knowledge context retrieved");
                hits
            }
            Err(e) => {
                warn!(error = %e, "Knowledge lookup failed, planning without it");
                Vec::new()
            }
        }
    }

    /// Parameters attached to every task of the plan
    async fn shared_parameters(
        &self,
        request: &str,
        history: &[ChatTurn],
        hints: Option<&PlanningContext>,
    ) -> Map<String, Value> {
        let mut shared = Map::new();

        let hits = self.knowledge_context(request).await;
        if !hits.is_empty() {
            shared.insert("knowledge_context".to_string(), json!(hits));
        }

        if !history.is_empty() {
            let recent: Vec<Value> = history
                .iter()
                .rev()
                .take(3)
                .rev()
                .map(|turn| json!({"user": turn.user_message, "assistant": turn.response}))
                .collect();
            shared.insert("conversation_context".to_string(), Value::Array(recent));
        }

        if let Some(hints) = hints {
            if !hints.recommendations.is_empty() {
                shared.insert("strategy_notes".to_string(), json!(hints.recommendations));
            }
            if let Some(failure) = &hints.previous_failure {
                shared.insert("previous_failure".to_string(), json!(failure));
            }
        }

        shared
    }
}

#[async_trait]
impl Planner for RulePlanner {
    async fn plan(
        &self,
        request: &str,
        history: &[ChatTurn],
        hints: Option<&PlanningContext>,
        session_id: &str,
    ) -> Result<Vec<Task>> {
        let category = RequestClassifier::classify(request);
        let shared = self.shared_parameters(request, history, hints).await;
        let query = extract_query(request);

        let mut tasks: Vec<Task> = Vec::new();

        match category {
            RequestCategory::MarketAnalysis => {
                if let Some(tool) = self.resolve(&COLLECT, hints) {
                    let mut params = Map::new();
                    params.insert("query".to_string(), json!(query));
                    tasks.push(self.build_task(&COLLECT, tool, params, vec![], &shared, session_id));
                }

                if let Some(tool) = self.resolve(&ANALYZE, hints) {
                    let previous = tasks.last().map(|t| t.id.clone());
                    let mut params = Map::new();
                    params.insert("query".to_string(), json!(query));
                    params.insert("previous_task_id".to_string(), json!(previous));
                    let dependencies = previous.into_iter().collect();
                    tasks.push(self.build_task(&ANALYZE, tool, params, dependencies, &shared, session_id));
                }
            }
            RequestCategory::News | RequestCategory::Risk => {
                let stage = if category == RequestCategory::News { &NEWS } else { &RISK };
                if let Some(tool) = self.resolve(stage, hints) {
                    let mut params = Map::new();
                    params.insert("query".to_string(), json!(query));
                    tasks.push(self.build_task(stage, tool, params, vec![], &shared, session_id));
                }
            }
            RequestCategory::General => {
                if let Some(tool) = self.resolve(&GENERAL, hints) {
                    let mut params = Map::new();
                    params.insert("query".to_string(), json!(request));
                    tasks.push(self.build_task(&GENERAL, tool, params, vec![], &shared, session_id));
                }
            }
        }

        if tasks.is_empty() {
            let tool = self.resolve(&FALLBACK, None).ok_or_else(|| {
                OrchestrationError::PlanningError(format!(
                    "No registered tool can serve a {:?} request",
                    category
                ))
            })?;

            warn!(category = ?category, "No candidate tool resolved, falling back to general_query");
            let mut params = Map::new();
            params.insert("query".to_string(), json!(request));
            tasks.push(self.build_task(&FALLBACK, tool, params, vec![], &shared, session_id));
        }

        info!(
            session_id = %session_id,
            category = ?category,
            task_count = tasks.len(),
            tools = ?tasks.iter().map(|t| t.tool_name.as_str()).collect::<Vec<_>>(),
            "Plan created"
        );

        Ok(tasks)
    }
}
