//! Core data models for the research agent

use crate::error::TaskErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Task =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DataCollection,
    DataAnalysis,
    NewsAnalysis,
    RiskAssessment,
    GeneralAnalysis,
    KnowledgeLookup,
    GeneralQuery,
    Summary,
}

/// One unit of work in a plan. Immutable once handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    /// Ids of tasks whose results must exist before this one runs
    pub dependencies: Vec<String>,
    pub task_type: TaskType,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

//
// ================= Task Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dependencies: Vec<String>,
}

/// Outcome of one attempt at one task. A retry yields a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_name: String,
    pub tool_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Seconds
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &Task, data: Value, execution_time: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            tool_name: task.tool_name.clone(),
            status: TaskStatus::Success,
            data: Some(data),
            error: None,
            execution_time,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        task: &Task,
        kind: TaskErrorKind,
        message: impl Into<String>,
        missing_dependencies: Vec<String>,
        data: Option<Value>,
        execution_time: f64,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            tool_name: task.tool_name.clone(),
            status: TaskStatus::Error,
            data,
            error: Some(TaskError {
                kind,
                code: kind.code(),
                message: message.into(),
                missing_dependencies,
            }),
            execution_time,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

//
// ================= Reflection =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SuccessGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub success: SuccessGrade,
    pub efficiency: Level,
    pub robustness: Level,
    pub completeness: Completeness,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub priority: Priority,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReflection {
    pub reflection_id: String,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub success_rate: f64,
    pub total_execution_time: f64,
    pub avg_execution_time: f64,
    pub evaluation: Evaluation,
    pub improvements: Vec<String>,
    pub learning_points: Vec<String>,
    pub action_plan: Vec<ActionItem>,
    /// tool name → failures in this iteration
    pub failed_tools: BTreeMap<String, usize>,
    pub dominant_failure_tool: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReflection {
    pub task_id: String,
    pub task_name: String,
    pub tool_name: String,
    pub status: TaskStatus,
    pub execution_time: f64,
    pub efficiency: Level,
    pub result_quality: SuccessGrade,
    pub improvements: Vec<String>,
    pub learning_points: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

//
// ================= Decision =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Finish,
    Retry,
    Replan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_tasks: Option<usize>,
}

impl Decision {
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Finish,
            reason: reason.into(),
            failed_tasks: None,
        }
    }
}

//
// ================= Strategy & Planning Hints =================
//

/// Learned adjustments persisted by the reflector for later planning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub timestamp: DateTime<Utc>,
    pub success_rate: f64,
    pub avg_execution_time: f64,
    pub improvements: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub unstable_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdjustmentSuggestion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid_tool: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningContext {
    pub adjustment_suggestions: Vec<AdjustmentSuggestion>,
    pub recommendations: Vec<String>,
    pub previous_failure: Option<String>,
}

impl PlanningContext {
    pub fn is_empty(&self) -> bool {
        self.adjustment_suggestions.is_empty()
            && self.recommendations.is_empty()
            && self.previous_failure.is_none()
    }
}

//
// ================= Knowledge =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub text: String,
    /// In [0, 1]
    pub similarity: f32,
    pub metadata: Value,
}

//
// ================= Session =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user_message: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
    pub reflection: PlanReflection,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tool_used: String,
    pub status: TaskStatus,
    pub execution_time: f64,
    pub result: TaskResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub status: ResultStatus,
    pub session_id: String,
    pub user_request: String,
    pub iterations: usize,
    /// Summed over every iteration
    pub task_count: usize,
    /// Summed over every iteration
    pub successful_tasks: usize,
    /// Last iteration only
    pub tasks: Vec<TaskSummary>,
    pub plan_reflection: Option<PlanReflection>,
    pub decision: Option<Decision>,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted under `conversation:{session_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_request: String,
    pub execution_history: Vec<IterationRecord>,
    pub final_result: Option<FinalResult>,
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
    pub last_update: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_request: user_request.into(),
            execution_history: Vec::new(),
            final_result: None,
            conversation_history: Vec::new(),
            last_update: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub status: ResultStatus,
    pub session_id: String,
    pub response: String,
    pub detailed_result: FinalResult,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the per-user bounded interaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub user_message: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl InteractionRecord {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        user_message: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            user_message: user_message.into(),
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalInsights {
    pub user_id: String,
    pub user_preferences: Value,
    pub recent_requests: Vec<String>,
    pub latest_strategy: Option<StrategyUpdate>,
    pub timestamp: DateTime<Utc>,
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    /// Keyed by every declared dependency id
    #[serde(default)]
    pub dependency_results: BTreeMap<String, TaskResult>,
}

impl ToolInput {
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            data,
            error: Some(message.into()),
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionAction::Finish => "FINISH",
            DecisionAction::Retry => "RETRY",
            DecisionAction::Replan => "REPLAN",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for SuccessGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuccessGrade::Excellent => "excellent",
            SuccessGrade::Good => "good",
            SuccessGrade::Fair => "fair",
            SuccessGrade::Poor => "poor",
        };
        write!(f, "{}", s)
    }
}
