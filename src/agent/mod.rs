//! Main orchestrator - implements the control loop
//!
//! INPUT → PLAN → EXECUTE → REFLECT → DECIDE → (RETRY | REPLAN | FINISH)

use crate::config::AgentConfig;
use crate::error::OrchestrationError;
use crate::execution::ExecutionEngine;
use crate::llm::ChatModel;
use crate::memory::MemoryManager;
use crate::models::{
    ChatResponse, ChatTurn, DecisionAction, ErrorBody, FinalResult, HistoricalInsights,
    InteractionRecord, IterationRecord, PlanReflection, PlanningContext, ResultStatus, Session,
    TaskSummary,
};
use crate::planner::{KnowledgeSource, Planner, PlannerKnowledge, RulePlanner};
use crate::reflection::{decide_next_step, planning_context, Reflector};
use crate::response::{LlmResponseFormatter, ResponseFormatter, TemplateFormatter, GENERATION_FAILED};
use crate::tools::{build_chat_model, create_default_registry, ToolRegistry};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_USER: &str = "default";
const EMPTY_CHAT_RESPONSE: &str = "分析完成，未获得具体结果。";

/// Collaborators resolved once at startup
pub struct Capabilities {
    pub tools: Arc<ToolRegistry>,
    pub knowledge: Option<KnowledgeSource>,
    pub formatter: Option<Arc<dyn ResponseFormatter>>,
}

impl Capabilities {
    /// Tools and formatter over one shared chat model
    pub fn from_config(config: &AgentConfig, llm: Option<Arc<dyn ChatModel>>) -> Result<Self> {
        let tools = Arc::new(create_default_registry(config, llm.clone(), None)?);
        let formatter = llm.map(|llm| -> Arc<dyn ResponseFormatter> {
            Arc::new(LlmResponseFormatter::new(llm))
        });

        Ok(Self {
            tools,
            knowledge: None,
            formatter,
        })
    }
}

/// Main orchestrator that coordinates the entire workflow
pub struct Orchestrator {
    planner: Box<dyn Planner>,
    execution_engine: ExecutionEngine,
    reflector: Reflector,
    memory: Arc<MemoryManager>,
    tools: Arc<ToolRegistry>,
    formatter: Option<Arc<dyn ResponseFormatter>>,
    max_iterations: u32,
    retry_delay: Duration,
    chat_history_limit: usize,
}

impl Orchestrator {
    /// Orchestrator with the rule planner over the registered tools
    pub fn new(capabilities: Capabilities, memory: Arc<MemoryManager>, config: &AgentConfig) -> Self {
        let mut planner = RulePlanner::new(capabilities.tools.list());
        if let Some(source) = &capabilities.knowledge {
            planner = planner.with_knowledge(PlannerKnowledge {
                source: source.clone(),
                top_k: config.knowledge_top_k,
                similarity_floor: config.similarity_floor,
            });
        }

        Self::with_planner(Box::new(planner), capabilities, memory, config)
    }

    pub fn with_planner(
        planner: Box<dyn Planner>,
        capabilities: Capabilities,
        memory: Arc<MemoryManager>,
        config: &AgentConfig,
    ) -> Self {
        info!(
            tool_count = capabilities.tools.len(),
            knowledge = capabilities.knowledge.is_some(),
            llm_formatter = capabilities.formatter.is_some(),
            memory_backend = memory.backend_name(),
            "Orchestrator capabilities resolved"
        );

        let execution_engine = ExecutionEngine::new(
            capabilities.tools.clone(),
            memory.clone(),
            config.tool_timeout,
        );

        Self {
            planner,
            execution_engine,
            reflector: Reflector::new(memory.clone()),
            memory,
            tools: capabilities.tools,
            formatter: capabilities.formatter,
            max_iterations: config.max_iterations.max(1),
            retry_delay: config.retry_delay,
            chat_history_limit: config.chat_history_limit,
        }
    }

    /// Wire memory, tools and formatter from configuration
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let memory = Arc::new(MemoryManager::connect(config).await);
        let capabilities = Capabilities::from_config(config, build_chat_model(config)?)?;
        Ok(Self::new(capabilities, memory, config))
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// `(name, description)` of every registered tool
    pub fn available_tools(&self) -> Vec<(&'static str, &'static str)> {
        self.tools.describe()
    }

    /// Run one request through the loop.
    ///
    /// Never fails: planner and reflector errors come back as a
    /// `status: error` result.
    pub async fn process_request(&self, request: &str, session_id: Option<&str>) -> FinalResult {
        self.run_turn(request, session_id, None).await
    }

    pub async fn chat(&self, message: &str, session_id: Option<&str>) -> ChatResponse {
        self.chat_for_user(DEFAULT_USER, message, session_id).await
    }

    /// Chat turn: the exchange is kept in the session's conversation history
    /// and in the user's interaction log
    pub async fn chat_for_user(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> ChatResponse {
        let final_result = self.run_turn(message, session_id, Some(user_id)).await;
        let response = chat_text(&final_result);

        let record = InteractionRecord::new(user_id, &final_result.session_id, message, &response);
        if let Err(e) = self.memory.append_interaction(&record).await {
            warn!(user_id = %user_id, error = %e, "Failed to record interaction");
        }

        ChatResponse {
            status: final_result.status,
            session_id: final_result.session_id.clone(),
            response,
            detailed_result: final_result,
            timestamp: Utc::now(),
        }
    }

    /// Conversation turns stored for a session, oldest first
    pub async fn session_history(&self, session_id: &str) -> Result<Vec<ChatTurn>> {
        Ok(self
            .memory
            .get_session(session_id)
            .await?
            .map(|session| session.conversation_history)
            .unwrap_or_default())
    }

    pub async fn historical_insights(&self, user_id: &str) -> Result<HistoricalInsights> {
        self.reflector.historical_insights(user_id).await
    }

    async fn run_turn(
        &self,
        request: &str,
        session_id: Option<&str>,
        chat_user: Option<&str>,
    ) -> FinalResult {
        let start_time = Instant::now();
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!(session_id = %session_id, request = %request, "Orchestrator: starting turn");

        let mut session = match self.memory.get_session(&session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(&session_id, request),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load session; starting fresh");
                Session::new(&session_id, request)
            }
        };
        session.user_request = request.to_string();
        session.execution_history.clear();

        let final_result = match self.run_loop(request, &mut session).await {
            Ok(()) => self.finalize(request, &session).await,
            Err(e) => {
                warn!(session_id = %session_id, code = e.code(), error = %e, "Turn ended with error");
                error_result(request, &session, &e)
            }
        };

        if chat_user.is_some() {
            session.conversation_history.push(ChatTurn {
                user_message: request.to_string(),
                response: chat_text(&final_result),
                timestamp: Utc::now(),
            });
            let overflow = session
                .conversation_history
                .len()
                .saturating_sub(self.chat_history_limit);
            session.conversation_history.drain(..overflow);
        }

        session.final_result = Some(final_result.clone());
        session.last_update = Utc::now();

        if let Err(e) = self.memory.save_session(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session");
        }

        info!(
            session_id = %session_id,
            iterations = final_result.iterations,
            task_count = final_result.task_count,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Orchestrator: turn complete"
        );

        final_result
    }

    async fn run_loop(&self, request: &str, session: &mut Session) -> Result<()> {
        let history = session.conversation_history.clone();

        // === PLAN ===
        let initial_hints = self.strategy_hints().await;
        let mut tasks = self
            .planner
            .plan(request, &history, initial_hints.as_ref(), &session.session_id)
            .await?;

        let mut previous: Option<PlanReflection> = None;

        for iteration in 0..self.max_iterations {
            debug!(iteration, task_count = tasks.len(), "Executing plan");

            // === EXECUTE ===
            let results = self.execution_engine.execute_plan(&tasks).await;

            // === REFLECT ===
            for result in &results {
                if let Some(task) = tasks.iter().find(|t| t.id == result.task_id) {
                    self.reflector.reflect_on_task(task, result).await;
                }
            }

            let reflection = self.reflector.reflect_on_plan(&tasks, &results).await?;
            let strategy = match self.reflector.update_planning_strategy(&reflection).await {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!(error = %e, "Failed to update planning strategy");
                    None
                }
            };

            // === DECIDE ===
            let decision = decide_next_step(
                &reflection,
                previous.as_ref(),
                self.max_iterations,
                iteration + 1,
            );

            info!(
                session_id = %session.session_id,
                iteration,
                success_rate = reflection.success_rate,
                action = %decision.action,
                reason = %decision.reason,
                "Iteration decided"
            );

            let action = decision.action;
            session.execution_history.push(IterationRecord {
                iteration,
                tasks: tasks.clone(),
                results: results.clone(),
                reflection: reflection.clone(),
                decision,
            });

            match action {
                DecisionAction::Finish => break,
                DecisionAction::Retry => {
                    tokio::time::sleep(self.retry_delay).await;
                }
                DecisionAction::Replan => {
                    let hints = planning_context(&reflection, &results, strategy.as_ref());
                    tasks = self
                        .planner
                        .plan(request, &history, Some(&hints), &session.session_id)
                        .await?;
                }
            }

            previous = Some(reflection);
        }

        Ok(())
    }

    /// Recommendations left by earlier turns, if any
    async fn strategy_hints(&self) -> Option<PlanningContext> {
        let strategy = match self.reflector.latest_strategy().await {
            Ok(strategy) => strategy?,
            Err(e) => {
                warn!(error = %e, "Failed to load planning strategy");
                return None;
            }
        };

        let context = PlanningContext {
            recommendations: strategy.recommendations,
            ..PlanningContext::default()
        };
        (!context.is_empty()).then_some(context)
    }

    async fn finalize(&self, request: &str, session: &Session) -> FinalResult {
        let Some(last) = session.execution_history.last() else {
            let e = OrchestrationError::ExecutionError("No iteration completed".to_string());
            return error_result(request, session, &e);
        };

        let response = match &self.formatter {
            Some(formatter) => match formatter.format(request, last).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Response formatter failed; using template");
                    template_response(request, last).await
                }
            },
            None => template_response(request, last).await,
        };

        let (task_count, successful_tasks) = totals(session);

        FinalResult {
            status: ResultStatus::Success,
            session_id: session.session_id.clone(),
            user_request: request.to_string(),
            iterations: session.execution_history.len(),
            task_count,
            successful_tasks,
            tasks: summarize_tasks(last),
            plan_reflection: Some(last.reflection.clone()),
            decision: Some(last.decision.clone()),
            response,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

async fn template_response(request: &str, last: &IterationRecord) -> String {
    TemplateFormatter
        .format(request, last)
        .await
        .unwrap_or_else(|_| GENERATION_FAILED.to_string())
}

/// Task and success counts summed over every iteration
fn totals(session: &Session) -> (usize, usize) {
    session
        .execution_history
        .iter()
        .fold((0, 0), |(tasks, ok), record| {
            (
                tasks + record.results.len(),
                ok + record.results.iter().filter(|r| r.is_success()).count(),
            )
        })
}

fn summarize_tasks(record: &IterationRecord) -> Vec<TaskSummary> {
    record
        .tasks
        .iter()
        .filter_map(|task| {
            let result = record.results.iter().find(|r| r.task_id == task.id)?;
            Some(TaskSummary {
                id: task.id.clone(),
                name: task.name.clone(),
                description: task.description.clone(),
                tool_used: task.tool_name.clone(),
                status: result.status,
                execution_time: result.execution_time,
                result: result.clone(),
            })
        })
        .collect()
}

fn error_result(request: &str, session: &Session, error: &OrchestrationError) -> FinalResult {
    let (task_count, successful_tasks) = totals(session);
    let last = session.execution_history.last();

    FinalResult {
        status: ResultStatus::Error,
        session_id: session.session_id.clone(),
        user_request: request.to_string(),
        iterations: session.execution_history.len(),
        task_count,
        successful_tasks,
        tasks: last.map(summarize_tasks).unwrap_or_default(),
        plan_reflection: last.map(|r| r.reflection.clone()),
        decision: last.map(|r| r.decision.clone()),
        response: format!("处理请求时出现错误: {}", error),
        error: Some(ErrorBody {
            code: error.code().to_string(),
            message: error.to_string(),
        }),
        timestamp: Utc::now(),
    }
}

fn chat_text(result: &FinalResult) -> String {
    if result.response.trim().is_empty() {
        EMPTY_CHAT_RESPONSE.to_string()
    } else {
        result.response.clone()
    }
}
