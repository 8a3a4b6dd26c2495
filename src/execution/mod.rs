//! Execution engine
//!
//! Runs a plan strictly in order. Each task either runs its tool or gets a
//! synthetic error result; nothing a single task does can abort the batch.

use crate::error::TaskErrorKind;
use crate::memory::MemoryManager;
use crate::models::{Task, TaskResult, ToolInput};
use crate::tools::ToolRegistry;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ExecutionEngine {
    tool_registry: Arc<ToolRegistry>,
    memory: Arc<MemoryManager>,
    tool_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        tool_registry: Arc<ToolRegistry>,
        memory: Arc<MemoryManager>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            tool_registry,
            memory,
            tool_timeout,
        }
    }

    /// Execute every task, ordered by creation time.
    ///
    /// Returns one result per task in execution order. Each result is
    /// persisted before the next task starts, so later tasks (and later
    /// iterations) can resolve it as a dependency.
    pub async fn execute_plan(&self, tasks: &[Task]) -> Vec<TaskResult> {
        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|task| task.timestamp);

        let mut completed: HashMap<String, TaskResult> = HashMap::with_capacity(tasks.len());
        let mut results = Vec::with_capacity(tasks.len());

        for task in ordered {
            let result = self.run(task, &completed).await;
            self.persist(&result).await;

            completed.insert(task.id.clone(), result.clone());
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.is_success()).count();
        info!(
            task_count = results.len(),
            successful,
            "Plan execution completed"
        );

        results
    }

    /// Execute a single task; dependencies come from memory only
    pub async fn execute_task(&self, task: &Task) -> TaskResult {
        let result = self.run(task, &HashMap::new()).await;
        self.persist(&result).await;
        result
    }

    async fn run(&self, task: &Task, completed: &HashMap<String, TaskResult>) -> TaskResult {
        debug!(
            task_id = %task.id,
            tool_name = %task.tool_name,
            "Processing task"
        );

        let (dependency_results, missing) = self.resolve_dependencies(task, completed).await;

        if !missing.is_empty() {
            warn!(
                task_id = %task.id,
                ?missing,
                "Skipping task due to unmet dependencies"
            );
            return TaskResult::failure(
                task,
                TaskErrorKind::DependencyUnmet,
                format!("Unmet dependencies: {}", missing.join(", ")),
                missing,
                None,
                0.0,
            );
        }

        let Some(tool) = self.tool_registry.get(&task.tool_name) else {
            warn!(task_id = %task.id, tool_name = %task.tool_name, "Tool not registered");
            return TaskResult::failure(
                task,
                TaskErrorKind::ToolNotFound,
                format!("Tool '{}' is not registered", task.tool_name),
                vec![],
                None,
                0.0,
            );
        };

        let input = ToolInput {
            tool_name: task.tool_name.clone(),
            parameters: task.parameters.clone(),
            dependency_results,
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.tool_timeout, tool.execute(&input)).await;
        let execution_time = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(output)) => {
                let data = augment_output(output.data, task, execution_time);
                if output.success {
                    debug!(task_id = %task.id, execution_time, "Task succeeded");
                    TaskResult::success(task, data, execution_time)
                } else {
                    let message = output
                        .error
                        .unwrap_or_else(|| "Tool reported failure".to_string());
                    warn!(task_id = %task.id, error = %message, "Tool reported failure");
                    TaskResult::failure(
                        task,
                        TaskErrorKind::ToolExecutionError,
                        message,
                        vec![],
                        Some(data),
                        execution_time,
                    )
                }
            }
            Ok(Err(e)) => {
                warn!(task_id = %task.id, tool_name = %task.tool_name, error = %e, "Tool execution failed");
                TaskResult::failure(
                    task,
                    TaskErrorKind::ToolExecutionError,
                    e.to_string(),
                    vec![],
                    None,
                    execution_time,
                )
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    tool_name = %task.tool_name,
                    timeout_secs = self.tool_timeout.as_secs_f64(),
                    "Tool execution timed out"
                );
                TaskResult::failure(
                    task,
                    TaskErrorKind::ToolExecutionError,
                    format!("Tool timed out after {:?}", self.tool_timeout),
                    vec![],
                    None,
                    execution_time,
                )
            }
        }
    }

    /// Look up every declared dependency in this batch, then in memory.
    /// Any recorded result counts, failed or not.
    async fn resolve_dependencies(
        &self,
        task: &Task,
        completed: &HashMap<String, TaskResult>,
    ) -> (BTreeMap<String, TaskResult>, Vec<String>) {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();

        for dep in &task.dependencies {
            if let Some(result) = completed.get(dep) {
                resolved.insert(dep.clone(), result.clone());
                continue;
            }

            match self.memory.get_task_result(dep).await {
                Ok(Some(result)) => {
                    resolved.insert(dep.clone(), result);
                }
                Ok(None) => missing.push(dep.clone()),
                Err(e) => {
                    warn!(task_id = %task.id, dependency = %dep, error = %e, "Dependency lookup failed");
                    missing.push(dep.clone());
                }
            }
        }

        (resolved, missing)
    }

    async fn persist(&self, result: &TaskResult) {
        if let Err(e) = self.memory.save_task_result(result).await {
            warn!(task_id = %result.task_id, error = %e, "Failed to persist task result");
        }
    }
}

/// Stamp execution metadata onto a tool's output
fn augment_output(data: Value, task: &Task, execution_time: f64) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        other => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert("data".to_string(), other);
            wrapped
        }
    };

    map.insert("execution_time".to_string(), json!(execution_time));
    map.insert("task_id".to_string(), json!(task.id));
    map.insert("task_name".to_string(), json!(task.name));
    map.insert("tool_name".to_string(), json!(task.tool_name));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TtlPolicy;
    use crate::error::OrchestrationError;
    use crate::models::{TaskStatus, TaskType, ToolOutput};
    use crate::tools::Tool;
    use crate::Result;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports which dependency results it was given
    struct EchoTool {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl EchoTool {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "echo"
        }

        async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let deps: BTreeMap<&String, TaskStatus> = input
                .dependency_results
                .iter()
                .map(|(id, result)| (id, result.status))
                .collect();
            Ok(ToolOutput::ok(json!({ "seen": deps })))
        }
    }

    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &'static str {
            "web_scraping"
        }

        fn description(&self) -> &'static str {
            "always fails"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            Err(OrchestrationError::ToolError("upstream returned 503".into()))
        }
    }

    struct SoftFailTool;

    #[async_trait::async_trait]
    impl Tool for SoftFailTool {
        fn name(&self) -> &'static str {
            "soft_fail"
        }

        fn description(&self) -> &'static str {
            "returns an unsuccessful output"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            Ok(ToolOutput::failed("no rows", json!({"record_count": 0})))
        }
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn description(&self) -> &'static str {
            "never finishes in time"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(ToolOutput::ok(json!({})))
        }
    }

    struct ScalarTool;

    #[async_trait::async_trait]
    impl Tool for ScalarTool {
        fn name(&self) -> &'static str {
            "scalar"
        }

        fn description(&self) -> &'static str {
            "returns a bare string"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(json!("plain text")))
        }
    }

    fn task(id: &str, tool: &str, deps: &[&str], offset_ms: i64) -> Task {
        Task {
            id: id.to_string(),
            name: format!("{} task", tool),
            description: String::new(),
            tool_name: tool.to_string(),
            parameters: Map::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            task_type: TaskType::GeneralAnalysis,
            timestamp: Utc::now() + ChronoDuration::milliseconds(offset_ms),
            session_id: "s1".to_string(),
        }
    }

    fn engine_with(tools: Vec<Arc<dyn Tool>>) -> (ExecutionEngine, Arc<MemoryManager>) {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let memory = Arc::new(MemoryManager::in_memory(TtlPolicy::default(), 10));
        let engine = ExecutionEngine::new(Arc::new(registry), memory.clone(), Duration::from_secs(5));
        (engine, memory)
    }

    #[tokio::test]
    async fn test_analysis_runs_after_scrape_failure() {
        let (engine, _) = engine_with(vec![
            Arc::new(FailingTool),
            Arc::new(EchoTool::new("data_analysis")),
        ]);

        let tasks = vec![
            task("task_0", "web_scraping", &[], 0),
            task("task_1", "data_analysis", &["task_0"], 10),
        ];
        let results = engine.execute_plan(&tasks).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error_kind(), Some(TaskErrorKind::ToolExecutionError));
        assert_eq!(results[0].error.as_ref().unwrap().code, 2001);

        assert!(results[1].is_success());
        let seen = &results[1].data.as_ref().unwrap()["seen"];
        assert_eq!(seen["task_0"], json!("error"));
    }

    #[tokio::test]
    async fn test_unmet_dependency_is_not_executed() {
        let echo = Arc::new(EchoTool::new("data_analysis"));
        let (engine, _) = engine_with(vec![echo.clone()]);

        let tasks = vec![
            task("task_0", "data_analysis", &["ghost"], 0),
            task("task_1", "data_analysis", &[], 10),
        ];
        let results = engine.execute_plan(&tasks).await;

        let error = results[0].error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::DependencyUnmet);
        assert_eq!(error.code, 6001);
        assert_eq!(error.missing_dependencies, vec!["ghost".to_string()]);

        // the batch continues and only the second task reached the tool
        assert!(results[1].is_success());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dependency_resolved_from_memory() {
        let (engine, memory) = engine_with(vec![Arc::new(EchoTool::new("data_analysis"))]);

        let previous = task("task_prev", "web_scraping", &[], 0);
        memory
            .save_task_result(&TaskResult::success(&previous, json!({"data": "x"}), 0.1))
            .await
            .unwrap();

        let result = engine
            .execute_task(&task("task_9", "data_analysis", &["task_prev"], 0))
            .await;

        assert!(result.is_success());
        assert_eq!(result.data.unwrap()["seen"]["task_prev"], json!("success"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_batch_continues() {
        let (engine, _) = engine_with(vec![Arc::new(EchoTool::new("general_analysis"))]);

        let tasks = vec![
            task("task_0", "does_not_exist", &[], 0),
            task("task_1", "general_analysis", &[], 10),
        ];
        let results = engine.execute_plan(&tasks).await;

        assert_eq!(results[0].error_kind(), Some(TaskErrorKind::ToolNotFound));
        assert_eq!(results[0].error.as_ref().unwrap().code, 2000);
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn test_unsuccessful_output_keeps_data() {
        let (engine, _) = engine_with(vec![Arc::new(SoftFailTool)]);
        let result = engine.execute_task(&task("task_0", "soft_fail", &[], 0)).await;

        assert_eq!(result.status, TaskStatus::Error);
        assert_eq!(result.error_message(), Some("no rows"));
        let data = result.data.unwrap();
        assert_eq!(data["record_count"], json!(0));
        assert_eq!(data["task_id"], json!("task_0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout() {
        let (engine, _) = engine_with(vec![Arc::new(SlowTool)]);
        let result = engine.execute_task(&task("task_0", "slow", &[], 0)).await;

        assert_eq!(result.error_kind(), Some(TaskErrorKind::ToolExecutionError));
        assert!(result.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_output_is_augmented_or_wrapped() {
        let (engine, _) = engine_with(vec![Arc::new(ScalarTool), Arc::new(EchoTool::new("echo"))]);

        let wrapped = engine.execute_task(&task("task_0", "scalar", &[], 0)).await;
        let data = wrapped.data.unwrap();
        assert_eq!(data["data"], json!("plain text"));
        assert_eq!(data["tool_name"], json!("scalar"));
        assert!(data["execution_time"].is_number());

        let augmented = engine.execute_task(&task("task_1", "echo", &[], 0)).await;
        let data = augmented.data.unwrap();
        assert!(data.get("seen").is_some());
        assert_eq!(data["task_name"], json!("echo task"));
    }

    #[tokio::test]
    async fn test_results_persisted_and_ordered_by_timestamp() {
        let (engine, memory) = engine_with(vec![Arc::new(EchoTool::new("general_analysis"))]);

        // handed over out of order
        let tasks = vec![
            task("task_1", "general_analysis", &["task_0"], 50),
            task("task_0", "general_analysis", &[], 0),
        ];
        let results = engine.execute_plan(&tasks).await;

        assert_eq!(results[0].task_id, "task_0");
        assert!(results[1].is_success());
        assert!(memory.get_task_result("task_0").await.unwrap().is_some());
        assert!(memory.get_task_result("task_1").await.unwrap().is_some());
    }
}
