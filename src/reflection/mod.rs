//! Reflection engine
//!
//! Scores an executed plan, decides FINISH / RETRY / REPLAN and keeps the
//! learned strategy in memory for the next planning pass.
//! Scoring and deciding are deterministic; only persistence touches memory.

use crate::error::{OrchestrationError, TaskErrorKind};
use crate::memory::MemoryManager;
use crate::models::{
    ActionItem, AdjustmentSuggestion, Completeness, Decision, DecisionAction, Evaluation,
    HistoricalInsights, Level, PlanReflection, PlanningContext, Priority, StrategyUpdate,
    SuccessGrade, Task, TaskReflection, TaskResult,
};
use crate::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owner of reflections and strategy updates in the intermediate namespace
const SYSTEM_SCOPE: &str = "system";
const STRATEGY_STEP: &str = "strategy_update";

pub struct Reflector {
    memory: Arc<MemoryManager>,
}

impl Reflector {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }

    /// Reflect on one task; persisted as `reflection_{task_id}`
    pub async fn reflect_on_task(&self, task: &Task, result: &TaskResult) -> TaskReflection {
        let mut improvements = Vec::new();
        let mut learning_points = Vec::new();

        let efficiency = if result.execution_time > 10.0 {
            improvements.push(format!(
                "Cache results or speed up tool {}",
                task.tool_name
            ));
            Level::Low
        } else if result.execution_time < 1.0 {
            Level::High
        } else {
            Level::Medium
        };

        let result_quality = if result.is_success() {
            learning_points.push(format!(
                "Tool {} handled '{}' well",
                task.tool_name, task.name
            ));
            SuccessGrade::Good
        } else {
            improvements.push(format!(
                "Improve error handling of tool {}",
                task.tool_name
            ));
            learning_points.push(format!(
                "Tool {} failed on '{}'",
                task.tool_name, task.name
            ));
            SuccessGrade::Poor
        };

        let reflection = TaskReflection {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            tool_name: task.tool_name.clone(),
            status: result.status,
            execution_time: result.execution_time,
            efficiency,
            result_quality,
            improvements,
            learning_points,
            timestamp: Utc::now(),
        };

        let step = format!("reflection_{}", task.id);
        if let Err(e) = self
            .memory
            .save_intermediate_result(SYSTEM_SCOPE, &step, &reflection)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to persist task reflection");
        }

        reflection
    }

    /// Score an executed plan.
    ///
    /// `results` must hold exactly one entry per task.
    pub async fn reflect_on_plan(
        &self,
        tasks: &[Task],
        results: &[TaskResult],
    ) -> Result<PlanReflection> {
        let reflection = evaluate_plan(tasks, results)?;

        if let Err(e) = self
            .memory
            .save_intermediate_result(SYSTEM_SCOPE, &reflection.reflection_id, &reflection)
            .await
        {
            warn!(reflection_id = %reflection.reflection_id, error = %e, "Failed to persist plan reflection");
        }

        info!(
            reflection_id = %reflection.reflection_id,
            success_rate = reflection.success_rate,
            grade = %reflection.evaluation.success,
            "Plan reflection completed"
        );

        Ok(reflection)
    }

    /// Learn from a reflection and store the result under `strategy_update`
    pub async fn update_planning_strategy(
        &self,
        reflection: &PlanReflection,
    ) -> Result<StrategyUpdate> {
        let update = strategy_from(reflection);

        self.memory
            .save_intermediate_result(SYSTEM_SCOPE, STRATEGY_STEP, &update)
            .await?;

        debug!(
            recommendations = update.recommendations.len(),
            "Planning strategy updated"
        );
        Ok(update)
    }

    pub async fn latest_strategy(&self) -> Result<Option<StrategyUpdate>> {
        self.memory
            .get_intermediate_result(SYSTEM_SCOPE, STRATEGY_STEP)
            .await
    }

    /// Preferences, recent requests and the latest strategy for one user
    pub async fn historical_insights(&self, user_id: &str) -> Result<HistoricalInsights> {
        let user_preferences = self
            .memory
            .get_user_preferences(user_id)
            .await?
            .unwrap_or_else(|| json!({}));

        let recent_requests = self
            .memory
            .recent_interactions(user_id)
            .await?
            .into_iter()
            .map(|record| record.user_message)
            .collect();

        Ok(HistoricalInsights {
            user_id: user_id.to_string(),
            user_preferences,
            recent_requests,
            latest_strategy: self.latest_strategy().await?,
            timestamp: Utc::now(),
        })
    }
}

//
// ================= Scoring =================
//

fn evaluate_plan(tasks: &[Task], results: &[TaskResult]) -> Result<PlanReflection> {
    if tasks.len() != results.len() {
        return Err(OrchestrationError::ReflectionError(format!(
            "{} tasks but {} results",
            tasks.len(),
            results.len()
        )));
    }

    let total_tasks = tasks.len();
    let successful_tasks = results.iter().filter(|r| r.is_success()).count();
    let failed_tasks = total_tasks - successful_tasks;
    let unmet_dependencies = results
        .iter()
        .filter(|r| r.error_kind() == Some(TaskErrorKind::DependencyUnmet))
        .count();

    let total_execution_time: f64 = results.iter().map(|r| r.execution_time).sum();
    let (success_rate, avg_execution_time, failure_ratio) = if total_tasks == 0 {
        (0.0, 0.0, 0.0)
    } else {
        let n = total_tasks as f64;
        (
            successful_tasks as f64 / n,
            total_execution_time / n,
            failed_tasks as f64 / n,
        )
    };

    let mut improvements = Vec::new();
    let mut learning_points = Vec::new();
    let mut action_plan = Vec::new();

    let success = if total_tasks > 0 && successful_tasks == total_tasks {
        learning_points.push("Every task succeeded; the current planning strategy works".to_string());
        SuccessGrade::Excellent
    } else if success_rate >= 0.8 {
        learning_points.push("Most tasks succeeded; the planning strategy is broadly sound".to_string());
        SuccessGrade::Good
    } else if success_rate >= 0.5 {
        improvements.push("Improve task dependencies or error recovery".to_string());
        SuccessGrade::Fair
    } else {
        improvements.push("Reassess the task planning strategy".to_string());
        SuccessGrade::Poor
    };

    let efficiency = if avg_execution_time > 5.0 {
        improvements.push("Parallelize independent tasks or speed up tools".to_string());
        action_plan.push(ActionItem {
            priority: Priority::Medium,
            action: "Cache tool results or parallelize independent tasks".to_string(),
            tool: None,
        });
        Level::Low
    } else if avg_execution_time < 2.0 {
        Level::High
    } else {
        Level::Medium
    };

    let robustness = if failure_ratio <= 0.2 {
        Level::High
    } else if failure_ratio <= 0.5 {
        Level::Medium
    } else {
        Level::Low
    };

    let completeness = if unmet_dependencies == 0 {
        Completeness::Complete
    } else if unmet_dependencies < total_tasks {
        Completeness::Partial
    } else {
        Completeness::Incomplete
    };

    if unmet_dependencies > 0 {
        action_plan.push(ActionItem {
            priority: Priority::High,
            action: "Optimize the dependency graph".to_string(),
            tool: None,
        });
    }

    let mut failed_tools: BTreeMap<String, usize> = BTreeMap::new();
    for result in results.iter().filter(|r| !r.is_success()) {
        *failed_tools.entry(result.tool_name.clone()).or_insert(0) += 1;
    }

    // highest count wins; ties go to the alphabetically first tool
    let dominant_failure_tool = failed_tools
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(tool, _)| tool.clone());

    if !failed_tools.is_empty() {
        improvements.push(format!("Tool failures: {:?}", failed_tools));
        learning_points.push(format!(
            "Watch the stability of: {}",
            failed_tools.keys().cloned().collect::<Vec<_>>().join(", ")
        ));

        for (tool, count) in &failed_tools {
            let priority = if Some(tool) == dominant_failure_tool.as_ref() {
                Priority::High
            } else {
                Priority::Medium
            };
            action_plan.push(ActionItem {
                priority,
                action: format!("Stabilize or replace {} ({} failures)", tool, count),
                tool: Some(tool.clone()),
            });
        }
    }

    action_plan.sort_by_key(|item| item.priority);

    Ok(PlanReflection {
        reflection_id: format!("plan_reflection_{}", Uuid::new_v4().simple()),
        total_tasks,
        successful_tasks,
        failed_tasks,
        success_rate,
        total_execution_time,
        avg_execution_time,
        evaluation: Evaluation {
            success,
            efficiency,
            robustness,
            completeness,
        },
        improvements,
        learning_points,
        action_plan,
        failed_tools,
        dominant_failure_tool,
        timestamp: Utc::now(),
    })
}

fn strategy_from(reflection: &PlanReflection) -> StrategyUpdate {
    let mut recommendations = Vec::new();

    if reflection.success_rate < 0.5 {
        recommendations.push("Reduce task complexity or add error handling".to_string());
    } else if reflection.success_rate < 0.8 {
        recommendations.push("Optimize the dependency graph".to_string());
    }

    if reflection.avg_execution_time > 5.0 {
        recommendations.push("Parallelize independent tasks or cache results".to_string());
    }

    StrategyUpdate {
        timestamp: Utc::now(),
        success_rate: reflection.success_rate,
        avg_execution_time: reflection.avg_execution_time,
        improvements: reflection.improvements.clone(),
        recommendations,
        unstable_tools: reflection.failed_tools.keys().cloned().collect(),
    }
}

//
// ================= Deciding =================
//

/// Choose the next loop step.
///
/// `current_iteration` counts iterations already completed.
pub fn decide_next_step(
    reflection: &PlanReflection,
    previous: Option<&PlanReflection>,
    max_iterations: u32,
    current_iteration: u32,
) -> Decision {
    if current_iteration >= max_iterations {
        return Decision::finish("Reached max retries");
    }

    if reflection.total_tasks > 0 && reflection.successful_tasks == reflection.total_tasks {
        return Decision::finish("All tasks succeeded");
    }

    if reflection.success_rate >= 0.8 {
        return Decision::finish("Most tasks succeeded; result is acceptable");
    }

    let repeated_failure = match (previous, &reflection.dominant_failure_tool) {
        (Some(prev), Some(tool)) => prev.dominant_failure_tool.as_ref() == Some(tool),
        _ => false,
    };

    if repeated_failure {
        return Decision {
            action: DecisionAction::Replan,
            reason: format!(
                "Tool {} failed again; planning around it",
                reflection.dominant_failure_tool.as_deref().unwrap_or_default()
            ),
            failed_tasks: Some(reflection.failed_tasks),
        };
    }

    Decision {
        action: DecisionAction::Retry,
        reason: "Some tasks failed; retrying".to_string(),
        failed_tasks: Some(reflection.failed_tasks),
    }
}

/// Hints for the next planning pass after a REPLAN decision
pub fn planning_context(
    reflection: &PlanReflection,
    results: &[TaskResult],
    strategy: Option<&StrategyUpdate>,
) -> PlanningContext {
    let adjustment_suggestions = reflection
        .dominant_failure_tool
        .iter()
        .map(|tool| AdjustmentSuggestion {
            preferred_tool: None,
            avoid_tool: Some(tool.clone()),
            reason: format!(
                "{} failed {} time(s) in the last iteration",
                tool,
                reflection.failed_tools.get(tool).copied().unwrap_or(0)
            ),
        })
        .collect();

    let previous_failure = results.iter().find_map(|result| {
        result
            .error_message()
            .map(|message| format!("{}: {}", result.tool_name, message))
    });

    PlanningContext {
        adjustment_suggestions,
        recommendations: strategy
            .map(|s| s.recommendations.clone())
            .unwrap_or_default(),
        previous_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TtlPolicy;
    use crate::models::{InteractionRecord, TaskType};
    use serde_json::Map;
    use tokio_test::{assert_err, assert_ok};

    fn task(id: &str, tool: &str) -> Task {
        Task {
            id: id.to_string(),
            name: format!("{} task", tool),
            description: String::new(),
            tool_name: tool.to_string(),
            parameters: Map::new(),
            dependencies: vec![],
            task_type: TaskType::GeneralAnalysis,
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
        }
    }

    /// Tasks plus results where the first `failed` tasks errored
    fn outcome(tools: &[&str], failed: usize, secs: f64) -> (Vec<Task>, Vec<TaskResult>) {
        let tasks: Vec<Task> = tools
            .iter()
            .enumerate()
            .map(|(i, tool)| task(&format!("task_{}", i), tool))
            .collect();
        let results = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                if i < failed {
                    TaskResult::failure(t, TaskErrorKind::ToolExecutionError, "boom", vec![], None, secs)
                } else {
                    TaskResult::success(t, json!({}), secs)
                }
            })
            .collect();
        (tasks, results)
    }

    fn reflector() -> (Reflector, Arc<MemoryManager>) {
        let memory = Arc::new(MemoryManager::in_memory(TtlPolicy::default(), 10));
        (Reflector::new(memory.clone()), memory)
    }

    #[tokio::test]
    async fn test_all_success_is_excellent_and_finishes() {
        let (reflector, _) = reflector();
        let (tasks, results) = outcome(&["web_scraping", "data_analysis"], 0, 0.5);

        let reflection = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert_eq!(reflection.evaluation.success, SuccessGrade::Excellent);
        assert_eq!(reflection.evaluation.efficiency, Level::High);
        assert_eq!(reflection.evaluation.completeness, Completeness::Complete);
        assert!(reflection.dominant_failure_tool.is_none());

        for iteration in 0..3 {
            let decision = decide_next_step(&reflection, None, 3, iteration);
            assert_eq!(decision.action, DecisionAction::Finish);
        }
    }

    #[tokio::test]
    async fn test_grades_and_mandated_notes() {
        let (reflector, _) = reflector();

        let (tasks, results) = outcome(&["a", "b", "c", "d", "e"], 1, 1.0);
        let good = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert_eq!(good.evaluation.success, SuccessGrade::Good);

        let (tasks, results) = outcome(&["a", "b"], 1, 1.0);
        let fair = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert_eq!(fair.evaluation.success, SuccessGrade::Fair);
        assert!(fair.improvements.iter().any(|s| s.contains("error recovery")));

        let (tasks, results) = outcome(&["a", "b", "c", "d", "e"], 3, 6.0);
        let poor = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert_eq!(poor.evaluation.success, SuccessGrade::Poor);
        assert_eq!(poor.evaluation.efficiency, Level::Low);
        assert_eq!(poor.evaluation.robustness, Level::Low);
        assert!(poor.improvements.iter().any(|s| s.contains("Reassess")));
    }

    #[tokio::test]
    async fn test_mismatched_counts() {
        let (reflector, _) = reflector();
        let (tasks, mut results) = outcome(&["a", "b"], 0, 0.1);
        results.pop();

        let err = assert_err!(reflector.reflect_on_plan(&tasks, &results).await);
        assert_eq!(err.code(), "REFLECTION_ERROR");
    }

    #[tokio::test]
    async fn test_dominant_failure_tool_and_completeness() {
        let (reflector, _) = reflector();
        let tasks = vec![
            task("task_0", "web_scraping"),
            task("task_1", "web_scraping"),
            task("task_2", "data_analysis"),
        ];
        let results = vec![
            TaskResult::failure(&tasks[0], TaskErrorKind::ToolExecutionError, "503", vec![], None, 0.1),
            TaskResult::failure(&tasks[1], TaskErrorKind::ToolExecutionError, "503", vec![], None, 0.1),
            TaskResult::failure(
                &tasks[2],
                TaskErrorKind::DependencyUnmet,
                "missing",
                vec!["task_x".into()],
                None,
                0.0,
            ),
        ];

        let reflection = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert_eq!(reflection.failed_tools.get("web_scraping"), Some(&2));
        assert_eq!(reflection.dominant_failure_tool.as_deref(), Some("web_scraping"));
        assert_eq!(reflection.evaluation.completeness, Completeness::Partial);
        assert_eq!(reflection.action_plan[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_decision_order() {
        let (reflector, _) = reflector();
        let (tasks, results) = outcome(&["web_scraping", "a", "b", "c", "d"], 3, 0.1);
        let reflection = reflector.reflect_on_plan(&tasks, &results).await.unwrap();
        assert!((reflection.success_rate - 0.4).abs() < 1e-9);

        let retry = decide_next_step(&reflection, None, 3, 0);
        assert_eq!(retry.action, DecisionAction::Retry);
        assert_eq!(retry.failed_tasks, Some(3));

        let replan = decide_next_step(&reflection, Some(&reflection), 3, 1);
        assert_eq!(replan.action, DecisionAction::Replan);

        let exhausted = decide_next_step(&reflection, Some(&reflection), 3, 3);
        assert_eq!(exhausted.action, DecisionAction::Finish);
        assert!(exhausted.reason.contains("max retries"));
    }

    #[tokio::test]
    async fn test_strategy_update_round_trip() {
        let (reflector, _) = reflector();
        let (tasks, results) = outcome(&["web_scraping", "data_analysis"], 1, 6.0);
        let reflection = reflector.reflect_on_plan(&tasks, &results).await.unwrap();

        let update = assert_ok!(reflector.update_planning_strategy(&reflection).await);
        assert!(update.recommendations.iter().any(|r| r.contains("dependency graph")));
        assert!(update.recommendations.iter().any(|r| r.contains("Parallelize")));
        assert_eq!(update.unstable_tools, vec!["web_scraping".to_string()]);

        let stored = reflector.latest_strategy().await.unwrap().unwrap();
        assert_eq!(stored.recommendations, update.recommendations);

        let context = planning_context(&reflection, &results, Some(&stored));
        assert_eq!(
            context.adjustment_suggestions[0].avoid_tool.as_deref(),
            Some("web_scraping")
        );
        assert_eq!(context.previous_failure.as_deref(), Some("web_scraping: boom"));
        assert!(!context.is_empty());
    }

    #[tokio::test]
    async fn test_task_reflection_persisted() {
        let (reflector, memory) = reflector();
        let t = task("task_7", "general_query");
        let result = TaskResult::failure(&t, TaskErrorKind::ToolNotFound, "missing", vec![], None, 12.0);

        let reflection = reflector.reflect_on_task(&t, &result).await;
        assert_eq!(reflection.efficiency, Level::Low);
        assert_eq!(reflection.result_quality, SuccessGrade::Poor);

        let stored: Option<TaskReflection> = memory
            .get_intermediate_result("system", "reflection_task_7")
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_historical_insights() {
        let (reflector, memory) = reflector();
        memory
            .save_user_preferences("u1", &json!({"risk": "low"}))
            .await
            .unwrap();
        memory
            .append_interaction(&InteractionRecord::new("u1", "s1", "今天有什么财经热点", "..."))
            .await
            .unwrap();

        let insights = reflector.historical_insights("u1").await.unwrap();
        assert_eq!(insights.user_preferences["risk"], json!("low"));
        assert_eq!(insights.recent_requests, vec!["今天有什么财经热点".to_string()]);
        assert!(insights.latest_strategy.is_none());
    }
}
