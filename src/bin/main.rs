use wealth_agent::{agent::Orchestrator, config::AgentConfig, models::ResultStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_REQUEST: &str = "分析最近一周的市场行情";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    let request = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let request = if request.trim().is_empty() {
        DEFAULT_REQUEST.to_string()
    } else {
        request
    };

    info!(
        max_iterations = config.max_iterations,
        llm = config.llm.is_some(),
        "Wealth agent starting"
    );

    let orchestrator = Orchestrator::from_config(&config).await?;
    let result = orchestrator.process_request(&request, None).await;

    println!("\n=== RESULT ===");
    println!("Session: {}", result.session_id);
    println!(
        "Iterations: {} • Tasks: {}/{} successful",
        result.iterations, result.successful_tasks, result.task_count
    );
    for task in &result.tasks {
        println!(
            "  [{:?}] {} ({}) {:.2}s",
            task.status, task.name, task.tool_used, task.execution_time
        );
    }
    if let Some(decision) = &result.decision {
        println!("Decision: {} ({})", decision.action, decision.reason);
    }
    println!("\n{}", result.response);

    match (result.status, result.error) {
        (ResultStatus::Error, Some(error)) => {
            eprintln!("Request failed: {} {}", error.code, error.message);
            std::process::exit(1);
        }
        _ => Ok(()),
    }
}
