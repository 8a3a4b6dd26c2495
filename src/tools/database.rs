//! `risk_assessment`: read-only lookups against the research database

use super::Tool;
use crate::error::OrchestrationError;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use serde_json::{json, Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

const DEFAULT_TABLE: &str = "financial_data";
const ROW_LIMIT: i64 = 100;

pub struct DatabaseTool {
    pool: PgPool,
}

impl DatabaseTool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connecting pool; nothing is dialled until the first query
    pub fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::ConfigError(format!("Invalid DATABASE_URL: {}", e))
            })?;
        info!("risk_assessment backend: postgres");
        Ok(Self::new(pool))
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers (optionally schema-qualified) are accepted
fn validate_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(name)
    } else {
        Err(OrchestrationError::InvalidToolInput(format!(
            "Invalid identifier: {}",
            name
        )))
    }
}

fn condition_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `SELECT to_jsonb(t) FROM <table> t WHERE col::text = $n ... LIMIT n`
fn build_select(table: &str, conditions: &Map<String, Value>) -> Result<(String, Vec<String>)> {
    let table = validate_identifier(table)?;

    let mut clauses = Vec::with_capacity(conditions.len());
    let mut binds = Vec::with_capacity(conditions.len());
    for (index, (column, value)) in conditions.iter().enumerate() {
        let column = validate_identifier(column)?;
        clauses.push(format!("t.{}::text = ${}", column, index + 1));
        binds.push(condition_text(value));
    }

    let mut sql = format!("SELECT to_jsonb(t) AS row FROM {} t", table);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(&format!(" LIMIT {}", ROW_LIMIT));

    Ok((sql, binds))
}

#[async_trait::async_trait]
impl Tool for DatabaseTool {
    fn name(&self) -> &'static str {
        "risk_assessment"
    }

    fn description(&self) -> &'static str {
        "Query stored financial data for risk assessment"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let table = input.str_param("table").unwrap_or(DEFAULT_TABLE);
        let empty = Map::new();
        let conditions = input
            .parameters
            .get("conditions")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let (sql, binds) = build_select(table, conditions)?;
        debug!(table = %table, conditions = conditions.len(), "Running risk data query");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            OrchestrationError::DatabaseError(format!("Risk data query failed: {}", e))
        })?;

        let records = rows
            .iter()
            .map(|row| row.try_get::<Value, _>("row"))
            .collect::<std::result::Result<Vec<Value>, _>>()?;

        if records.is_empty() {
            return Ok(ToolOutput::failed(
                format!("No records in {}", table),
                json!({ "data": [], "record_count": 0, "table": table }),
            ));
        }

        Ok(ToolOutput::ok(json!({
            "data": records,
            "record_count": records.len(),
            "table": table,
            "conditions": conditions,
        })))
    }
}
