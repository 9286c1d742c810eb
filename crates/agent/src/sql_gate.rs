use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use kopi_db::{OutletStore, RowMap};
use kopi_core::{Outlet, ServiceError, ToolError};

use crate::llm::LlmClient;

/// Row-list results are clipped to this many outlets.
const ROW_LIMIT: usize = 20;
/// Destructive verbs the validation predicate rejects outright.
const FORBIDDEN_KEYWORDS: &[&str] =
    &["insert", "update", "delete", "drop", "alter", "create", "grant"];

const SQL_PROMPT: &str = r#"You are a SQL expert. Convert the natural language question into ONE SQLite SELECT statement for the `outlets` table.

Table schema:
CREATE TABLE outlets (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT,
    city TEXT,
    state TEXT,
    postal_code TEXT,
    maps_url TEXT,
    location_category TEXT,  -- e.g. 'Mall', 'Stand Alone', 'Petrol Station'
    source TEXT,
    fetched_at TIMESTAMP
);

Rules:
1. Use LIKE with % wildcards for case-insensitive partial matches
2. Only return a single SELECT statement against the outlets table
3. Limit row lists to 20 unless counting
4. For counting questions use SELECT COUNT(*) AS count
5. For location questions search city, state, or address
6. For category questions use the location_category column
7. For map or URL requests include maps_url in the SELECT
8. Return ONLY raw SQL - no markdown, no code fences, no explanations

Examples:
Q: "Show me outlets in malls"
A: SELECT * FROM outlets WHERE location_category LIKE '%mall%' LIMIT 20

Q: "Find outlets in Shah Alam"
A: SELECT * FROM outlets WHERE city LIKE '%Shah Alam%' LIMIT 20

Q: "How many outlets in Selangor?"
A: SELECT COUNT(*) AS count FROM outlets WHERE state LIKE '%Selangor%'

Q: "Give me the map location for outlets in Subang"
A: SELECT name, address, city, state, maps_url FROM outlets WHERE city LIKE '%Subang%' LIMIT 20
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutletAnswerKind {
    List,
    Count,
    Single,
    Empty,
    Error,
}

/// Structured outcome of one outlet question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutletAnswer {
    pub kind: OutletAnswerKind,
    pub rows: Vec<RowMap>,
    pub count: usize,
    pub formatted_text: String,
    pub sql: Option<String>,
}

impl OutletAnswer {
    fn error(sql: Option<String>) -> Self {
        Self {
            kind: OutletAnswerKind::Error,
            rows: Vec::new(),
            count: 0,
            formatted_text: "Sorry, I couldn't look up the outlet directory just now. Please \
                             try rephrasing or ask again in a moment."
                .to_string(),
            sql,
        }
    }
}

/// Validating wrapper around language-model-generated SELECT statements.
/// Owns no data, only a connection handle and the model client.
pub struct OutletSqlGate {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn OutletStore>,
    query_timeout: Duration,
}

impl OutletSqlGate {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn OutletStore>, query_timeout: Duration) -> Self {
        Self { llm, store, query_timeout }
    }

    /// Generates, validates, and executes one statement, with a single
    /// regeneration attempt carrying the failure context. Tool failures fold
    /// into `kind = Error`; only resource exhaustion propagates.
    pub async fn answer(&self, question: &str) -> Result<OutletAnswer, ServiceError> {
        match self.attempt(question, None).await {
            Ok(answer) => Ok(answer),
            Err(GateFailure::Resource(resource)) => Err(resource),
            Err(GateFailure::Tool { sql, error }) if !error.retryable() => {
                warn!(error = %error, "outlet model call failed; no retry budget for it");
                Ok(OutletAnswer::error(sql))
            }
            Err(GateFailure::Tool { sql, error }) => {
                debug!(error = %error, "first outlet attempt failed; regenerating once");
                let context = format!("The previous attempt failed with: {error}.");
                match self.attempt(question, Some(&context)).await {
                    Ok(answer) => Ok(answer),
                    Err(GateFailure::Resource(resource)) => Err(resource),
                    Err(GateFailure::Tool { sql: retry_sql, error }) => {
                        warn!(error = %error, "outlet query failed after regeneration");
                        Ok(OutletAnswer::error(retry_sql.or(sql)))
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        question: &str,
        error_context: Option<&str>,
    ) -> Result<OutletAnswer, GateFailure> {
        let prompt = build_prompt(question, error_context);
        let raw = self.llm.complete(&prompt).await.map_err(classify_llm_failure)?;

        let sql = validate_statement(&raw)
            .map_err(|reason| GateFailure::Tool { sql: None, error: ToolError::SqlRejected(reason) })?;

        let rows = tokio::time::timeout(self.query_timeout, self.store.select(&sql))
            .await
            .map_err(|_| GateFailure::Tool {
                sql: Some(sql.clone()),
                error: ToolError::DeadlineExceeded {
                    tool: "sql",
                    deadline_ms: self.query_timeout.as_millis() as u64,
                },
            })?
            .map_err(|error| GateFailure::Tool {
                sql: Some(sql.clone()),
                error: ToolError::SqlExecution(error.to_string()),
            })?;

        Ok(classify_and_format(question, sql, rows))
    }
}

enum GateFailure {
    Tool { sql: Option<String>, error: ToolError },
    Resource(ServiceError),
}

fn classify_llm_failure(error: ToolError) -> GateFailure {
    match error {
        ToolError::RateLimited { retry_after_ms } => {
            GateFailure::Resource(ServiceError::RateLimited { retry_after_ms })
        }
        other => GateFailure::Tool { sql: None, error: other },
    }
}

fn build_prompt(question: &str, error_context: Option<&str>) -> String {
    let mut prompt = SQL_PROMPT.to_string();
    if let Some(context) = error_context {
        prompt.push_str(&format!("\n{context} Generate a corrected SELECT statement.\n"));
    }
    prompt.push_str(&format!("\nQ: \"{question}\"\nA:"));
    prompt
}

/// The validation predicate every executed statement must pass: one SELECT,
/// only the outlets table, no destructive verbs. Returns the sanitized
/// statement with the row limit enforced.
pub fn validate_statement(raw: &str) -> Result<String, String> {
    let mut sql = raw.trim();
    // Models occasionally wrap output in fences despite instructions.
    sql = sql
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let sql = sql.trim_end_matches(';').trim().to_string();

    if sql.is_empty() {
        return Err("statement is empty".to_string());
    }
    let lowered = sql.to_lowercase();

    if !lowered.starts_with("select") {
        return Err("statement must begin with SELECT".to_string());
    }

    // Keyword scanning must not see quoted text: an address like
    // '%from Jalan%' is data, not a FROM clause.
    let masked = mask_string_literals(&lowered);
    if masked.contains(';') {
        return Err("statement must be a single SELECT".to_string());
    }

    let words: Vec<&str> = masked
        .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .filter(|word| !word.is_empty())
        .collect();
    for forbidden in FORBIDDEN_KEYWORDS {
        if words.contains(forbidden) {
            return Err(format!("destructive keyword `{}` is not allowed", forbidden.to_uppercase()));
        }
    }
    if words.contains(&"join") {
        return Err("joins are not allowed; only the outlets table may be referenced".to_string());
    }
    for (index, word) in words.iter().enumerate() {
        if *word == "from" {
            match words.get(index + 1) {
                Some(&"outlets") => {}
                Some(other) => {
                    return Err(format!("only the outlets table may be referenced, found `{other}`"))
                }
                None => return Err("FROM clause names no table".to_string()),
            }
        }
    }
    if !words.iter().any(|word| *word == "from") {
        return Err("statement must select from the outlets table".to_string());
    }

    let is_count = masked.contains("count(");
    if !is_count && !words.contains(&"limit") {
        return Ok(format!("{sql} LIMIT {ROW_LIMIT}"));
    }
    Ok(sql)
}

/// Blanks out the contents of single-quoted literals (keeping the quotes)
/// so the word scan above only ever sees real SQL tokens. Doubled quotes
/// inside a literal reopen it immediately, which still leaves every quoted
/// character masked.
fn mask_string_literals(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut in_literal = false;
    for ch in sql.chars() {
        if ch == '\'' {
            in_literal = !in_literal;
            masked.push('\'');
        } else if in_literal {
            masked.push(' ');
        } else {
            masked.push(ch);
        }
    }
    masked
}

fn classify_and_format(question: &str, sql: String, rows: Vec<RowMap>) -> OutletAnswer {
    // A single row whose only meaningful payload is a count column is a
    // count answer, not a one-outlet listing.
    if rows.len() == 1 {
        if let Some(count) = extract_count(&rows[0]) {
            let formatted = if sql.to_lowercase().contains("where") {
                format!("There are {count} outlets matching your criteria.")
            } else {
                format!("There are {count} outlets in total.")
            };
            return OutletAnswer {
                kind: OutletAnswerKind::Count,
                rows,
                count: count.max(0) as usize,
                formatted_text: formatted,
                sql: Some(sql),
            };
        }
    }

    if rows.is_empty() {
        return OutletAnswer {
            kind: OutletAnswerKind::Empty,
            rows,
            count: 0,
            formatted_text: "No outlets found matching your criteria.".to_string(),
            sql: Some(sql),
        };
    }

    let question_lowered = question.to_lowercase();
    let include_maps = sql.to_lowercase().contains("maps_url")
        || question_lowered.contains("map")
        || question_lowered.contains("google")
        || question_lowered.contains("location link");

    let lines: Vec<String> = rows
        .iter()
        .map(|row| Outlet::from_row(row).bullet_line(include_maps))
        .collect();

    let kind = if rows.len() == 1 { OutletAnswerKind::Single } else { OutletAnswerKind::List };
    OutletAnswer {
        kind,
        count: rows.len(),
        formatted_text: lines.join("\n"),
        rows,
        sql: Some(sql),
    }
}

fn extract_count(row: &RowMap) -> Option<i64> {
    row.iter()
        .find(|(key, _)| {
            let key = key.to_lowercase();
            key == "count" || key.starts_with("count(")
        })
        .and_then(|(_, value)| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(raw) => raw.parse().ok(),
            _ => None,
        })
}
