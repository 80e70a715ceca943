use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PromptTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        }
    }
}

/// One row per dispatched provider call. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetric {
    pub project_id: i64,
    pub prompt_id: i64,
    pub outcome: CallOutcome,
    pub duration_ms: i64,
    pub total_tokens: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct PromptCallCount {
    pub prompt_id: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopPrompt {
    pub prompt: PromptTemplate,
    pub count: i64,
}
