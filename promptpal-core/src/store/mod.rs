//! Durable store boundary
//!
//! The system of record for users, projects, prompts and call metrics. The
//! server and the execution dispatcher only ever see the traits below;
//! [`PgStore`] is the production backend and [`MemoryStore`] backs tests and
//! `--in-memory` development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    ExecutionMetric, ListResponse, NewProject, NewPrompt, NewUser, Pagination, ProjectConfig,
    ProjectPatch, PromptCallCount, PromptPatch, PromptTemplate, TopPrompt, User, ValidationError,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Window and size of the per-project top-prompts report.
pub const TOP_PROMPTS_DAYS: i64 = 7;
pub const TOP_PROMPTS_LIMIT: i64 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// `addr` is compared lower-cased.
    async fn find_user_by_addr(&self, addr: &str) -> Result<Option<User>, StoreError>;

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn list_projects(&self, page: Pagination)
        -> Result<ListResponse<ProjectConfig>, StoreError>;

    async fn get_project(&self, id: i64) -> Result<Option<ProjectConfig>, StoreError>;

    async fn create_project(
        &self,
        project: NewProject,
        creator_id: i64,
    ) -> Result<ProjectConfig, StoreError>;

    /// Apply `patch` atomically and return the committed row.
    async fn update_project(
        &self,
        id: i64,
        patch: &ProjectPatch,
    ) -> Result<ProjectConfig, StoreError>;
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn list_prompts(&self, page: Pagination)
        -> Result<ListResponse<PromptTemplate>, StoreError>;

    async fn list_project_prompts(
        &self,
        project_id: i64,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError>;

    /// Prompts with `public_level = public`.
    async fn list_public_prompts(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError>;

    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>, StoreError>;

    async fn create_prompt(
        &self,
        prompt: NewPrompt,
        creator_id: i64,
    ) -> Result<PromptTemplate, StoreError>;

    /// Validate `patch` against the current row and apply it atomically.
    async fn update_prompt(
        &self,
        id: i64,
        patch: &PromptPatch,
    ) -> Result<PromptTemplate, StoreError>;
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn record_call(&self, metric: &ExecutionMetric) -> Result<(), StoreError>;

    /// Call counts per prompt of `project_id` since `since`, highest first,
    /// ties broken by ascending prompt id.
    async fn prompt_call_counts(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromptCallCount>, StoreError>;
}

/// Everything the server needs from one backend.
pub trait Store: UserStore + ProjectStore + PromptStore + MetricStore {}

impl<T> Store for T where T: UserStore + ProjectStore + PromptStore + MetricStore {}

/// The most called prompts of a project over the last [`TOP_PROMPTS_DAYS`].
/// Prompts deleted since they were called are skipped.
pub async fn top_prompts<S>(
    store: &S,
    project_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<TopPrompt>, StoreError>
where
    S: PromptStore + MetricStore + ?Sized,
{
    let since = now - chrono::Duration::days(TOP_PROMPTS_DAYS);
    let counts = store
        .prompt_call_counts(project_id, since, TOP_PROMPTS_LIMIT)
        .await?;

    let mut out = Vec::with_capacity(counts.len());
    for PromptCallCount { prompt_id, count } in counts {
        if let Some(prompt) = store.get_prompt(prompt_id).await? {
            out.push(TopPrompt { prompt, count });
        }
    }
    Ok(out)
}
