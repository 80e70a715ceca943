use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{MetricStore, ProjectStore, PromptStore, StoreError, UserStore};
use crate::clock::Clock;
use crate::models::{
    ExecutionMetric, ListResponse, NewProject, NewPrompt, NewUser, Pagination, ProjectConfig,
    ProjectPatch, PromptCallCount, PromptPatch, PromptTemplate, PublicLevel, User,
};

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    projects: BTreeMap<i64, ProjectConfig>,
    prompts: BTreeMap<i64, PromptTemplate>,
    calls: Vec<ExecutionMetric>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store with the same semantics as [`super::PgStore`].
pub struct MemoryStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    metrics_down: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            metrics_down: AtomicBool::new(false),
        }
    }

    /// Make `record_call` fail until switched back.
    pub fn set_metrics_unavailable(&self, down: bool) {
        self.metrics_down.store(down, Ordering::SeqCst);
    }

    /// Every recorded call, oldest first.
    pub async fn recorded_calls(&self) -> Vec<ExecutionMetric> {
        self.tables.read().await.calls.clone()
    }
}

/// Newest-first keyset page over `rows`, plus the unpaged total.
fn page_of<'a, T, I>(rows: I, page: Pagination) -> ListResponse<T>
where
    T: Clone + 'a,
    I: DoubleEndedIterator<Item = (&'a i64, &'a T)> + Clone,
{
    let count = rows.clone().count() as i64;
    let cursor = page.cursor();
    let data = rows
        .rev()
        .filter(|(id, _)| **id < cursor)
        .take(page.limit() as usize)
        .map(|(_, v)| v.clone())
        .collect();
    ListResponse { count, data }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_addr(&self, addr: &str) -> Result<Option<User>, StoreError> {
        let addr = addr.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.addr == addr).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut tables = self.tables.write().await;
        let addr = user.addr.to_lowercase();
        if tables.users.values().any(|u| u.addr == addr) {
            return Err(StoreError::Conflict("user already exists".to_string()));
        }
        let id = tables.next_id();
        let user = user.into_user(id, self.clock.now());
        tables.users.insert(id, user.clone());
        Ok(user)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn list_projects(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<ProjectConfig>, StoreError> {
        let tables = self.tables.read().await;
        Ok(page_of(tables.projects.iter(), page))
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectConfig>, StoreError> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn create_project(
        &self,
        project: NewProject,
        creator_id: i64,
    ) -> Result<ProjectConfig, StoreError> {
        project.validate()?;
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let project = project.into_config(id, creator_id, self.clock.now());
        tables.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn update_project(
        &self,
        id: i64,
        patch: &ProjectPatch,
    ) -> Result<ProjectConfig, StoreError> {
        patch.validate()?;
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        let project = tables
            .projects
            .get_mut(&id)
            .ok_or(StoreError::NotFound("project"))?;
        patch.apply(project, now);
        Ok(project.clone())
    }
}

#[async_trait]
impl PromptStore for MemoryStore {
    async fn list_prompts(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let tables = self.tables.read().await;
        Ok(page_of(tables.prompts.iter(), page))
    }

    async fn list_project_prompts(
        &self,
        project_id: i64,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables.prompts.iter().filter(|(_, p)| p.project_id == project_id);
        Ok(page_of(rows, page))
    }

    async fn list_public_prompts(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables
            .prompts
            .iter()
            .filter(|(_, p)| p.public_level == PublicLevel::Public);
        Ok(page_of(rows, page))
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>, StoreError> {
        Ok(self.tables.read().await.prompts.get(&id).cloned())
    }

    async fn create_prompt(
        &self,
        prompt: NewPrompt,
        creator_id: i64,
    ) -> Result<PromptTemplate, StoreError> {
        prompt.validate()?;
        let mut tables = self.tables.write().await;
        if !tables.projects.contains_key(&prompt.project_id) {
            return Err(StoreError::Conflict("prompt references a missing row".to_string()));
        }
        let id = tables.next_id();
        let prompt = prompt.into_template(id, creator_id, self.clock.now());
        tables.prompts.insert(id, prompt.clone());
        Ok(prompt)
    }

    async fn update_prompt(
        &self,
        id: i64,
        patch: &PromptPatch,
    ) -> Result<PromptTemplate, StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        let prompt = tables
            .prompts
            .get_mut(&id)
            .ok_or(StoreError::NotFound("prompt"))?;
        patch.validate(prompt)?;
        patch.apply(prompt, now);
        Ok(prompt.clone())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn record_call(&self, metric: &ExecutionMetric) -> Result<(), StoreError> {
        if self.metrics_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        self.tables.write().await.calls.push(metric.clone());
        Ok(())
    }

    async fn prompt_call_counts(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromptCallCount>, StoreError> {
        let tables = self.tables.read().await;
        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
        for call in tables
            .calls
            .iter()
            .filter(|c| c.project_id == project_id && c.created_at >= since)
        {
            *counts.entry(call.prompt_id).or_default() += 1;
        }

        let mut out: Vec<PromptCallCount> = counts
            .into_iter()
            .map(|(prompt_id, count)| PromptCallCount { prompt_id, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.prompt_id.cmp(&b.prompt_id)));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}
