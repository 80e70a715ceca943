use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use super::{MetricStore, ProjectStore, PromptStore, StoreError, UserStore};
use crate::clock::Clock;
use crate::models::{
    ExecutionMetric, ListResponse, MessageRow, NewProject, NewPrompt, NewUser, Pagination,
    ProjectConfig, ProjectPatch, PromptCallCount, PromptPatch, PromptTemplate, User,
    VariableDeclaration,
};

const USER_COLUMNS: &str = "id, name, addr, email, level, created_at";

const PROJECT_COLUMNS: &str = "id, name, enabled, openai_base_url, openai_model, openai_token, \
     openai_temperature, openai_top_p, openai_max_tokens, creator_id, created_at, updated_at";

const PROMPT_COLUMNS: &str = "id, project_id, creator_id, name, description, token_count, \
     prompts, variables, public_level, created_at, updated_at";

/// Row shape of `prompts`; rows and variables are JSONB.
#[derive(sqlx::FromRow)]
struct PromptRecord {
    id: i64,
    project_id: i64,
    creator_id: i64,
    name: String,
    description: String,
    token_count: i32,
    prompts: Json<Vec<MessageRow>>,
    variables: Json<Vec<VariableDeclaration>>,
    public_level: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PromptRecord> for PromptTemplate {
    fn from(r: PromptRecord) -> Self {
        let public_level = r.public_level.parse().unwrap_or_else(|_| {
            tracing::warn!(prompt_id = r.id, level = %r.public_level, "unknown public level, treating as private");
            Default::default()
        });
        PromptTemplate {
            id: r.id,
            project_id: r.project_id,
            creator_id: r.creator_id,
            name: r.name,
            description: r.description,
            token_count: r.token_count,
            prompts: r.prompts.0,
            variables: r.variables.0,
            public_level,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

fn conflict_or_unavailable(e: sqlx::Error, what: &str) -> StoreError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Conflict(format!("{} already exists", what)),
        Some(db) if db.is_foreign_key_violation() => {
            StoreError::Conflict(format!("{} references a missing row", what))
        }
        _ => StoreError::Unavailable(e),
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn count(&self, sql: &str, bind: Option<i64>) -> Result<i64, StoreError> {
        let mut query = sqlx::query_as::<_, (i64,)>(sql);
        if let Some(v) = bind {
            query = query.bind(v);
        }
        Ok(query.fetch_one(&self.pool).await?.0)
    }

    async fn fetch_prompts(
        &self,
        filter: &str,
        bind: Option<i64>,
        page: Pagination,
    ) -> Result<Vec<PromptTemplate>, StoreError> {
        let (cursor_arg, limit_arg) = if bind.is_some() { ("$2", "$3") } else { ("$1", "$2") };
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts WHERE {filter} id < {cursor_arg} \
             ORDER BY id DESC LIMIT {limit_arg}"
        );
        let mut query = sqlx::query_as::<_, PromptRecord>(&sql);
        if let Some(v) = bind {
            query = query.bind(v);
        }
        let rows = query
            .bind(page.cursor())
            .bind(page.limit())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PromptTemplate::from).collect())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user_by_addr(&self, addr: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE addr = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(addr.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let user = user.into_user(0, self.clock.now());
        let sql = format!(
            "INSERT INTO users (name, addr, email, level, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(&user.name)
            .bind(&user.addr)
            .bind(&user.email)
            .bind(user.level)
            .bind(user.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| conflict_or_unavailable(e, "user"))
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn list_projects(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<ProjectConfig>, StoreError> {
        let count = self.count("SELECT COUNT(*) FROM projects", None).await?;
        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id < $1 ORDER BY id DESC LIMIT $2"
        );
        let data = sqlx::query_as::<_, ProjectConfig>(&sql)
            .bind(page.cursor())
            .bind(page.limit())
            .fetch_all(&self.pool)
            .await?;
        Ok(ListResponse { count, data })
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectConfig>, StoreError> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1");
        let project = sqlx::query_as::<_, ProjectConfig>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn create_project(
        &self,
        project: NewProject,
        creator_id: i64,
    ) -> Result<ProjectConfig, StoreError> {
        project.validate()?;
        let p = project.into_config(0, creator_id, self.clock.now());
        let sql = format!(
            "INSERT INTO projects (name, enabled, openai_base_url, openai_model, openai_token, \
             openai_temperature, openai_top_p, openai_max_tokens, creator_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {PROJECT_COLUMNS}"
        );
        sqlx::query_as::<_, ProjectConfig>(&sql)
            .bind(&p.name)
            .bind(p.enabled)
            .bind(&p.openai_base_url)
            .bind(&p.openai_model)
            .bind(&p.openai_token)
            .bind(p.openai_temperature)
            .bind(p.openai_top_p)
            .bind(p.openai_max_tokens)
            .bind(p.creator_id)
            .bind(p.created_at)
            .bind(p.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| conflict_or_unavailable(e, "project"))
    }

    async fn update_project(
        &self,
        id: i64,
        patch: &ProjectPatch,
    ) -> Result<ProjectConfig, StoreError> {
        patch.validate()?;

        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 FOR UPDATE");
        let mut project = sqlx::query_as::<_, ProjectConfig>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("project"))?;

        patch.apply(&mut project, self.clock.now());

        sqlx::query(
            "UPDATE projects SET enabled = $2, openai_base_url = $3, openai_model = $4, \
             openai_token = $5, openai_temperature = $6, openai_top_p = $7, \
             openai_max_tokens = $8, updated_at = $9 WHERE id = $1",
        )
        .bind(id)
        .bind(project.enabled)
        .bind(&project.openai_base_url)
        .bind(&project.openai_model)
        .bind(&project.openai_token)
        .bind(project.openai_temperature)
        .bind(project.openai_top_p)
        .bind(project.openai_max_tokens)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(project)
    }
}

#[async_trait]
impl PromptStore for PgStore {
    async fn list_prompts(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let count = self.count("SELECT COUNT(*) FROM prompts", None).await?;
        let data = self.fetch_prompts("", None, page).await?;
        Ok(ListResponse { count, data })
    }

    async fn list_project_prompts(
        &self,
        project_id: i64,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let count = self
            .count("SELECT COUNT(*) FROM prompts WHERE project_id = $1", Some(project_id))
            .await?;
        let data = self
            .fetch_prompts("project_id = $1 AND", Some(project_id), page)
            .await?;
        Ok(ListResponse { count, data })
    }

    async fn list_public_prompts(
        &self,
        page: Pagination,
    ) -> Result<ListResponse<PromptTemplate>, StoreError> {
        let count = self
            .count("SELECT COUNT(*) FROM prompts WHERE public_level = 'public'", None)
            .await?;
        let data = self
            .fetch_prompts("public_level = 'public' AND", None, page)
            .await?;
        Ok(ListResponse { count, data })
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>, StoreError> {
        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = $1");
        let row = sqlx::query_as::<_, PromptRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PromptTemplate::from))
    }

    async fn create_prompt(
        &self,
        prompt: NewPrompt,
        creator_id: i64,
    ) -> Result<PromptTemplate, StoreError> {
        prompt.validate()?;
        let p = prompt.into_template(0, creator_id, self.clock.now());
        let sql = format!(
            "INSERT INTO prompts (project_id, creator_id, name, description, token_count, \
             prompts, variables, public_level, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {PROMPT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PromptRecord>(&sql)
            .bind(p.project_id)
            .bind(p.creator_id)
            .bind(&p.name)
            .bind(&p.description)
            .bind(p.token_count)
            .bind(Json(&p.prompts))
            .bind(Json(&p.variables))
            .bind(p.public_level.as_str())
            .bind(p.created_at)
            .bind(p.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| conflict_or_unavailable(e, "prompt"))?;
        Ok(row.into())
    }

    async fn update_prompt(
        &self,
        id: i64,
        patch: &PromptPatch,
    ) -> Result<PromptTemplate, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = $1 FOR UPDATE");
        let mut prompt: PromptTemplate = sqlx::query_as::<_, PromptRecord>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("prompt"))?
            .into();

        patch.validate(&prompt)?;
        patch.apply(&mut prompt, self.clock.now());

        sqlx::query(
            "UPDATE prompts SET name = $2, description = $3, token_count = $4, prompts = $5, \
             variables = $6, public_level = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(id)
        .bind(&prompt.name)
        .bind(&prompt.description)
        .bind(prompt.token_count)
        .bind(Json(&prompt.prompts))
        .bind(Json(&prompt.variables))
        .bind(prompt.public_level.as_str())
        .bind(prompt.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(prompt)
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn record_call(&self, metric: &ExecutionMetric) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO prompt_calls (project_id, prompt_id, outcome, duration_ms, total_tokens, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(metric.project_id)
        .bind(metric.prompt_id)
        .bind(metric.outcome.as_str())
        .bind(metric.duration_ms)
        .bind(metric.total_tokens)
        .bind(metric.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prompt_call_counts(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromptCallCount>, StoreError> {
        let rows = sqlx::query_as::<_, PromptCallCount>(
            "SELECT prompt_id, COUNT(*) AS count FROM prompt_calls \
             WHERE project_id = $1 AND created_at >= $2 \
             GROUP BY prompt_id ORDER BY count DESC, prompt_id ASC LIMIT $3",
        )
        .bind(project_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
