//! Prompt execution pipeline
//!
//! `ResolveProject -> Render -> Dispatch -> RecordMetric`, once per request.
//! Requests run concurrently and share only the config cache, the store and
//! the provider client; no lock is held across the provider call.
//!
//! Failures before dispatch (unknown prompt, unknown or disabled project,
//! missing variable) never reach the provider and record nothing. Every
//! dispatched call records exactly one metric row, success or failure, and a
//! failure to record it is logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::ConfigCache;
use crate::clock::Clock;
use crate::models::{
    validate_declarations, CallOutcome, ExecutionMetric, MessageRow, ProjectConfig,
    ValidationError, VariableDeclaration,
};
use crate::provider::{Completion, LlmProvider, ProviderError, ProviderParams};
use crate::store::{MetricStore, ProjectStore, PromptStore, Store, StoreError};
use crate::template::{RenderError, TemplateRenderer};

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("prompt {0} not found")]
    PromptNotFound(i64),

    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error("project {0} is disabled")]
    ProjectDisabled(i64),

    #[error("missing variable: {0}")]
    MissingVariable(String),

    #[error(transparent)]
    InvalidTemplate(#[from] ValidationError),

    #[error("provider timed out")]
    ProviderTimeout,

    #[error("provider error: {body}")]
    Provider { status: Option<u16>, body: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RenderError> for ExecutionError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::MissingVariable(name) => ExecutionError::MissingVariable(name),
        }
    }
}

impl From<ProviderError> for ExecutionError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout => ExecutionError::ProviderTimeout,
            ProviderError::Status { status, body } => ExecutionError::Provider {
                status: Some(status),
                body,
            },
            other => ExecutionError::Provider {
                status: None,
                body: other.to_string(),
            },
        }
    }
}

/// Public run request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub project_id: i64,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Per-call provider deadline; capped at the dispatcher's timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RunRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Normalised provider result returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub message: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub duration_ms: i64,
    pub model: String,
}

impl ExecutionResult {
    fn from_completion(c: Completion, elapsed: Duration) -> Self {
        Self {
            message: c.message,
            prompt_tokens: c.prompt_tokens,
            completion_tokens: c.completion_tokens,
            total_tokens: c.total_tokens,
            duration_ms: elapsed.as_millis() as i64,
            model: c.model,
        }
    }
}

pub struct ExecutionDispatcher {
    store: Arc<dyn Store>,
    cache: Arc<ConfigCache>,
    provider: Arc<dyn LlmProvider>,
    renderer: TemplateRenderer,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ExecutionDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<ConfigCache>,
        provider: Arc<dyn LlmProvider>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            renderer: TemplateRenderer::new(),
            clock,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    /// Run stored prompt `prompt_id` within `request.project_id`.
    pub async fn run(
        &self,
        prompt_id: i64,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let prompt = self
            .store
            .get_prompt(prompt_id)
            .await?
            .filter(|p| p.project_id == request.project_id)
            .ok_or(ExecutionError::PromptNotFound(prompt_id))?;

        let project = self.resolve_project(request.project_id).await?;

        let outcome = self
            .render_and_dispatch(
                &project,
                &prompt.prompts,
                &prompt.variables,
                &request.variables,
                request.timeout(),
                cancel,
            )
            .await;

        match &outcome {
            Ok(result) => {
                self.record(&project, prompt.id, CallOutcome::Success, result.duration_ms, result.total_tokens)
                    .await;
                tracing::info!(
                    prompt_id = prompt.id,
                    project_id = project.id,
                    duration_ms = result.duration_ms,
                    total_tokens = result.total_tokens,
                    provider = self.provider.name(),
                    "prompt executed"
                );
            }
            Err(Dispatched { elapsed: Some(elapsed), error }) => {
                let ms = elapsed.as_millis() as i64;
                self.record(&project, prompt.id, CallOutcome::Failure, ms, 0).await;
                tracing::warn!(
                    prompt_id = prompt.id,
                    project_id = project.id,
                    provider = self.provider.name(),
                    error = %error,
                    "prompt execution failed"
                );
            }
            Err(_) => {}
        }

        outcome.map_err(|d| d.error)
    }

    /// Render and dispatch an unsaved template. Its placeholders are checked
    /// against `declared` the same way a stored prompt's are. Nothing is
    /// recorded.
    pub async fn run_unsaved(
        &self,
        project_id: i64,
        rows: &[MessageRow],
        declared: &[VariableDeclaration],
        values: &HashMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        validate_declarations(rows, declared)?;
        let project = self.resolve_project(project_id).await?;
        self.render_and_dispatch(&project, rows, declared, values, timeout, cancel)
            .await
            .map_err(|d| d.error)
    }

    /// Cache read-through. A disabled project is refused here, before any
    /// rendering or provider traffic.
    pub async fn resolve_project(&self, project_id: i64) -> Result<ProjectConfig, ExecutionError> {
        let project = match self.cache.get(project_id) {
            Some(p) => p,
            None => {
                let stored = self
                    .store
                    .get_project(project_id)
                    .await?
                    .ok_or(ExecutionError::ProjectNotFound(project_id))?;
                if self.cache.populate(stored.clone()) {
                    stored
                } else {
                    // A fresher copy landed while we were reading the store.
                    self.cache.get(project_id).unwrap_or(stored)
                }
            }
        };

        if !project.enabled {
            return Err(ExecutionError::ProjectDisabled(project_id));
        }
        Ok(project)
    }

    async fn render_and_dispatch(
        &self,
        project: &ProjectConfig,
        rows: &[MessageRow],
        declared: &[VariableDeclaration],
        values: &HashMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Dispatched> {
        let conversation = self
            .renderer
            .render(rows, declared, values)
            .map_err(|e| Dispatched::before(e.into()))?;

        if cancel.is_cancelled() {
            return Err(Dispatched::before(ExecutionError::Cancelled));
        }

        let params = ProviderParams::from(project);
        let deadline = self.deadline(timeout);
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            r = tokio::time::timeout(deadline, self.provider.complete(&conversation, &params)) => {
                match r {
                    Err(_) => Err(ExecutionError::ProviderTimeout),
                    Ok(Err(e)) => Err(e.into()),
                    Ok(Ok(c)) => Ok(c),
                }
            }
        };
        let elapsed = started.elapsed();

        match result {
            Ok(completion) => Ok(ExecutionResult::from_completion(completion, elapsed)),
            Err(error) => Err(Dispatched {
                elapsed: Some(elapsed),
                error,
            }),
        }
    }

    /// A caller deadline may shorten the configured timeout, never extend it.
    /// Zero means "use the default".
    fn deadline(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) if !d.is_zero() => d.min(self.timeout),
            _ => self.timeout,
        }
    }

    async fn record(
        &self,
        project: &ProjectConfig,
        prompt_id: i64,
        outcome: CallOutcome,
        duration_ms: i64,
        total_tokens: i32,
    ) {
        let metric = ExecutionMetric {
            project_id: project.id,
            prompt_id,
            outcome,
            duration_ms,
            total_tokens,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.store.record_call(&metric).await {
            tracing::warn!(prompt_id, project_id = project.id, error = %e, "failed to record prompt call");
        }
    }
}

/// An execution failure, tagged with how long the provider call ran if it
/// was reached at all.
struct Dispatched {
    elapsed: Option<Duration>,
    error: ExecutionError,
}

impl Dispatched {
    fn before(error: ExecutionError) -> Self {
        Self {
            elapsed: None,
            error,
        }
    }
}
