use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// A project's LLM configuration as held by the durable store. The config
/// cache holds copies of this with their own expiry.
#[derive(Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "openAIBaseURL")]
    pub openai_base_url: String,
    #[serde(rename = "openAIModel")]
    pub openai_model: String,
    #[serde(rename = "openAIToken", skip_serializing, default)]
    pub openai_token: String,
    #[serde(rename = "openAITemperature")]
    pub openai_temperature: f64,
    #[serde(rename = "openAITopP")]
    pub openai_top_p: f64,
    /// Zero leaves the limit to the provider.
    #[serde(rename = "openAIMaxTokens")]
    pub openai_max_tokens: i32,
    pub creator_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for ProjectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_model", &self.openai_model)
            .field("openai_token", &"<redacted>")
            .field("openai_temperature", &self.openai_temperature)
            .field("openai_top_p", &self.openai_top_p)
            .field("openai_max_tokens", &self.openai_max_tokens)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Payload for creating a project.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(rename = "openAIToken", alias = "openaiToken")]
    pub openai_token: String,
    #[serde(rename = "openAIBaseURL", default)]
    pub openai_base_url: Option<String>,
    #[serde(rename = "openAIModel", default)]
    pub openai_model: Option<String>,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        Ok(())
    }

    /// Build the stored row. `id` is assigned by the store.
    pub fn into_config(self, id: i64, creator_id: i64, now: DateTime<Utc>) -> ProjectConfig {
        ProjectConfig {
            id,
            name: self.name,
            enabled: true,
            openai_base_url: self
                .openai_base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            openai_model: self.openai_model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            openai_token: self.openai_token,
            openai_temperature: 1.0,
            openai_top_p: 1.0,
            openai_max_tokens: 0,
            creator_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. Only fields that are present are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(rename = "openAIBaseURL", default)]
    pub openai_base_url: Option<String>,
    #[serde(rename = "openAIModel", default)]
    pub openai_model: Option<String>,
    #[serde(rename = "openAIToken", default)]
    pub openai_token: Option<String>,
    #[serde(rename = "openAITemperature", default)]
    pub openai_temperature: Option<f64>,
    #[serde(rename = "openAITopP", default)]
    pub openai_top_p: Option<f64>,
    #[serde(rename = "openAIMaxTokens", default)]
    pub openai_max_tokens: Option<i32>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.openai_base_url.is_none()
            && self.openai_model.is_none()
            && self.openai_token.is_none()
            && self.openai_temperature.is_none()
            && self.openai_top_p.is_none()
            && self.openai_max_tokens.is_none()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(t) = self.openai_temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ValidationError::new("openAITemperature", "must be within [0, 2]"));
            }
        }
        if let Some(p) = self.openai_top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ValidationError::new("openAITopP", "must be within [0, 1]"));
            }
        }
        if let Some(m) = self.openai_max_tokens {
            if m < 0 {
                return Err(ValidationError::new("openAIMaxTokens", "must not be negative"));
            }
        }
        if let Some(url) = &self.openai_base_url {
            if url.trim().is_empty() {
                return Err(ValidationError::new("openAIBaseURL", "must not be empty"));
            }
        }
        if let Some(model) = &self.openai_model {
            if model.trim().is_empty() {
                return Err(ValidationError::new("openAIModel", "must not be empty"));
            }
        }
        Ok(())
    }

    /// Apply the present fields to `project` and stamp `updated_at`.
    pub fn apply(&self, project: &mut ProjectConfig, now: DateTime<Utc>) {
        if let Some(enabled) = self.enabled {
            project.enabled = enabled;
        }
        if let Some(url) = &self.openai_base_url {
            project.openai_base_url = url.clone();
        }
        if let Some(model) = &self.openai_model {
            project.openai_model = model.clone();
        }
        if let Some(token) = &self.openai_token {
            project.openai_token = token.clone();
        }
        if let Some(t) = self.openai_temperature {
            project.openai_temperature = t;
        }
        if let Some(p) = self.openai_top_p {
            project.openai_top_p = p;
        }
        if let Some(m) = self.openai_max_tokens {
            project.openai_max_tokens = m;
        }
        project.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
