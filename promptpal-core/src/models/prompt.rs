use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ValidationError;
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicLevel {
    #[default]
    Private,
    Protected,
    Public,
}

impl PublicLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicLevel::Private => "private",
            PublicLevel::Protected => "protected",
            PublicLevel::Public => "public",
        }
    }
}

impl fmt::Display for PublicLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(PublicLevel::Private),
            "protected" => Ok(PublicLevel::Protected),
            "public" => Ok(PublicLevel::Public),
            other => Err(ValidationError::new(
                "publicLevel",
                format!("unknown level '{}'", other),
            )),
        }
    }
}

/// One message of a prompt template. `content` may contain `{{name}}`
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub role: String,
    #[serde(alias = "prompt")]
    pub content: String,
}

impl MessageRow {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A declared template variable. Without a default value it is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl VariableDeclaration {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: None,
        }
    }

    pub fn with_default(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: Some(value.into()),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: i64,
    pub project_id: i64,
    pub creator_id: i64,
    pub name: String,
    pub description: String,
    pub token_count: i32,
    pub prompts: Vec<MessageRow>,
    pub variables: Vec<VariableDeclaration>,
    pub public_level: PublicLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a prompt, also used by the admin test-run endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPrompt {
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub token_count: i32,
    pub prompts: Vec<MessageRow>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub public_level: PublicLevel,
}

impl NewPrompt {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if self.prompts.is_empty() {
            return Err(ValidationError::new("prompts", "at least one message row is required"));
        }
        validate_declarations(&self.prompts, &self.variables)
    }

    pub fn into_template(self, id: i64, creator_id: i64, now: DateTime<Utc>) -> PromptTemplate {
        PromptTemplate {
            id,
            project_id: self.project_id,
            creator_id,
            name: self.name,
            description: self.description,
            token_count: self.token_count,
            prompts: self.prompts,
            variables: self.variables,
            public_level: self.public_level,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub token_count: Option<i32>,
    #[serde(default)]
    pub prompts: Option<Vec<MessageRow>>,
    #[serde(default)]
    pub variables: Option<Vec<VariableDeclaration>>,
    #[serde(default)]
    pub public_level: Option<PublicLevel>,
}

impl PromptPatch {
    /// Validate against the template the patch will be applied to, since rows
    /// and declarations may arrive in separate patches.
    pub fn validate(&self, current: &PromptTemplate) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ValidationError::new("name", "must not be empty"));
            }
        }
        if let Some(rows) = &self.prompts {
            if rows.is_empty() {
                return Err(ValidationError::new("prompts", "at least one message row is required"));
            }
        }
        let rows = self.prompts.as_ref().unwrap_or(&current.prompts);
        let vars = self.variables.as_ref().unwrap_or(&current.variables);
        validate_declarations(rows, vars)
    }

    pub fn apply(&self, prompt: &mut PromptTemplate, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            prompt.name = name.clone();
        }
        if let Some(description) = &self.description {
            prompt.description = description.clone();
        }
        if let Some(count) = self.token_count {
            prompt.token_count = count;
        }
        if let Some(rows) = &self.prompts {
            prompt.prompts = rows.clone();
        }
        if let Some(vars) = &self.variables {
            prompt.variables = vars.clone();
        }
        if let Some(level) = self.public_level {
            prompt.public_level = level;
        }
        prompt.updated_at = now;
    }
}

/// Every placeholder used in `rows` must be declared in `vars`.
pub fn validate_declarations(
    rows: &[MessageRow],
    vars: &[VariableDeclaration],
) -> Result<(), ValidationError> {
    for name in template::placeholders(rows) {
        if !vars.iter().any(|v| v.name == name) {
            return Err(ValidationError::new(
                "variables",
                format!("placeholder '{}' is not declared", name),
            ));
        }
    }
    Ok(())
}
