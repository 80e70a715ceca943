//! Template rendering
//!
//! A prompt template is an ordered list of message rows whose content may
//! contain `{{name}}` placeholders. Rendering substitutes caller-supplied values
//! (falling back to declared defaults) into each row independently and keeps
//! the row order. Substitution is a single pass over the original content, so a
//! value that itself looks like a placeholder is inserted verbatim.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{MessageRow, VariableDeclaration};

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("missing variable: {0}")]
    MissingVariable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub role: String,
    pub content: String,
}

/// The conversation sent to the provider. Built per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderedConversation {
    pub messages: Vec<RenderedMessage>,
}

impl RenderedConversation {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"))
}

/// Distinct placeholder names used across `rows`, sorted.
pub fn placeholders(rows: &[MessageRow]) -> BTreeSet<String> {
    let re = placeholder_regex();
    rows.iter()
        .flat_map(|row| re.captures_iter(&row.content))
        .map(|caps| caps[1].to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render `rows` with `vars`.
    ///
    /// Fails with [`RenderError::MissingVariable`] naming the first required
    /// declaration (in declaration order) that has no value, or else the first
    /// placeholder (in row order) that resolves to nothing. Only declared names
    /// resolve: a supplied value never fills an undeclared placeholder, and
    /// supplied variables that nothing declares are ignored.
    pub fn render(
        &self,
        rows: &[MessageRow],
        declared: &[VariableDeclaration],
        vars: &HashMap<String, String>,
    ) -> Result<RenderedConversation, RenderError> {
        let mut values: HashMap<&str, &str> = HashMap::with_capacity(declared.len());

        for decl in declared {
            match (vars.get(&decl.name), decl.default_value.as_deref()) {
                (Some(v), _) => {
                    values.insert(decl.name.as_str(), v.as_str());
                }
                (None, Some(default)) => {
                    values.insert(decl.name.as_str(), default);
                }
                (None, None) => return Err(RenderError::MissingVariable(decl.name.clone())),
            }
        }

        let re = placeholder_regex();
        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            if let Some(missing) = re
                .captures_iter(&row.content)
                .map(|caps| caps.get(1).map_or("", |m| m.as_str()))
                .find(|name| !values.contains_key(name))
            {
                return Err(RenderError::MissingVariable(missing.to_string()));
            }

            let content = re.replace_all(&row.content, |caps: &Captures| {
                values.get(&caps[1]).copied().unwrap_or_default().to_string()
            });

            messages.push(RenderedMessage {
                role: row.role.clone(),
                content: content.into_owned(),
            });
        }

        Ok(RenderedConversation { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_hello_name() {
        let rows = vec![MessageRow::new("user", "Hello, {{name}}!")];
        let declared = vec![VariableDeclaration::required("name")];

        let out = TemplateRenderer::new()
            .render(&rows, &declared, &vars(&[("name", "Ada")]))
            .unwrap();

        assert_eq!(out.messages[0].content, "Hello, Ada!");
        assert_eq!(out.messages[0].role, "user");
    }

    #[test]
    fn test_render_empty_map_names_missing_variable() {
        let rows = vec![MessageRow::new("user", "Hello, {{name}}!")];
        let declared = vec![VariableDeclaration::required("name")];

        let err = TemplateRenderer::new()
            .render(&rows, &declared, &HashMap::new())
            .unwrap_err();

        assert_eq!(err, RenderError::MissingVariable("name".to_string()));
    }

    #[test]
    fn test_undeclared_placeholder_without_value_is_missing() {
        let rows = vec![MessageRow::new("user", "Hi {{who}}")];
        let err = TemplateRenderer::new()
            .render(&rows, &[], &HashMap::new())
            .unwrap_err();
        assert_eq!(err, RenderError::MissingVariable("who".to_string()));
    }

    #[test]
    fn test_supplied_value_does_not_fill_undeclared_placeholder() {
        let rows = vec![MessageRow::new("user", "Hi {{who}}, meet {{other}}")];
        let declared = vec![VariableDeclaration::required("who")];
        let err = TemplateRenderer::new()
            .render(&rows, &declared, &vars(&[("who", "Ada"), ("other", "Grace")]))
            .unwrap_err();
        assert_eq!(err, RenderError::MissingVariable("other".to_string()));
    }

    #[test]
    fn test_omitting_each_required_variable_names_exactly_that_one() {
        let rows = vec![
            MessageRow::new("system", "You are {{persona}}."),
            MessageRow::new("user", "Translate {{text}} into {{language}}."),
        ];
        let declared = vec![
            VariableDeclaration::required("persona"),
            VariableDeclaration::required("text"),
            VariableDeclaration::required("language"),
        ];
        let full = vars(&[("persona", "a translator"), ("text", "bonjour"), ("language", "English")]);
        let renderer = TemplateRenderer::new();

        assert!(renderer.render(&rows, &declared, &full).is_ok());

        for omitted in ["persona", "text", "language"] {
            let mut partial = full.clone();
            partial.remove(omitted);
            let err = renderer.render(&rows, &declared, &partial).unwrap_err();
            assert_eq!(err, RenderError::MissingVariable(omitted.to_string()));
        }
    }

    #[test]
    fn test_defaults_fill_in_and_supplied_values_win() {
        let rows = vec![MessageRow::new("user", "Write in a {{tone}} tone about {{topic}}.")];
        let declared = vec![
            VariableDeclaration::with_default("tone", "neutral"),
            VariableDeclaration::required("topic"),
        ];
        let renderer = TemplateRenderer::new();

        let out = renderer
            .render(&rows, &declared, &vars(&[("topic", "rust")]))
            .unwrap();
        assert_eq!(out.messages[0].content, "Write in a neutral tone about rust.");

        let out = renderer
            .render(&rows, &declared, &vars(&[("topic", "rust"), ("tone", "playful")]))
            .unwrap();
        assert_eq!(out.messages[0].content, "Write in a playful tone about rust.");
    }

    #[test]
    fn test_unused_supplied_variable_is_ignored() {
        let rows = vec![MessageRow::new("user", "static text")];
        let out = TemplateRenderer::new()
            .render(&rows, &[], &vars(&[("extra", "ignored")]))
            .unwrap();
        assert_eq!(out.messages[0].content, "static text");
    }

    #[test]
    fn test_row_order_preserved_and_repeated_placeholders() {
        let rows = vec![
            MessageRow::new("system", "first {{x}}"),
            MessageRow::new("user", "second {{x}} {{ x }}"),
            MessageRow::new("assistant", "third"),
        ];
        let declared = vec![VariableDeclaration::required("x")];
        let out = TemplateRenderer::new()
            .render(&rows, &declared, &vars(&[("x", "1")]))
            .unwrap();

        let roles: Vec<&str> = out.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(out.messages[1].content, "second 1 1");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_values_are_not_re_expanded() {
        let rows = vec![MessageRow::new("user", "{{a}} and {{b}}")];
        let declared = vec![VariableDeclaration::required("a"), VariableDeclaration::required("b")];
        let out = TemplateRenderer::new()
            .render(&rows, &declared, &vars(&[("a", "{{b}}"), ("b", "B")]))
            .unwrap();
        assert_eq!(out.messages[0].content, "{{b}} and B");
    }

    #[test]
    fn test_render_is_deterministic_and_leaves_rows_untouched() {
        let rows = vec![MessageRow::new("user", "Hello, {{name}}!")];
        let declared = vec![VariableDeclaration::required("name")];
        let values = vars(&[("name", "Ada")]);
        let renderer = TemplateRenderer::new();

        let a = renderer.render(&rows, &declared, &values).unwrap();
        let b = renderer.render(&rows, &declared, &values).unwrap();
        assert_eq!(a, b);
        assert_eq!(rows[0].content, "Hello, {{name}}!");
    }

    #[test]
    fn test_placeholders_extracts_distinct_names() {
        let rows = vec![
            MessageRow::new("user", "{{b}} {{a}} {{b}}"),
            MessageRow::new("user", "{ {not} } {{ c }}"),
        ];
        let names: Vec<String> = placeholders(&rows).into_iter().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_conversation_serializes_as_message_array() {
        let conv = RenderedConversation {
            messages: vec![RenderedMessage { role: "user".into(), content: "hi".into() }],
        };
        assert_eq!(
            serde_json::to_value(&conv).unwrap(),
            serde_json::json!([{"role": "user", "content": "hi"}])
        );
    }
}
