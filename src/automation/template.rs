//! Typed follow-up task templates
//!
//! Templates are parsed and checked once, when a stage is saved. Expansion at
//! tick time only substitutes placeholders.

use crate::error::EngineError;
use crate::models::{ItemRef, Pipeline, Stage, TransitionRecord};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Placeholders a template may reference
pub const KNOWN_PLACEHOLDERS: &[&str] = &["item_name", "contact_name", "stage_name", "pipeline_name"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    #[serde(alias = "low")]
    Low,
    #[default]
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "urgent")]
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "snake_case")]
pub struct TaskTemplate {
    #[validate(length(min = 1, max = 200, message = "Task title must be between 1 and 200 characters"))]
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[validate(range(min = 0, max = 365, message = "days_to_complete must be between 0 and 365"))]
    #[serde(default = "default_days_to_complete")]
    pub days_to_complete: i64,
    #[serde(default)]
    pub priority: TaskPriority,
}

fn default_title() -> String {
    "Follow up".to_string()
}

fn default_days_to_complete() -> i64 {
    3
}

impl Default for TaskTemplate {
    fn default() -> Self {
        Self {
            title: default_title(),
            description: String::new(),
            days_to_complete: default_days_to_complete(),
            priority: TaskPriority::default(),
        }
    }
}

/// Attribute values substituted into a template
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub item_name: String,
    pub stage_name: String,
    pub pipeline_name: String,
}

impl TemplateContext {
    fn lookup(&self, placeholder: &str) -> Option<&str> {
        match placeholder {
            "item_name" | "contact_name" => Some(&self.item_name),
            "stage_name" => Some(&self.stage_name),
            "pipeline_name" => Some(&self.pipeline_name),
            _ => None,
        }
    }
}

/// Fields handed to the task sink
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub due_date: DateTime<Utc>,
    pub item: ItemRef,
    pub scope: String,
    pub pipeline_id: Uuid,
    pub stage_id: Uuid,
    pub placement_id: Uuid,
    pub transition_id: Uuid,
}

impl TaskTemplate {
    pub fn new(title: impl Into<String>, days_to_complete: i64) -> Self {
        Self {
            title: title.into(),
            days_to_complete,
            ..Default::default()
        }
    }

    /// Parse legacy JSON text, rejecting anything that does not check out
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let template: TaskTemplate = serde_json::from_str(raw)
            .map_err(|e| EngineError::InvalidTemplate(format!("malformed JSON: {}", e)))?;
        template.check()?;
        Ok(template)
    }

    /// Field validation plus placeholder checks
    pub fn check(&self) -> Result<(), EngineError> {
        self.validate()
            .map_err(|e| EngineError::InvalidTemplate(e.to_string()))?;

        for text in [&self.title, &self.description] {
            for captures in PLACEHOLDER.captures_iter(text) {
                let name = &captures[1];
                if !KNOWN_PLACEHOLDERS.contains(&name) {
                    return Err(EngineError::InvalidTemplate(format!(
                        "unknown placeholder '{{{}}}'",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Substitute placeholders in a single string
    pub fn render(text: &str, ctx: &TemplateContext) -> Result<String, EngineError> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(text, |caps: &regex::Captures<'_>| {
            match ctx.lookup(&caps[1]) {
                Some(value) => value.to_string(),
                None => {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    caps[0].to_string()
                }
            }
        });

        match missing {
            Some(name) => Err(EngineError::InvalidTemplate(format!(
                "unknown placeholder '{{{}}}'",
                name
            ))),
            None => Ok(rendered.into_owned()),
        }
    }

    /// Build the task for a transition into `stage`
    pub fn expand(
        &self,
        ctx: &TemplateContext,
        pipeline: &Pipeline,
        stage: &Stage,
        item: &ItemRef,
        transition: &TransitionRecord,
    ) -> Result<ExpandedTask, EngineError> {
        Ok(ExpandedTask {
            title: Self::render(&self.title, ctx)?,
            description: Self::render(&self.description, ctx)?,
            priority: self.priority,
            due_date: transition.created_at + Duration::days(self.days_to_complete),
            item: item.clone(),
            scope: pipeline.scope.clone(),
            pipeline_id: pipeline.id,
            stage_id: stage.id,
            placement_id: transition.placement_id,
            transition_id: transition.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> TemplateContext {
        TemplateContext {
            item_name: "Ruth Miller".to_string(),
            stage_name: "Invitation".to_string(),
            pipeline_name: "People".to_string(),
        }
    }

    #[test]
    fn test_legacy_json_defaults() {
        let template = TaskTemplate::from_json_str(r#"{"title": "Call {contact_name}"}"#).unwrap();
        assert_eq!(template.days_to_complete, 3);
        assert_eq!(template.priority, TaskPriority::Medium);
        assert_eq!(template.description, "");
    }

    #[test]
    fn test_priority_accepts_both_cases() {
        let template =
            TaskTemplate::from_json_str(r#"{"title": "x", "priority": "high"}"#).unwrap();
        assert_eq!(template.priority, TaskPriority::High);
        let template =
            TaskTemplate::from_json_str(r#"{"title": "x", "priority": "URGENT"}"#).unwrap();
        assert_eq!(template.priority, TaskPriority::Urgent);
    }

    #[test]
    fn test_malformed_template_is_rejected() {
        assert!(matches!(
            TaskTemplate::from_json_str("{not json"),
            Err(EngineError::InvalidTemplate(_))
        ));
        assert!(matches!(
            TaskTemplate::from_json_str(r#"{"title": "Hi {nickname}"}"#),
            Err(EngineError::InvalidTemplate(_))
        ));
        assert!(TaskTemplate::new("", 2).check().is_err());
        assert!(TaskTemplate::new("Soon", -1).check().is_err());
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let rendered = TaskTemplate::render(
            "Follow up with {item_name} ({contact_name}) in {stage_name} of {pipeline_name}",
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "Follow up with Ruth Miller (Ruth Miller) in Invitation of People"
        );
    }

    #[test]
    fn test_render_leaves_plain_text() {
        assert_eq!(TaskTemplate::render("No braces here", &ctx()).unwrap(), "No braces here");
        assert!(TaskTemplate::render("{bogus}", &ctx()).is_err());
    }
}
