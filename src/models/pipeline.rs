//! Pipeline and stage models
//!
//! A pipeline is an ordered sequence of stages; each stage carries its own
//! automation configuration.

use crate::automation::template::TaskTemplate;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_STAGE_COLOR: &str = "#3498db";

/// What kind of item a pipeline is meant for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Person,
    Church,
    Custom,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Person => "person",
            PipelineType::Church => "church",
            PipelineType::Custom => "custom",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "people" and "both" are legacy spellings still present in stored data
        match s.trim().to_ascii_lowercase().as_str() {
            "person" | "people" => Ok(PipelineType::Person),
            "church" | "churches" => Ok(PipelineType::Church),
            "custom" | "both" => Ok(PipelineType::Custom),
            _ => Err(EngineError::InvalidType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub pipeline_type: PipelineType,
    /// Tenant scope, e.g. an office identifier
    pub scope: String,
    pub is_main: bool,
    /// Main-pipeline stage a custom pipeline hangs off
    pub parent_stage: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a pipeline
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewPipeline {
    #[validate(length(min = 1, max = 100, message = "Pipeline name must be between 1 and 100 characters"))]
    pub name: String,
    /// Raw type tag, parsed into [`PipelineType`]
    pub pipeline_type: String,
    #[validate(length(min = 1, message = "Pipeline scope is required"))]
    pub scope: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_stage: Option<String>,
}

impl NewPipeline {
    pub fn new(
        name: impl Into<String>,
        pipeline_type: impl Into<String>,
        scope: impl Into<String>,
        is_main: bool,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline_type: pipeline_type.into(),
            scope: scope.into(),
            is_main,
            description: None,
            parent_stage: None,
        }
    }
}

/// Editable pipeline attributes; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PipelineUpdate {
    #[validate(length(min = 1, max = 100, message = "Pipeline name must be between 1 and 100 characters"))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_stage: Option<String>,
    pub active: Option<bool>,
}

/// What `remove_pipeline` actually did
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRemoval {
    Deleted,
    /// Still occupied, so only deactivated
    Retired,
}

/// Per-stage automation rules
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StageAutomation {
    #[validate(range(min = 1, message = "auto_move_days must be a positive number of days"))]
    #[serde(default)]
    pub auto_move_days: Option<i32>,
    #[serde(default)]
    pub auto_reminder: bool,
    #[serde(default)]
    pub auto_task_template: Option<TaskTemplate>,
    /// Stored template that no longer decodes, kept verbatim until replaced
    #[serde(skip)]
    pub unreadable_template: Option<serde_json::Value>,
}

impl StageAutomation {
    pub fn is_empty(&self) -> bool {
        self.auto_move_days.is_none()
            && !self.auto_reminder
            && self.auto_task_template.is_none()
            && self.unreadable_template.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub order: i32,
    pub color: String,
    pub automation: StageAutomation,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of the desired stage set handed to `upsert_stages`
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StageInput {
    /// `None` creates a new stage
    #[serde(default)]
    pub id: Option<Uuid>,
    #[validate(length(min = 1, max = 100, message = "Stage name must be between 1 and 100 characters"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub order: i32,
    #[validate(custom(function = "validate_color"))]
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub automation: StageAutomation,
}

impl StageInput {
    pub fn new(name: impl Into<String>, order: i32) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            order,
            color: default_color(),
            active: true,
            automation: StageAutomation::default(),
        }
    }

    /// Input that keeps an existing stage as it is
    pub fn from_stage(stage: &Stage) -> Self {
        Self {
            id: Some(stage.id),
            name: stage.name.clone(),
            description: stage.description.clone(),
            order: stage.order,
            color: stage.color.clone(),
            active: stage.active,
            automation: stage.automation.clone(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_automation(mut self, automation: StageAutomation) -> Self {
        self.automation = automation;
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

fn default_color() -> String {
    DEFAULT_STAGE_COLOR.to_string()
}

fn default_active() -> bool {
    true
}

/// Validate a `#rrggbb` color
fn validate_color(color: &str) -> Result<(), validator::ValidationError> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());

    if !valid {
        let mut err = validator::ValidationError::new("invalid_color");
        err.message = Some("Stage color must look like #3498db".into());
        return Err(err);
    }
    Ok(())
}

/// Result of applying a stage batch
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDiff {
    pub created: Vec<Stage>,
    pub updated: Vec<Stage>,
    pub unchanged: Vec<Uuid>,
    pub deleted: Vec<Uuid>,
}

/// A stage with the number of placements currently in it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOccupancy {
    pub stage: Stage,
    pub placements: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_type_parsing() {
        assert_eq!("person".parse::<PipelineType>().unwrap(), PipelineType::Person);
        assert_eq!("People".parse::<PipelineType>().unwrap(), PipelineType::Person);
        assert_eq!("church".parse::<PipelineType>().unwrap(), PipelineType::Church);
        assert_eq!("both".parse::<PipelineType>().unwrap(), PipelineType::Custom);
        assert!(matches!(
            "vendor".parse::<PipelineType>(),
            Err(EngineError::InvalidType(_))
        ));
    }

    #[test]
    fn test_stage_input_validation() {
        assert!(StageInput::new("Contacted", 1).validate().is_ok());
        assert!(StageInput::new("", 1).validate().is_err());
        assert!(StageInput::new("Contacted", 1).with_color("blue").validate().is_err());

        let automation = StageAutomation {
            auto_move_days: Some(0),
            ..Default::default()
        };
        assert!(automation.validate().is_err());
    }

    #[test]
    fn test_stage_input_defaults_from_json() {
        let input: StageInput =
            serde_json::from_value(serde_json::json!({ "name": "Invited", "order": 3 })).unwrap();
        assert_eq!(input.color, DEFAULT_STAGE_COLOR);
        assert!(input.active);
        assert!(input.automation.is_empty());
    }
}
