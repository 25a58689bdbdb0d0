//! Error handling module
//!
//! Provides the unified error type for every pipeline operation.

use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Storage,
}

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("Stage {0} not found")]
    StageNotFound(Uuid),

    #[error("Placement {0} not found")]
    PlacementNotFound(Uuid),

    #[error("Invalid pipeline type '{0}' (expected person, church or custom)")]
    InvalidType(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Stage {stage_id} does not belong to pipeline {pipeline_id}")]
    CrossPipelineStage { stage_id: Uuid, pipeline_id: Uuid },

    #[error("Stage {stage_id} is not part of pipeline {pipeline_id}")]
    UnknownStage { stage_id: Uuid, pipeline_id: Uuid },

    #[error("Invalid stage '{name}': {reason}")]
    InvalidStage { name: String, reason: String },

    #[error("Stage order {order} is used more than once")]
    DuplicateStageOrder { order: i32 },

    #[error("Invalid task template: {0}")]
    InvalidTemplate(String),

    #[error("Item {item} is already placed in pipeline {pipeline_id}")]
    AlreadyPlaced { item: String, pipeline_id: Uuid },

    #[error("A main {pipeline_type} pipeline already exists for scope '{scope}'")]
    DuplicateMain { pipeline_type: String, scope: String },

    #[error("Stage '{name}' ({stage_id}) still holds {placements} placement(s)")]
    OccupiedStageRemoved {
        stage_id: Uuid,
        name: String,
        placements: u64,
    },

    #[error("Pipeline {0} is retired and accepts no new items")]
    PipelineRetired(Uuid),

    #[error("Main pipeline {0} cannot be deleted")]
    MainPipelineProtected(Uuid),

    #[error("Pipeline {0} has no active stages")]
    NoStages(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::PipelineNotFound(_)
            | EngineError::StageNotFound(_)
            | EngineError::PlacementNotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidType(_)
            | EngineError::InvalidPipeline(_)
            | EngineError::CrossPipelineStage { .. }
            | EngineError::UnknownStage { .. }
            | EngineError::InvalidStage { .. }
            | EngineError::DuplicateStageOrder { .. }
            | EngineError::InvalidTemplate(_)
            | EngineError::NoStages(_) => ErrorKind::Validation,
            EngineError::AlreadyPlaced { .. }
            | EngineError::DuplicateMain { .. }
            | EngineError::OccupiedStageRemoved { .. }
            | EngineError::PipelineRetired(_)
            | EngineError::MainPipelineProtected(_) => ErrorKind::Conflict,
            EngineError::Database(_) | EngineError::Pool(_) | EngineError::Internal(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PipelineNotFound(_) => "PIPELINE_NOT_FOUND",
            EngineError::StageNotFound(_) => "STAGE_NOT_FOUND",
            EngineError::PlacementNotFound(_) => "PLACEMENT_NOT_FOUND",
            EngineError::InvalidType(_) => "INVALID_TYPE",
            EngineError::InvalidPipeline(_) => "INVALID_PIPELINE",
            EngineError::CrossPipelineStage { .. } => "CROSS_PIPELINE_STAGE",
            EngineError::UnknownStage { .. } => "UNKNOWN_STAGE",
            EngineError::InvalidStage { .. } => "INVALID_STAGE",
            EngineError::DuplicateStageOrder { .. } => "DUPLICATE_STAGE_ORDER",
            EngineError::InvalidTemplate(_) => "INVALID_TEMPLATE",
            EngineError::AlreadyPlaced { .. } => "ALREADY_PLACED",
            EngineError::DuplicateMain { .. } => "DUPLICATE_MAIN",
            EngineError::OccupiedStageRemoved { .. } => "OCCUPIED_STAGE_REMOVED",
            EngineError::PipelineRetired(_) => "PIPELINE_RETIRED",
            EngineError::MainPipelineProtected(_) => "MAIN_PIPELINE_PROTECTED",
            EngineError::NoStages(_) => "NO_STAGES",
            EngineError::Database(e) => {
                error!("Database error: {:?}", e);
                "DATABASE_ERROR"
            }
            EngineError::Pool(e) => {
                error!("Pool error: {:?}", e);
                "POOL_EXHAUSTED"
            }
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Helper function to create an internal error
pub fn internal_error(msg: impl Into<String>) -> EngineError {
    EngineError::Internal(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_kinds() {
        let err = EngineError::AlreadyPlaced {
            item: "person:1".to_string(),
            pipeline_id: Uuid::nil(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.code(), "ALREADY_PLACED");

        let err = EngineError::OccupiedStageRemoved {
            stage_id: Uuid::nil(),
            name: "Contacted".to_string(),
            placements: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("2 placement(s)"));
    }

    #[test]
    fn test_validation_and_not_found_kinds() {
        let err = EngineError::CrossPipelineStage {
            stage_id: Uuid::nil(),
            pipeline_id: Uuid::nil(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(EngineError::PlacementNotFound(Uuid::nil()).kind(), ErrorKind::NotFound);
        assert_eq!(internal_error("boom").kind(), ErrorKind::Storage);
    }
}
