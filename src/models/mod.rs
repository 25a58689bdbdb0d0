//! Domain models
//!
//! Contains the pipeline, stage, placement and history structures.

pub mod pipeline;
pub mod placement;

// Re-export commonly used types
pub use pipeline::*;
pub use placement::*;
