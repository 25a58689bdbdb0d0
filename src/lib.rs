//! Stageflow - relationship pipeline engine
//!
//! Tracked items move through ordered stages. A periodic automation tick
//! advances stale items, raises reminders and spawns follow-up tasks, and can
//! be re-run without duplicating any of it.
//!
//! - [`PipelineEngine`]: pipelines, stages, placements and history
//! - [`AutomationEngine`]: the idempotent tick
//! - [`store`]: storage seam with in-memory and Postgres backends

pub mod automation;
pub mod clock;
pub mod config;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod history;
pub mod models;
pub mod placement;
pub mod seed;
pub mod store;

pub use automation::{AutomationEngine, Collaborators, TickReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::PipelineEngine;
pub use error::{EngineError, EngineResult, ErrorKind};
