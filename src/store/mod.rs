//! Storage layer
//!
//! Four logical relations (pipelines, stages, placements, transition records)
//! plus the transition-to-task link used to deduplicate derived tasks.
//!
//! A [`Store`] hands out [`Transaction`]s. Transactions expose plain data
//! access; every business rule lives in the directory, placement and
//! automation modules. Dropping a transaction without committing discards
//! its writes.

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::EngineResult;
use crate::models::{
    DerivedTaskLink, HistoryScope, ItemRef, Page, Pipeline, PipelineType, Placement, Stage,
    TransitionRecord,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use uuid::Uuid;

/// Keyset cursor for scans over placements or transitions (ordered by id)
#[derive(Debug, Clone, Copy)]
pub struct Scan {
    pub after: Option<Uuid>,
    pub limit: usize,
}

impl Scan {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    /// Cursor for the page following `last_id`
    pub fn after(self, last_id: Uuid) -> Self {
        Self {
            after: Some(last_id),
            limit: self.limit,
        }
    }
}

pub trait Store: Send + Sync + 'static {
    type Tx: Transaction + 'static;

    fn begin(&self) -> impl Future<Output = EngineResult<Self::Tx>> + Send;
}

pub trait Transaction: Send {
    // ---- pipelines ----------------------------------------------------------

    fn insert_pipeline(&mut self, pipeline: &Pipeline) -> impl Future<Output = EngineResult<()>> + Send;

    fn update_pipeline(&mut self, pipeline: &Pipeline) -> impl Future<Output = EngineResult<()>> + Send;

    /// Removes the pipeline and its stages
    fn delete_pipeline(&mut self, id: Uuid) -> impl Future<Output = EngineResult<()>> + Send;

    fn get_pipeline(&mut self, id: Uuid) -> impl Future<Output = EngineResult<Option<Pipeline>>> + Send;

    fn find_main_pipeline(
        &mut self,
        pipeline_type: PipelineType,
        scope: &str,
    ) -> impl Future<Output = EngineResult<Option<Pipeline>>> + Send;

    fn list_pipelines(&mut self) -> impl Future<Output = EngineResult<Vec<Pipeline>>> + Send;

    // ---- stages -------------------------------------------------------------

    fn insert_stage(&mut self, stage: &Stage) -> impl Future<Output = EngineResult<()>> + Send;

    fn update_stage(&mut self, stage: &Stage) -> impl Future<Output = EngineResult<()>> + Send;

    fn delete_stage(&mut self, id: Uuid) -> impl Future<Output = EngineResult<()>> + Send;

    fn get_stage(&mut self, id: Uuid) -> impl Future<Output = EngineResult<Option<Stage>>> + Send;

    /// All stages of a pipeline, active or not, ordered by `order`
    fn list_stages(&mut self, pipeline_id: Uuid) -> impl Future<Output = EngineResult<Vec<Stage>>> + Send;

    /// Active stages of active pipelines that carry any automation rule
    fn list_automated_stages(&mut self) -> impl Future<Output = EngineResult<Vec<Stage>>> + Send;

    // ---- placements ---------------------------------------------------------

    fn insert_placement(&mut self, placement: &Placement) -> impl Future<Output = EngineResult<()>> + Send;

    fn update_placement(&mut self, placement: &Placement) -> impl Future<Output = EngineResult<()>> + Send;

    /// Removes the placement together with its history and task links
    fn delete_placement(&mut self, id: Uuid) -> impl Future<Output = EngineResult<()>> + Send;

    fn get_placement(&mut self, id: Uuid) -> impl Future<Output = EngineResult<Option<Placement>>> + Send;

    /// Read a placement and hold its row lock until the transaction ends
    fn lock_placement(&mut self, id: Uuid) -> impl Future<Output = EngineResult<Option<Placement>>> + Send;

    fn find_placement(
        &mut self,
        item: &ItemRef,
        pipeline_id: Uuid,
    ) -> impl Future<Output = EngineResult<Option<Placement>>> + Send;

    fn count_placements_in_stage(&mut self, stage_id: Uuid) -> impl Future<Output = EngineResult<u64>> + Send;

    fn count_placements_in_pipeline(&mut self, pipeline_id: Uuid) -> impl Future<Output = EngineResult<u64>> + Send;

    /// Placements in `stage_id`, optionally only those untouched since `updated_before`
    fn scan_placements(
        &mut self,
        stage_id: Uuid,
        updated_before: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> impl Future<Output = EngineResult<Vec<Placement>>> + Send;

    // ---- transition history -------------------------------------------------

    fn insert_transition(&mut self, record: &TransitionRecord) -> impl Future<Output = EngineResult<()>> + Send;

    fn latest_transition(
        &mut self,
        placement_id: Uuid,
    ) -> impl Future<Output = EngineResult<Option<TransitionRecord>>> + Send;

    /// Newest first
    fn list_transitions(
        &mut self,
        scope: HistoryScope,
        page: Page,
    ) -> impl Future<Output = EngineResult<Vec<TransitionRecord>>> + Send;

    fn count_transitions(&mut self, scope: HistoryScope) -> impl Future<Output = EngineResult<u64>> + Send;

    /// Transitions into `stage_id` that have no task link yet
    fn scan_untasked_transitions(
        &mut self,
        stage_id: Uuid,
        since: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> impl Future<Output = EngineResult<Vec<TransitionRecord>>> + Send;

    // ---- derived task links -------------------------------------------------

    /// Reserve the task slot for a transition; `false` if someone already holds it
    fn claim_derived_task(
        &mut self,
        transition_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> impl Future<Output = EngineResult<bool>> + Send;

    fn attach_task_handle(
        &mut self,
        transition_id: Uuid,
        handle: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    /// Drop a claim that never got a task handle
    fn release_derived_task(&mut self, transition_id: Uuid) -> impl Future<Output = EngineResult<()>> + Send;

    fn get_derived_task(
        &mut self,
        transition_id: Uuid,
    ) -> impl Future<Output = EngineResult<Option<DerivedTaskLink>>> + Send;

    // ---- transaction control ------------------------------------------------

    fn savepoint(&mut self) -> impl Future<Output = EngineResult<()>> + Send;

    fn release_savepoint(&mut self) -> impl Future<Output = EngineResult<()>> + Send;

    fn rollback_to_savepoint(&mut self) -> impl Future<Output = EngineResult<()>> + Send;

    fn commit(self) -> impl Future<Output = EngineResult<()>> + Send;

    fn rollback(self) -> impl Future<Output = EngineResult<()>> + Send;
}
