//! Pipeline engine facade
//!
//! Runs every user-invoked operation in its own transaction. Errors are
//! returned as-is and the transaction is rolled back.

use crate::clock::Clock;
use crate::directory;
use crate::error::{EngineError, EngineResult};
use crate::history;
use crate::models::{
    HistoryPage, HistoryScope, ItemRef, MoveOutcome, NewPipeline, Page, Pipeline, PipelineRemoval,
    PipelineUpdate, Placement, Stage, StageDiff, StageInput, StageOccupancy,
};
use crate::placement;
use crate::seed;
use crate::store::{Store, Transaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub struct PipelineEngine<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> PipelineEngine<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Commit on success, roll back on failure
    async fn finish<R>(tx: S::Tx, result: EngineResult<R>) -> EngineResult<R> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback after '{}' failed: {}", e, rollback);
                }
                Err(e)
            }
        }
    }

    // ---- pipelines ----------------------------------------------------------

    pub async fn create_pipeline(&self, input: NewPipeline) -> EngineResult<Pipeline> {
        let mut tx = self.store.begin().await?;
        let result = directory::create_pipeline(&mut tx, input, self.now()).await;
        Self::finish(tx, result).await
    }

    pub async fn update_pipeline(&self, id: Uuid, update: PipelineUpdate) -> EngineResult<Pipeline> {
        let mut tx = self.store.begin().await?;
        let result = directory::update_pipeline(&mut tx, id, update, self.now()).await;
        Self::finish(tx, result).await
    }

    pub async fn remove_pipeline(&self, id: Uuid) -> EngineResult<PipelineRemoval> {
        let mut tx = self.store.begin().await?;
        let result = directory::remove_pipeline(&mut tx, id, self.now()).await;
        Self::finish(tx, result).await
    }

    pub async fn get_pipeline(&self, id: Uuid) -> EngineResult<Pipeline> {
        let mut tx = self.store.begin().await?;
        let result = directory::require_pipeline(&mut tx, id).await;
        Self::finish(tx, result).await
    }

    /// Pipelines the caller's predicate lets through
    pub async fn list_pipelines<F>(&self, visible: F) -> EngineResult<Vec<Pipeline>>
    where
        F: Fn(&Pipeline) -> bool,
    {
        let mut tx = self.store.begin().await?;
        let result = tx.list_pipelines().await;
        let pipelines = Self::finish(tx, result).await?;
        Ok(pipelines.into_iter().filter(|p| visible(p)).collect())
    }

    /// Create the main PERSON and CHURCH pipelines of a scope if missing
    pub async fn ensure_main_pipelines(&self, scope: &str) -> EngineResult<Vec<Pipeline>> {
        let mut tx = self.store.begin().await?;
        let result = seed::ensure_main_pipelines(&mut tx, scope, self.now()).await;
        Self::finish(tx, result).await
    }

    // ---- stages -------------------------------------------------------------

    pub async fn upsert_stages(
        &self,
        pipeline_id: Uuid,
        desired: Vec<StageInput>,
    ) -> EngineResult<StageDiff> {
        let mut tx = self.store.begin().await?;
        let result = directory::upsert_stages(&mut tx, pipeline_id, desired, self.now()).await;
        Self::finish(tx, result).await
    }

    pub async fn list_stages(&self, pipeline_id: Uuid) -> EngineResult<Vec<Stage>> {
        let mut tx = self.store.begin().await?;
        let result = match directory::require_pipeline(&mut tx, pipeline_id).await {
            Ok(_) => tx.list_stages(pipeline_id).await,
            Err(e) => Err(e),
        };
        Self::finish(tx, result).await
    }

    pub async fn next_stage(&self, stage_id: Uuid) -> EngineResult<Option<Stage>> {
        let mut tx = self.store.begin().await?;
        let result = match directory::require_stage(&mut tx, stage_id).await {
            Ok(stage) => directory::next_stage(&mut tx, &stage).await,
            Err(e) => Err(e),
        };
        Self::finish(tx, result).await
    }

    pub async fn first_stage(&self, pipeline_id: Uuid) -> EngineResult<Stage> {
        let mut tx = self.store.begin().await?;
        let result = directory::first_stage(&mut tx, pipeline_id).await;
        Self::finish(tx, result).await
    }

    pub async fn stage_occupancy(&self, pipeline_id: Uuid) -> EngineResult<Vec<StageOccupancy>> {
        let mut tx = self.store.begin().await?;
        let result = directory::stage_occupancy(&mut tx, pipeline_id).await;
        Self::finish(tx, result).await
    }

    // ---- placements ---------------------------------------------------------

    pub async fn place_item(
        &self,
        item: impl Into<ItemRef>,
        pipeline_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> EngineResult<Placement> {
        let mut tx = self.store.begin().await?;
        let result = placement::place_item(&mut tx, item.into(), pipeline_id, actor_id, self.now()).await;
        Self::finish(tx, result).await
    }

    /// Manual move; moving to the current stage is a no-op
    pub async fn move_item(
        &self,
        placement_id: Uuid,
        to_stage_id: Uuid,
        actor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> EngineResult<Placement> {
        let mut tx = self.store.begin().await?;
        let result = placement::move_item(
            &mut tx,
            placement_id,
            to_stage_id,
            actor_id,
            notes,
            None,
            self.now(),
        )
        .await
        .map(MoveOutcome::into_placement);
        Self::finish(tx, result).await
    }

    pub async fn remove_item(&self, placement_id: Uuid) -> EngineResult<Placement> {
        let mut tx = self.store.begin().await?;
        let result = placement::remove_item(&mut tx, placement_id).await;
        Self::finish(tx, result).await
    }

    pub async fn get_placement(&self, id: Uuid) -> EngineResult<Placement> {
        let mut tx = self.store.begin().await?;
        let result = match tx.get_placement(id).await {
            Ok(Some(placement)) => Ok(placement),
            Ok(None) => Err(EngineError::PlacementNotFound(id)),
            Err(e) => Err(e),
        };
        Self::finish(tx, result).await
    }

    pub async fn find_placement(
        &self,
        item: impl Into<ItemRef>,
        pipeline_id: Uuid,
    ) -> EngineResult<Option<Placement>> {
        let item = item.into();
        let mut tx = self.store.begin().await?;
        let result = tx.find_placement(&item, pipeline_id).await;
        Self::finish(tx, result).await
    }

    // ---- history ------------------------------------------------------------

    pub async fn list_history(&self, scope: HistoryScope, page: Page) -> EngineResult<HistoryPage> {
        let mut tx = self.store.begin().await?;
        let result = history::query(&mut tx, scope, page).await;
        Self::finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::ErrorKind;
    use crate::models::TrackedItem;
    use crate::store::MemoryStore;

    fn engine() -> PipelineEngine<MemoryStore> {
        PipelineEngine::new(MemoryStore::new(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_committed() {
        let engine = engine();
        let pipeline = engine
            .create_pipeline(NewPipeline::new("People", "person", "o1", false))
            .await
            .unwrap();
        engine
            .upsert_stages(pipeline.id, vec![StageInput::new("A", 1)])
            .await
            .unwrap();

        let err = engine
            .upsert_stages(
                pipeline.id,
                vec![StageInput::new("B", 1), StageInput::new("C", 1)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let names: Vec<String> = engine
            .list_stages(pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["A"]);
    }

    #[tokio::test]
    async fn test_list_pipelines_applies_predicate() {
        let engine = engine();
        for scope in ["north", "south"] {
            engine
                .create_pipeline(NewPipeline::new("People", "person", scope, true))
                .await
                .unwrap();
        }
        let north = engine.list_pipelines(|p| p.scope == "north").await.unwrap();
        assert_eq!(north.len(), 1);
        assert_eq!(engine.list_pipelines(|_| true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tracked_items_are_placed_by_ref() {
        let engine = engine();
        let pipeline = engine
            .create_pipeline(NewPipeline::new("Churches", "church", "o1", false))
            .await
            .unwrap();
        engine
            .upsert_stages(pipeline.id, vec![StageInput::new("A", 1)])
            .await
            .unwrap();

        let church = TrackedItem::Church(Uuid::new_v4());
        let placement = engine.place_item(church, pipeline.id, None).await.unwrap();
        let found = engine.find_placement(church, pipeline.id).await.unwrap();
        assert_eq!(found, Some(placement.clone()));
        assert_eq!(engine.get_placement(placement.id).await.unwrap(), placement);

        let err = engine.place_item(church, pipeline.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_next_stage_of_unknown_stage() {
        let engine = engine();
        let err = engine.next_stage(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
