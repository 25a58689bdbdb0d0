//! Placement store operations
//!
//! [`move_item`] is the only code path that changes a placement's stage.
//! Manual moves and automation both go through it.

use crate::directory;
use crate::error::{EngineError, EngineResult};
use crate::history;
use crate::models::{ItemRef, MoveOutcome, Placement, TransitionRecord};
use crate::store::Transaction;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

pub const INITIAL_STAGE_NOTE: &str = "Initial stage";

/// Put `item` into the first active stage of an active pipeline
pub async fn place_item<T: Transaction>(
    tx: &mut T,
    item: ItemRef,
    pipeline_id: Uuid,
    actor_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> EngineResult<Placement> {
    let pipeline = directory::require_pipeline(tx, pipeline_id).await?;
    if !pipeline.active {
        return Err(EngineError::PipelineRetired(pipeline_id));
    }

    if tx.find_placement(&item, pipeline_id).await?.is_some() {
        return Err(EngineError::AlreadyPlaced {
            item: item.to_string(),
            pipeline_id,
        });
    }

    let stage = directory::first_stage(tx, pipeline_id).await?;
    let placement = Placement {
        id: Uuid::new_v4(),
        item,
        pipeline_id,
        current_stage_id: stage.id,
        entered_at: now,
        last_updated: now,
    };
    tx.insert_placement(&placement).await?;

    let record = TransitionRecord {
        id: Uuid::new_v4(),
        placement_id: placement.id,
        pipeline_id,
        from_stage_id: None,
        to_stage_id: stage.id,
        actor_id,
        notes: Some(INITIAL_STAGE_NOTE.to_string()),
        created_at: now,
    };
    history::append(tx, &record).await?;

    info!(
        "Placed {} in pipeline {} at stage '{}'",
        placement.item, pipeline_id, stage.name
    );
    Ok(placement)
}

/// Move a placement to `to_stage_id`
///
/// Holds the placement's row lock for the rest of the transaction. Moving to
/// the current stage writes nothing. When `expected_last_updated` is given and
/// the placement has changed since, the move is abandoned as
/// [`MoveOutcome::Superseded`].
pub async fn move_item<T: Transaction>(
    tx: &mut T,
    placement_id: Uuid,
    to_stage_id: Uuid,
    actor_id: Option<Uuid>,
    notes: Option<String>,
    expected_last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> EngineResult<MoveOutcome> {
    let mut placement = tx
        .lock_placement(placement_id)
        .await?
        .ok_or(EngineError::PlacementNotFound(placement_id))?;
    let stage = directory::require_stage(tx, to_stage_id).await?;

    if stage.pipeline_id != placement.pipeline_id {
        return Err(EngineError::CrossPipelineStage {
            stage_id: to_stage_id,
            pipeline_id: placement.pipeline_id,
        });
    }

    if let Some(expected) = expected_last_updated {
        if placement.last_updated != expected {
            debug!(
                "Placement {} changed since it was scanned, skipping move",
                placement_id
            );
            return Ok(MoveOutcome::Superseded(placement));
        }
    }

    if placement.current_stage_id == to_stage_id {
        return Ok(MoveOutcome::Unchanged(placement));
    }

    let record = history::transition(&placement, to_stage_id, actor_id, notes, now);
    history::append(tx, &record).await?;

    placement.current_stage_id = to_stage_id;
    placement.last_updated = now;
    tx.update_placement(&placement).await?;

    debug!(
        "Moved placement {} from {:?} to '{}'",
        placement_id, record.from_stage_id, stage.name
    );
    Ok(MoveOutcome::Moved { placement, record })
}

/// Take an item out of its pipeline, dropping its history
pub async fn remove_item<T: Transaction>(tx: &mut T, placement_id: Uuid) -> EngineResult<Placement> {
    let placement = tx
        .lock_placement(placement_id)
        .await?
        .ok_or(EngineError::PlacementNotFound(placement_id))?;
    tx.delete_placement(placement_id).await?;
    info!("Removed {} from pipeline {}", placement.item, placement.pipeline_id);
    Ok(placement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoryScope, NewPipeline, Page, PipelineRemoval, Stage, StageInput};
    use crate::store::{MemoryStore, Store};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn setup(tx: &mut <MemoryStore as Store>::Tx) -> (Uuid, Vec<Stage>) {
        let now = Utc::now();
        let pipeline = directory::create_pipeline(tx, NewPipeline::new("People", "person", "o1", false), now)
            .await
            .unwrap();
        let diff = directory::upsert_stages(
            tx,
            pipeline.id,
            vec![StageInput::new("A", 1), StageInput::new("B", 2)],
            now,
        )
        .await
        .unwrap();
        (pipeline.id, diff.created)
    }

    #[tokio::test]
    async fn test_place_item_records_initial_transition() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, stages) = setup(&mut tx).await;

        let placement = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(placement.current_stage_id, stages[0].id);

        let latest = tx.latest_transition(placement.id).await.unwrap().unwrap();
        assert_eq!(latest.from_stage_id, None);
        assert_eq!(latest.to_stage_id, stages[0].id);
        assert_eq!(latest.notes.as_deref(), Some(INITIAL_STAGE_NOTE));

        let again = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, Utc::now()).await;
        assert!(matches!(again, Err(EngineError::AlreadyPlaced { .. })));
    }

    #[tokio::test]
    async fn test_retired_pipeline_rejects_new_items() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, _) = setup(&mut tx).await;
        place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, Utc::now())
            .await
            .unwrap();
        let removal = directory::remove_pipeline(&mut tx, pipeline_id, Utc::now()).await.unwrap();
        assert_eq!(removal, PipelineRemoval::Retired);

        let result = place_item(&mut tx, ItemRef::new("person:2"), pipeline_id, None, Utc::now()).await;
        assert!(matches!(result, Err(EngineError::PipelineRetired(id)) if id == pipeline_id));
    }

    #[tokio::test]
    async fn test_move_same_stage_writes_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, stages) = setup(&mut tx).await;
        let placement = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, Utc::now())
            .await
            .unwrap();

        let outcome = move_item(&mut tx, placement.id, stages[0].id, None, None, None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, MoveOutcome::Unchanged(_)));
        assert_eq!(tx.count_transitions(HistoryScope::Placement(placement.id)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_appends_and_updates() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, stages) = setup(&mut tx).await;
        let start = Utc::now();
        let placement = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, start)
            .await
            .unwrap();

        let later = start + Duration::hours(3);
        let actor = Uuid::new_v4();
        let outcome = move_item(
            &mut tx,
            placement.id,
            stages[1].id,
            Some(actor),
            Some("called".to_string()),
            None,
            later,
        )
        .await
        .unwrap();

        let MoveOutcome::Moved { placement: moved, record } = outcome else {
            panic!("expected a move");
        };
        assert_eq!(moved.current_stage_id, stages[1].id);
        assert_eq!(moved.last_updated, later);
        assert_eq!(moved.entered_at, start);
        assert_eq!(record.from_stage_id, Some(stages[0].id));
        assert_eq!(record.actor_id, Some(actor));

        let latest = tx.latest_transition(placement.id).await.unwrap().unwrap();
        assert_eq!(latest.to_stage_id, moved.current_stage_id);
        let page = history::query(&mut tx, HistoryScope::Placement(placement.id), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_move_rejects_foreign_stage() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, _) = setup(&mut tx).await;
        let (_, foreign) = setup(&mut tx).await;
        let placement = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, Utc::now())
            .await
            .unwrap();

        let err = move_item(&mut tx, placement.id, foreign[1].id, None, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CrossPipelineStage { .. }));

        let err = move_item(&mut tx, Uuid::new_v4(), foreign[1].id, None, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PlacementNotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_expectation_is_superseded() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, stages) = setup(&mut tx).await;
        let start = Utc::now();
        let placement = place_item(&mut tx, ItemRef::new("person:1"), pipeline_id, None, start)
            .await
            .unwrap();

        let stale = start - Duration::days(1);
        let outcome = move_item(&mut tx, placement.id, stages[1].id, None, None, Some(stale), start)
            .await
            .unwrap();
        assert!(matches!(outcome, MoveOutcome::Superseded(_)));
        assert_eq!(tx.count_transitions(HistoryScope::Placement(placement.id)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_item_cascades_history() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline_id, _) = setup(&mut tx).await;
        let placement = place_item(&mut tx, ItemRef::new("church:9"), pipeline_id, None, Utc::now())
            .await
            .unwrap();

        remove_item(&mut tx, placement.id).await.unwrap();
        assert!(tx.get_placement(placement.id).await.unwrap().is_none());
        assert_eq!(tx.count_transitions(HistoryScope::Pipeline(pipeline_id)).await.unwrap(), 0);
        assert!(matches!(
            remove_item(&mut tx, placement.id).await,
            Err(EngineError::PlacementNotFound(_))
        ));
    }
}
