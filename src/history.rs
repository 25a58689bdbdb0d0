//! Transition history ledger
//!
//! Append-only. Records are only ever removed together with their placement.

use crate::error::EngineResult;
use crate::models::{HistoryPage, HistoryScope, Page, Placement, TransitionRecord};
use crate::store::Transaction;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Build the record for a move of `placement` into `to_stage_id`
pub fn transition(
    placement: &Placement,
    to_stage_id: Uuid,
    actor_id: Option<Uuid>,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> TransitionRecord {
    TransitionRecord {
        id: Uuid::new_v4(),
        placement_id: placement.id,
        pipeline_id: placement.pipeline_id,
        from_stage_id: Some(placement.current_stage_id),
        to_stage_id,
        actor_id,
        notes,
        created_at: now,
    }
}

pub async fn append<T: Transaction>(tx: &mut T, record: &TransitionRecord) -> EngineResult<()> {
    tx.insert_transition(record).await
}

/// One page of history, newest first
pub async fn query<T: Transaction>(
    tx: &mut T,
    scope: HistoryScope,
    page: Page,
) -> EngineResult<HistoryPage> {
    let records = tx.list_transitions(scope, page).await?;
    let total = tx.count_transitions(scope).await?;
    Ok(HistoryPage { records, total, page })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory;
    use crate::models::{ItemRef, NewPipeline, StageInput};
    use crate::store::{MemoryStore, Store};
    use chrono::Duration;

    #[tokio::test]
    async fn test_query_pages_newest_first() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let start = Utc::now();
        let pipeline = directory::create_pipeline(&mut tx, NewPipeline::new("P", "custom", "o1", false), start)
            .await
            .unwrap();
        let diff = directory::upsert_stages(&mut tx, pipeline.id, vec![StageInput::new("A", 1)], start)
            .await
            .unwrap();
        let placement = Placement {
            id: Uuid::new_v4(),
            item: ItemRef::new("person:7"),
            pipeline_id: pipeline.id,
            current_stage_id: diff.created[0].id,
            entered_at: start,
            last_updated: start,
        };
        tx.insert_placement(&placement).await.unwrap();

        let mut ids = Vec::new();
        for minutes in 0..5 {
            let record = transition(&placement, Uuid::new_v4(), None, None, start + Duration::minutes(minutes));
            append(&mut tx, &record).await.unwrap();
            ids.push(record.id);
        }

        let first = query(&mut tx, HistoryScope::Placement(placement.id), Page::first(2))
            .await
            .unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);
        assert!(first.has_more());

        let last = query(&mut tx, HistoryScope::Pipeline(placement.pipeline_id), Page::new(2, 4))
            .await
            .unwrap();
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].id, ids[0]);
        assert!(!last.has_more());
    }
}
