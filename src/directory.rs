//! Pipeline & stage directory
//!
//! Pipeline lifecycle plus the batch stage diff. Stage lookups used by the
//! automation tick are also exposed as pure functions over a loaded stage
//! list so a tick can cache stages per pipeline.

use crate::error::{EngineError, EngineResult};
use crate::models::{
    NewPipeline, Pipeline, PipelineRemoval, PipelineType, PipelineUpdate, Stage, StageDiff,
    StageInput, StageOccupancy,
};
use crate::store::Transaction;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// Pipelines
// =============================================================================

pub async fn create_pipeline<T: Transaction>(
    tx: &mut T,
    input: NewPipeline,
    now: DateTime<Utc>,
) -> EngineResult<Pipeline> {
    input
        .validate()
        .map_err(|e| EngineError::InvalidPipeline(e.to_string()))?;
    let pipeline_type: PipelineType = input.pipeline_type.parse()?;

    if input.is_main && tx.find_main_pipeline(pipeline_type, &input.scope).await?.is_some() {
        return Err(EngineError::DuplicateMain {
            pipeline_type: pipeline_type.to_string(),
            scope: input.scope,
        });
    }

    let pipeline = Pipeline {
        id: Uuid::new_v4(),
        name: input.name,
        description: input.description,
        pipeline_type,
        scope: input.scope,
        is_main: input.is_main,
        parent_stage: input.parent_stage,
        active: true,
        created_at: now,
        updated_at: now,
    };
    tx.insert_pipeline(&pipeline).await?;

    info!(
        "Created {} pipeline '{}' ({}) for scope '{}'",
        pipeline.pipeline_type, pipeline.name, pipeline.id, pipeline.scope
    );
    Ok(pipeline)
}

pub async fn update_pipeline<T: Transaction>(
    tx: &mut T,
    id: Uuid,
    update: PipelineUpdate,
    now: DateTime<Utc>,
) -> EngineResult<Pipeline> {
    update
        .validate()
        .map_err(|e| EngineError::InvalidPipeline(e.to_string()))?;
    let mut pipeline = require_pipeline(tx, id).await?;

    if let Some(name) = update.name {
        pipeline.name = name;
    }
    if let Some(description) = update.description {
        pipeline.description = Some(description);
    }
    if let Some(parent_stage) = update.parent_stage {
        pipeline.parent_stage = Some(parent_stage);
    }
    if let Some(active) = update.active {
        pipeline.active = active;
    }
    pipeline.updated_at = now;

    tx.update_pipeline(&pipeline).await?;
    Ok(pipeline)
}

/// Main pipelines are protected; occupied ones are retired instead of deleted
pub async fn remove_pipeline<T: Transaction>(
    tx: &mut T,
    id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<PipelineRemoval> {
    let mut pipeline = require_pipeline(tx, id).await?;
    if pipeline.is_main {
        return Err(EngineError::MainPipelineProtected(id));
    }

    let occupied = tx.count_placements_in_pipeline(id).await?;
    if occupied > 0 {
        pipeline.active = false;
        pipeline.updated_at = now;
        tx.update_pipeline(&pipeline).await?;
        info!(
            "Retired pipeline '{}' ({}), {} placement(s) remain",
            pipeline.name, id, occupied
        );
        return Ok(PipelineRemoval::Retired);
    }

    tx.delete_pipeline(id).await?;
    info!("Deleted pipeline '{}' ({})", pipeline.name, id);
    Ok(PipelineRemoval::Deleted)
}

pub async fn require_pipeline<T: Transaction>(tx: &mut T, id: Uuid) -> EngineResult<Pipeline> {
    tx.get_pipeline(id)
        .await?
        .ok_or(EngineError::PipelineNotFound(id))
}

pub async fn require_stage<T: Transaction>(tx: &mut T, id: Uuid) -> EngineResult<Stage> {
    tx.get_stage(id).await?.ok_or(EngineError::StageNotFound(id))
}

// =============================================================================
// Stages
// =============================================================================

fn invalid_stage(input: &StageInput, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidStage {
        name: input.name.clone(),
        reason: reason.into(),
    }
}

/// Check a single stage entry on its own
fn check_stage_input(input: &StageInput) -> EngineResult<()> {
    input
        .validate()
        .map_err(|e| invalid_stage(input, e.to_string()))?;
    input
        .automation
        .validate()
        .map_err(|e| invalid_stage(input, e.to_string()))?;
    if let Some(template) = &input.automation.auto_task_template {
        template.check()?;
    }
    Ok(())
}

fn apply_input(stage: &Stage, input: &StageInput, now: DateTime<Utc>) -> Option<Stage> {
    let same = stage.name == input.name
        && stage.description == input.description
        && stage.order == input.order
        && stage.color == input.color
        && stage.active == input.active
        && stage.automation == input.automation;
    if same {
        return None;
    }

    Some(Stage {
        name: input.name.clone(),
        description: input.description.clone(),
        order: input.order,
        color: input.color.clone(),
        active: input.active,
        automation: input.automation.clone(),
        updated_at: now,
        ..stage.clone()
    })
}

/// Replace a pipeline's stage set with `desired`
///
/// Entries with an id update that stage, entries without one create a stage,
/// and existing stages missing from the list are deleted. An omitted stage
/// that still holds placements fails the whole batch with
/// `OccupiedStageRemoved`; the caller's transaction is then left unapplied.
pub async fn upsert_stages<T: Transaction>(
    tx: &mut T,
    pipeline_id: Uuid,
    desired: Vec<StageInput>,
    now: DateTime<Utc>,
) -> EngineResult<StageDiff> {
    require_pipeline(tx, pipeline_id).await?;

    let mut orders = HashSet::new();
    let mut ids = HashSet::new();
    for input in &desired {
        check_stage_input(input)?;
        if !orders.insert(input.order) {
            return Err(EngineError::DuplicateStageOrder { order: input.order });
        }
        if let Some(id) = input.id {
            if !ids.insert(id) {
                return Err(invalid_stage(input, "listed more than once"));
            }
        }
    }

    let existing: HashMap<Uuid, Stage> = tx
        .list_stages(pipeline_id)
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    for id in &ids {
        if !existing.contains_key(id) {
            return Err(EngineError::UnknownStage {
                stage_id: *id,
                pipeline_id,
            });
        }
    }

    let mut omitted: Vec<&Stage> = existing.values().filter(|s| !ids.contains(&s.id)).collect();
    omitted.sort_by_key(|s| s.order);
    for stage in &omitted {
        let placements = tx.count_placements_in_stage(stage.id).await?;
        if placements > 0 {
            return Err(EngineError::OccupiedStageRemoved {
                stage_id: stage.id,
                name: stage.name.clone(),
                placements,
            });
        }
    }

    let mut diff = StageDiff::default();
    for stage in omitted {
        tx.delete_stage(stage.id).await?;
        diff.deleted.push(stage.id);
    }

    for input in &desired {
        match input.id.and_then(|id| existing.get(&id)) {
            Some(stage) => match apply_input(stage, input, now) {
                Some(updated) => {
                    tx.update_stage(&updated).await?;
                    diff.updated.push(updated);
                }
                None => diff.unchanged.push(stage.id),
            },
            None => {
                let stage = Stage {
                    id: Uuid::new_v4(),
                    pipeline_id,
                    name: input.name.clone(),
                    description: input.description.clone(),
                    order: input.order,
                    color: input.color.clone(),
                    automation: input.automation.clone(),
                    active: input.active,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_stage(&stage).await?;
                diff.created.push(stage);
            }
        }
    }

    debug!(
        "Stage diff for pipeline {}: {} created, {} updated, {} unchanged, {} deleted",
        pipeline_id,
        diff.created.len(),
        diff.updated.len(),
        diff.unchanged.len(),
        diff.deleted.len()
    );
    Ok(diff)
}

/// Lowest-order active stage with an order above `stage`'s
pub fn next_in<'a>(stages: &'a [Stage], stage: &Stage) -> Option<&'a Stage> {
    stages
        .iter()
        .filter(|s| s.active && s.pipeline_id == stage.pipeline_id && s.order > stage.order)
        .min_by_key(|s| s.order)
}

/// Lowest-order active stage
pub fn first_in(stages: &[Stage]) -> Option<&Stage> {
    stages.iter().filter(|s| s.active).min_by_key(|s| s.order)
}

pub async fn next_stage<T: Transaction>(tx: &mut T, stage: &Stage) -> EngineResult<Option<Stage>> {
    let stages = tx.list_stages(stage.pipeline_id).await?;
    Ok(next_in(&stages, stage).cloned())
}

pub async fn first_stage<T: Transaction>(tx: &mut T, pipeline_id: Uuid) -> EngineResult<Stage> {
    let stages = tx.list_stages(pipeline_id).await?;
    first_in(&stages)
        .cloned()
        .ok_or(EngineError::NoStages(pipeline_id))
}

/// Active stages with their current placement counts, in order
pub async fn stage_occupancy<T: Transaction>(
    tx: &mut T,
    pipeline_id: Uuid,
) -> EngineResult<Vec<StageOccupancy>> {
    require_pipeline(tx, pipeline_id).await?;
    let stages = tx.list_stages(pipeline_id).await?;

    let mut occupancy = Vec::with_capacity(stages.len());
    for stage in stages.into_iter().filter(|s| s.active) {
        let placements = tx.count_placements_in_stage(stage.id).await?;
        occupancy.push(StageOccupancy { stage, placements });
    }
    Ok(occupancy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::template::TaskTemplate;
    use crate::models::{ItemRef, Placement, StageAutomation};
    use crate::store::{MemoryStore, Store};
    use tokio_test::{assert_err, assert_ok};

    async fn pipeline_with_stages(
        tx: &mut <MemoryStore as Store>::Tx,
        names: &[&str],
    ) -> (Pipeline, StageDiff) {
        let now = Utc::now();
        let pipeline = create_pipeline(tx, NewPipeline::new("People", "person", "office-1", false), now)
            .await
            .unwrap();
        let inputs = names
            .iter()
            .enumerate()
            .map(|(i, n)| StageInput::new(*n, i as i32 + 1))
            .collect();
        let diff = upsert_stages(tx, pipeline.id, inputs, now).await.unwrap();
        (pipeline, diff)
    }

    #[tokio::test]
    async fn test_duplicate_main_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        assert_ok!(create_pipeline(&mut tx, NewPipeline::new("Main", "person", "o1", true), now).await);
        let err = create_pipeline(&mut tx, NewPipeline::new("Other", "people", "o1", true), now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateMain { .. }));

        // Different scope or type is fine
        assert_ok!(create_pipeline(&mut tx, NewPipeline::new("Main", "person", "o2", true), now).await);
        assert_ok!(create_pipeline(&mut tx, NewPipeline::new("Main", "church", "o1", true), now).await);
    }

    #[tokio::test]
    async fn test_invalid_type_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = create_pipeline(&mut tx, NewPipeline::new("X", "vendor", "o1", false), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidType(_)));
    }

    #[tokio::test]
    async fn test_upsert_creates_updates_and_deletes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, diff) = pipeline_with_stages(&mut tx, &["Contacted", "Visited", "Joined"]).await;
        assert_eq!(diff.created.len(), 3);

        let contacted = &diff.created[0];
        let joined = &diff.created[2];
        let desired = vec![
            StageInput::from_stage(contacted),
            StageInput::new("Joined!", 2).with_id(joined.id),
            StageInput::new("Baptized", 3),
        ];
        let diff = upsert_stages(&mut tx, pipeline.id, desired, Utc::now()).await.unwrap();
        assert_eq!(diff.unchanged, vec![contacted.id]);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].name, "Joined!");
        assert_eq!(diff.created.len(), 1);
        assert_eq!(diff.deleted.len(), 1);

        let names: Vec<String> = tx
            .list_stages(pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Contacted", "Joined!", "Baptized"]);
        assert_ok!(tx.commit().await);
    }

    #[tokio::test]
    async fn test_upsert_rejects_duplicate_order_and_foreign_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, _) = pipeline_with_stages(&mut tx, &["A"]).await;

        let err = upsert_stages(
            &mut tx,
            pipeline.id,
            vec![StageInput::new("A", 1), StageInput::new("B", 1)],
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateStageOrder { order: 1 }));

        let (_, other) = pipeline_with_stages(&mut tx, &["Elsewhere"]).await;
        let foreign = other.created[0].id;
        let err = upsert_stages(
            &mut tx,
            pipeline.id,
            vec![StageInput::new("A", 1).with_id(foreign)],
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStage { .. }));
    }

    #[tokio::test]
    async fn test_upsert_rejects_bad_template() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, _) = pipeline_with_stages(&mut tx, &[]).await;

        let automation = StageAutomation {
            auto_task_template: Some(TaskTemplate::new("Call {nickname}", 2)),
            ..Default::default()
        };
        let result = upsert_stages(
            &mut tx,
            pipeline.id,
            vec![StageInput::new("A", 1).with_automation(automation)],
            Utc::now(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_occupied_stage_cannot_be_dropped() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, diff) = pipeline_with_stages(&mut tx, &["A", "B"]).await;
        let (a, b) = (&diff.created[0], &diff.created[1]);
        let now = Utc::now();
        tx.insert_placement(&Placement {
            id: Uuid::new_v4(),
            item: ItemRef::new("person:1"),
            pipeline_id: pipeline.id,
            current_stage_id: a.id,
            entered_at: now,
            last_updated: now,
        })
        .await
        .unwrap();

        let err = upsert_stages(&mut tx, pipeline.id, vec![StageInput::from_stage(b)], now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OccupiedStageRemoved { placements: 1, .. }));
        assert_eq!(tx.list_stages(pipeline.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_next_and_first_skip_inactive() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, diff) = pipeline_with_stages(&mut tx, &["A", "B", "C"]).await;
        let (a, b, c) = (&diff.created[0], &diff.created[1], &diff.created[2]);

        let mut inactive_b = StageInput::from_stage(b);
        inactive_b.active = false;
        let desired = vec![StageInput::from_stage(a), inactive_b, StageInput::from_stage(c)];
        upsert_stages(&mut tx, pipeline.id, desired, Utc::now()).await.unwrap();

        assert_eq!(next_stage(&mut tx, a).await.unwrap().map(|s| s.id), Some(c.id));
        assert_eq!(next_stage(&mut tx, c).await.unwrap(), None);
        assert_eq!(first_stage(&mut tx, pipeline.id).await.unwrap().id, a.id);

        let (empty, _) = pipeline_with_stages(&mut tx, &[]).await;
        assert!(matches!(
            first_stage(&mut tx, empty.id).await,
            Err(EngineError::NoStages(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_pipeline_lifecycle() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        let main = create_pipeline(&mut tx, NewPipeline::new("Main", "church", "o1", true), now)
            .await
            .unwrap();
        assert!(matches!(
            remove_pipeline(&mut tx, main.id, now).await,
            Err(EngineError::MainPipelineProtected(_))
        ));

        let (occupied, diff) = pipeline_with_stages(&mut tx, &["A"]).await;
        tx.insert_placement(&Placement {
            id: Uuid::new_v4(),
            item: ItemRef::new("church:1"),
            pipeline_id: occupied.id,
            current_stage_id: diff.created[0].id,
            entered_at: now,
            last_updated: now,
        })
        .await
        .unwrap();
        assert_eq!(remove_pipeline(&mut tx, occupied.id, now).await.unwrap(), PipelineRemoval::Retired);
        assert!(!tx.get_pipeline(occupied.id).await.unwrap().unwrap().active);

        let (empty, _) = pipeline_with_stages(&mut tx, &["A"]).await;
        assert_eq!(remove_pipeline(&mut tx, empty.id, now).await.unwrap(), PipelineRemoval::Deleted);
        assert_err!(require_pipeline(&mut tx, empty.id).await);
        assert!(tx.list_stages(empty.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stage_occupancy_counts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, diff) = pipeline_with_stages(&mut tx, &["A", "B"]).await;
        let now = Utc::now();
        for n in 0..2 {
            tx.insert_placement(&Placement {
                id: Uuid::new_v4(),
                item: ItemRef::new(format!("person:{}", n)),
                pipeline_id: pipeline.id,
                current_stage_id: diff.created[1].id,
                entered_at: now,
                last_updated: now,
            })
            .await
            .unwrap();
        }
        let counts: Vec<u64> = stage_occupancy(&mut tx, pipeline.id)
            .await
            .unwrap()
            .iter()
            .map(|o| o.placements)
            .collect();
        assert_eq!(counts, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_update_pipeline_fields() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (pipeline, _) = pipeline_with_stages(&mut tx, &[]).await;
        let update = PipelineUpdate {
            name: Some("Youth".to_string()),
            parent_stage: Some("INVITATION".to_string()),
            ..Default::default()
        };
        let updated = update_pipeline(&mut tx, pipeline.id, update, Utc::now()).await.unwrap();
        assert_eq!(updated.name, "Youth");
        assert_eq!(updated.parent_stage.as_deref(), Some("INVITATION"));
        assert_eq!(updated.description, pipeline.description);

        let bad = PipelineUpdate {
            name: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            update_pipeline(&mut tx, pipeline.id, bad, Utc::now()).await,
            Err(EngineError::InvalidPipeline(_))
        ));
    }
}
