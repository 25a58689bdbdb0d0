//! In-process storage backend
//!
//! Used by tests and by the daemon when no database is configured. A
//! transaction holds the state lock for its whole lifetime and works on a
//! private copy, so writers are fully serialized and rollback is a drop.

use super::{Scan, Store, Transaction};
use crate::error::{internal_error, EngineError, EngineResult};
use crate::models::{
    DerivedTaskLink, HistoryScope, ItemRef, Page, Pipeline, PipelineType, Placement, Stage,
    TransitionRecord,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    pipelines: HashMap<Uuid, Pipeline>,
    stages: HashMap<Uuid, Stage>,
    placements: HashMap<Uuid, Placement>,
    /// Append order is history order
    transitions: Vec<TransitionRecord>,
    derived: HashMap<Uuid, DerivedTaskLink>,
}

impl MemoryState {
    fn in_scope(record: &TransitionRecord, scope: HistoryScope) -> bool {
        match scope {
            HistoryScope::Placement(id) => record.placement_id == id,
            HistoryScope::Pipeline(id) => record.pipeline_id == id,
        }
    }

    /// Deferred constraint: stage orders are unique per pipeline
    fn check_stage_orders(&self) -> EngineResult<()> {
        let mut seen: HashSet<(Uuid, i32)> = HashSet::new();
        for stage in self.stages.values() {
            if !seen.insert((stage.pipeline_id, stage.order)) {
                return Err(EngineError::DuplicateStageOrder { order: stage.order });
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transaction currently holds the store
    pub fn is_locked(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> EngineResult<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx {
            guard,
            working,
            savepoints: Vec::new(),
        })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    savepoints: Vec<MemoryState>,
}

impl Transaction for MemoryTx {
    async fn insert_pipeline(&mut self, pipeline: &Pipeline) -> EngineResult<()> {
        if pipeline.is_main {
            let clash = self.working.pipelines.values().any(|p| {
                p.is_main
                    && p.id != pipeline.id
                    && p.pipeline_type == pipeline.pipeline_type
                    && p.scope == pipeline.scope
            });
            if clash {
                return Err(EngineError::DuplicateMain {
                    pipeline_type: pipeline.pipeline_type.to_string(),
                    scope: pipeline.scope.clone(),
                });
            }
        }
        self.working.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn update_pipeline(&mut self, pipeline: &Pipeline) -> EngineResult<()> {
        match self.working.pipelines.get_mut(&pipeline.id) {
            Some(existing) => {
                *existing = pipeline.clone();
                Ok(())
            }
            None => Err(EngineError::PipelineNotFound(pipeline.id)),
        }
    }

    async fn delete_pipeline(&mut self, id: Uuid) -> EngineResult<()> {
        if self.working.placements.values().any(|p| p.pipeline_id == id) {
            return Err(internal_error(format!(
                "pipeline {} is still referenced by placements",
                id
            )));
        }
        self.working.stages.retain(|_, s| s.pipeline_id != id);
        self.working.pipelines.remove(&id);
        Ok(())
    }

    async fn get_pipeline(&mut self, id: Uuid) -> EngineResult<Option<Pipeline>> {
        Ok(self.working.pipelines.get(&id).cloned())
    }

    async fn find_main_pipeline(
        &mut self,
        pipeline_type: PipelineType,
        scope: &str,
    ) -> EngineResult<Option<Pipeline>> {
        Ok(self
            .working
            .pipelines
            .values()
            .find(|p| p.is_main && p.pipeline_type == pipeline_type && p.scope == scope)
            .cloned())
    }

    async fn list_pipelines(&mut self) -> EngineResult<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self.working.pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(pipelines)
    }

    async fn insert_stage(&mut self, stage: &Stage) -> EngineResult<()> {
        if !self.working.pipelines.contains_key(&stage.pipeline_id) {
            return Err(EngineError::PipelineNotFound(stage.pipeline_id));
        }
        self.working.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn update_stage(&mut self, stage: &Stage) -> EngineResult<()> {
        match self.working.stages.get_mut(&stage.id) {
            Some(existing) => {
                *existing = stage.clone();
                Ok(())
            }
            None => Err(EngineError::StageNotFound(stage.id)),
        }
    }

    async fn delete_stage(&mut self, id: Uuid) -> EngineResult<()> {
        if self.working.placements.values().any(|p| p.current_stage_id == id) {
            return Err(internal_error(format!(
                "stage {} is still referenced by placements",
                id
            )));
        }
        self.working.stages.remove(&id);
        Ok(())
    }

    async fn get_stage(&mut self, id: Uuid) -> EngineResult<Option<Stage>> {
        Ok(self.working.stages.get(&id).cloned())
    }

    async fn list_stages(&mut self, pipeline_id: Uuid) -> EngineResult<Vec<Stage>> {
        let mut stages: Vec<_> = self
            .working
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.order);
        Ok(stages)
    }

    async fn list_automated_stages(&mut self) -> EngineResult<Vec<Stage>> {
        let pipelines = &self.working.pipelines;
        let mut stages: Vec<_> = self
            .working
            .stages
            .values()
            .filter(|s| s.active && !s.automation.is_empty())
            .filter(|s| pipelines.get(&s.pipeline_id).map(|p| p.active).unwrap_or(false))
            .cloned()
            .collect();
        stages.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id).then(a.order.cmp(&b.order)));
        Ok(stages)
    }

    async fn insert_placement(&mut self, placement: &Placement) -> EngineResult<()> {
        let duplicate = self
            .working
            .placements
            .values()
            .any(|p| p.item == placement.item && p.pipeline_id == placement.pipeline_id);
        if duplicate {
            return Err(EngineError::AlreadyPlaced {
                item: placement.item.to_string(),
                pipeline_id: placement.pipeline_id,
            });
        }
        if !self.working.stages.contains_key(&placement.current_stage_id) {
            return Err(EngineError::StageNotFound(placement.current_stage_id));
        }
        self.working.placements.insert(placement.id, placement.clone());
        Ok(())
    }

    async fn update_placement(&mut self, placement: &Placement) -> EngineResult<()> {
        match self.working.placements.get_mut(&placement.id) {
            Some(existing) => {
                *existing = placement.clone();
                Ok(())
            }
            None => Err(EngineError::PlacementNotFound(placement.id)),
        }
    }

    async fn delete_placement(&mut self, id: Uuid) -> EngineResult<()> {
        self.working.placements.remove(&id);
        let mut dropped = Vec::new();
        self.working.transitions.retain(|t| {
            if t.placement_id == id {
                dropped.push(t.id);
                false
            } else {
                true
            }
        });
        for transition_id in dropped {
            self.working.derived.remove(&transition_id);
        }
        Ok(())
    }

    async fn get_placement(&mut self, id: Uuid) -> EngineResult<Option<Placement>> {
        Ok(self.working.placements.get(&id).cloned())
    }

    async fn lock_placement(&mut self, id: Uuid) -> EngineResult<Option<Placement>> {
        // The whole state is already exclusively held by this transaction
        Ok(self.working.placements.get(&id).cloned())
    }

    async fn find_placement(
        &mut self,
        item: &ItemRef,
        pipeline_id: Uuid,
    ) -> EngineResult<Option<Placement>> {
        Ok(self
            .working
            .placements
            .values()
            .find(|p| &p.item == item && p.pipeline_id == pipeline_id)
            .cloned())
    }

    async fn count_placements_in_stage(&mut self, stage_id: Uuid) -> EngineResult<u64> {
        Ok(self
            .working
            .placements
            .values()
            .filter(|p| p.current_stage_id == stage_id)
            .count() as u64)
    }

    async fn count_placements_in_pipeline(&mut self, pipeline_id: Uuid) -> EngineResult<u64> {
        Ok(self
            .working
            .placements
            .values()
            .filter(|p| p.pipeline_id == pipeline_id)
            .count() as u64)
    }

    async fn scan_placements(
        &mut self,
        stage_id: Uuid,
        updated_before: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> EngineResult<Vec<Placement>> {
        let mut matches: Vec<_> = self
            .working
            .placements
            .values()
            .filter(|p| p.current_stage_id == stage_id)
            .filter(|p| updated_before.map_or(true, |cutoff| p.last_updated <= cutoff))
            .filter(|p| scan.after.map_or(true, |after| p.id > after))
            .cloned()
            .collect();
        matches.sort_by_key(|p| p.id);
        matches.truncate(scan.limit);
        Ok(matches)
    }

    async fn insert_transition(&mut self, record: &TransitionRecord) -> EngineResult<()> {
        if !self.working.placements.contains_key(&record.placement_id) {
            return Err(EngineError::PlacementNotFound(record.placement_id));
        }
        self.working.transitions.push(record.clone());
        Ok(())
    }

    async fn latest_transition(&mut self, placement_id: Uuid) -> EngineResult<Option<TransitionRecord>> {
        Ok(self
            .working
            .transitions
            .iter()
            .rev()
            .find(|t| t.placement_id == placement_id)
            .cloned())
    }

    async fn list_transitions(
        &mut self,
        scope: HistoryScope,
        page: Page,
    ) -> EngineResult<Vec<TransitionRecord>> {
        Ok(self
            .working
            .transitions
            .iter()
            .rev()
            .filter(|t| MemoryState::in_scope(t, scope))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn count_transitions(&mut self, scope: HistoryScope) -> EngineResult<u64> {
        Ok(self
            .working
            .transitions
            .iter()
            .filter(|t| MemoryState::in_scope(t, scope))
            .count() as u64)
    }

    async fn scan_untasked_transitions(
        &mut self,
        stage_id: Uuid,
        since: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> EngineResult<Vec<TransitionRecord>> {
        let derived = &self.working.derived;
        let mut matches: Vec<_> = self
            .working
            .transitions
            .iter()
            .filter(|t| t.to_stage_id == stage_id)
            .filter(|t| since.map_or(true, |since| t.created_at >= since))
            .filter(|t| !derived.contains_key(&t.id))
            .filter(|t| scan.after.map_or(true, |after| t.id > after))
            .cloned()
            .collect();
        matches.sort_by_key(|t| t.id);
        matches.truncate(scan.limit);
        Ok(matches)
    }

    async fn claim_derived_task(
        &mut self,
        transition_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        if self.working.derived.contains_key(&transition_id) {
            return Ok(false);
        }
        self.working.derived.insert(
            transition_id,
            DerivedTaskLink {
                transition_id,
                task_handle: None,
                claimed_at,
            },
        );
        Ok(true)
    }

    async fn attach_task_handle(&mut self, transition_id: Uuid, handle: &str) -> EngineResult<()> {
        match self.working.derived.get_mut(&transition_id) {
            Some(link) => {
                link.task_handle = Some(handle.to_string());
                Ok(())
            }
            None => Err(internal_error(format!(
                "no task claim for transition {}",
                transition_id
            ))),
        }
    }

    async fn release_derived_task(&mut self, transition_id: Uuid) -> EngineResult<()> {
        if self
            .working
            .derived
            .get(&transition_id)
            .is_some_and(|link| link.task_handle.is_none())
        {
            self.working.derived.remove(&transition_id);
        }
        Ok(())
    }

    async fn get_derived_task(&mut self, transition_id: Uuid) -> EngineResult<Option<DerivedTaskLink>> {
        Ok(self.working.derived.get(&transition_id).cloned())
    }

    async fn savepoint(&mut self) -> EngineResult<()> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> EngineResult<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| internal_error("release without savepoint"))
    }

    async fn rollback_to_savepoint(&mut self) -> EngineResult<()> {
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| internal_error("rollback without savepoint"))?;
        self.working = snapshot;
        Ok(())
    }

    async fn commit(self) -> EngineResult<()> {
        let MemoryTx {
            mut guard, working, ..
        } = self;
        working.check_stage_orders()?;
        *guard = working;
        debug!("Committed in-memory transaction");
        Ok(())
    }

    async fn rollback(self) -> EngineResult<()> {
        debug!("Rolled back in-memory transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StageAutomation, TrackedItem};
    use tokio_test::{assert_err, assert_ok};

    fn pipeline(is_main: bool) -> Pipeline {
        let now = Utc::now();
        Pipeline {
            id: Uuid::new_v4(),
            name: "People".to_string(),
            description: None,
            pipeline_type: PipelineType::Person,
            scope: "office-1".to_string(),
            is_main,
            parent_stage: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn stage(pipeline_id: Uuid, order: i32) -> Stage {
        let now = Utc::now();
        Stage {
            id: Uuid::new_v4(),
            pipeline_id,
            name: format!("Stage {}", order),
            description: None,
            order,
            color: "#3498db".to_string(),
            automation: StageAutomation::default(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        let p = pipeline(false);
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_pipeline(&p).await.unwrap();
            // dropped without commit
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_pipeline(p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let p = pipeline(true);
        let mut tx = store.begin().await.unwrap();
        tx.insert_pipeline(&p).await.unwrap();
        assert_ok!(tx.commit().await);

        let mut tx = store.begin().await.unwrap();
        let found = tx.find_main_pipeline(PipelineType::Person, "office-1").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(p.id));
        assert_err!(tx.insert_pipeline(&pipeline(true)).await);
    }

    #[tokio::test]
    async fn test_duplicate_stage_order_fails_at_commit() {
        let store = MemoryStore::new();
        let p = pipeline(false);
        let mut tx = store.begin().await.unwrap();
        tx.insert_pipeline(&p).await.unwrap();
        tx.insert_stage(&stage(p.id, 1)).await.unwrap();
        tx.insert_stage(&stage(p.id, 1)).await.unwrap();
        assert!(matches!(
            tx.commit().await,
            Err(EngineError::DuplicateStageOrder { order: 1 })
        ));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_restores_state() {
        let store = MemoryStore::new();
        let p = pipeline(false);
        let s = stage(p.id, 1);
        let mut tx = store.begin().await.unwrap();
        tx.insert_pipeline(&p).await.unwrap();
        tx.insert_stage(&s).await.unwrap();

        tx.savepoint().await.unwrap();
        let now = Utc::now();
        let placement = Placement {
            id: Uuid::new_v4(),
            item: TrackedItem::Person(Uuid::new_v4()).item_ref(),
            pipeline_id: p.id,
            current_stage_id: s.id,
            entered_at: now,
            last_updated: now,
        };
        tx.insert_placement(&placement).await.unwrap();
        tx.rollback_to_savepoint().await.unwrap();

        assert!(tx.get_placement(placement.id).await.unwrap().is_none());
        assert!(tx.get_stage(s.id).await.unwrap().is_some());
        assert_err!(tx.release_savepoint().await);
    }

    #[tokio::test]
    async fn test_release_only_drops_unattached_claims() {
        let store = MemoryStore::new();
        let (open, attached) = (Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_derived_task(open, Utc::now()).await.unwrap());
        assert!(tx.claim_derived_task(attached, Utc::now()).await.unwrap());
        tx.attach_task_handle(attached, "task-9").await.unwrap();

        tx.release_derived_task(open).await.unwrap();
        tx.release_derived_task(attached).await.unwrap();
        assert!(tx.claim_derived_task(open, Utc::now()).await.unwrap());
        assert!(!tx.claim_derived_task(attached, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_locked_follows_transaction_lifetime() {
        let store = MemoryStore::new();
        assert!(!store.is_locked());
        let tx = store.begin().await.unwrap();
        assert!(store.is_locked());
        tx.rollback().await.unwrap();
        assert!(!store.is_locked());
    }
}
