//! PostgreSQL storage backend
//!
//! Each transaction owns one pooled connection and drives it with explicit
//! `BEGIN` / `COMMIT` / `ROLLBACK`. `lock_placement` takes a row lock with
//! `SELECT ... FOR UPDATE`, which is what serializes concurrent moves of the
//! same placement.

use super::{schema, Scan, Store, Transaction};
use crate::automation::template::TaskTemplate;
use crate::error::{internal_error, EngineError, EngineResult};
use crate::models::{
    DerivedTaskLink, HistoryScope, ItemRef, Page, Pipeline, PipelineType, Placement, Stage,
    StageAutomation, TransitionRecord,
};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PIPELINE_COLUMNS: &str = "id, name, description, pipeline_type, scope, is_main, \
     parent_stage, active, created_at, updated_at";

const STAGE_COLUMNS: &str = "s.id, s.pipeline_id, s.name, s.description, s.stage_order, s.color, \
     s.auto_move_days, s.auto_reminder, s.auto_task_template, s.active, s.created_at, s.updated_at";

const PLACEMENT_COLUMNS: &str =
    "id, item_ref, pipeline_id, current_stage_id, entered_at, last_updated";

const TRANSITION_COLUMNS: &str = "t.id, t.placement_id, t.pipeline_id, t.from_stage_id, \
     t.to_stage_id, t.actor_id, t.notes, t.created_at";

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they don't exist
    pub async fn migrate(&self) -> EngineResult<()> {
        let client = self.pool.get().await?;
        for statement in schema::statements() {
            client.batch_execute(statement).await?;
        }
        info!("✅ Pipeline tables initialized");
        Ok(())
    }
}

impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> EngineResult<PgTx> {
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        Ok(PgTx {
            client: Some(client),
            savepoints: 0,
        })
    }
}

pub struct PgTx {
    client: Option<Object>,
    savepoints: usize,
}

impl PgTx {
    fn client(&self) -> EngineResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| internal_error("transaction already finished"))
    }

    async fn finish(mut self, statement: &str) -> EngineResult<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| internal_error("transaction already finished"))?;
        client.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // The connection still has an open transaction; detach it from the
            // pool so closing it rolls the transaction back server-side
            warn!("Transaction dropped without commit or rollback, discarding connection");
            drop(Object::take(client));
        }
    }
}

fn row_to_pipeline(row: &Row) -> EngineResult<Pipeline> {
    let raw_type: String = row.get(3);
    Ok(Pipeline {
        id: row.get(0),
        name: row.get(1),
        description: row.get(2),
        pipeline_type: raw_type.parse()?,
        scope: row.get(4),
        is_main: row.get(5),
        parent_stage: row.get(6),
        active: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    })
}

fn row_to_stage(row: &Row) -> EngineResult<Stage> {
    let id: Uuid = row.get(0);
    let (auto_task_template, unreadable_template) = decode_template(id, row.get(8));

    Ok(Stage {
        id,
        pipeline_id: row.get(1),
        name: row.get(2),
        description: row.get(3),
        order: row.get(4),
        color: row.get(5),
        automation: StageAutomation {
            auto_move_days: row.get(6),
            auto_reminder: row.get(7),
            auto_task_template,
            unreadable_template,
        },
        active: row.get(9),
        created_at: row.get(10),
        updated_at: row.get(11),
    })
}

fn row_to_placement(row: &Row) -> Placement {
    let item: String = row.get(1);
    Placement {
        id: row.get(0),
        item: ItemRef::new(item),
        pipeline_id: row.get(2),
        current_stage_id: row.get(3),
        entered_at: row.get(4),
        last_updated: row.get(5),
    }
}

fn row_to_transition(row: &Row) -> TransitionRecord {
    TransitionRecord {
        id: row.get(0),
        placement_id: row.get(1),
        pipeline_id: row.get(2),
        from_stage_id: row.get(3),
        to_stage_id: row.get(4),
        actor_id: row.get(5),
        notes: row.get(6),
        created_at: row.get(7),
    }
}

/// Split a stored template into its typed form or, if it no longer decodes,
/// the raw value
fn decode_template(
    stage_id: Uuid,
    raw: Option<serde_json::Value>,
) -> (Option<TaskTemplate>, Option<serde_json::Value>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    match serde_json::from_value::<TaskTemplate>(raw.clone()) {
        Ok(template) => (Some(template), None),
        Err(e) => {
            warn!("Stored task template of stage {} is unreadable: {}", stage_id, e);
            (None, Some(raw))
        }
    }
}

fn template_json(stage: &Stage) -> EngineResult<Option<serde_json::Value>> {
    match &stage.automation.auto_task_template {
        Some(template) => serde_json::to_value(template)
            .map(Some)
            .map_err(|e| EngineError::InvalidTemplate(e.to_string())),
        None => Ok(stage.automation.unreadable_template.clone()),
    }
}

/// Stage order named in a `uq_stage_order` violation detail, e.g.
/// `Key (pipeline_id, stage_order)=(5b0c..., 3) already exists.`
fn conflicting_order(detail: &str) -> Option<i32> {
    let (_, values) = detail.split_once(")=(")?;
    let (values, _) = values.split_once(')')?;
    values.rsplit(',').next()?.trim().parse().ok()
}

/// Name of the violated unique constraint, if that is what failed
fn unique_violation(err: &tokio_postgres::Error) -> Option<&str> {
    let db = err.as_db_error()?;
    if db.code() == &SqlState::UNIQUE_VIOLATION {
        db.constraint()
    } else {
        None
    }
}

fn scope_column(scope: HistoryScope) -> (&'static str, Uuid) {
    match scope {
        HistoryScope::Placement(id) => ("placement_id", id),
        HistoryScope::Pipeline(id) => ("pipeline_id", id),
    }
}

impl Transaction for PgTx {
    async fn insert_pipeline(&mut self, pipeline: &Pipeline) -> EngineResult<()> {
        let result = self
            .client()?
            .execute(
                "INSERT INTO pipelines (id, name, description, pipeline_type, scope, is_main, \
                 parent_stage, active, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &pipeline.id,
                    &pipeline.name,
                    &pipeline.description,
                    &pipeline.pipeline_type.as_str(),
                    &pipeline.scope,
                    &pipeline.is_main,
                    &pipeline.parent_stage,
                    &pipeline.active,
                    &pipeline.created_at,
                    &pipeline.updated_at,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if unique_violation(&e) == Some("uq_pipelines_main") => Err(EngineError::DuplicateMain {
                pipeline_type: pipeline.pipeline_type.to_string(),
                scope: pipeline.scope.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_pipeline(&mut self, pipeline: &Pipeline) -> EngineResult<()> {
        let updated = self
            .client()?
            .execute(
                "UPDATE pipelines SET name = $2, description = $3, parent_stage = $4, \
                 active = $5, updated_at = $6 WHERE id = $1",
                &[
                    &pipeline.id,
                    &pipeline.name,
                    &pipeline.description,
                    &pipeline.parent_stage,
                    &pipeline.active,
                    &pipeline.updated_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(EngineError::PipelineNotFound(pipeline.id));
        }
        Ok(())
    }

    async fn delete_pipeline(&mut self, id: Uuid) -> EngineResult<()> {
        // Stages go with the pipeline via ON DELETE CASCADE
        self.client()?
            .execute("DELETE FROM pipelines WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn get_pipeline(&mut self, id: Uuid) -> EngineResult<Option<Pipeline>> {
        let query = format!("SELECT {} FROM pipelines WHERE id = $1", PIPELINE_COLUMNS);
        let row = self.client()?.query_opt(&query, &[&id]).await?;
        row.as_ref().map(row_to_pipeline).transpose()
    }

    async fn find_main_pipeline(
        &mut self,
        pipeline_type: PipelineType,
        scope: &str,
    ) -> EngineResult<Option<Pipeline>> {
        let query = format!(
            "SELECT {} FROM pipelines WHERE is_main AND pipeline_type = $1 AND scope = $2",
            PIPELINE_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(&query, &[&pipeline_type.as_str(), &scope])
            .await?;
        row.as_ref().map(row_to_pipeline).transpose()
    }

    async fn list_pipelines(&mut self) -> EngineResult<Vec<Pipeline>> {
        let query = format!(
            "SELECT {} FROM pipelines ORDER BY created_at, name",
            PIPELINE_COLUMNS
        );
        let rows = self.client()?.query(&query, &[]).await?;
        rows.iter().map(row_to_pipeline).collect()
    }

    async fn insert_stage(&mut self, stage: &Stage) -> EngineResult<()> {
        let template = template_json(stage)?;
        self.client()?
            .execute(
                "INSERT INTO pipeline_stages (id, pipeline_id, name, description, stage_order, color, \
                 auto_move_days, auto_reminder, auto_task_template, active, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &stage.id,
                    &stage.pipeline_id,
                    &stage.name,
                    &stage.description,
                    &stage.order,
                    &stage.color,
                    &stage.automation.auto_move_days,
                    &stage.automation.auto_reminder,
                    &template,
                    &stage.active,
                    &stage.created_at,
                    &stage.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_stage(&mut self, stage: &Stage) -> EngineResult<()> {
        let template = template_json(stage)?;
        let updated = self
            .client()?
            .execute(
                "UPDATE pipeline_stages SET name = $2, description = $3, stage_order = $4, \
                 color = $5, auto_move_days = $6, auto_reminder = $7, auto_task_template = $8, \
                 active = $9, updated_at = $10 WHERE id = $1",
                &[
                    &stage.id,
                    &stage.name,
                    &stage.description,
                    &stage.order,
                    &stage.color,
                    &stage.automation.auto_move_days,
                    &stage.automation.auto_reminder,
                    &template,
                    &stage.active,
                    &stage.updated_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(EngineError::StageNotFound(stage.id));
        }
        Ok(())
    }

    async fn delete_stage(&mut self, id: Uuid) -> EngineResult<()> {
        self.client()?
            .execute("DELETE FROM pipeline_stages WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn get_stage(&mut self, id: Uuid) -> EngineResult<Option<Stage>> {
        let query = format!("SELECT {} FROM pipeline_stages s WHERE s.id = $1", STAGE_COLUMNS);
        let row = self.client()?.query_opt(&query, &[&id]).await?;
        row.as_ref().map(row_to_stage).transpose()
    }

    async fn list_stages(&mut self, pipeline_id: Uuid) -> EngineResult<Vec<Stage>> {
        let query = format!(
            "SELECT {} FROM pipeline_stages s WHERE s.pipeline_id = $1 ORDER BY s.stage_order",
            STAGE_COLUMNS
        );
        let rows = self.client()?.query(&query, &[&pipeline_id]).await?;
        rows.iter().map(row_to_stage).collect()
    }

    async fn list_automated_stages(&mut self) -> EngineResult<Vec<Stage>> {
        let query = format!(
            "SELECT {} FROM pipeline_stages s JOIN pipelines p ON p.id = s.pipeline_id \
             WHERE s.active AND p.active \
             AND (s.auto_move_days IS NOT NULL OR s.auto_reminder OR s.auto_task_template IS NOT NULL) \
             ORDER BY s.pipeline_id, s.stage_order",
            STAGE_COLUMNS
        );
        let rows = self.client()?.query(&query, &[]).await?;
        rows.iter().map(row_to_stage).collect()
    }

    async fn insert_placement(&mut self, placement: &Placement) -> EngineResult<()> {
        let result = self
            .client()?
            .execute(
                "INSERT INTO placements (id, item_ref, pipeline_id, current_stage_id, entered_at, last_updated) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &placement.id,
                    &placement.item.as_str(),
                    &placement.pipeline_id,
                    &placement.current_stage_id,
                    &placement.entered_at,
                    &placement.last_updated,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if unique_violation(&e) == Some("uq_placement_item") => Err(EngineError::AlreadyPlaced {
                item: placement.item.to_string(),
                pipeline_id: placement.pipeline_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_placement(&mut self, placement: &Placement) -> EngineResult<()> {
        let updated = self
            .client()?
            .execute(
                "UPDATE placements SET current_stage_id = $2, last_updated = $3 WHERE id = $1",
                &[&placement.id, &placement.current_stage_id, &placement.last_updated],
            )
            .await?;
        if updated == 0 {
            return Err(EngineError::PlacementNotFound(placement.id));
        }
        Ok(())
    }

    async fn delete_placement(&mut self, id: Uuid) -> EngineResult<()> {
        // History and task links go with it via ON DELETE CASCADE
        self.client()?
            .execute("DELETE FROM placements WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn get_placement(&mut self, id: Uuid) -> EngineResult<Option<Placement>> {
        let query = format!("SELECT {} FROM placements WHERE id = $1", PLACEMENT_COLUMNS);
        let row = self.client()?.query_opt(&query, &[&id]).await?;
        Ok(row.as_ref().map(row_to_placement))
    }

    async fn lock_placement(&mut self, id: Uuid) -> EngineResult<Option<Placement>> {
        let query = format!(
            "SELECT {} FROM placements WHERE id = $1 FOR UPDATE",
            PLACEMENT_COLUMNS
        );
        let row = self.client()?.query_opt(&query, &[&id]).await?;
        Ok(row.as_ref().map(row_to_placement))
    }

    async fn find_placement(
        &mut self,
        item: &ItemRef,
        pipeline_id: Uuid,
    ) -> EngineResult<Option<Placement>> {
        let query = format!(
            "SELECT {} FROM placements WHERE item_ref = $1 AND pipeline_id = $2",
            PLACEMENT_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(&query, &[&item.as_str(), &pipeline_id])
            .await?;
        Ok(row.as_ref().map(row_to_placement))
    }

    async fn count_placements_in_stage(&mut self, stage_id: Uuid) -> EngineResult<u64> {
        let row = self
            .client()?
            .query_one(
                "SELECT COUNT(*) FROM placements WHERE current_stage_id = $1",
                &[&stage_id],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn count_placements_in_pipeline(&mut self, pipeline_id: Uuid) -> EngineResult<u64> {
        let row = self
            .client()?
            .query_one(
                "SELECT COUNT(*) FROM placements WHERE pipeline_id = $1",
                &[&pipeline_id],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn scan_placements(
        &mut self,
        stage_id: Uuid,
        updated_before: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> EngineResult<Vec<Placement>> {
        let query = format!(
            "SELECT {} FROM placements \
             WHERE current_stage_id = $1 \
             AND ($2::timestamptz IS NULL OR last_updated <= $2) \
             AND ($3::uuid IS NULL OR id > $3) \
             ORDER BY id LIMIT $4",
            PLACEMENT_COLUMNS
        );
        let limit = scan.limit as i64;
        let rows = self
            .client()?
            .query(&query, &[&stage_id, &updated_before, &scan.after, &limit])
            .await?;
        Ok(rows.iter().map(row_to_placement).collect())
    }

    async fn insert_transition(&mut self, record: &TransitionRecord) -> EngineResult<()> {
        self.client()?
            .execute(
                "INSERT INTO transition_records (id, placement_id, pipeline_id, from_stage_id, \
                 to_stage_id, actor_id, notes, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &record.id,
                    &record.placement_id,
                    &record.pipeline_id,
                    &record.from_stage_id,
                    &record.to_stage_id,
                    &record.actor_id,
                    &record.notes,
                    &record.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn latest_transition(&mut self, placement_id: Uuid) -> EngineResult<Option<TransitionRecord>> {
        let query = format!(
            "SELECT {} FROM transition_records t WHERE t.placement_id = $1 ORDER BY t.seq DESC LIMIT 1",
            TRANSITION_COLUMNS
        );
        let row = self.client()?.query_opt(&query, &[&placement_id]).await?;
        Ok(row.as_ref().map(row_to_transition))
    }

    async fn list_transitions(
        &mut self,
        scope: HistoryScope,
        page: Page,
    ) -> EngineResult<Vec<TransitionRecord>> {
        let (column, id) = scope_column(scope);
        let query = format!(
            "SELECT {} FROM transition_records t WHERE t.{} = $1 ORDER BY t.seq DESC LIMIT $2 OFFSET $3",
            TRANSITION_COLUMNS, column
        );
        let limit = page.limit as i64;
        let offset = page.offset as i64;
        let rows = self.client()?.query(&query, &[&id, &limit, &offset]).await?;
        Ok(rows.iter().map(row_to_transition).collect())
    }

    async fn count_transitions(&mut self, scope: HistoryScope) -> EngineResult<u64> {
        let (column, id) = scope_column(scope);
        let query = format!("SELECT COUNT(*) FROM transition_records WHERE {} = $1", column);
        let row = self.client()?.query_one(&query, &[&id]).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn scan_untasked_transitions(
        &mut self,
        stage_id: Uuid,
        since: Option<DateTime<Utc>>,
        scan: Scan,
    ) -> EngineResult<Vec<TransitionRecord>> {
        let query = format!(
            "SELECT {} FROM transition_records t \
             LEFT JOIN derived_tasks d ON d.transition_id = t.id \
             WHERE t.to_stage_id = $1 AND d.transition_id IS NULL \
             AND ($2::timestamptz IS NULL OR t.created_at >= $2) \
             AND ($3::uuid IS NULL OR t.id > $3) \
             ORDER BY t.id LIMIT $4",
            TRANSITION_COLUMNS
        );
        let limit = scan.limit as i64;
        let rows = self
            .client()?
            .query(&query, &[&stage_id, &since, &scan.after, &limit])
            .await?;
        Ok(rows.iter().map(row_to_transition).collect())
    }

    async fn claim_derived_task(
        &mut self,
        transition_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        // Blocks behind a concurrent uncommitted claim, then sees the conflict
        let inserted = self
            .client()?
            .execute(
                "INSERT INTO derived_tasks (transition_id, claimed_at) VALUES ($1, $2) \
                 ON CONFLICT (transition_id) DO NOTHING",
                &[&transition_id, &claimed_at],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn attach_task_handle(&mut self, transition_id: Uuid, handle: &str) -> EngineResult<()> {
        let updated = self
            .client()?
            .execute(
                "UPDATE derived_tasks SET task_handle = $2 WHERE transition_id = $1",
                &[&transition_id, &handle],
            )
            .await?;
        if updated == 0 {
            return Err(internal_error(format!(
                "no task claim for transition {}",
                transition_id
            )));
        }
        Ok(())
    }

    async fn release_derived_task(&mut self, transition_id: Uuid) -> EngineResult<()> {
        self.client()?
            .execute(
                "DELETE FROM derived_tasks WHERE transition_id = $1 AND task_handle IS NULL",
                &[&transition_id],
            )
            .await?;
        Ok(())
    }

    async fn get_derived_task(&mut self, transition_id: Uuid) -> EngineResult<Option<DerivedTaskLink>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT transition_id, task_handle, claimed_at FROM derived_tasks WHERE transition_id = $1",
                &[&transition_id],
            )
            .await?;
        Ok(row.map(|r| DerivedTaskLink {
            transition_id: r.get(0),
            task_handle: r.get(1),
            claimed_at: r.get(2),
        }))
    }

    async fn savepoint(&mut self) -> EngineResult<()> {
        let name = format!("sp_{}", self.savepoints + 1);
        self.client()?
            .batch_execute(&format!("SAVEPOINT {}", name))
            .await?;
        self.savepoints += 1;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> EngineResult<()> {
        if self.savepoints == 0 {
            return Err(internal_error("release without savepoint"));
        }
        let name = format!("sp_{}", self.savepoints);
        self.client()?
            .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
            .await?;
        self.savepoints -= 1;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> EngineResult<()> {
        if self.savepoints == 0 {
            return Err(internal_error("rollback without savepoint"));
        }
        let name = format!("sp_{}", self.savepoints);
        // ROLLBACK TO keeps the savepoint; release it so depth tracking stays exact
        self.client()?
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}", name))
            .await?;
        self.savepoints -= 1;
        Ok(())
    }

    async fn commit(self) -> EngineResult<()> {
        let result = self.finish("COMMIT").await;
        match result {
            Err(EngineError::Database(e)) if unique_violation(&e) == Some("uq_stage_order") => {
                let order = e
                    .as_db_error()
                    .and_then(|db| db.detail())
                    .and_then(conflicting_order);
                match order {
                    Some(order) => Err(EngineError::DuplicateStageOrder { order }),
                    None => Err(internal_error("stage order conflict detected at commit")),
                }
            }
            other => {
                debug!("Committed transaction");
                other
            }
        }
    }

    async fn rollback(self) -> EngineResult<()> {
        self.finish("ROLLBACK").await?;
        debug!("Rolled back transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_column() {
        let id = Uuid::new_v4();
        assert_eq!(scope_column(HistoryScope::Placement(id)), ("placement_id", id));
        assert_eq!(scope_column(HistoryScope::Pipeline(id)), ("pipeline_id", id));
    }

    #[test]
    fn test_column_lists_match_row_mappers() {
        assert_eq!(PIPELINE_COLUMNS.split(',').count(), 10);
        assert_eq!(STAGE_COLUMNS.split(',').count(), 12);
        assert_eq!(PLACEMENT_COLUMNS.split(',').count(), 6);
        assert_eq!(TRANSITION_COLUMNS.split(',').count(), 8);
    }

    #[test]
    fn test_decode_template_keeps_unreadable_value() {
        let id = Uuid::new_v4();
        let good = serde_json::json!({ "title": "Call {item_name}", "priority": "HIGH" });
        let (template, raw) = decode_template(id, Some(good));
        assert_eq!(template.map(|t| t.title), Some("Call {item_name}".to_string()));
        assert!(raw.is_none());

        let legacy = serde_json::json!({ "title": "Call", "priority": "Normal" });
        let (template, raw) = decode_template(id, Some(legacy.clone()));
        assert!(template.is_none());
        assert_eq!(raw, Some(legacy));

        assert_eq!(decode_template(id, None), (None, None));
    }

    #[test]
    fn test_unreadable_template_is_written_back() {
        let now = Utc::now();
        let legacy = serde_json::json!({ "priority": "Normal" });
        let stage = Stage {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            name: "Invited".to_string(),
            description: None,
            order: 1,
            color: "#3498db".to_string(),
            automation: StageAutomation {
                unreadable_template: Some(legacy.clone()),
                ..Default::default()
            },
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(template_json(&stage).unwrap(), Some(legacy));
    }

    #[test]
    fn test_conflicting_order_from_detail() {
        let detail = "Key (pipeline_id, stage_order)=(5b0c7e0a-1c1d-4d7e-9f00-7a1b2c3d4e5f, 3) already exists.";
        assert_eq!(conflicting_order(detail), Some(3));
        assert_eq!(conflicting_order("something else"), None);
    }
}
