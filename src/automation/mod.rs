//! Automation engine
//!
//! A tick runs three passes:
//!
//! 1. auto-advance placements that sat in a stage for `auto_move_days`
//! 2. send reminders for placements exactly N days into a reminder stage
//! 3. create the follow-up task for every untasked transition into a
//!    templated stage
//!
//! A live tick commits every candidate on its own and reads scan pages in
//! short transactions, so no lock is held while collaborators run and a
//! failure only costs its own candidate, tallied in [`TickReport::failed`].
//! A dry run makes the same decisions through no-op collaborators inside a
//! single transaction, one savepoint per candidate, and rolls it back.
//!
//! Derived tasks are claimed and committed before the sink is called. A
//! sink failure releases the claim for the next tick; a claim that outlives
//! its sink call without a handle is never retried.

pub mod collaborators;
pub mod template;

use self::collaborators::{
    DryRunNotifier, DryRunTaskSink, ItemDirectory, Notifier, ReminderItem, ReminderPayload, Roster,
    TaskSink,
};
use self::template::{TaskTemplate, TemplateContext};
use crate::clock::Clock;
use crate::config::AutomationConfig;
use crate::directory;
use crate::error::{internal_error, EngineResult};
use crate::models::{MoveOutcome, Pipeline, Placement, Stage, TransitionRecord};
use crate::placement;
use crate::store::{Scan, Store, Transaction};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const AUTO_ADVANCE_NOTE: &str = "auto-advanced";

/// Counters for one tick
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub moved: u64,
    pub reminders_sent: u64,
    pub tasks_created: u64,
    pub failed: u64,
    /// Candidates dropped because a concurrent writer got there first
    pub skipped: u64,
    pub dry_run: bool,
    /// The tick budget ran out before every candidate was visited
    pub timed_out: bool,
}

/// Everything the tick talks to outside storage
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub tasks: Arc<dyn TaskSink>,
    pub items: Arc<dyn ItemDirectory>,
    pub roster: Arc<dyn Roster>,
}

/// A pipeline and its full stage list, loaded once per tick
struct PipelineStages {
    pipeline: Pipeline,
    stages: Vec<Stage>,
}

struct TickState {
    now: DateTime<Utc>,
    deadline: Option<Instant>,
    notifier: Arc<dyn Notifier>,
    tasks: Arc<dyn TaskSink>,
    report: TickReport,
}

impl TickState {
    /// Checked between candidates; sets `timed_out` once the budget is spent
    fn out_of_time(&mut self) -> bool {
        if self.report.timed_out {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.report.timed_out = true;
        }
        self.report.timed_out
    }
}

/// Where a tick's reads and writes go
struct Session<'s, S: Store> {
    store: &'s S,
    /// The single transaction of a dry run
    preview: Option<S::Tx>,
}

impl<'s, S: Store> Session<'s, S> {
    async fn open(store: &'s S, dry_run: bool) -> EngineResult<Self> {
        let preview = if dry_run { Some(store.begin().await?) } else { None };
        Ok(Self { store, preview })
    }

    /// A fresh transaction, or a savepoint in the dry-run transaction
    async fn unit(&mut self) -> EngineResult<Unit<'_, S::Tx>> {
        match &mut self.preview {
            Some(tx) => {
                tx.savepoint().await?;
                Ok(Unit::Nested(tx))
            }
            None => Ok(Unit::Own(self.store.begin().await?)),
        }
    }

    async fn close(self) -> EngineResult<()> {
        match self.preview {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

enum Unit<'a, T: Transaction> {
    Own(T),
    Nested(&'a mut T),
}

impl<T: Transaction> Unit<'_, T> {
    fn tx(&mut self) -> &mut T {
        match self {
            Unit::Own(tx) => tx,
            Unit::Nested(tx) => &mut **tx,
        }
    }

    async fn keep(self) -> EngineResult<()> {
        match self {
            Unit::Own(tx) => tx.commit().await,
            Unit::Nested(tx) => tx.release_savepoint().await,
        }
    }

    async fn discard(self) -> EngineResult<()> {
        match self {
            Unit::Own(tx) => tx.rollback().await,
            Unit::Nested(tx) => tx.rollback_to_savepoint().await,
        }
    }
}

pub struct AutomationEngine<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    config: AutomationConfig,
}

impl<S: Store> AutomationEngine<S> {
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        config: AutomationConfig,
    ) -> Self {
        Self {
            store,
            clock,
            collaborators,
            config,
        }
    }

    /// Run one automation pass
    ///
    /// Safe to call repeatedly and concurrently with itself and with manual
    /// moves. Only failures outside any candidate (opening a transaction,
    /// scanning) are returned as errors; candidates committed before such a
    /// failure stay committed.
    pub async fn run_tick(&self, dry_run: bool) -> EngineResult<TickReport> {
        let started = Instant::now();
        let (notifier, tasks): (Arc<dyn Notifier>, Arc<dyn TaskSink>) = if dry_run {
            (Arc::new(DryRunNotifier), Arc::new(DryRunTaskSink))
        } else {
            (
                self.collaborators.notifier.clone(),
                self.collaborators.tasks.clone(),
            )
        };
        let mut state = TickState {
            now: self.clock.now(),
            deadline: self.config.tick_budget.map(|budget| started + budget),
            notifier,
            tasks,
            report: TickReport {
                dry_run,
                ..Default::default()
            },
        };

        let mut session = Session::open(&self.store, dry_run).await?;
        let mut unit = session.unit().await?;
        let stages = unit.tx().list_automated_stages().await?;
        let pipelines = load_pipelines(unit.tx(), &stages).await?;
        unit.discard().await?;
        debug!(
            "Tick at {}: {} automated stage(s) across {} pipeline(s)",
            state.now,
            stages.len(),
            pipelines.len()
        );

        for stage in stages.iter().filter(|s| s.automation.auto_move_days.is_some()) {
            if state.out_of_time() {
                break;
            }
            if let Some(ps) = pipelines.get(&stage.pipeline_id) {
                self.advance_stage(&mut session, &mut state, ps, stage).await?;
            }
        }

        for stage in stages.iter().filter(|s| s.automation.auto_reminder) {
            if state.out_of_time() {
                break;
            }
            if let Some(ps) = pipelines.get(&stage.pipeline_id) {
                self.remind_stage(&mut session, &mut state, &ps.pipeline, stage)
                    .await?;
            }
        }

        for stage in &stages {
            if state.out_of_time() {
                break;
            }
            let Some(ps) = pipelines.get(&stage.pipeline_id) else {
                continue;
            };
            if let Some(template) = &stage.automation.auto_task_template {
                self.spawn_stage_tasks(&mut session, &mut state, &ps.pipeline, stage, template)
                    .await?;
            } else if stage.automation.unreadable_template.is_some() {
                self.fail_unreadable_stage(&mut session, &mut state, stage)
                    .await?;
            }
        }

        session.close().await?;

        let report = state.report;
        if report.timed_out {
            warn!("⏱️  Tick budget exhausted, remaining candidates left for the next tick");
        }
        info!(
            "✅ Tick finished in {:?}: moved={} reminders={} tasks={} failed={} skipped={} dry_run={}",
            started.elapsed(),
            report.moved,
            report.reminders_sent,
            report.tasks_created,
            report.failed,
            report.skipped,
            report.dry_run
        );
        Ok(report)
    }

    // =========================================================================
    // Auto-advance
    // =========================================================================

    async fn advance_stage(
        &self,
        session: &mut Session<'_, S>,
        state: &mut TickState,
        ps: &PipelineStages,
        stage: &Stage,
    ) -> EngineResult<()> {
        let Some(days) = stage.automation.auto_move_days else {
            return Ok(());
        };
        // Terminal stage: nothing to advance into
        let Some(next) = directory::next_in(&ps.stages, stage) else {
            return Ok(());
        };
        let cutoff = state.now - Duration::days(i64::from(days));

        let mut scan = Scan::first(self.config.page_size);
        loop {
            let mut unit = session.unit().await?;
            let batch = unit.tx().scan_placements(stage.id, Some(cutoff), scan).await?;
            unit.discard().await?;

            for candidate in &batch {
                if state.out_of_time() {
                    return Ok(());
                }
                self.advance_one(session, state, candidate, next).await?;
            }
            match batch.last() {
                Some(last) if batch.len() == scan.limit => scan = scan.after(last.id),
                _ => return Ok(()),
            }
        }
    }

    async fn advance_one(
        &self,
        session: &mut Session<'_, S>,
        state: &mut TickState,
        candidate: &Placement,
        next: &Stage,
    ) -> EngineResult<()> {
        let mut unit = session.unit().await?;
        let result = placement::move_item(
            unit.tx(),
            candidate.id,
            next.id,
            None,
            Some(AUTO_ADVANCE_NOTE.to_string()),
            Some(candidate.last_updated),
            state.now,
        )
        .await;

        match result {
            Ok(MoveOutcome::Moved { .. }) => match unit.keep().await {
                Ok(()) => {
                    state.report.moved += 1;
                    info!("➡️  Auto-advanced placement {} to '{}'", candidate.id, next.name);
                }
                Err(e) => {
                    state.report.failed += 1;
                    error!(
                        "❌ Auto-advance of placement {} could not be committed: {}",
                        candidate.id, e
                    );
                }
            },
            Ok(_) => {
                unit.discard().await?;
                state.report.skipped += 1;
            }
            Err(e) => {
                unit.discard().await?;
                state.report.failed += 1;
                error!(
                    "❌ Auto-advance of placement {} to stage {} failed: {}",
                    candidate.id, next.id, e
                );
            }
        }
        Ok(())
    }

    // =========================================================================
    // Reminders
    // =========================================================================

    async fn remind_stage(
        &self,
        session: &mut Session<'_, S>,
        state: &mut TickState,
        pipeline: &Pipeline,
        stage: &Stage,
    ) -> EngineResult<()> {
        let Some(&min_days) = self.config.reminder_days.iter().min() else {
            return Ok(());
        };
        let recipients = self.collaborators.roster.recipients(pipeline);
        if recipients.is_empty() {
            debug!("No reminder recipients for pipeline {}", pipeline.id);
            return Ok(());
        }

        // Nothing younger than the smallest threshold can match
        let updated_before = state.now - Duration::days(min_days);
        let mut buckets: BTreeMap<i64, Vec<ReminderItem>> = BTreeMap::new();
        let mut scan = Scan::first(self.config.page_size);
        loop {
            let mut unit = session.unit().await?;
            let batch = unit
                .tx()
                .scan_placements(stage.id, Some(updated_before), scan)
                .await?;
            unit.discard().await?;

            for candidate in &batch {
                let days = candidate.days_in_stage(state.now);
                if !self.config.reminder_days.contains(&days) {
                    continue;
                }
                let name = self
                    .collaborators
                    .items
                    .display_name(&candidate.item)
                    .unwrap_or_else(|| candidate.item.to_string());
                buckets.entry(days).or_default().push(ReminderItem {
                    placement_id: candidate.id,
                    item: candidate.item.clone(),
                    name,
                });
            }
            match batch.last() {
                Some(last) if batch.len() == scan.limit => scan = scan.after(last.id),
                _ => break,
            }
        }

        for (days, items) in buckets {
            let payload = ReminderPayload {
                pipeline_id: pipeline.id,
                pipeline_name: pipeline.name.clone(),
                stage_id: stage.id,
                stage_name: stage.name.clone(),
                days_in_stage: days,
                items,
            };
            for recipient in &recipients {
                if state.out_of_time() {
                    return Ok(());
                }
                match state.notifier.send(recipient, &payload) {
                    Ok(()) => state.report.reminders_sent += 1,
                    Err(e) => {
                        state.report.failed += 1;
                        error!(
                            "❌ Reminder to {} for stage {} ({} days) failed: {}",
                            recipient.id, stage.id, days, e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Derived tasks
    // =========================================================================

    fn task_window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config
            .task_lookback
            .and_then(|lookback| Duration::from_std(lookback).ok())
            .map(|lookback| now - lookback)
    }

    async fn spawn_stage_tasks(
        &self,
        session: &mut Session<'_, S>,
        state: &mut TickState,
        pipeline: &Pipeline,
        stage: &Stage,
        template: &TaskTemplate,
    ) -> EngineResult<()> {
        let since = self.task_window_start(state.now);
        let mut scan = Scan::first(self.config.page_size);
        loop {
            let mut unit = session.unit().await?;
            let batch = unit.tx().scan_untasked_transitions(stage.id, since, scan).await?;
            unit.discard().await?;

            for record in &batch {
                if state.out_of_time() {
                    return Ok(());
                }
                match self
                    .spawn_task(session, state, pipeline, stage, template, record)
                    .await
                {
                    Ok(true) => state.report.tasks_created += 1,
                    Ok(false) => state.report.skipped += 1,
                    Err(e) => {
                        state.report.failed += 1;
                        error!(
                            "❌ Task creation for transition {} (placement {}) failed: {}",
                            record.id, record.placement_id, e
                        );
                    }
                }
            }
            match batch.last() {
                Some(last) if batch.len() == scan.limit => scan = scan.after(last.id),
                _ => return Ok(()),
            }
        }
    }

    /// Claim the transition, hand the expanded task to the sink, then record
    /// the handle
    ///
    /// `Ok(false)` means another tick already holds the claim.
    async fn spawn_task(
        &self,
        session: &mut Session<'_, S>,
        state: &TickState,
        pipeline: &Pipeline,
        stage: &Stage,
        template: &TaskTemplate,
        record: &TransitionRecord,
    ) -> EngineResult<bool> {
        let mut unit = session.unit().await?;
        let claimed = claim_transition(unit.tx(), record, state.now).await;
        let placement = match claimed {
            Ok(Some(placement)) => {
                unit.keep().await?;
                placement
            }
            Ok(None) => {
                unit.discard().await?;
                return Ok(false);
            }
            Err(e) => {
                unit.discard().await?;
                return Err(e);
            }
        };

        let ctx = TemplateContext {
            item_name: self
                .collaborators
                .items
                .display_name(&placement.item)
                .unwrap_or_else(|| placement.item.to_string()),
            stage_name: stage.name.clone(),
            pipeline_name: pipeline.name.clone(),
        };
        let created = template
            .expand(&ctx, pipeline, stage, &placement.item, record)
            .and_then(|task| {
                let handle = state
                    .tasks
                    .create(&task)
                    .map_err(|e| internal_error(format!("task sink: {}", e)))?;
                Ok((task, handle))
            });
        let (task, handle) = match created {
            Ok(created) => created,
            Err(e) => {
                if let Err(release) = release_claim(session, record.id).await {
                    error!(
                        "❌ Claim on transition {} could not be released, no task will be retried: {}",
                        record.id, release
                    );
                }
                return Err(e);
            }
        };

        if let Err(e) = attach_handle(session, record.id, &handle).await {
            error!(
                "❌ Task {} for transition {} was created but its handle was not recorded: {}",
                handle, record.id, e
            );
        }
        info!(
            "📝 Created task '{}' ({}) for transition {}",
            task.title, handle, record.id
        );
        Ok(true)
    }

    /// A stage whose stored template does not decode fails each of its
    /// candidates without claiming them
    async fn fail_unreadable_stage(
        &self,
        session: &mut Session<'_, S>,
        state: &mut TickState,
        stage: &Stage,
    ) -> EngineResult<()> {
        let since = self.task_window_start(state.now);
        let mut scan = Scan::first(self.config.page_size);
        loop {
            let mut unit = session.unit().await?;
            let batch = unit.tx().scan_untasked_transitions(stage.id, since, scan).await?;
            unit.discard().await?;

            for record in &batch {
                if state.out_of_time() {
                    return Ok(());
                }
                state.report.failed += 1;
                error!(
                    "❌ Task creation for transition {} skipped: stage '{}' ({}) has an unreadable task template",
                    record.id, stage.name, stage.id
                );
            }
            match batch.last() {
                Some(last) if batch.len() == scan.limit => scan = scan.after(last.id),
                _ => return Ok(()),
            }
        }
    }
}

/// Reserve the task slot for `record`; `None` if it is already taken
async fn claim_transition<T: Transaction>(
    tx: &mut T,
    record: &TransitionRecord,
    now: DateTime<Utc>,
) -> EngineResult<Option<Placement>> {
    if !tx.claim_derived_task(record.id, now).await? {
        return Ok(None);
    }
    let placement = tx
        .get_placement(record.placement_id)
        .await?
        .ok_or_else(|| internal_error(format!("placement {} vanished", record.placement_id)))?;
    Ok(Some(placement))
}

async fn release_claim<S: Store>(session: &mut Session<'_, S>, transition_id: Uuid) -> EngineResult<()> {
    let mut unit = session.unit().await?;
    match unit.tx().release_derived_task(transition_id).await {
        Ok(()) => unit.keep().await,
        Err(e) => {
            unit.discard().await?;
            Err(e)
        }
    }
}

async fn attach_handle<S: Store>(
    session: &mut Session<'_, S>,
    transition_id: Uuid,
    handle: &str,
) -> EngineResult<()> {
    let mut unit = session.unit().await?;
    match unit.tx().attach_task_handle(transition_id, handle).await {
        Ok(()) => unit.keep().await,
        Err(e) => {
            unit.discard().await?;
            Err(e)
        }
    }
}

async fn load_pipelines<T: Transaction>(
    tx: &mut T,
    stages: &[Stage],
) -> EngineResult<HashMap<Uuid, PipelineStages>> {
    let mut pipelines = HashMap::new();
    for stage in stages {
        if pipelines.contains_key(&stage.pipeline_id) {
            continue;
        }
        let pipeline = directory::require_pipeline(tx, stage.pipeline_id).await?;
        let stages = tx.list_stages(pipeline.id).await?;
        pipelines.insert(pipeline.id, PipelineStages { pipeline, stages });
    }
    Ok(pipelines)
}
