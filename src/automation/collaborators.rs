//! External collaborators consumed by the automation tick
//!
//! The engine only knows these traits. The daemon wires the logging
//! implementations; tests and simulations use the in-memory ones.

use super::template::ExpandedTask;
use crate::models::{ItemRef, Pipeline};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Failure reported by a collaborator
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// Someone responsible for a pipeline's items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderItem {
    pub placement_id: Uuid,
    pub item: ItemRef,
    pub name: String,
}

/// One (stage, threshold) reminder bucket
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    pub stage_id: Uuid,
    pub stage_name: String,
    pub days_in_stage: i64,
    pub items: Vec<ReminderItem>,
}

/// Fire-and-forget notification delivery
pub trait Notifier: Send + Sync {
    fn send(&self, recipient: &Recipient, payload: &ReminderPayload) -> Result<(), CollaboratorError>;
}

/// Materializes follow-up tasks; the returned handle anchors deduplication
pub trait TaskSink: Send + Sync {
    fn create(&self, task: &ExpandedTask) -> Result<String, CollaboratorError>;
}

/// Resolves display names for opaque item references
pub trait ItemDirectory: Send + Sync {
    fn display_name(&self, item: &ItemRef) -> Option<String>;
}

/// Who gets reminders for a pipeline
pub trait Roster: Send + Sync {
    fn recipients(&self, pipeline: &Pipeline) -> Vec<Recipient>;
}

// =============================================================================
// Logging implementations
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, recipient: &Recipient, payload: &ReminderPayload) -> Result<(), CollaboratorError> {
        info!(
            recipient = %recipient.id,
            stage = %payload.stage_id,
            days = payload.days_in_stage,
            items = payload.items.len(),
            "📨 Reminder: {} item(s) in '{}' of '{}' for {} days",
            payload.items.len(),
            payload.stage_name,
            payload.pipeline_name,
            payload.days_in_stage
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogTaskSink;

impl TaskSink for LogTaskSink {
    fn create(&self, task: &ExpandedTask) -> Result<String, CollaboratorError> {
        info!(
            transition = %task.transition_id,
            due = %task.due_date,
            "📝 Task '{}' for {}",
            task.title,
            task.item
        );
        Ok(format!("log:{}", task.transition_id))
    }
}

/// Uses the item reference itself as the display name
#[derive(Debug, Default, Clone, Copy)]
pub struct RefDirectory;

impl ItemDirectory for RefDirectory {
    fn display_name(&self, item: &ItemRef) -> Option<String> {
        Some(item.to_string())
    }
}

/// Same recipients for every pipeline
#[derive(Debug, Default, Clone)]
pub struct StaticRoster(pub Vec<Recipient>);

impl Roster for StaticRoster {
    fn recipients(&self, _pipeline: &Pipeline) -> Vec<Recipient> {
        self.0.clone()
    }
}

// =============================================================================
// Dry-run stand-ins
// =============================================================================

/// Reports what would be sent without delivering anything
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunNotifier;

impl Notifier for DryRunNotifier {
    fn send(&self, recipient: &Recipient, payload: &ReminderPayload) -> Result<(), CollaboratorError> {
        info!(
            "[dry-run] would remind {} about {} item(s) in '{}' ({} days)",
            recipient.name,
            payload.items.len(),
            payload.stage_name,
            payload.days_in_stage
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunTaskSink;

impl TaskSink for DryRunTaskSink {
    fn create(&self, task: &ExpandedTask) -> Result<String, CollaboratorError> {
        info!("[dry-run] would create task '{}' for {}", task.title, task.item);
        Ok(format!("dry-run:{}", task.transition_id))
    }
}

// =============================================================================
// In-memory implementations
// =============================================================================

/// Keeps every delivery; can be told to fail for given recipients
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(Recipient, ReminderPayload)>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient_id: Uuid) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(recipient_id);
    }

    pub fn sent(&self) -> Vec<(Recipient, ReminderPayload)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn send(&self, recipient: &Recipient, payload: &ReminderPayload) -> Result<(), CollaboratorError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&recipient.id)
        {
            return Err(CollaboratorError(format!(
                "delivery to {} refused",
                recipient.name
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((recipient.clone(), payload.clone()));
        Ok(())
    }
}

/// Keeps every created task; can be switched into a failing mode
#[derive(Debug, Default)]
pub struct MemoryTaskSink {
    created: Mutex<Vec<ExpandedTask>>,
    failing: Mutex<bool>,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn created(&self) -> Vec<ExpandedTask> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TaskSink for MemoryTaskSink {
    fn create(&self, task: &ExpandedTask) -> Result<String, CollaboratorError> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(CollaboratorError("task sink unavailable".to_string()));
        }
        let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
        created.push(task.clone());
        Ok(format!("task-{}", created.len()))
    }
}
