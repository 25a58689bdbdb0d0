//! Placements and their transition history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Concrete kinds of things the CRM tracks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TrackedItem {
    Person(Uuid),
    Church(Uuid),
}

impl TrackedItem {
    /// Collapse into the opaque reference the pipeline core works with
    pub fn item_ref(&self) -> ItemRef {
        match self {
            TrackedItem::Person(id) => ItemRef(format!("person:{}", id)),
            TrackedItem::Church(id) => ItemRef(format!("church:{}", id)),
        }
    }
}

impl From<TrackedItem> for ItemRef {
    fn from(item: TrackedItem) -> Self {
        item.item_ref()
    }
}

/// Opaque reference to a tracked item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ItemRef(String);

impl ItemRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current position of an item within one pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub id: Uuid,
    pub item: ItemRef,
    pub pipeline_id: Uuid,
    pub current_stage_id: Uuid,
    pub entered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Placement {
    /// Whole days since the last stage change
    pub fn days_in_stage(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_updated).num_days()
    }
}

/// Append-only record of a stage change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub id: Uuid,
    pub placement_id: Uuid,
    pub pipeline_id: Uuid,
    /// `None` on initial placement
    pub from_stage_id: Option<Uuid>,
    pub to_stage_id: Uuid,
    /// `None` means the move was automated
    pub actor_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn is_automated(&self) -> bool {
        self.actor_id.is_none()
    }
}

/// Outcome of the transition primitive
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Moved {
        placement: Placement,
        record: TransitionRecord,
    },
    /// Target equals the current stage; nothing was written
    Unchanged(Placement),
    /// The placement changed after the caller looked at it
    Superseded(Placement),
}

impl MoveOutcome {
    pub fn placement(&self) -> &Placement {
        match self {
            MoveOutcome::Moved { placement, .. }
            | MoveOutcome::Unchanged(placement)
            | MoveOutcome::Superseded(placement) => placement,
        }
    }

    pub fn into_placement(self) -> Placement {
        match self {
            MoveOutcome::Moved { placement, .. }
            | MoveOutcome::Unchanged(placement)
            | MoveOutcome::Superseded(placement) => placement,
        }
    }
}

/// Which slice of history to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    Placement(Uuid),
    Pipeline(Uuid),
}

pub const MAX_PAGE_SIZE: usize = 500;

/// Offset pagination for read-only listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_SIZE),
            offset,
        }
    }

    pub fn first(limit: usize) -> Self {
        Self::new(limit, 0)
    }

    pub fn next(&self) -> Self {
        Self::new(self.limit, self.offset + self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub records: Vec<TransitionRecord>,
    pub total: u64,
    pub page: Page,
}

impl HistoryPage {
    pub fn has_more(&self) -> bool {
        (self.page.offset + self.records.len()) < self.total as usize
    }
}

/// Link between a transition and the task it spawned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedTaskLink {
    pub transition_id: Uuid,
    /// Handle returned by the task sink; `None` while the claim is in flight
    pub task_handle: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_item_ref_is_kind_prefixed() {
        let id = Uuid::new_v4();
        assert_eq!(TrackedItem::Person(id).item_ref().as_str(), format!("person:{}", id));
        assert_ne!(TrackedItem::Person(id).item_ref(), TrackedItem::Church(id).item_ref());
    }

    #[test]
    fn test_days_in_stage_floors() {
        let now = Utc::now();
        let placement = Placement {
            id: Uuid::new_v4(),
            item: ItemRef::new("person:1"),
            pipeline_id: Uuid::new_v4(),
            current_stage_id: Uuid::new_v4(),
            entered_at: now - Duration::days(10),
            last_updated: now - Duration::hours(7 * 24 + 23),
        };
        assert_eq!(placement.days_in_stage(now), 7);
    }

    #[test]
    fn test_page_is_clamped() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(10_000, 0).limit, MAX_PAGE_SIZE);
        assert_eq!(Page::first(20).next().offset, 20);
    }
}
