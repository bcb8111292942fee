//! Persisted entity types.
//!
//! These are the records stored in the save file and sent to clients.
//! Field names serialize as camelCase so the PWA can read them directly.
//! Postcard is not self-describing, so nothing here may use
//! `skip_serializing_if` or internally tagged enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recurrence::Recurrence;

// ── Tasks ─────────────────────────────────────────────────────

/// Where a task is shown. The single source of truth for its lifecycle.
///
/// Inbox   = captured, waiting for triage
/// Today   = actionable now
/// Snoozed = hidden until `due_at`, then woken back to Today
/// Done    = completed (terminal)
/// Deleted = soft-deleted (terminal, record is kept)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Inbox,
    Today,
    Snoozed,
    Done,
    Deleted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Manual,
    Share,
    Recipe,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    /// Stable identifier handed to other devices and share links.
    pub public_id: Uuid,
    pub content: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub source: TaskSource,
    pub responsible: Option<String>,
    pub notes: Option<String>,
    pub owner_id: Uuid,
    pub list_id: Option<Uuid>,
    pub recurrence: Option<Recurrence>,
    /// Bumped on every mutation. Compared when an update asks for it.
    pub version: u64,
}

/// Input for creating a task. Absent fields stay absent on the record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub content: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<TaskSource>,
    #[serde(default)]
    pub responsible: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub list_id: Option<Uuid>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl NewTask {
    pub fn new(content: impl Into<String>) -> Self {
        NewTask {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Field-level patch. `None` means "leave this field alone".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub responsible: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub list_id: Option<Uuid>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    /// When set, the update only applies if the stored version matches.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        TaskPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.status.is_none()
            && self.due_at.is_none()
            && self.responsible.is_none()
            && self.notes.is_none()
            && self.list_id.is_none()
            && self.recurrence.is_none()
    }
}

// ── Lists ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: Uuid,
    /// Identifier embedded in invite links.
    pub shared_id: Uuid,
    pub name: String,
    pub color: String,
    pub icon: Option<String>,
    pub owner_id: Uuid,
    pub shared_with: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListRole {
    Owner,
    Editor,
}

impl List {
    pub fn role_of(&self, user_id: Uuid) -> Option<ListRole> {
        if self.owner_id == user_id {
            Some(ListRole::Owner)
        } else if self.shared_with.contains(&user_id) {
            Some(ListRole::Editor)
        } else {
            None
        }
    }
}

// ── Recipes ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    /// Sentence with `{variable}` placeholders, e.g. "Trip to {destination}".
    pub template: String,
    pub task_templates: Vec<String>,
    pub color: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ── Staging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStatus {
    Processing,
    Ready,
    Error,
}

/// A task proposed by extraction, not yet accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: Uuid,
    pub content: String,
    pub due_at: Option<DateTime<Utc>>,
    pub responsible: Option<String>,
    pub notes: Option<String>,
}

/// One capture session waiting for the user to review its candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub status: StagingStatus,
    pub error: Option<String>,
    pub tasks: Vec<Candidate>,
}

// ── Users ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub guest: bool,
    pub created_at: DateTime<Utc>,
}
