//! Swipe triage of the inbox.
//!
//! The client reports the drag offset when the card is released; the
//! server decides whether it crossed the threshold and which way.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Task, TaskPatch, TaskStatus};
use crate::world::{Command, TaskQuery, World};

/// Drag distance in pixels a card must exceed to commit.
pub const SWIPE_THRESHOLD: f64 = 100.0;

/// How long a left swipe snoozes for.
pub const SNOOZE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Left,
    Right,
    Down,
}

impl SwipeDirection {
    /// Horizontal wins over vertical. Upward drags never commit.
    pub fn from_offset(dx: f64, dy: f64) -> Option<Self> {
        if dx > SWIPE_THRESHOLD {
            Some(SwipeDirection::Right)
        } else if dx < -SWIPE_THRESHOLD {
            Some(SwipeDirection::Left)
        } else if dy > SWIPE_THRESHOLD {
            Some(SwipeDirection::Down)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageAction {
    /// Move to Today.
    Promote,
    Snooze { until: DateTime<Utc> },
    Delete,
}

impl TriageAction {
    pub fn for_direction(direction: SwipeDirection, now: DateTime<Utc>) -> Self {
        match direction {
            SwipeDirection::Right => TriageAction::Promote,
            SwipeDirection::Left => TriageAction::Snooze {
                until: now + Duration::hours(SNOOZE_HOURS),
            },
            SwipeDirection::Down => TriageAction::Delete,
        }
    }

    pub fn command(self, task_id: Uuid) -> Command {
        Command::TriageTask { task_id, action: self }
    }

    /// The field change this action makes. `None` means delete.
    pub fn patch(self) -> Option<TaskPatch> {
        match self {
            TriageAction::Promote => Some(TaskPatch::status(TaskStatus::Today)),
            TriageAction::Snooze { until } => Some(TaskPatch {
                status: Some(TaskStatus::Snoozed),
                due_at: Some(until),
                ..Default::default()
            }),
            TriageAction::Delete => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TriageError {
    #[error("inbox is empty")]
    Empty,
    #[error("only the front card can be swiped")]
    NotFrontCard,
}

/// The viewer's inbox as a card stack, newest on top.
#[derive(Debug, Clone)]
pub struct TriageQueue {
    cards: Vec<Task>,
}

impl TriageQueue {
    pub fn for_user(world: &World, user_id: Uuid) -> Self {
        TriageQueue {
            cards: world.query_tasks(user_id, &TaskQuery::status(TaskStatus::Inbox)),
        }
    }

    pub fn front(&self) -> Option<&Task> {
        self.cards.first()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn ensure_front(&self, task_id: Uuid) -> Result<&Task, TriageError> {
        match self.front() {
            None => Err(TriageError::Empty),
            Some(task) if task.id == task_id => Ok(task),
            Some(_) => Err(TriageError::NotFrontCard),
        }
    }
}

/// Fires once when the inbox empties.
///
/// The first observation only primes the tracker, so opening the triage
/// screen on an already empty inbox does not celebrate.
#[derive(Debug, Clone, Default)]
pub struct InboxZeroTracker {
    last: Option<usize>,
}

impl InboxZeroTracker {
    pub fn new() -> Self {
        InboxZeroTracker::default()
    }

    /// Record the current inbox size. Returns true on a >0 → 0 transition.
    pub fn observe(&mut self, count: usize) -> bool {
        let fired = matches!(self.last, Some(prev) if prev > 0) && count == 0;
        self.last = Some(count);
        fired
    }

    /// Forget history, e.g. when the triage view is remounted.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
