//! Task lifecycle rules.
//!
//! Pure functions from (current record, input, time) to the next record.
//! World::plan calls these; nothing here touches the collections.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Candidate, NewTask, Task, TaskPatch, TaskSource, TaskStatus};
use crate::world::WorldError;

/// Build a fresh task from user input. Status defaults to Inbox.
pub fn new_task(input: NewTask, owner_id: Uuid, now: DateTime<Utc>) -> Result<Task, WorldError> {
    let content = clean_content(&input.content)?;
    if let Some(rule) = &input.recurrence {
        if !rule.is_valid() {
            return Err(WorldError::InvalidRecurrence);
        }
    }

    Ok(Task {
        id: Uuid::new_v4(),
        public_id: Uuid::new_v4(),
        content,
        status: input.status.unwrap_or(TaskStatus::Inbox),
        created_at: now,
        due_at: input.due_at,
        source: input.source.unwrap_or(TaskSource::Manual),
        responsible: non_blank(input.responsible),
        notes: non_blank(input.notes),
        owner_id,
        list_id: input.list_id,
        recurrence: input.recurrence,
        version: 1,
    })
}

/// Merge a patch into a task. Only fields present in the patch change.
///
/// Without `expected_version` this is last-write-wins. With it, a stale
/// version is rejected and nothing changes.
pub fn merge_patch(task: &Task, patch: &TaskPatch) -> Result<Task, WorldError> {
    if let Some(expected) = patch.expected_version {
        if expected != task.version {
            return Err(WorldError::VersionConflict {
                expected,
                actual: task.version,
            });
        }
    }

    let mut next = task.clone();
    if let Some(content) = &patch.content {
        next.content = clean_content(content)?;
    }
    if let Some(status) = patch.status {
        next.status = status;
    }
    if let Some(due_at) = patch.due_at {
        next.due_at = Some(due_at);
    }
    if let Some(responsible) = &patch.responsible {
        next.responsible = non_blank(Some(responsible.clone()));
    }
    if let Some(notes) = &patch.notes {
        next.notes = non_blank(Some(notes.clone()));
    }
    if let Some(list_id) = patch.list_id {
        next.list_id = Some(list_id);
    }
    if let Some(rule) = patch.recurrence {
        if !rule.is_valid() {
            return Err(WorldError::InvalidRecurrence);
        }
        next.recurrence = Some(rule);
    }
    next.version += 1;
    Ok(next)
}

/// Mark a task done. A recurring task also yields its next occurrence.
pub fn complete(task: &Task, now: DateTime<Utc>) -> Result<(Task, Option<Task>), WorldError> {
    if task.status.is_terminal() {
        return Err(WorldError::InvalidTransition);
    }

    let mut done = task.clone();
    done.status = TaskStatus::Done;
    done.version += 1;

    let next = match task.recurrence {
        Some(rule) => {
            let due_at = rule.next_after(now).ok_or(WorldError::InvalidRecurrence)?;
            Some(Task {
                id: Uuid::new_v4(),
                public_id: Uuid::new_v4(),
                content: task.content.clone(),
                status: TaskStatus::Inbox,
                created_at: now,
                due_at: Some(due_at),
                source: task.source,
                responsible: task.responsible.clone(),
                notes: task.notes.clone(),
                owner_id: task.owner_id,
                list_id: task.list_id,
                recurrence: Some(rule),
                version: 1,
            })
        }
        None => None,
    };

    Ok((done, next))
}

/// Soft delete. The record stays, only the status changes.
pub fn soft_delete(task: &Task) -> Result<Task, WorldError> {
    if task.status == TaskStatus::Deleted {
        return Err(WorldError::InvalidTransition);
    }
    let mut deleted = task.clone();
    deleted.status = TaskStatus::Deleted;
    deleted.version += 1;
    Ok(deleted)
}

/// A snoozed task whose time has come.
pub fn is_due_to_wake(task: &Task, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Snoozed && task.due_at.is_some_and(|due| due <= now)
}

pub fn wake(task: &Task) -> Task {
    let mut woken = task.clone();
    woken.status = TaskStatus::Today;
    woken.version += 1;
    woken
}

/// Turn an accepted extraction candidate into a real task.
/// A candidate with a date goes straight to Today.
pub fn from_candidate(
    candidate: &Candidate,
    owner_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Task, WorldError> {
    new_task(
        NewTask {
            content: candidate.content.clone(),
            status: Some(if candidate.due_at.is_some() {
                TaskStatus::Today
            } else {
                TaskStatus::Inbox
            }),
            due_at: candidate.due_at,
            source: Some(TaskSource::Voice),
            responsible: candidate.responsible.clone(),
            notes: candidate.notes.clone(),
            list_id: None,
            recurrence: None,
        },
        owner_id,
        now,
    )
}

fn clean_content(content: &str) -> Result<String, WorldError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(WorldError::EmptyContent);
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::{Recurrence, RecurrenceUnit};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, 8, 0, 0).unwrap()
    }

    fn task(content: &str) -> Task {
        new_task(NewTask::new(content), Uuid::nil(), now()).unwrap()
    }

    #[test]
    fn new_task_defaults() {
        let t = task("  Water plants ");
        assert_eq!(t.content, "Water plants");
        assert_eq!(t.status, TaskStatus::Inbox);
        assert_eq!(t.source, TaskSource::Manual);
        assert_eq!(t.created_at, now());
        assert_eq!(t.version, 1);
        assert_eq!(t.due_at, None);
    }

    #[test]
    fn blank_content_rejected() {
        let r = new_task(NewTask::new("   "), Uuid::nil(), now());
        assert_eq!(r.unwrap_err(), WorldError::EmptyContent);
    }

    #[test]
    fn blank_optional_fields_are_dropped() {
        let mut input = NewTask::new("Call mum");
        input.notes = Some("  ".into());
        input.responsible = Some("Ana".into());
        let t = new_task(input, Uuid::nil(), now()).unwrap();
        assert_eq!(t.notes, None);
        assert_eq!(t.responsible.as_deref(), Some("Ana"));
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut t = task("Buy bread");
        t.notes = Some("wholegrain".into());

        let patched = merge_patch(&t, &TaskPatch::status(TaskStatus::Today)).unwrap();
        assert_eq!(patched.status, TaskStatus::Today);
        assert_eq!(patched.notes.as_deref(), Some("wholegrain"));
        assert_eq!(patched.content, "Buy bread");
        assert_eq!(patched.version, 2);
    }

    #[test]
    fn stale_version_rejected() {
        let t = task("Buy bread");
        let patch = TaskPatch {
            content: Some("Buy rye".into()),
            expected_version: Some(7),
            ..Default::default()
        };
        assert_eq!(
            merge_patch(&t, &patch).unwrap_err(),
            WorldError::VersionConflict { expected: 7, actual: 1 }
        );
    }

    #[test]
    fn complete_recurring_spawns_next() {
        let mut t = task("Take out bins");
        t.list_id = Some(Uuid::new_v4());
        t.notes = Some("blue one".into());
        t.recurrence = Some(Recurrence::new(1, RecurrenceUnit::Weeks));

        let (done, next) = complete(&t, now()).unwrap();
        assert_eq!(done.status, TaskStatus::Done);

        let next = next.expect("recurring task spawns a successor");
        assert_ne!(next.id, t.id);
        assert_eq!(next.status, TaskStatus::Inbox);
        assert_eq!(next.due_at, Some(now() + Duration::days(7)));
        assert_eq!(next.content, t.content);
        assert_eq!(next.list_id, t.list_id);
        assert_eq!(next.notes, t.notes);
        assert_eq!(next.recurrence, t.recurrence);
    }

    #[test]
    fn complete_plain_task_has_no_successor() {
        let (done, next) = complete(&task("One-off"), now()).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(next.is_none());
    }

    #[test]
    fn cannot_complete_twice() {
        let (done, _) = complete(&task("One-off"), now()).unwrap();
        assert_eq!(complete(&done, now()).unwrap_err(), WorldError::InvalidTransition);
    }

    #[test]
    fn wake_rule() {
        let mut t = task("Snoozer");
        t.status = TaskStatus::Snoozed;
        t.due_at = Some(now());
        assert!(is_due_to_wake(&t, now()));
        assert!(!is_due_to_wake(&t, now() - Duration::seconds(1)));

        t.due_at = None;
        assert!(!is_due_to_wake(&t, now()));
    }

    #[test]
    fn dated_candidate_lands_in_today() {
        let candidate = Candidate {
            id: Uuid::new_v4(),
            content: "Dentist".into(),
            due_at: Some(now() + Duration::days(2)),
            responsible: None,
            notes: None,
        };
        let t = from_candidate(&candidate, Uuid::nil(), now()).unwrap();
        assert_eq!(t.status, TaskStatus::Today);
        assert_eq!(t.source, TaskSource::Voice);

        let undated = Candidate { due_at: None, ..candidate };
        assert_eq!(from_candidate(&undated, Uuid::nil(), now()).unwrap().status, TaskStatus::Inbox);
    }
}
