use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::lifecycle;
use crate::models::{
    Candidate, List, NewTask, Recipe, StagingItem, StagingStatus, Task, TaskPatch, TaskSource,
    TaskStatus, User,
};
use crate::recipe;
use crate::scope;
use crate::triage::TriageAction;

/// How many events are kept for reconnect replay.
pub const LOG_CAPACITY: usize = 1024;

/// Summary shown on a staging item while extraction is running.
pub const PROCESSING_SUMMARY: &str = "Processing capture";

// ── Commands (client → world) ─────────────────────────────────

/// A command is something a user wants to happen.
/// The world validates it, and if it is allowed, describes the result as an Event.
#[derive(Debug, Clone)]
pub enum Command {
    AddTask(NewTask),
    UpdateTask {
        task_id: Uuid,
        patch: TaskPatch,
    },
    /// A swipe on an inbox card. Fails unless the task is still in the inbox.
    TriageTask {
        task_id: Uuid,
        action: TriageAction,
    },
    CompleteTask {
        task_id: Uuid,
    },
    /// Soft delete: the record stays with status Deleted.
    DeleteTask {
        task_id: Uuid,
    },
    /// Promote every snoozed task whose due date has passed. Not user-scoped.
    WakeSnoozed,

    CreateList {
        name: String,
        color: String,
        icon: Option<String>,
    },
    UpdateList {
        list_id: Uuid,
        name: Option<String>,
        color: Option<String>,
        icon: Option<String>,
    },
    /// Hard delete of the list record. Contained tasks are left as they are.
    DeleteList {
        list_id: Uuid,
    },
    JoinList {
        shared_id: Uuid,
    },

    CreateRecipe {
        name: String,
        template: String,
        task_templates: Vec<String>,
        color: String,
    },
    DeleteRecipe {
        recipe_id: Uuid,
    },
    RunRecipe {
        recipe_id: Uuid,
        values: HashMap<String, String>,
    },

    OpenStaging,
    /// Put a Ready or Error item back into Processing for a refinement pass.
    RestartStaging {
        staging_id: Uuid,
    },
    FinishStaging {
        staging_id: Uuid,
        result: StagingResult,
    },
    AcceptCandidate {
        staging_id: Uuid,
        candidate_id: Uuid,
    },
    RejectCandidate {
        staging_id: Uuid,
        candidate_id: Uuid,
    },
    DiscardStaging {
        staging_id: Uuid,
    },
}

/// What an extraction pass produced for a staging item.
#[derive(Debug, Clone, PartialEq)]
pub enum StagingResult {
    Ready {
        summary: String,
        candidates: Vec<Candidate>,
    },
    Failed {
        message: String,
    },
}

// ── Events (world → clients) ──────────────────────────────────

/// An event is what actually happened. Broadcast to every subscriber.
/// Each event carries the full records it touched and the revision it was
/// applied at, so persistence and clients never have to look anything up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskCreated {
        revision: u64,
        task: Task,
    },
    TaskUpdated {
        revision: u64,
        task: Task,
        /// The list the task was moved out of, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_list_id: Option<Uuid>,
    },
    TaskCompleted {
        revision: u64,
        task: Task,
        next: Option<Task>,
    },
    TaskDeleted {
        revision: u64,
        task: Task,
    },
    TasksCreated {
        revision: u64,
        tasks: Vec<Task>,
    },
    TasksWoken {
        revision: u64,
        tasks: Vec<Task>,
    },
    ListCreated {
        revision: u64,
        list: List,
    },
    ListUpdated {
        revision: u64,
        list: List,
    },
    ListDeleted {
        revision: u64,
        list: List,
    },
    RecipeCreated {
        revision: u64,
        recipe: Recipe,
    },
    RecipeDeleted {
        revision: u64,
        recipe: Recipe,
    },
    StagingCreated {
        revision: u64,
        item: StagingItem,
    },
    StagingUpdated {
        revision: u64,
        item: StagingItem,
    },
    StagingDeleted {
        revision: u64,
        item: StagingItem,
    },
    /// A candidate was accepted or rejected. `item` is what remains; when
    /// `closed` is set the item itself is gone.
    CandidateResolved {
        revision: u64,
        item: StagingItem,
        accepted: Option<Task>,
        closed: bool,
    },
}

impl Event {
    pub fn revision(&self) -> u64 {
        match self {
            Event::TaskCreated { revision, .. }
            | Event::TaskUpdated { revision, .. }
            | Event::TaskCompleted { revision, .. }
            | Event::TaskDeleted { revision, .. }
            | Event::TasksCreated { revision, .. }
            | Event::TasksWoken { revision, .. }
            | Event::ListCreated { revision, .. }
            | Event::ListUpdated { revision, .. }
            | Event::ListDeleted { revision, .. }
            | Event::RecipeCreated { revision, .. }
            | Event::RecipeDeleted { revision, .. }
            | Event::StagingCreated { revision, .. }
            | Event::StagingUpdated { revision, .. }
            | Event::StagingDeleted { revision, .. }
            | Event::CandidateResolved { revision, .. } => *revision,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task_created",
            Event::TaskUpdated { .. } => "task_updated",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskDeleted { .. } => "task_deleted",
            Event::TasksCreated { .. } => "tasks_created",
            Event::TasksWoken { .. } => "tasks_woken",
            Event::ListCreated { .. } => "list_created",
            Event::ListUpdated { .. } => "list_updated",
            Event::ListDeleted { .. } => "list_deleted",
            Event::RecipeCreated { .. } => "recipe_created",
            Event::RecipeDeleted { .. } => "recipe_deleted",
            Event::StagingCreated { .. } => "staging_created",
            Event::StagingUpdated { .. } => "staging_updated",
            Event::StagingDeleted { .. } => "staging_deleted",
            Event::CandidateResolved { .. } => "candidate_resolved",
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    /// Also returned for tasks the caller is not allowed to see.
    #[error("task not found")]
    TaskNotFound,
    #[error("list not found")]
    ListNotFound,
    #[error("recipe not found")]
    RecipeNotFound,
    #[error("staging item not found")]
    StagingNotFound,
    #[error("candidate not found")]
    CandidateNotFound,
    #[error("content must not be empty")]
    EmptyContent,
    #[error("patch changes nothing")]
    EmptyPatch,
    #[error("recurrence interval must be at least 1")]
    InvalidRecurrence,
    /// The record is not in a state that allows this command.
    #[error("invalid transition")]
    InvalidTransition,
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("only the list owner may do that")]
    Forbidden,
    #[error("already joined")]
    AlreadyJoined,
    #[error("no snoozed task is due")]
    NothingToWake,
}

// ── Queries ────────────────────────────────────────────────────

/// Filter for task reads and live task queries. Query strings may use
/// either `listId` or `list_id` spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, alias = "list_id")]
    pub list_id: Option<Uuid>,
    #[serde(default, alias = "include_deleted")]
    pub include_deleted: bool,
}

impl TaskQuery {
    pub fn status(status: TaskStatus) -> Self {
        TaskQuery {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.include_deleted && task.status == TaskStatus::Deleted {
            return false;
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(list_id) = self.list_id {
            if task.list_id != Some(list_id) {
                return false;
            }
        }
        true
    }
}

// ── The World ──────────────────────────────────────────────────

/// The authoritative state. Lives in memory, loaded from redb on boot.
///
/// Mutations are two-phase: `plan` validates a command against the current
/// state and describes the outcome as an Event without touching anything;
/// `commit` applies that Event. The store flushes between the two so a
/// failed write leaves memory untouched.
#[derive(Debug, Default)]
pub struct World {
    pub tasks: HashMap<Uuid, Task>,
    pub lists: HashMap<Uuid, List>,
    pub recipes: HashMap<Uuid, Recipe>,
    pub staging: HashMap<Uuid, StagingItem>,
    pub users: HashMap<Uuid, User>,
    pub revision: u64,
    /// Recent event log for reconnect replay.
    pub log: Vec<(u64, Event)>,
}

impl World {
    pub fn new() -> Self {
        World::default()
    }

    /// Plan and commit in one step. Returns the Event that was applied.
    pub fn apply(&mut self, cmd: Command, user_id: Uuid, now: DateTime<Utc>) -> Result<Event, WorldError> {
        let event = self.plan(cmd, user_id, now)?;
        self.commit(event.clone());
        Ok(event)
    }

    /// Validate a command on behalf of `user_id` and describe its outcome.
    /// Never mutates.
    pub fn plan(&self, cmd: Command, user_id: Uuid, now: DateTime<Utc>) -> Result<Event, WorldError> {
        let revision = self.revision + 1;

        match cmd {
            Command::AddTask(input) => {
                if let Some(list_id) = input.list_id {
                    self.member_list(user_id, list_id)?;
                }
                let task = lifecycle::new_task(input, user_id, now)?;
                Ok(Event::TaskCreated { revision, task })
            }

            Command::UpdateTask { task_id, patch } => {
                let task = self.task_for(user_id, task_id)?;
                if patch.is_empty() {
                    return Err(WorldError::EmptyPatch);
                }
                if let Some(list_id) = patch.list_id {
                    self.member_list(user_id, list_id)?;
                }
                let previous_list_id = match (task.list_id, patch.list_id) {
                    (Some(from), Some(to)) if from != to => Some(from),
                    _ => None,
                };
                let task = lifecycle::merge_patch(task, &patch)?;
                Ok(Event::TaskUpdated { revision, task, previous_list_id })
            }

            Command::TriageTask { task_id, action } => {
                let task = self.task_for(user_id, task_id)?;
                if task.status != TaskStatus::Inbox {
                    return Err(WorldError::InvalidTransition);
                }
                match action.patch() {
                    Some(patch) => {
                        let task = lifecycle::merge_patch(task, &patch)?;
                        Ok(Event::TaskUpdated { revision, task, previous_list_id: None })
                    }
                    None => {
                        let task = lifecycle::soft_delete(task)?;
                        Ok(Event::TaskDeleted { revision, task })
                    }
                }
            }

            Command::CompleteTask { task_id } => {
                let task = self.task_for(user_id, task_id)?;
                let (task, next) = lifecycle::complete(task, now)?;
                Ok(Event::TaskCompleted { revision, task, next })
            }

            Command::DeleteTask { task_id } => {
                let task = self.task_for(user_id, task_id)?;
                let task = lifecycle::soft_delete(task)?;
                Ok(Event::TaskDeleted { revision, task })
            }

            Command::WakeSnoozed => {
                let mut tasks: Vec<Task> = self.overdue_snoozed(now)
                    .into_iter()
                    .map(lifecycle::wake)
                    .collect();
                if tasks.is_empty() {
                    return Err(WorldError::NothingToWake);
                }
                tasks.sort_by_key(|t| t.created_at);
                Ok(Event::TasksWoken { revision, tasks })
            }

            Command::CreateList { name, color, icon } => {
                let list = List {
                    id: Uuid::new_v4(),
                    shared_id: Uuid::new_v4(),
                    name: required(&name)?,
                    color,
                    icon,
                    owner_id: user_id,
                    shared_with: Vec::new(),
                    created_at: now,
                };
                Ok(Event::ListCreated { revision, list })
            }

            Command::UpdateList { list_id, name, color, icon } => {
                let mut list = self.owned_list(user_id, list_id)?.clone();
                if let Some(name) = name {
                    list.name = required(&name)?;
                }
                if let Some(color) = color {
                    list.color = color;
                }
                if icon.is_some() {
                    list.icon = icon;
                }
                Ok(Event::ListUpdated { revision, list })
            }

            Command::DeleteList { list_id } => {
                let list = self.owned_list(user_id, list_id)?.clone();
                Ok(Event::ListDeleted { revision, list })
            }

            Command::JoinList { shared_id } => {
                let mut list = self.list_by_shared_id(shared_id)
                    .ok_or(WorldError::ListNotFound)?
                    .clone();
                if list.role_of(user_id).is_some() {
                    return Err(WorldError::AlreadyJoined);
                }
                list.shared_with.push(user_id);
                Ok(Event::ListUpdated { revision, list })
            }

            Command::CreateRecipe { name, template, task_templates, color } => {
                let task_templates: Vec<String> = task_templates
                    .iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                if task_templates.is_empty() {
                    return Err(WorldError::EmptyContent);
                }
                let recipe = Recipe {
                    id: Uuid::new_v4(),
                    name: required(&name)?,
                    template: template.trim().to_string(),
                    task_templates,
                    color,
                    owner_id: user_id,
                    created_at: now,
                };
                Ok(Event::RecipeCreated { revision, recipe })
            }

            Command::DeleteRecipe { recipe_id } => {
                let recipe = self.recipe_for(user_id, recipe_id)?.clone();
                Ok(Event::RecipeDeleted { revision, recipe })
            }

            Command::RunRecipe { recipe_id, values } => {
                let recipe = self.recipe_for(user_id, recipe_id)?;
                let tasks = recipe::expand(recipe, &values)
                    .into_iter()
                    .map(|content| {
                        lifecycle::new_task(
                            NewTask {
                                content,
                                status: Some(TaskStatus::Inbox),
                                source: Some(TaskSource::Recipe),
                                ..Default::default()
                            },
                            user_id,
                            now,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Event::TasksCreated { revision, tasks })
            }

            Command::OpenStaging => {
                let item = StagingItem {
                    id: Uuid::new_v4(),
                    owner_id: user_id,
                    created_at: now,
                    summary: PROCESSING_SUMMARY.to_string(),
                    status: StagingStatus::Processing,
                    error: None,
                    tasks: Vec::new(),
                };
                Ok(Event::StagingCreated { revision, item })
            }

            Command::RestartStaging { staging_id } => {
                let mut item = self.staging_for(user_id, staging_id)?.clone();
                if item.status == StagingStatus::Processing {
                    return Err(WorldError::InvalidTransition);
                }
                item.status = StagingStatus::Processing;
                item.error = None;
                Ok(Event::StagingUpdated { revision, item })
            }

            Command::FinishStaging { staging_id, result } => {
                let mut item = self.staging_for(user_id, staging_id)?.clone();
                if item.status != StagingStatus::Processing {
                    return Err(WorldError::InvalidTransition);
                }
                match result {
                    StagingResult::Ready { summary, candidates } => {
                        item.status = StagingStatus::Ready;
                        item.summary = summary;
                        item.tasks = candidates;
                        item.error = None;
                    }
                    StagingResult::Failed { message } => {
                        item.status = StagingStatus::Error;
                        item.error = Some(message);
                    }
                }
                Ok(Event::StagingUpdated { revision, item })
            }

            Command::AcceptCandidate { staging_id, candidate_id } => {
                let (item, candidate) = self.take_candidate(user_id, staging_id, candidate_id)?;
                let task = lifecycle::from_candidate(&candidate, user_id, now)?;
                let closed = item.tasks.is_empty();
                Ok(Event::CandidateResolved { revision, item, accepted: Some(task), closed })
            }

            Command::RejectCandidate { staging_id, candidate_id } => {
                let (item, _) = self.take_candidate(user_id, staging_id, candidate_id)?;
                let closed = item.tasks.is_empty();
                Ok(Event::CandidateResolved { revision, item, accepted: None, closed })
            }

            Command::DiscardStaging { staging_id } => {
                let item = self.staging_for(user_id, staging_id)?.clone();
                Ok(Event::StagingDeleted { revision, item })
            }
        }
    }

    /// Apply a planned event. Events always come from `plan` on this world,
    /// so they are trusted.
    pub fn commit(&mut self, event: Event) {
        match &event {
            Event::TaskCreated { task, .. }
            | Event::TaskUpdated { task, .. }
            | Event::TaskDeleted { task, .. } => {
                self.tasks.insert(task.id, task.clone());
            }
            Event::TaskCompleted { task, next, .. } => {
                self.tasks.insert(task.id, task.clone());
                if let Some(next) = next {
                    self.tasks.insert(next.id, next.clone());
                }
            }
            Event::TasksCreated { tasks, .. } | Event::TasksWoken { tasks, .. } => {
                for task in tasks {
                    self.tasks.insert(task.id, task.clone());
                }
            }
            Event::ListCreated { list, .. } | Event::ListUpdated { list, .. } => {
                self.lists.insert(list.id, list.clone());
            }
            Event::ListDeleted { list, .. } => {
                self.lists.remove(&list.id);
            }
            Event::RecipeCreated { recipe, .. } => {
                self.recipes.insert(recipe.id, recipe.clone());
            }
            Event::RecipeDeleted { recipe, .. } => {
                self.recipes.remove(&recipe.id);
            }
            Event::StagingCreated { item, .. } | Event::StagingUpdated { item, .. } => {
                self.staging.insert(item.id, item.clone());
            }
            Event::StagingDeleted { item, .. } => {
                self.staging.remove(&item.id);
            }
            Event::CandidateResolved { item, accepted, closed, .. } => {
                if let Some(task) = accepted {
                    self.tasks.insert(task.id, task.clone());
                }
                if *closed {
                    self.staging.remove(&item.id);
                } else {
                    self.staging.insert(item.id, item.clone());
                }
            }
        }

        self.revision = event.revision();
        self.log.push((self.revision, event));
        if self.log.len() > LOG_CAPACITY {
            let excess = self.log.len() - LOG_CAPACITY;
            self.log.drain(..excess);
        }
    }

    // ── Lookups ────────────────────────────────────────────────

    /// Look up a user by username (linear scan, user counts are small).
    pub fn get_user_by_username(&self, username: &str) -> Option<&User> {
        self.users.values().find(|u| u.username == username)
    }

    /// A task the user is allowed to see. Invisible tasks are not found.
    pub fn task_for(&self, user_id: Uuid, task_id: Uuid) -> Result<&Task, WorldError> {
        self.tasks.get(&task_id)
            .filter(|t| scope::can_see_task(self, user_id, t))
            .ok_or(WorldError::TaskNotFound)
    }

    /// Tasks matching the query that the user can see, newest first.
    pub fn query_tasks(&self, user_id: Uuid, query: &TaskQuery) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values()
            .filter(|t| query.matches(t) && scope::can_see_task(self, user_id, t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    /// Every snoozed task, across all users, whose due date has passed.
    pub fn overdue_snoozed(&self, now: DateTime<Utc>) -> Vec<&Task> {
        self.tasks.values()
            .filter(|t| lifecycle::is_due_to_wake(t, now))
            .collect()
    }

    pub fn list_by_shared_id(&self, shared_id: Uuid) -> Option<&List> {
        self.lists.values().find(|l| l.shared_id == shared_id)
    }

    /// Lists owned by or shared with the user, oldest first.
    pub fn lists_for(&self, user_id: Uuid) -> Vec<List> {
        let mut lists: Vec<List> = self.lists.values()
            .filter(|l| scope::can_see_list(l, user_id))
            .cloned()
            .collect();
        lists.sort_by_key(|l| l.created_at);
        lists
    }

    /// The user's recipes, by name.
    pub fn recipes_for(&self, user_id: Uuid) -> Vec<Recipe> {
        let mut recipes: Vec<Recipe> = self.recipes.values()
            .filter(|r| scope::can_see_recipe(r, user_id))
            .cloned()
            .collect();
        recipes.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        recipes
    }

    /// The user's staging items in review order (oldest capture first).
    pub fn staging_items_for(&self, user_id: Uuid) -> Vec<StagingItem> {
        let mut items: Vec<StagingItem> = self.staging.values()
            .filter(|s| scope::can_see_staging(s, user_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Get all events since a given revision (for reconnect replay).
    /// Returns None if the revision is too old (caller should send full snapshot).
    pub fn events_since(&self, since_rev: u64) -> Option<&[(u64, Event)]> {
        if since_rev >= self.revision {
            return Some(&[]);
        }
        match self.log.first() {
            Some((first, _)) if *first <= since_rev + 1 => {
                let idx = self.log.iter().position(|(rev, _)| *rev > since_rev)?;
                Some(&self.log[idx..])
            }
            _ => None, // too old, log was trimmed
        }
    }

    // ── Access helpers ─────────────────────────────────────────

    fn member_list(&self, user_id: Uuid, list_id: Uuid) -> Result<&List, WorldError> {
        self.lists.get(&list_id)
            .filter(|l| scope::can_see_list(l, user_id))
            .ok_or(WorldError::ListNotFound)
    }

    fn owned_list(&self, user_id: Uuid, list_id: Uuid) -> Result<&List, WorldError> {
        let list = self.member_list(user_id, list_id)?;
        if !scope::can_manage_list(list, user_id) {
            return Err(WorldError::Forbidden);
        }
        Ok(list)
    }

    fn recipe_for(&self, user_id: Uuid, recipe_id: Uuid) -> Result<&Recipe, WorldError> {
        self.recipes.get(&recipe_id)
            .filter(|r| scope::can_see_recipe(r, user_id))
            .ok_or(WorldError::RecipeNotFound)
    }

    fn staging_for(&self, user_id: Uuid, staging_id: Uuid) -> Result<&StagingItem, WorldError> {
        self.staging.get(&staging_id)
            .filter(|s| scope::can_see_staging(s, user_id))
            .ok_or(WorldError::StagingNotFound)
    }

    /// Clone a Ready staging item with one candidate removed.
    fn take_candidate(
        &self,
        user_id: Uuid,
        staging_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<(StagingItem, Candidate), WorldError> {
        let mut item = self.staging_for(user_id, staging_id)?.clone();
        if item.status != StagingStatus::Ready {
            return Err(WorldError::InvalidTransition);
        }
        let pos = item.tasks.iter()
            .position(|c| c.id == candidate_id)
            .ok_or(WorldError::CandidateNotFound)?;
        let candidate = item.tasks.remove(pos);
        Ok((item, candidate))
    }
}

fn required(value: &str) -> Result<String, WorldError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorldError::EmptyContent);
    }
    Ok(trimmed.to_string())
}

// ── Tests ──────────────────────────────────────────────────────
