//! The shared handle every surface goes through.
//!
//! One write path: plan the command, flush the event to the save file,
//! commit it to the World, broadcast it. All of it happens under the write
//! lock, so events reach subscribers in revision order.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Session;
use crate::capture;
use crate::models::{List, NewTask, Recipe, StagingItem, Task, TaskPatch, TaskSource, User};
use crate::persist::{SaveFile, SaveFileError};
use crate::triage::{InboxZeroTracker, SwipeDirection, TriageAction, TriageError, TriageQueue};
use crate::world::{Command, Event, TaskQuery, World, WorldError};

/// Capacity of the event broadcast channel. Slow subscribers past this lag
/// and resync from a fresh snapshot.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("save file: {0}")]
    Persist(#[from] SaveFileError),
    #[error(transparent)]
    Triage(#[from] TriageError),
    #[error("username already taken")]
    UsernameTaken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Joined(List),
    AlreadyJoined(List),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageOutcome {
    pub committed: bool,
    pub inbox_zero: bool,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    world: RwLock<World>,
    save_file: SaveFile,
    events: broadcast::Sender<Event>,
    inbox_trackers: Mutex<HashMap<Uuid, InboxZeroTracker>>,
}

impl Store {
    pub fn new(world: World, save_file: SaveFile) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Store {
            inner: Arc::new(Inner {
                world: RwLock::new(world),
                save_file,
                events,
                inbox_trackers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Read-only view of the world. Keep the closure short; it holds the lock.
    pub fn read<R>(&self, f: impl FnOnce(&World) -> R) -> R {
        f(&*self.world_read())
    }

    pub fn revision(&self) -> u64 {
        self.world_read().revision
    }

    fn world_read(&self) -> RwLockReadGuard<'_, World> {
        self.inner.world.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn world_write(&self) -> RwLockWriteGuard<'_, World> {
        self.inner.world.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Write path ─────────────────────────────────────────────

    /// Run a command on behalf of the session's user.
    pub fn execute(&self, session: &Session, cmd: Command) -> Result<Event, StoreError> {
        self.apply_as(session.user_id, cmd)
    }

    /// Plan → flush → commit → broadcast.
    pub(crate) fn apply_as(&self, user_id: Uuid, cmd: Command) -> Result<Event, StoreError> {
        let mut world = self.world_write();
        let event = world.plan(cmd, user_id, Utc::now())?;
        if let Err(e) = self.inner.save_file.flush(&event) {
            error!(event = event.name(), error = %e, "save file flush failed, mutation dropped");
            return Err(e.into());
        }
        world.commit(event.clone());
        debug!(event = event.name(), revision = event.revision(), %user_id, "applied");
        // No receivers is fine.
        let _ = self.inner.events.send(event.clone());
        Ok(event)
    }

    /// Promote overdue snoozed tasks for every user. Returns how many woke.
    pub fn wake_snoozed(&self) -> Result<usize, StoreError> {
        match self.apply_as(Uuid::nil(), Command::WakeSnoozed) {
            Ok(Event::TasksWoken { tasks, .. }) => Ok(tasks.len()),
            Ok(_) => Ok(0),
            Err(StoreError::World(WorldError::NothingToWake)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn insert_user(&self, user: User) -> Result<User, StoreError> {
        let mut world = self.world_write();
        if world.get_user_by_username(&user.username).is_some() {
            return Err(StoreError::UsernameTaken);
        }
        self.inner.save_file.save_user(&user)?;
        world.users.insert(user.id, user.clone());
        info!(username = %user.username, guest = user.guest, "user created");
        Ok(user)
    }

    // ── Tasks ──────────────────────────────────────────────────

    pub fn add_task(&self, session: &Session, input: NewTask) -> Result<Task, StoreError> {
        match self.execute(session, Command::AddTask(input))? {
            Event::TaskCreated { task, .. } => Ok(task),
            other => Err(unexpected(other)),
        }
    }

    pub fn update_task(&self, session: &Session, task_id: Uuid, patch: TaskPatch) -> Result<Task, StoreError> {
        match self.execute(session, Command::UpdateTask { task_id, patch })? {
            Event::TaskUpdated { task, .. } => Ok(task),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the completed task and, for recurring tasks, its successor.
    pub fn complete_task(&self, session: &Session, task_id: Uuid) -> Result<(Task, Option<Task>), StoreError> {
        match self.execute(session, Command::CompleteTask { task_id })? {
            Event::TaskCompleted { task, next, .. } => Ok((task, next)),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_task(&self, session: &Session, task_id: Uuid) -> Result<Task, StoreError> {
        match self.execute(session, Command::DeleteTask { task_id })? {
            Event::TaskDeleted { task, .. } => Ok(task),
            other => Err(unexpected(other)),
        }
    }

    pub fn task(&self, session: &Session, task_id: Uuid) -> Result<Task, StoreError> {
        Ok(self.world_read().task_for(session.user_id, task_id)?.clone())
    }

    pub fn tasks(&self, session: &Session, query: &TaskQuery) -> Vec<Task> {
        self.world_read().query_tasks(session.user_id, query)
    }

    /// Free-text capture with relative date keywords.
    pub fn quick_capture(&self, session: &Session, text: &str, tz_offset_minutes: i32) -> Result<Task, StoreError> {
        let parsed = capture::parse_date_keywords(text, Utc::now(), capture::local_offset(tz_offset_minutes));
        self.add_task(session, NewTask {
            content: parsed.content,
            status: Some(parsed.status),
            due_at: parsed.due_at,
            source: Some(TaskSource::Manual),
            ..Default::default()
        })
    }

    pub fn share(&self, session: &Session, title: Option<&str>, text: Option<&str>, url: Option<&str>) -> Result<Task, StoreError> {
        let content = capture::share_content(title, text, url).ok_or(WorldError::EmptyContent)?;
        self.add_task(session, NewTask {
            content,
            source: Some(TaskSource::Share),
            ..Default::default()
        })
    }

    // ── Triage ─────────────────────────────────────────────────

    /// The viewer's card stack, and whether the inbox just emptied since
    /// the last look.
    pub fn triage_queue(&self, session: &Session) -> (TriageQueue, bool) {
        let queue = TriageQueue::for_user(&self.world_read(), session.user_id);
        let inbox_zero = self.observe_inbox(session.user_id, queue.len());
        (queue, inbox_zero)
    }

    /// Apply a released swipe. Below the threshold nothing happens.
    pub fn triage_swipe(&self, session: &Session, task_id: Uuid, dx: f64, dy: f64) -> Result<TriageOutcome, StoreError> {
        let queue = TriageQueue::for_user(&self.world_read(), session.user_id);
        queue.ensure_front(task_id)?;
        self.observe_inbox(session.user_id, queue.len());

        let Some(direction) = SwipeDirection::from_offset(dx, dy) else {
            return Ok(TriageOutcome { committed: false, inbox_zero: false });
        };
        let action = TriageAction::for_direction(direction, Utc::now());
        self.execute(session, action.command(task_id))?;

        let remaining = TriageQueue::for_user(&self.world_read(), session.user_id).len();
        let inbox_zero = self.observe_inbox(session.user_id, remaining);
        if inbox_zero {
            info!(user_id = %session.user_id, "inbox zero");
        }
        Ok(TriageOutcome { committed: true, inbox_zero })
    }

    fn observe_inbox(&self, user_id: Uuid, count: usize) -> bool {
        let mut trackers = self.inner.inbox_trackers.lock().unwrap_or_else(PoisonError::into_inner);
        trackers.entry(user_id).or_default().observe(count)
    }

    // ── Lists ──────────────────────────────────────────────────

    pub fn lists(&self, session: &Session) -> Vec<List> {
        self.world_read().lists_for(session.user_id)
    }

    pub fn join_list(&self, session: &Session, shared_id: Uuid) -> Result<JoinOutcome, StoreError> {
        match self.execute(session, Command::JoinList { shared_id }) {
            Ok(Event::ListUpdated { list, .. }) => {
                info!(list_id = %list.id, user_id = %session.user_id, "joined list");
                Ok(JoinOutcome::Joined(list))
            }
            Ok(other) => Err(unexpected(other)),
            Err(StoreError::World(WorldError::AlreadyJoined)) => {
                let list = self.world_read()
                    .list_by_shared_id(shared_id)
                    .cloned()
                    .ok_or(WorldError::ListNotFound)?;
                Ok(JoinOutcome::AlreadyJoined(list))
            }
            Err(e) => Err(e),
        }
    }

    // ── Recipes & staging reads ────────────────────────────────

    pub fn recipes(&self, session: &Session) -> Vec<Recipe> {
        self.world_read().recipes_for(session.user_id)
    }

    pub fn staging_items(&self, session: &Session) -> Vec<StagingItem> {
        self.world_read().staging_items_for(session.user_id)
    }

    // ── Live queries ───────────────────────────────────────────

    /// Run `selector` now and after every relevant change, calling
    /// `callback` whenever the result differs from the last one delivered.
    /// Must be called from within a tokio runtime.
    pub fn watch<F>(&self, session: &Session, selector: Selector, mut callback: F) -> Subscription
    where
        F: FnMut(Snapshot) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let user_id = session.user_id;
        let mut last = self.read(|w| selector.select(w, user_id));
        callback(last.clone());

        let store = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if !selector.touches(&event) => continue,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "live query lagged, recomputing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let next = store.read(|w| selector.select(w, user_id));
                if next != last {
                    callback(next.clone());
                    last = next;
                }
            }
        });
        Subscription { handle }
    }
}

fn unexpected(event: Event) -> StoreError {
    // plan() maps each command to exactly one event kind.
    error!(event = event.name(), "unexpected event kind for command");
    StoreError::World(WorldError::InvalidTransition)
}

// ── Live query types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Tasks(TaskQuery),
    Lists,
    Recipes,
    Staging,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Snapshot {
    Tasks(Vec<Task>),
    Lists(Vec<List>),
    Recipes(Vec<Recipe>),
    Staging(Vec<StagingItem>),
}

impl Selector {
    pub fn select(&self, world: &World, user_id: Uuid) -> Snapshot {
        match self {
            Selector::Tasks(query) => Snapshot::Tasks(world.query_tasks(user_id, query)),
            Selector::Lists => Snapshot::Lists(world.lists_for(user_id)),
            Selector::Recipes => Snapshot::Recipes(world.recipes_for(user_id)),
            Selector::Staging => Snapshot::Staging(world.staging_items_for(user_id)),
        }
    }

    /// Whether an event can change this selector's result. List membership
    /// changes affect task visibility, so task queries listen to them too.
    pub fn touches(&self, event: &Event) -> bool {
        let list_event = matches!(
            event,
            Event::ListCreated { .. } | Event::ListUpdated { .. } | Event::ListDeleted { .. }
        );
        match self {
            Selector::Tasks(_) => {
                list_event
                    || matches!(
                        event,
                        Event::TaskCreated { .. }
                            | Event::TaskUpdated { .. }
                            | Event::TaskCompleted { .. }
                            | Event::TaskDeleted { .. }
                            | Event::TasksCreated { .. }
                            | Event::TasksWoken { .. }
                            | Event::CandidateResolved { accepted: Some(_), .. }
                    )
            }
            Selector::Lists => list_event,
            Selector::Recipes => matches!(event, Event::RecipeCreated { .. } | Event::RecipeDeleted { .. }),
            Selector::Staging => matches!(
                event,
                Event::StagingCreated { .. }
                    | Event::StagingUpdated { .. }
                    | Event::StagingDeleted { .. }
                    | Event::CandidateResolved { .. }
            ),
        }
    }
}

/// Handle for a running live query. Dropping it cancels the query.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use std::fs;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) fn temp_store(name: &str) -> (Store, String) {
        let path = format!("/tmp/mindflow_store_{name}_{}.redb", std::process::id());
        let _ = fs::remove_file(&path);
        let save_file = SaveFile::open(&path).unwrap();
        let world = save_file.load_world().unwrap();
        (Store::new(world, save_file), path)
    }

    pub(crate) fn session(name: &str) -> Session {
        Session { user_id: Uuid::new_v4(), username: name.to_string() }
    }

    #[tokio::test]
    async fn mutations_reach_subscribers_and_disk() {
        let (store, path) = temp_store("broadcast");
        let ana = session("ana");
        let mut rx = store.subscribe();

        let task = store.add_task(&ana, NewTask::new("Buy milk")).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.revision(), 1);
        assert!(matches!(event, Event::TaskCreated { task: ref t, .. } if t.id == task.id));

        drop(store);
        let reloaded = SaveFile::open(&path).unwrap().load_world().unwrap();
        assert_eq!(reloaded.tasks[&task.id], task);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejected_command_broadcasts_nothing() {
        let (store, path) = temp_store("rejected");
        let ana = session("ana");
        let mut rx = store.subscribe();

        let err = store.delete_task(&ana, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::World(WorldError::TaskNotFound)));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.revision(), 0);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn wake_sweep_second_run_is_noop() {
        let (store, path) = temp_store("wake");
        let ana = session("ana");
        let task = store.add_task(&ana, NewTask::new("Call back")).unwrap();
        store.update_task(&ana, task.id, TaskPatch {
            status: Some(TaskStatus::Snoozed),
            due_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            ..Default::default()
        }).unwrap();

        assert_eq!(store.wake_snoozed().unwrap(), 1);
        let rev = store.revision();
        assert_eq!(store.wake_snoozed().unwrap(), 0);
        assert_eq!(store.revision(), rev);
        assert_eq!(store.task(&ana, task.id).unwrap().status, TaskStatus::Today);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn quick_capture_parses_keywords() {
        let (store, path) = temp_store("capture");
        let ana = session("ana");

        let task = store.quick_capture(&ana, "Buy milk tomorrow", 0).unwrap();
        assert_eq!(task.content, "Buy milk");
        assert_eq!(task.status, TaskStatus::Inbox);
        assert_eq!(task.source, TaskSource::Manual);
        let due = task.due_at.unwrap();
        assert_eq!(due.date_naive(), (Utc::now() + chrono::Duration::days(1)).date_naive());

        let shared = store.share(&ana, Some("Article"), None, Some("https://example.org")).unwrap();
        assert_eq!(shared.source, TaskSource::Share);
        assert!(store.share(&ana, None, None, None).is_err());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn triage_swipes_front_card() {
        let (store, path) = temp_store("triage");
        let ana = session("ana");
        let older = store.add_task(&ana, NewTask::new("Older")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = store.add_task(&ana, NewTask::new("Newer")).unwrap();

        let err = store.triage_swipe(&ana, older.id, 150.0, 0.0).unwrap_err();
        assert!(matches!(err, StoreError::Triage(TriageError::NotFrontCard)));

        let outcome = store.triage_swipe(&ana, newer.id, 99.0, 0.0).unwrap();
        assert!(!outcome.committed);
        assert_eq!(store.task(&ana, newer.id).unwrap().status, TaskStatus::Inbox);

        let outcome = store.triage_swipe(&ana, newer.id, 101.0, 0.0).unwrap();
        assert_eq!(outcome, TriageOutcome { committed: true, inbox_zero: false });
        assert_eq!(store.task(&ana, newer.id).unwrap().status, TaskStatus::Today);

        let outcome = store.triage_swipe(&ana, older.id, 0.0, 101.0).unwrap();
        assert_eq!(outcome, TriageOutcome { committed: true, inbox_zero: true });
        assert_eq!(store.task(&ana, older.id).unwrap().status, TaskStatus::Deleted);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn triage_view_reports_inbox_emptied_elsewhere() {
        let (store, path) = temp_store("triage_view");
        let ana = session("ana");
        let task = store.add_task(&ana, NewTask::new("Pay rent")).unwrap();

        let (queue, inbox_zero) = store.triage_queue(&ana);
        assert_eq!(queue.len(), 1);
        assert!(!inbox_zero);

        store.complete_task(&ana, task.id).unwrap();
        let (queue, inbox_zero) = store.triage_queue(&ana);
        assert!(queue.is_empty());
        assert!(inbox_zero);

        let (_, inbox_zero) = store.triage_queue(&ana);
        assert!(!inbox_zero);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn join_twice_reports_already_joined() {
        let (store, path) = temp_store("join");
        let ana = session("ana");
        let ben = session("ben");

        let list = match store.execute(&ana, Command::CreateList { name: "Home".into(), color: "sky".into(), icon: None }).unwrap() {
            Event::ListCreated { list, .. } => list,
            _ => panic!("expected ListCreated"),
        };

        assert!(matches!(store.join_list(&ben, list.shared_id).unwrap(), JoinOutcome::Joined(_)));
        assert!(matches!(store.join_list(&ben, list.shared_id).unwrap(), JoinOutcome::AlreadyJoined(_)));
        assert!(matches!(store.join_list(&ana, list.shared_id).unwrap(), JoinOutcome::AlreadyJoined(_)));
        assert_eq!(store.lists(&ben).len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn watch_delivers_changes_until_dropped() {
        let (store, path) = temp_store("watch");
        let ana = session("ana");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = store.watch(&ana, Selector::Tasks(TaskQuery::status(TaskStatus::Inbox)), move |snap| {
            let _ = tx.send(snap);
        });
        assert_eq!(rx.recv().await.unwrap(), Snapshot::Tasks(vec![]));

        // Recipes don't touch task queries.
        store.execute(&ana, Command::CreateRecipe {
            name: "Review".into(),
            template: String::new(),
            task_templates: vec!["Clear desk".into()],
            color: "indigo".into(),
        }).unwrap();
        let task = store.add_task(&ana, NewTask::new("Buy milk")).unwrap();
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap() {
            Snapshot::Tasks(tasks) => assert_eq!(tasks, vec![task.clone()]),
            other => panic!("unexpected snapshot {other:?}"),
        }

        assert!(sub.is_active());
        sub.unsubscribe();
        store.add_task(&ana, NewTask::new("Unseen")).unwrap();
        let after = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(after, Ok(None) | Err(_)));

        let _ = fs::remove_file(&path);
    }
}
