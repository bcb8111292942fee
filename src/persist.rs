//! World ↔ redb persistence.
//!
//! redb is a save file: loaded on boot, flushed on every mutation.
//! Never queried at runtime. World is the runtime truth.

use crate::models::{List, Recipe, StagingItem, StagingStatus, Task, User};
use crate::world::{Event, World};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
#[cfg(feature = "profile")]
use std::time::Instant;
use uuid::Uuid;

const TASKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tasks");
const LISTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("lists");
const RECIPES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("recipes");
const STAGING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("staging");
const USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("users");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Error shown on a staging item whose extraction was cut off by a restart.
pub const INTERRUPTED_MESSAGE: &str = "Processing was interrupted. Try again.";

/// Thin handle to the redb file. Cloneable (Arc inside).
#[derive(Clone)]
pub struct SaveFile {
    db: Arc<Database>,
}

impl SaveFile {
    /// Open (or create) the save file at the given path.
    /// Creates tables if they don't exist.
    pub fn open(path: &str) -> Result<Self, SaveFileError> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(TASKS)?;
            let _ = txn.open_table(LISTS)?;
            let _ = txn.open_table(RECIPES)?;
            let _ = txn.open_table(STAGING)?;
            let _ = txn.open_table(USERS)?;
            let _ = txn.open_table(META)?;
        }
        txn.commit()?;

        Ok(SaveFile { db: Arc::new(db) })
    }

    /// Load the entire World from disk. Called once at boot.
    pub fn load_world(&self) -> Result<World, SaveFileError> {
        let mut world = World::new();
        let txn = self.db.begin_read()?;

        for task in load_all::<Task>(&txn.open_table(TASKS)?)? {
            world.tasks.insert(task.id, task);
        }
        for list in load_all::<List>(&txn.open_table(LISTS)?)? {
            world.lists.insert(list.id, list);
        }
        for recipe in load_all::<Recipe>(&txn.open_table(RECIPES)?)? {
            world.recipes.insert(recipe.id, recipe);
        }
        // Extraction tasks do not survive a restart.
        let mut interrupted = 0;
        for mut item in load_all::<StagingItem>(&txn.open_table(STAGING)?)? {
            if item.status == StagingStatus::Processing {
                item.status = StagingStatus::Error;
                item.error = Some(INTERRUPTED_MESSAGE.to_string());
                interrupted += 1;
            }
            world.staging.insert(item.id, item);
        }
        if interrupted > 0 {
            tracing::warn!(interrupted, "staging items were processing at shutdown, marked as failed");
        }
        for user in load_all::<User>(&txn.open_table(USERS)?)? {
            world.users.insert(user.id, user);
        }

        let meta = txn.open_table(META)?;
        if let Some(rev_data) = meta.get("revision")? {
            let bytes: [u8; 8] = rev_data.value()
                .try_into()
                .map_err(|_| SaveFileError::Decode("revision is not 8 bytes".into()))?;
            world.revision = u64::from_le_bytes(bytes);
        }

        Ok(world)
    }

    /// Flush a single event to disk. Called before the event is committed
    /// to the World, so a failure here means the mutation never happened.
    /// Writes the affected entities + the event's revision in one transaction.
    pub fn flush(&self, event: &Event) -> Result<(), SaveFileError> {
        #[cfg(feature = "profile")]
        let total_start = Instant::now();
        let txn = self.db.begin_write()?;
        {
            let mut tasks = txn.open_table(TASKS)?;
            let mut lists = txn.open_table(LISTS)?;
            let mut recipes = txn.open_table(RECIPES)?;
            let mut staging = txn.open_table(STAGING)?;
            let mut meta = txn.open_table(META)?;

            #[cfg(feature = "profile")]
            let write_start = Instant::now();
            match event {
                Event::TaskCreated { task, .. }
                | Event::TaskUpdated { task, .. }
                | Event::TaskDeleted { task, .. } => {
                    put(&mut tasks, task.id, task)?;
                }
                Event::TaskCompleted { task, next, .. } => {
                    put(&mut tasks, task.id, task)?;
                    if let Some(next) = next {
                        put(&mut tasks, next.id, next)?;
                    }
                }
                Event::TasksCreated { tasks: batch, .. } | Event::TasksWoken { tasks: batch, .. } => {
                    for task in batch {
                        put(&mut tasks, task.id, task)?;
                    }
                }
                Event::ListCreated { list, .. } | Event::ListUpdated { list, .. } => {
                    put(&mut lists, list.id, list)?;
                }
                Event::ListDeleted { list, .. } => {
                    lists.remove(list.id.as_bytes().as_slice())?;
                }
                Event::RecipeCreated { recipe, .. } => {
                    put(&mut recipes, recipe.id, recipe)?;
                }
                Event::RecipeDeleted { recipe, .. } => {
                    recipes.remove(recipe.id.as_bytes().as_slice())?;
                }
                Event::StagingCreated { item, .. } | Event::StagingUpdated { item, .. } => {
                    put(&mut staging, item.id, item)?;
                }
                Event::StagingDeleted { item, .. } => {
                    staging.remove(item.id.as_bytes().as_slice())?;
                }
                Event::CandidateResolved { item, accepted, closed, .. } => {
                    if let Some(task) = accepted {
                        put(&mut tasks, task.id, task)?;
                    }
                    if *closed {
                        staging.remove(item.id.as_bytes().as_slice())?;
                    } else {
                        put(&mut staging, item.id, item)?;
                    }
                }
            }

            meta.insert("revision", event.revision().to_le_bytes().as_slice())?;
            #[cfg(feature = "profile")]
            tracing::debug!(elapsed_us = write_start.elapsed().as_micros() as u64, event = event.name(), "flush wrote rows and revision");
        }
        txn.commit()?;
        #[cfg(feature = "profile")]
        tracing::debug!(total_us = total_start.elapsed().as_micros() as u64, "flush committed transaction");
        Ok(())
    }

    /// Write a user to the save file (account creation).
    pub fn save_user(&self, user: &User) -> Result<(), SaveFileError> {
        let txn = self.db.begin_write()?;
        {
            let mut users = txn.open_table(USERS)?;
            put(&mut users, user.id, user)?;
        }
        txn.commit()?;
        Ok(())
    }
}

fn put<T: Serialize>(
    table: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    id: Uuid,
    value: &T,
) -> Result<(), SaveFileError> {
    let bytes = postcard::to_allocvec(value)
        .map_err(|e| SaveFileError::Encode(e.to_string()))?;
    table.insert(id.as_bytes().as_slice(), bytes.as_slice())?;
    Ok(())
}

fn load_all<T: DeserializeOwned>(
    table: &redb::ReadOnlyTable<&'static [u8], &'static [u8]>,
) -> Result<Vec<T>, SaveFileError> {
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let record = postcard::from_bytes(value.value())
            .map_err(|e| SaveFileError::Decode(e.to_string()))?;
        out.push(record);
    }
    Ok(out)
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SaveFileError {
    #[error("redb: {0}")]
    Redb(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
}

// redb 2.x has many error types. Blanket them all into SaveFileError::Redb.
macro_rules! from_redb {
    ($($t:ty),*) => {
        $(impl From<$t> for SaveFileError {
            fn from(e: $t) -> Self { SaveFileError::Redb(e.to_string()) }
        })*
    };
}

from_redb!(
    redb::Error,
    redb::DatabaseError,
    redb::TableError,
    redb::TransactionError,
    redb::StorageError,
    redb::CommitError
);

// ── Tests ──────────────────────────────────────────────────────
