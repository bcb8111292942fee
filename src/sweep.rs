//! Periodic wake-up of snoozed tasks whose due date has passed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::store::Store;

/// Run the sweep now and then every `every`.
pub fn spawn(store: Store, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // The first tick completes immediately.
            ticker.tick().await;
            run_once(&store);
        }
    })
}

/// One pass. Returns how many tasks woke.
pub fn run_once(store: &Store) -> usize {
    match store.wake_snoozed() {
        Ok(0) => {
            debug!("wake sweep: nothing due");
            0
        }
        Ok(woken) => {
            info!(woken, "woke snoozed tasks");
            woken
        }
        Err(e) => {
            error!(error = %e, "wake sweep failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, TaskPatch, TaskStatus};
    use crate::store::tests::{session, temp_store};
    use chrono::Utc;
    use uuid::Uuid;

    fn snooze_past(store: &Store, session: &crate::auth::Session, task_id: Uuid) {
        store.update_task(session, task_id, TaskPatch {
            status: Some(TaskStatus::Snoozed),
            due_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..Default::default()
        }).unwrap();
    }

    #[tokio::test]
    async fn run_once_is_idempotent() {
        let (store, path) = temp_store("sweep_once");
        let ana = session("ana");
        let task = store.add_task(&ana, NewTask::new("Call back")).unwrap();
        snooze_past(&store, &ana, task.id);

        assert_eq!(run_once(&store), 1);
        assert_eq!(run_once(&store), 0);
        assert_eq!(store.task(&ana, task.id).unwrap().status, TaskStatus::Today);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_at_start_then_on_interval() {
        let (store, path) = temp_store("sweep_interval");
        let ana = session("ana");
        let task = store.add_task(&ana, NewTask::new("Water plants")).unwrap();
        snooze_past(&store, &ana, task.id);

        let handle = spawn(store.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.task(&ana, task.id).unwrap().status, TaskStatus::Today);

        snooze_past(&store, &ana, task.id);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.task(&ana, task.id).unwrap().status, TaskStatus::Snoozed);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.task(&ana, task.id).unwrap().status, TaskStatus::Today);

        handle.abort();
        let _ = std::fs::remove_file(&path);
    }
}
