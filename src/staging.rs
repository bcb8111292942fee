//! Capture → extraction → review pipeline.
//!
//! Each capture gets its own staging item. Extraction runs in a spawned
//! task that always lands its result on the item, even if the caller has
//! gone away. Nothing is retried automatically.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Session;
use crate::extraction::{classify_failure, CaptureInput, ExtractionOutcome, Extractor};
use crate::models::{Candidate, StagingItem, Task};
use crate::store::{Store, StoreError};
use crate::world::{Command, Event, StagingResult, WorldError};

/// A capture that has been accepted for processing.
pub struct PendingCapture {
    pub item: StagingItem,
    /// Completes once the result is on the item. Dropping it does not cancel.
    pub done: JoinHandle<()>,
}

/// Result of accepting or rejecting one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub item: StagingItem,
    pub accepted: Option<Task>,
    /// The item had no candidates left and is gone.
    pub closed: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    extractor: Arc<dyn Extractor>,
}

impl Pipeline {
    pub fn new(store: Store, extractor: Arc<dyn Extractor>) -> Self {
        Pipeline { store, extractor }
    }

    /// Open a new staging item and start extracting.
    pub fn capture(&self, session: &Session, input: CaptureInput) -> Result<PendingCapture, StoreError> {
        let item = match self.store.execute(session, Command::OpenStaging)? {
            Event::StagingCreated { item, .. } => item,
            _ => return Err(WorldError::InvalidTransition.into()),
        };
        info!(staging_id = %item.id, user_id = %session.user_id, "capture started");
        let done = self.spawn_extraction(item.id, session.user_id, input, Vec::new());
        Ok(PendingCapture { item, done })
    }

    /// Re-run extraction on a settled item with new instructions. The
    /// current candidates go along as context and are replaced by the reply.
    pub fn refine(&self, session: &Session, staging_id: Uuid, input: CaptureInput) -> Result<PendingCapture, StoreError> {
        let item = match self.store.execute(session, Command::RestartStaging { staging_id })? {
            Event::StagingUpdated { item, .. } => item,
            _ => return Err(WorldError::InvalidTransition.into()),
        };
        info!(%staging_id, context = item.tasks.len(), "refinement started");
        let done = self.spawn_extraction(item.id, session.user_id, input, item.tasks.clone());
        Ok(PendingCapture { item, done })
    }

    pub fn accept(&self, session: &Session, staging_id: Uuid, candidate_id: Uuid) -> Result<Resolution, StoreError> {
        self.resolve(session, Command::AcceptCandidate { staging_id, candidate_id })
    }

    pub fn reject(&self, session: &Session, staging_id: Uuid, candidate_id: Uuid) -> Result<Resolution, StoreError> {
        self.resolve(session, Command::RejectCandidate { staging_id, candidate_id })
    }

    pub fn discard(&self, session: &Session, staging_id: Uuid) -> Result<StagingItem, StoreError> {
        match self.store.execute(session, Command::DiscardStaging { staging_id })? {
            Event::StagingDeleted { item, .. } => Ok(item),
            _ => Err(WorldError::InvalidTransition.into()),
        }
    }

    /// The item to review next: the viewer's oldest.
    pub fn active(&self, session: &Session) -> Option<StagingItem> {
        self.store.staging_items(session).into_iter().next()
    }

    fn resolve(&self, session: &Session, cmd: Command) -> Result<Resolution, StoreError> {
        match self.store.execute(session, cmd)? {
            Event::CandidateResolved { item, accepted, closed, .. } => Ok(Resolution { item, accepted, closed }),
            _ => Err(WorldError::InvalidTransition.into()),
        }
    }

    fn spawn_extraction(
        &self,
        staging_id: Uuid,
        owner_id: Uuid,
        input: CaptureInput,
        context: Vec<Candidate>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let extractor = self.extractor.clone();

        tokio::spawn(async move {
            let result = match extractor.extract(&input, &context, Utc::now()).await {
                Ok(ExtractionOutcome::Ok { summary, tasks }) => {
                    info!(%staging_id, candidates = tasks.len(), "extraction finished");
                    StagingResult::Ready { summary, candidates: tasks }
                }
                Ok(ExtractionOutcome::Error { message }) => {
                    warn!(%staging_id, %message, "extraction declined");
                    StagingResult::Failed { message }
                }
                Err(e) => {
                    warn!(%staging_id, error = %e, "extraction failed");
                    StagingResult::Failed { message: classify_failure(&e) }
                }
            };

            // The item may have been discarded while we were waiting.
            if let Err(e) = store.apply_as(owner_id, Command::FinishStaging { staging_id, result }) {
                warn!(%staging_id, error = %e, "extraction result dropped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionError;
    use crate::models::{StagingStatus, TaskSource, TaskStatus};
    use crate::store::tests::{session, temp_store};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use std::fs;
    use std::sync::Mutex;

    /// Replies from a script and records the context it was given.
    struct FakeExtractor {
        replies: Mutex<Vec<Result<ExtractionOutcome, ExtractionError>>>,
        seen_context: Mutex<Vec<Vec<Candidate>>>,
    }

    impl FakeExtractor {
        fn new(replies: Vec<Result<ExtractionOutcome, ExtractionError>>) -> Arc<Self> {
            Arc::new(FakeExtractor {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                seen_context: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(
            &self,
            _input: &CaptureInput,
            context: &[Candidate],
            _now: DateTime<Utc>,
        ) -> Result<ExtractionOutcome, ExtractionError> {
            self.seen_context.lock().unwrap().push(context.to_vec());
            self.replies.lock().unwrap().pop().unwrap_or(Err(ExtractionError::Malformed("script exhausted".into())))
        }
    }

    fn candidate(content: &str, due_in_days: Option<i64>) -> Candidate {
        Candidate {
            id: Uuid::new_v4(),
            content: content.to_string(),
            due_at: due_in_days.map(|d| Utc::now() + Duration::days(d)),
            responsible: None,
            notes: None,
        }
    }

    fn found(tasks: Vec<Candidate>) -> Result<ExtractionOutcome, ExtractionError> {
        Ok(ExtractionOutcome::Ok { summary: format!("Found {} tasks", tasks.len()), tasks })
    }

    fn text(s: &str) -> CaptureInput {
        CaptureInput::Text(s.to_string())
    }

    #[tokio::test]
    async fn capture_then_accept_all() {
        let (store, path) = temp_store("pipeline_accept");
        let ana = session("ana");
        let pipeline = Pipeline::new(store.clone(), FakeExtractor::new(vec![
            found(vec![candidate("Book dentist", Some(2)), candidate("Email Sam", None)]),
        ]));

        let pending = pipeline.capture(&ana, text("dentist and email sam")).unwrap();
        assert_eq!(pending.item.status, StagingStatus::Processing);
        pending.done.await.unwrap();

        let item = pipeline.active(&ana).unwrap();
        assert_eq!(item.status, StagingStatus::Ready);
        assert_eq!(item.summary, "Found 2 tasks");

        let first = pipeline.accept(&ana, item.id, item.tasks[0].id).unwrap();
        let task = first.accepted.unwrap();
        assert_eq!(task.status, TaskStatus::Today);
        assert_eq!(task.source, TaskSource::Voice);
        assert!(!first.closed);

        let second = pipeline.accept(&ana, item.id, item.tasks[1].id).unwrap();
        assert_eq!(second.accepted.unwrap().status, TaskStatus::Inbox);
        assert!(second.closed);
        assert!(pipeline.active(&ana).is_none());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failure_lands_on_item() {
        let (store, path) = temp_store("pipeline_fail");
        let ana = session("ana");
        let pipeline = Pipeline::new(store.clone(), FakeExtractor::new(vec![
            Err(ExtractionError::Service { status: 429, body: "quota".into() }),
        ]));

        let pending = pipeline.capture(&ana, text("anything")).unwrap();
        pending.done.await.unwrap();

        let item = pipeline.active(&ana).unwrap();
        assert_eq!(item.status, StagingStatus::Error);
        assert!(item.error.unwrap().contains("quota"));

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn refine_sends_current_candidates() {
        let (store, path) = temp_store("pipeline_refine");
        let ana = session("ana");
        let original = candidate("Call plumber", None);
        let extractor = FakeExtractor::new(vec![
            found(vec![original.clone()]),
            found(vec![candidate("Call plumber at 9", Some(1))]),
        ]);
        let pipeline = Pipeline::new(store.clone(), extractor.clone());

        let pending = pipeline.capture(&ana, text("call the plumber")).unwrap();
        pending.done.await.unwrap();

        let refined = pipeline.refine(&ana, pending.item.id, text("make it 9am tomorrow")).unwrap();
        assert_eq!(refined.item.status, StagingStatus::Processing);
        refined.done.await.unwrap();

        let seen = extractor.seen_context.lock().unwrap().clone();
        assert_eq!(seen, vec![vec![], vec![original]]);

        let item = pipeline.active(&ana).unwrap();
        assert_eq!(item.tasks.len(), 1);
        assert_eq!(item.tasks[0].content, "Call plumber at 9");

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn concurrent_captures_have_own_items() {
        let (store, path) = temp_store("pipeline_many");
        let ana = session("ana");
        let pipeline = Pipeline::new(store.clone(), FakeExtractor::new(vec![
            found(vec![candidate("First", None)]),
            found(vec![]),
        ]));

        let a = pipeline.capture(&ana, text("first")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = pipeline.capture(&ana, text("second")).unwrap();
        a.done.await.unwrap();
        b.done.await.unwrap();

        let items = store.staging_items(&ana);
        assert_eq!(items.len(), 2);
        assert_eq!(pipeline.active(&ana).unwrap().id, a.item.id);
        // Empty result stays for the user to dismiss.
        assert_eq!(items[1].status, StagingStatus::Ready);
        assert!(items[1].tasks.is_empty());

        pipeline.discard(&ana, b.item.id).unwrap();
        assert_eq!(store.staging_items(&ana).len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn items_are_private() {
        let (store, path) = temp_store("pipeline_private");
        let ana = session("ana");
        let ben = session("ben");
        let pipeline = Pipeline::new(store.clone(), FakeExtractor::new(vec![found(vec![candidate("Secret", None)])]));

        let pending = pipeline.capture(&ana, text("secret")).unwrap();
        pending.done.await.unwrap();

        assert!(pipeline.active(&ben).is_none());
        let err = pipeline.accept(&ben, pending.item.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::World(WorldError::StagingNotFound)));

        let _ = fs::remove_file(&path);
    }
}
