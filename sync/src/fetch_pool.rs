use chrono::DateTime;
use chrono::Utc;
use maple_client::CharacterSource;
use maple_client::FetchAttempt;
use maple_state::EntityRecord;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::Id;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One finished fetch.
#[derive(Debug)]
pub(crate) struct FetchResult {
    /// Position of the record in the list handed to [`FetchPool::new`].
    pub index: usize,
    pub record: EntityRecord,
    pub attempted_at: DateTime<Utc>,
    /// `None` when cancellation arrived before the request went out.
    pub attempt: Option<FetchAttempt>,
}

/// Runs fetches with at most `workers` in flight and yields results in
/// completion order.
///
/// Nothing new is started once the token is cancelled, but fetches already
/// in flight still run to completion and are yielded.
pub(crate) struct FetchPool<S: CharacterSource + ?Sized + 'static> {
    source: Arc<S>,
    queued: VecDeque<(usize, EntityRecord)>,
    running: HashMap<Id, (usize, EntityRecord)>,
    tasks: JoinSet<(DateTime<Utc>, Option<FetchAttempt>)>,
    workers: usize,
    dispatched: usize,
    cancel: CancellationToken,
}

impl<S: CharacterSource + ?Sized + 'static> FetchPool<S> {
    pub(crate) fn new(
        source: Arc<S>,
        records: Vec<EntityRecord>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            queued: records.into_iter().enumerate().collect(),
            running: HashMap::new(),
            tasks: JoinSet::new(),
            workers: workers.max(1),
            dispatched: 0,
            cancel,
        }
    }

    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Top up the workers, then wait for the next completion.
    pub(crate) async fn next(&mut self) -> Option<FetchResult> {
        self.fill();
        loop {
            let joined = self.tasks.join_next_with_id().await?;
            let (id, outcome) = match joined {
                Ok((id, (attempted_at, attempt))) => (id, Ok((attempted_at, attempt))),
                Err(err) => (err.id(), Err(err)),
            };
            let Some((index, record)) = self.running.remove(&id) else {
                continue;
            };
            let (attempted_at, attempt) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    warn!(entity_id = %record.entity_id, error = %err, "fetch task failed");
                    (
                        Utc::now(),
                        Some(FetchAttempt::TransientError(format!("fetch task failed: {err}"))),
                    )
                }
            };
            return Some(FetchResult {
                index,
                record,
                attempted_at,
                attempt,
            });
        }
    }

    /// Stop dispatching and wait out whatever is in flight, discarding it.
    pub(crate) async fn drain(&mut self) {
        self.queued.clear();
        while self.tasks.join_next().await.is_some() {}
        self.running.clear();
    }

    fn fill(&mut self) {
        while !self.cancel.is_cancelled() && self.tasks.len() < self.workers {
            let Some((index, record)) = self.queued.pop_front() else {
                break;
            };
            let source = Arc::clone(&self.source);
            let cancel = self.cancel.clone();
            let entity_id = record.entity_id.clone();
            let handle = self.tasks.spawn(async move {
                let attempted_at = Utc::now();
                let attempt = source.fetch(&entity_id, &cancel).await;
                (attempted_at, attempt)
            });
            self.running.insert(handle.id(), (index, record));
            self.dispatched += 1;
        }
    }
}
