//! Resumable full sweep over the entity table.

use crate::config::BackfillConfig;
use crate::fetch_pool::FetchPool;
use crate::reconcile::ReconcileOutcome;
use crate::reconcile::apply;
use crate::reconcile::decide;
use chrono::Utc;
use maple_client::CharacterSource;
use maple_state::BackfillTally;
use maple_state::StateRuntime;
use maple_state::is_store_unavailable;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Longest wait between retries while the store is unavailable.
const MAX_STORE_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub updated: u64,
    pub not_found_marked: u64,
    pub errored: u64,
    /// The sweep continued from a stored cursor.
    pub resumed: bool,
    /// False when shutdown interrupted the sweep; the cursor is kept.
    pub completed: bool,
}

impl BackfillSummary {
    fn new(tally: BackfillTally, resumed: bool, completed: bool) -> Self {
        Self {
            updated: tally.updated,
            not_found_marked: tally.not_found_marked,
            errored: tally.errored,
            resumed,
            completed,
        }
    }
}

pub struct BackfillCoordinator<S: CharacterSource + ?Sized + 'static> {
    runtime: Arc<StateRuntime>,
    source: Arc<S>,
    config: BackfillConfig,
}

impl<S: CharacterSource + ?Sized + 'static> BackfillCoordinator<S> {
    pub fn new(runtime: Arc<StateRuntime>, source: Arc<S>, config: BackfillConfig) -> Self {
        Self {
            runtime,
            source,
            config,
        }
    }

    /// Sweep until done or cancelled.
    ///
    /// Progress is checkpointed after every batch. When cancelled mid-batch
    /// the checkpoint covers the longest prefix of the batch whose results
    /// were all reconciled, so a rerun neither skips nor double counts.
    /// Store outages are waited out; only other store errors end the sweep.
    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<BackfillSummary> {
        let sweep = self.config.sweep.as_str();
        let Some(cursor) = self
            .with_store_retry(cancel, "start", || {
                self.runtime.start_backfill(sweep, Utc::now())
            })
            .await?
        else {
            return Ok(BackfillSummary::new(BackfillTally::default(), false, false));
        };
        let resumed = cursor.last_entity_id.is_some();
        let mut tally = cursor.tally;
        let mut after = cursor.last_entity_id;
        if resumed {
            info!(
                sweep,
                after = after.as_deref().unwrap_or_default(),
                "resuming backfill"
            );
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(BackfillSummary::new(tally, resumed, false));
            }
            let Some(batch) = self
                .with_store_retry(cancel, "list batch", || {
                    self.runtime.list_backfill_batch(
                        after.as_deref(),
                        &self.config.scope,
                        self.config.batch_size,
                    )
                })
                .await?
            else {
                return Ok(BackfillSummary::new(tally, resumed, false));
            };
            let Some(last) = batch.last().map(|record| record.entity_id.clone()) else {
                let cleared = self
                    .with_store_retry(cancel, "clear cursor", || {
                        self.runtime.clear_backfill_cursor(sweep)
                    })
                    .await?;
                if cleared.is_none() {
                    return Ok(BackfillSummary::new(tally, resumed, false));
                }
                info!(
                    sweep,
                    updated = tally.updated,
                    not_found_marked = tally.not_found_marked,
                    errored = tally.errored,
                    "backfill complete"
                );
                return Ok(BackfillSummary::new(tally, resumed, true));
            };
            let ids: Vec<String> = batch.iter().map(|record| record.entity_id.clone()).collect();

            let outcomes = self.run_batch(batch, cancel).await;
            let done = outcomes.iter().take_while(|outcome| outcome.is_some()).count();
            for outcome in outcomes.iter().take(done).flatten() {
                tally_outcome(&mut tally, *outcome);
            }
            let prefix_end = done.checked_sub(1).and_then(|index| ids.get(index));
            if let Some(prefix_end) = prefix_end {
                let saved = self
                    .with_store_retry(cancel, "checkpoint", || {
                        self.runtime.checkpoint_backfill(sweep, prefix_end, tally)
                    })
                    .await?;
                if saved.is_none() {
                    return Ok(BackfillSummary::new(tally, resumed, false));
                }
            }
            if done == ids.len() {
                after = Some(last);
                continue;
            }

            info!(sweep, checkpointed = done, "backfill interrupted");
            return Ok(BackfillSummary::new(tally, resumed, false));
        }
    }

    /// Fetch and reconcile one batch; `None` marks entries that never ran.
    async fn run_batch(
        &self,
        batch: Vec<maple_state::EntityRecord>,
        cancel: &CancellationToken,
    ) -> Vec<Option<ReconcileOutcome>> {
        let mut outcomes = vec![None; batch.len()];
        let mut pool = FetchPool::new(
            Arc::clone(&self.source),
            batch,
            self.config.workers,
            cancel.clone(),
        );
        while let Some(result) = pool.next().await {
            let Some(attempt) = result.attempt else {
                continue;
            };
            let entity_id = result.record.entity_id.as_str();
            let decision = decide(
                &result.record,
                attempt,
                result.attempted_at,
                self.config.eviction_threshold,
            );
            let applied = self
                .with_store_retry(cancel, "reconcile", || {
                    apply(self.runtime.as_ref(), entity_id, decision.clone())
                })
                .await;
            let outcome = match applied {
                Ok(Some(outcome)) => outcome,
                // Cancelled while the store was away; the resumed run redoes it.
                Ok(None) => continue,
                Err(err) => {
                    warn!(entity_id, error = %err, "failed to reconcile entity");
                    ReconcileOutcome::Errored
                }
            };
            if let Some(slot) = outcomes.get_mut(result.index) {
                *slot = Some(outcome);
            }
        }
        outcomes
    }

    /// Run `op` until it gets past a store outage. `Ok(None)` means shutdown
    /// arrived while waiting.
    async fn with_store_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        step: &'static str,
        mut op: F,
    ) -> anyhow::Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.config.store_retry;
        let max_delay = MAX_STORE_RETRY.max(self.config.store_retry);
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) if is_store_unavailable(&err) => {
                    warn!(
                        sweep = self.config.sweep.as_str(),
                        step,
                        retry_in = ?delay,
                        error = %err,
                        "store unavailable during backfill, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2).min(max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn tally_outcome(tally: &mut BackfillTally, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Updated => tally.updated += 1,
        ReconcileOutcome::MissRecorded { .. } => tally.not_found_marked += 1,
        ReconcileOutcome::Errored => tally.errored += 1,
        ReconcileOutcome::Skipped => {}
    }
}
