//! The polling loop.
//!
//! Each cycle walks `Selecting -> Dispatching <-> Reconciling -> Sleeping`.
//! All store writes happen here on the control loop; workers only fetch.

use crate::bootstrap::BootstrapReport;
use crate::bootstrap::resolve_roster;
use crate::config::SchedulerConfig;
use crate::fetch_pool::FetchPool;
use crate::reconcile::ReconcileOutcome;
use crate::reconcile::apply;
use crate::reconcile::decide;
use chrono::Utc;
use maple_client::CharacterSource;
use maple_state::StateRuntime;
use maple_state::is_store_unavailable;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Selecting,
    Dispatching,
    Reconciling,
    Sleeping,
    Stopped,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub bootstrap: BootstrapReport,
    pub selected: usize,
    pub dispatched: usize,
    pub updated: usize,
    pub misses: usize,
    pub evicted: usize,
    pub errored: usize,
    pub skipped: usize,
    /// Fetches that never went out because shutdown arrived first.
    pub cancelled: usize,
    /// The store was unavailable; remaining work waits for the next cycle.
    pub deferred: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::MissRecorded { evicted } => {
                self.misses += 1;
                if evicted {
                    self.evicted += 1;
                }
            }
            ReconcileOutcome::Errored => self.errored += 1,
            ReconcileOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct Scheduler<S: CharacterSource + ?Sized + 'static> {
    runtime: Arc<StateRuntime>,
    source: Arc<S>,
    config: SchedulerConfig,
    phase_tx: watch::Sender<SchedulerPhase>,
}

impl<S: CharacterSource + ?Sized + 'static> Scheduler<S> {
    pub fn new(runtime: Arc<StateRuntime>, source: Arc<S>, config: SchedulerConfig) -> Self {
        let (phase_tx, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            runtime,
            source,
            config,
            phase_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            world = %self.config.world,
            workers = self.config.workers,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "scheduler started"
        );
        while !cancel.is_cancelled() {
            let report = self.run_cycle(&cancel).await;
            info!(
                selected = report.selected,
                updated = report.updated,
                misses = report.misses,
                evicted = report.evicted,
                errored = report.errored,
                deferred = report.deferred,
                "cycle finished"
            );
            if cancel.is_cancelled() {
                break;
            }
            self.set_phase(SchedulerPhase::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            self.set_phase(SchedulerPhase::Idle);
        }
        self.set_phase(SchedulerPhase::Stopped);
        info!("scheduler stopped");
    }

    /// One select/dispatch/reconcile pass. Never fails: store trouble defers
    /// the rest of the cycle and is reported in the result.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        self.set_phase(SchedulerPhase::Selecting);

        match resolve_roster(
            self.runtime.as_ref(),
            Arc::clone(&self.source),
            &self.config.world,
            self.config.bootstrap_limit,
            self.config.workers,
            self.config.eviction_threshold,
            cancel,
        )
        .await
        {
            Ok(bootstrap) => report.bootstrap = bootstrap,
            Err(err) if is_store_unavailable(&err) => {
                warn!(error = %err, "store unavailable during roster bootstrap, deferring cycle");
                report.deferred = true;
                return report;
            }
            Err(err) => warn!(error = %err, "roster bootstrap failed"),
        }

        let due = match self
            .runtime
            .due_for_refresh(
                Utc::now(),
                self.config.min_refresh_interval,
                self.config.max_per_cycle,
            )
            .await
        {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "failed to select due entities, deferring cycle");
                report.deferred = true;
                return report;
            }
        };
        report.selected = due.len();
        if due.is_empty() {
            debug!("nothing due for refresh");
            return report;
        }

        self.set_phase(SchedulerPhase::Dispatching);
        let mut pool = FetchPool::new(
            Arc::clone(&self.source),
            due,
            self.config.workers,
            cancel.clone(),
        );
        while let Some(result) = pool.next().await {
            let Some(attempt) = result.attempt else {
                report.cancelled += 1;
                continue;
            };
            self.set_phase(SchedulerPhase::Reconciling);
            let entity_id = result.record.entity_id.as_str();
            let decision = decide(
                &result.record,
                attempt,
                result.attempted_at,
                self.config.eviction_threshold,
            );
            match apply(self.runtime.as_ref(), entity_id, decision).await {
                Ok(outcome) => report.record(outcome),
                Err(err) if is_store_unavailable(&err) => {
                    warn!(entity_id, error = %err, "store unavailable, deferring rest of cycle");
                    report.deferred = true;
                    pool.drain().await;
                    break;
                }
                Err(err) => {
                    warn!(entity_id, error = %err, "failed to reconcile entity");
                    report.errored += 1;
                }
            }
            self.set_phase(SchedulerPhase::Dispatching);
        }
        report.dispatched = pool.dispatched();
        report
    }
}
