//! Roster names to entity ids.

use chrono::Utc;
use maple_client::CharacterSource;
use maple_client::ResolveAttempt;
use maple_state::ResolutionFailure;
use maple_state::StateRuntime;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub resolved: usize,
    pub not_found: usize,
    pub errored: usize,
}

/// Resolve up to `limit` unresolved roster names of `world`, with at most
/// `workers` lookups in flight.
///
/// Lookups run concurrently; their results are written here, one at a time.
/// A name that upstream reports missing `give_up_after` times in a row is no
/// longer offered by the store. Stops early, without error, on cancellation.
pub async fn resolve_roster<S>(
    runtime: &StateRuntime,
    source: Arc<S>,
    world: &str,
    limit: usize,
    workers: usize,
    give_up_after: u32,
    cancel: &CancellationToken,
) -> anyhow::Result<BootstrapReport>
where
    S: CharacterSource + ?Sized + 'static,
{
    let mut report = BootstrapReport::default();
    if limit == 0 {
        return Ok(report);
    }
    let mut queued: VecDeque<String> = runtime
        .list_unresolved_roster(world, give_up_after, limit)
        .await?
        .into_iter()
        .map(|entry| entry.display_name)
        .collect();
    let mut tasks = JoinSet::new();
    let workers = workers.max(1);
    loop {
        while !cancel.is_cancelled() && tasks.len() < workers {
            let Some(display_name) = queued.pop_front() else {
                break;
            };
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let attempt = source.resolve(&display_name, &cancel).await;
                (display_name, attempt)
            });
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((display_name, Some(attempt))) => {
                record_attempt(runtime, world, &display_name, attempt, &mut report).await?;
            }
            Ok((_, None)) => {}
            Err(err) => {
                warn!(error = %err, "roster lookup task failed");
                report.errored += 1;
            }
        }
    }
    if report != BootstrapReport::default() {
        info!(
            resolved = report.resolved,
            not_found = report.not_found,
            errored = report.errored,
            "roster bootstrap finished"
        );
    }
    Ok(report)
}

async fn record_attempt(
    runtime: &StateRuntime,
    world: &str,
    display_name: &str,
    attempt: ResolveAttempt,
    report: &mut BootstrapReport,
) -> anyhow::Result<()> {
    let now = Utc::now();
    match attempt {
        ResolveAttempt::Resolved(entity_id) => {
            runtime
                .create_entity(display_name, world, &entity_id, now)
                .await?;
            runtime.clear_pending_resolution(display_name, world).await?;
            report.resolved += 1;
        }
        ResolveAttempt::NotFound => {
            let pending = runtime
                .record_resolution_failure(
                    display_name,
                    world,
                    ResolutionFailure::NotFound,
                    None,
                    now,
                )
                .await?;
            debug!(
                name = display_name,
                not_found_count = pending.not_found_count,
                "roster name not found"
            );
            report.not_found += 1;
        }
        ResolveAttempt::TransientError(reason) => {
            runtime
                .record_resolution_failure(
                    display_name,
                    world,
                    ResolutionFailure::Transient,
                    Some(reason.as_str()),
                    now,
                )
                .await?;
            report.errored += 1;
        }
        ResolveAttempt::RateLimited { retry_after } => {
            let reason = format!("rate limited, retry after {}s", retry_after.as_secs());
            runtime
                .record_resolution_failure(
                    display_name,
                    world,
                    ResolutionFailure::Transient,
                    Some(reason.as_str()),
                    now,
                )
                .await?;
            report.errored += 1;
        }
    }
    Ok(())
}
