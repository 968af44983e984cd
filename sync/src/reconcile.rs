//! Turns one fetch attempt into one store mutation.
//!
//! [`decide`] is pure so every branch can be tested without a database;
//! [`apply`] is the only place that writes.

use chrono::DateTime;
use chrono::Utc;
use maple_client::CharacterSnapshot;
use maple_client::FetchAttempt;
use maple_state::EntityRecord;
use maple_state::SnapshotAttributes;
use maple_state::StateRuntime;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreMutation {
    /// Merge the snapshot and reset the miss streak.
    RecordSuccess {
        attributes: SnapshotAttributes,
        observed_at: DateTime<Utc>,
    },
    RecordMiss {
        attempted_at: DateTime<Utc>,
        threshold: u32,
    },
    /// Only advance `last_attempted_at`; counters stay as they are.
    RecordAttempt { attempted_at: DateTime<Utc> },
    None,
}

/// What the scheduler should expect next for this entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHint {
    Refresh,
    Backoff(Duration),
    Evicted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub mutation: StoreMutation,
    pub hint: NextHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated,
    MissRecorded { evicted: bool },
    Errored,
    /// Nothing written: the entity was already evicted or the miss was a replay.
    Skipped,
}

pub fn decide(
    current: &EntityRecord,
    attempt: FetchAttempt,
    attempted_at: DateTime<Utc>,
    threshold: u32,
) -> Decision {
    if current.status.is_evicted() {
        return Decision {
            mutation: StoreMutation::None,
            hint: NextHint::Evicted,
        };
    }
    match attempt {
        FetchAttempt::Success(snapshot) => Decision {
            mutation: StoreMutation::RecordSuccess {
                attributes: snapshot_attributes(snapshot),
                observed_at: attempted_at,
            },
            hint: NextHint::Refresh,
        },
        FetchAttempt::NotFound => {
            let evicts = current.consecutive_miss_count.saturating_add(1) >= threshold;
            Decision {
                mutation: StoreMutation::RecordMiss {
                    attempted_at,
                    threshold,
                },
                hint: if evicts {
                    NextHint::Evicted
                } else {
                    NextHint::Refresh
                },
            }
        }
        FetchAttempt::TransientError(_) => Decision {
            mutation: StoreMutation::RecordAttempt { attempted_at },
            hint: NextHint::Refresh,
        },
        FetchAttempt::RateLimited { retry_after } => Decision {
            mutation: StoreMutation::RecordAttempt { attempted_at },
            hint: NextHint::Backoff(retry_after),
        },
    }
}

/// Perform the decided mutation.
pub async fn apply(
    runtime: &StateRuntime,
    entity_id: &str,
    decision: Decision,
) -> anyhow::Result<ReconcileOutcome> {
    let outcome = match decision.mutation {
        StoreMutation::RecordSuccess {
            attributes,
            observed_at,
        } => {
            runtime
                .record_success(entity_id, &attributes, observed_at)
                .await?;
            ReconcileOutcome::Updated
        }
        StoreMutation::RecordMiss {
            attempted_at,
            threshold,
        } => {
            let miss = runtime.mark_miss(entity_id, attempted_at, threshold).await?;
            if miss.counted {
                ReconcileOutcome::MissRecorded {
                    evicted: miss.status.is_evicted(),
                }
            } else {
                ReconcileOutcome::Skipped
            }
        }
        StoreMutation::RecordAttempt { attempted_at } => {
            runtime.mark_attempted(entity_id, attempted_at).await?;
            ReconcileOutcome::Errored
        }
        StoreMutation::None => ReconcileOutcome::Skipped,
    };
    debug!(entity_id, ?outcome, hint = ?decision.hint, "reconciled");
    Ok(outcome)
}

pub(crate) fn snapshot_attributes(snapshot: CharacterSnapshot) -> SnapshotAttributes {
    SnapshotAttributes {
        guild_name: snapshot.guild_name,
        level: snapshot.level,
        power: snapshot.power,
        class_name: snapshot.class_name,
        gender: snapshot.gender,
        stats: snapshot.stats,
    }
}
