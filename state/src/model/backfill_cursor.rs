use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::entity::epoch_millis_to_datetime;

/// Outcome counts accumulated by a backfill sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillTally {
    pub updated: u64,
    pub not_found_marked: u64,
    pub errored: u64,
}

impl BackfillTally {
    pub fn total(&self) -> u64 {
        self.updated
            .saturating_add(self.not_found_marked)
            .saturating_add(self.errored)
    }

    pub fn merge(&mut self, other: BackfillTally) {
        self.updated = self.updated.saturating_add(other.updated);
        self.not_found_marked = self.not_found_marked.saturating_add(other.not_found_marked);
        self.errored = self.errored.saturating_add(other.errored);
    }
}

/// Persisted progress of one named backfill sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillCursor {
    pub sweep: String,
    /// Last entity whose batch completed; the sweep resumes after it.
    pub last_entity_id: Option<String>,
    /// Tally of everything before and including `last_entity_id`.
    pub tally: BackfillTally,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillCursor {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            sweep: row.try_get("sweep")?,
            last_entity_id: row.try_get("last_entity_id")?,
            tally: BackfillTally {
                updated: count(row, "updated")?,
                not_found_marked: count(row, "not_found_marked")?,
                errored: count(row, "errored")?,
            },
            started_at: epoch_millis_to_datetime(row.try_get("started_at")?)?,
            updated_at: epoch_millis_to_datetime(row.try_get("updated_at")?)?,
        })
    }
}

fn count(row: &SqliteRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| anyhow::anyhow!("invalid {column} count: {value}"))
}

pub(crate) fn count_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
