use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::entity::epoch_millis_to_datetime;

/// A user-curated roster line: a display name and its guild label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub display_name: String,
    pub world_name: String,
    pub guild_label: Option<String>,
}

impl RosterEntry {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            display_name: row.try_get("display_name")?,
            world_name: row.try_get("world_name")?,
            guild_label: row.try_get("guild_label")?,
        })
    }
}

/// Why a roster name could not be resolved to an entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// Upstream reported no such character. Counts toward giving up.
    NotFound,
    /// Transport noise or throttling. Recorded, never counted.
    Transient,
}

impl ResolutionFailure {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResolutionFailure::NotFound => "not_found",
            ResolutionFailure::Transient => "transient",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "not_found" => Ok(Self::NotFound),
            "transient" => Ok(Self::Transient),
            _ => Err(anyhow::anyhow!("invalid resolution failure: {value}")),
        }
    }
}

/// Bookkeeping for a roster name that has failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResolution {
    pub display_name: String,
    pub world_name: String,
    pub not_found_count: u32,
    pub last_reason: ResolutionFailure,
    pub last_error: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}

impl PendingResolution {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let last_reason: String = row.try_get("last_reason")?;
        let not_found_count: i64 = row.try_get("not_found_count")?;
        Ok(Self {
            display_name: row.try_get("display_name")?,
            world_name: row.try_get("world_name")?,
            not_found_count: u32::try_from(not_found_count)
                .map_err(|_| anyhow::anyhow!("invalid not_found_count: {not_found_count}"))?,
            last_reason: ResolutionFailure::parse(last_reason.as_str())?,
            last_error: row.try_get("last_error")?,
            last_checked_at: epoch_millis_to_datetime(row.try_get("last_checked_at")?)?,
        })
    }
}
