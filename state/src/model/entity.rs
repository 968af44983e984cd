use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::BTreeMap;

/// Number of consecutive not-found outcomes that evicts an entity.
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 5;

/// Tracking status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Last reconciled outcome was a success, or the entity was just created.
    Active,
    /// At least one counted miss, still below the eviction threshold.
    Stale,
    /// Terminal. Never scheduled again and excluded from aggregates.
    Evicted,
}

impl EntityStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Stale => "stale",
            EntityStatus::Evicted => "evicted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "stale" => Ok(Self::Stale),
            "evicted" => Ok(Self::Evicted),
            _ => Err(anyhow::anyhow!("invalid entity status: {value}")),
        }
    }

    pub fn is_evicted(self) -> bool {
        matches!(self, EntityStatus::Evicted)
    }
}

/// An attribute value together with the time it was observed upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observed<T> {
    pub value: T,
    pub observed_at: DateTime<Utc>,
}

/// Persisted state of one tracked character.
///
/// Named stat fields live in a side table; load them with
/// [`crate::StateRuntime::get_entity_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    /// Stable upstream identifier (`ocid`).
    pub entity_id: String,
    /// Name as entered in the roster, used for the initial lookup.
    pub display_name: String,
    pub world_name: String,
    pub guild_name: Option<Observed<String>>,
    pub level: Option<Observed<i64>>,
    pub power: Option<Observed<i64>>,
    pub class_name: Option<Observed<String>>,
    pub gender: Option<Observed<String>>,
    pub consecutive_miss_count: u32,
    pub status: EntityStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_miss_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EntityRecord {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let consecutive_miss_count: i64 = row.try_get("consecutive_miss_count")?;
        Ok(Self {
            entity_id: row.try_get("entity_id")?,
            display_name: row.try_get("display_name")?,
            world_name: row.try_get("world_name")?,
            guild_name: observed(row, "guild_name")?,
            level: observed(row, "level")?,
            power: observed(row, "power")?,
            class_name: observed(row, "class_name")?,
            gender: observed(row, "gender")?,
            consecutive_miss_count: u32::try_from(consecutive_miss_count)
                .map_err(|_| anyhow::anyhow!("invalid miss count: {consecutive_miss_count}"))?,
            status: EntityStatus::parse(status.as_str())?,
            last_seen_at: optional_millis(row, "last_seen_at")?,
            last_attempted_at: optional_millis(row, "last_attempted_at")?,
            last_miss_at: optional_millis(row, "last_miss_at")?,
            created_at: epoch_millis_to_datetime(row.try_get("created_at")?)?,
        })
    }

    /// Whether the basic profile still lacks fields a full fetch fills in.
    pub fn is_incomplete(&self) -> bool {
        self.class_name.is_none() || self.gender.is_none() || self.level.is_none()
    }
}

/// Attribute values observed by one successful fetch.
///
/// `None` means the fetch did not report the field; stored values are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotAttributes {
    pub guild_name: Option<String>,
    pub level: Option<i64>,
    pub power: Option<i64>,
    pub class_name: Option<String>,
    pub gender: Option<String>,
    pub stats: BTreeMap<String, f64>,
}

/// Result of counting one not-found outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissOutcome {
    pub consecutive_miss_count: u32,
    pub status: EntityStatus,
    /// False when the miss was a replay or older than the latest contact.
    pub counted: bool,
}

/// Aggregates over non-evicted entities, plus per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySummary {
    pub active: u64,
    pub stale: u64,
    pub evicted: u64,
    pub average_level: Option<f64>,
    pub max_power: Option<i64>,
    pub classes: Vec<(String, u64)>,
}

/// Bounds for a backfill sweep over the entity table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillScope {
    /// Inclusive lower bound on `entity_id`.
    pub from_entity: Option<String>,
    /// Inclusive upper bound on `entity_id`.
    pub to_entity: Option<String>,
    /// Only entities not seen since this instant (or never seen).
    pub seen_before: Option<DateTime<Utc>>,
    /// Only entities missing class, gender or level.
    pub only_incomplete: bool,
}

fn observed<T>(row: &SqliteRow, column: &str) -> Result<Option<Observed<T>>>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    let value: Option<T> = row.try_get(column)?;
    let observed_at: Option<i64> = row.try_get(format!("{column}_observed_at").as_str())?;
    match (value, observed_at) {
        (Some(value), Some(observed_at)) => Ok(Some(Observed {
            value,
            observed_at: epoch_millis_to_datetime(observed_at)?,
        })),
        _ => Ok(None),
    }
}

fn optional_millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<i64>, _>(column)?
        .map(epoch_millis_to_datetime)
        .transpose()
}

pub(crate) fn datetime_to_epoch_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn epoch_millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp millis: {millis}"))
}
