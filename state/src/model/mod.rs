mod backfill_cursor;
mod entity;
mod roster;

pub use backfill_cursor::BackfillCursor;
pub use backfill_cursor::BackfillTally;
pub use entity::BackfillScope;
pub use entity::DEFAULT_EVICTION_THRESHOLD;
pub use entity::EntityRecord;
pub use entity::EntityStatus;
pub use entity::EntitySummary;
pub use entity::MissOutcome;
pub use entity::Observed;
pub use entity::SnapshotAttributes;
pub use roster::PendingResolution;
pub use roster::ResolutionFailure;
pub use roster::RosterEntry;

pub(crate) use backfill_cursor::count_to_i64;
pub(crate) use entity::datetime_to_epoch_millis;
pub(crate) use entity::epoch_millis_to_datetime;
