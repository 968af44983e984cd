//! SQLite-backed record store for tracked characters.
//!
//! Holds the entity table with per-field observation stamps, the guild
//! roster the engine resolves names from, and backfill cursors. Fetching and
//! scheduling live in `maple-client` and `maple-sync`.

mod migrations;
mod model;
mod runtime;

/// Preferred entrypoint: owns the connection pool.
pub use runtime::DEFAULT_BUSY_TIMEOUT;
pub use runtime::StateRuntime;
pub use runtime::is_store_unavailable;
pub use runtime::state_db_filename;
pub use runtime::state_db_path;

pub use model::BackfillCursor;
pub use model::BackfillScope;
pub use model::BackfillTally;
pub use model::DEFAULT_EVICTION_THRESHOLD;
pub use model::EntityRecord;
pub use model::EntityStatus;
pub use model::EntitySummary;
pub use model::MissOutcome;
pub use model::Observed;
pub use model::PendingResolution;
pub use model::ResolutionFailure;
pub use model::RosterEntry;
pub use model::SnapshotAttributes;

pub const MAPLE_DB_FILENAME: &str = "maple";
pub const MAPLE_DB_VERSION: u32 = 1;
