use crate::MAPLE_DB_FILENAME;
use crate::MAPLE_DB_VERSION;
use crate::migrations::MIGRATOR;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::warn;

mod backfill;
mod entities;
mod roster;
#[cfg(test)]
mod test_support;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the record store. Cheap to clone; every component gets its own.
#[derive(Clone)]
pub struct StateRuntime {
    home: PathBuf,
    pool: Arc<sqlx::SqlitePool>,
}

impl StateRuntime {
    /// Open (and migrate) the SQLite database under `home`.
    pub async fn init(home: PathBuf) -> anyhow::Result<Arc<Self>> {
        Self::init_with_busy_timeout(home, DEFAULT_BUSY_TIMEOUT).await
    }

    /// [`StateRuntime::init`] with a custom wait for locks held by other
    /// connections. Once it elapses, writes fail with an error that
    /// [`is_store_unavailable`] recognizes.
    pub async fn init_with_busy_timeout(
        home: PathBuf,
        busy_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&home).await?;
        let db_path = state_db_path(home.as_path());
        let existed = tokio::fs::try_exists(&db_path).await.unwrap_or(false);
        let pool = match open_sqlite(&db_path, busy_timeout).await {
            Ok(db) => Arc::new(db),
            Err(err) => {
                warn!("failed to open state db at {}: {err}", db_path.display());
                return Err(err);
            }
        };
        if !existed {
            info!("created state db at {}", db_path.display());
        }
        Ok(Arc::new(Self { home, pool }))
    }

    pub fn home(&self) -> &Path {
        self.home.as_path()
    }

    /// Close the pool so an external maintenance job can take the file.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether `err` means the store is briefly unusable (locked by a
/// maintenance pass, disk trouble, pool exhausted) rather than broken.
pub fn is_store_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let Some(sqlx_err) = cause.downcast_ref::<sqlx::Error>() else {
            return false;
        };
        match sqlx_err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db_err) => db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| {
                    // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_IOERR, SQLITE_CANTOPEN
                    matches!(code & 0xff, 5 | 6 | 10 | 14)
                }),
            _ => false,
        }
    })
}

async fn open_sqlite(path: &Path, busy_timeout: Duration) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

pub fn state_db_filename() -> String {
    format!("{MAPLE_DB_FILENAME}_{MAPLE_DB_VERSION}.sqlite")
}

pub fn state_db_path(home: &Path) -> PathBuf {
    home.join(state_db_filename())
}

#[cfg(test)]
mod tests {
    use super::StateRuntime;
    use super::is_store_unavailable;
    use super::state_db_filename;
    use super::test_support::unique_temp_dir;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn init_creates_versioned_db_file() {
        let home = unique_temp_dir();
        let _runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");

        assert_eq!(
            tokio::fs::try_exists(home.join(state_db_filename()))
                .await
                .expect("check db path"),
            true
        );

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn reopening_existing_db_keeps_rows() {
        let home = unique_temp_dir();
        let runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");
        runtime
            .upsert_roster_entry("Alpha", "Challenger", Some("Guild"))
            .await
            .expect("insert roster entry");
        runtime.close().await;

        let reopened = StateRuntime::init(home.clone())
            .await
            .expect("reopen runtime");
        let roster = reopened.list_roster("Challenger").await.expect("roster");
        assert_eq!(roster.len(), 1);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn closed_pool_is_reported_as_unavailable() {
        let home = unique_temp_dir();
        let runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");
        runtime.close().await;

        let err = runtime
            .list_roster("Challenger")
            .await
            .expect_err("closed pool must fail");
        assert!(is_store_unavailable(&err));
        assert!(!is_store_unavailable(&anyhow::anyhow!("unrelated")));

        let _ = tokio::fs::remove_dir_all(home).await;
    }
}
