use super::*;
use crate::BackfillCursor;
use crate::BackfillTally;
use crate::model::count_to_i64;
use crate::model::datetime_to_epoch_millis;
use chrono::DateTime;
use chrono::Utc;

impl StateRuntime {
    pub async fn get_backfill_cursor(&self, sweep: &str) -> anyhow::Result<Option<BackfillCursor>> {
        let row = sqlx::query(
            r#"
SELECT sweep, last_entity_id, updated, not_found_marked, errored, started_at, updated_at
FROM backfill_cursors
WHERE sweep = ?
            "#,
        )
        .bind(sweep)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| BackfillCursor::try_from_row(&row)).transpose()
    }

    /// Return the cursor for `sweep`, creating an empty one if none is stored.
    ///
    /// An existing cursor is returned untouched so an interrupted sweep
    /// resumes where it left off.
    pub async fn start_backfill(
        &self,
        sweep: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BackfillCursor> {
        let now = datetime_to_epoch_millis(now);
        sqlx::query(
            r#"
INSERT INTO backfill_cursors (sweep, last_entity_id, updated, not_found_marked, errored, started_at, updated_at)
VALUES (?, NULL, 0, 0, 0, ?, ?)
ON CONFLICT(sweep) DO NOTHING
            "#,
        )
        .bind(sweep)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        self.get_backfill_cursor(sweep)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load backfill cursor {sweep}"))
    }

    /// Persist sweep progress. `tally` is cumulative, not a delta.
    pub async fn checkpoint_backfill(
        &self,
        sweep: &str,
        last_entity_id: &str,
        tally: BackfillTally,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
UPDATE backfill_cursors
SET
    last_entity_id = ?,
    updated = ?,
    not_found_marked = ?,
    errored = ?,
    updated_at = ?
WHERE sweep = ?
            "#,
        )
        .bind(last_entity_id)
        .bind(count_to_i64(tally.updated))
        .bind(count_to_i64(tally.not_found_marked))
        .bind(count_to_i64(tally.errored))
        .bind(datetime_to_epoch_millis(Utc::now()))
        .bind(sweep)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("backfill sweep {sweep} was not started"));
        }
        Ok(())
    }

    /// Drop the cursor once a sweep has run to completion.
    pub async fn clear_backfill_cursor(&self, sweep: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM backfill_cursors WHERE sweep = ?")
            .bind(sweep)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::StateRuntime;
    use super::test_support::at;
    use super::test_support::unique_temp_dir;
    use crate::BackfillTally;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn backfill_cursor_persists_progress_until_cleared() {
        let home = unique_temp_dir();
        let runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");

        assert_eq!(
            runtime
                .get_backfill_cursor("full")
                .await
                .expect("get missing cursor"),
            None
        );

        let started = runtime
            .start_backfill("full", at(0))
            .await
            .expect("start backfill");
        assert_eq!(started.last_entity_id, None);
        assert_eq!(started.tally, BackfillTally::default());
        assert_eq!(started.started_at, at(0));

        let tally = BackfillTally {
            updated: 3,
            not_found_marked: 1,
            errored: 1,
        };
        runtime
            .checkpoint_backfill("full", "ocid-0005", tally)
            .await
            .expect("checkpoint backfill");

        let resumed = runtime
            .start_backfill("full", at(60))
            .await
            .expect("restart backfill");
        assert_eq!(resumed.last_entity_id, Some("ocid-0005".to_string()));
        assert_eq!(resumed.tally, tally);
        assert_eq!(resumed.started_at, at(0));

        runtime
            .clear_backfill_cursor("full")
            .await
            .expect("clear cursor");
        assert_eq!(
            runtime
                .get_backfill_cursor("full")
                .await
                .expect("get cleared cursor"),
            None
        );

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn checkpoint_requires_started_sweep() {
        let home = unique_temp_dir();
        let runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");

        let err = runtime
            .checkpoint_backfill("never-started", "ocid-1", BackfillTally::default())
            .await
            .expect_err("checkpoint without start");
        assert!(err.to_string().contains("was not started"));

        let _ = tokio::fs::remove_dir_all(home).await;
    }
}
