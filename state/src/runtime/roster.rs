use super::*;
use crate::PendingResolution;
use crate::ResolutionFailure;
use crate::RosterEntry;
use crate::model::datetime_to_epoch_millis;
use chrono::DateTime;
use chrono::Utc;

impl StateRuntime {
    pub async fn upsert_roster_entry(
        &self,
        display_name: &str,
        world_name: &str,
        guild_label: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO roster_entries (display_name, world_name, guild_label)
VALUES (?, ?, ?)
ON CONFLICT(display_name, world_name) DO UPDATE SET
    guild_label = COALESCE(excluded.guild_label, roster_entries.guild_label)
            "#,
        )
        .bind(display_name)
        .bind(world_name)
        .bind(guild_label)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    pub async fn list_roster(&self, world_name: &str) -> anyhow::Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            r#"
SELECT display_name, world_name, guild_label
FROM roster_entries
WHERE world_name = ?
ORDER BY display_name ASC
            "#,
        )
        .bind(world_name)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(RosterEntry::try_from_row).collect()
    }

    /// Roster names with no entity yet, least recently checked first.
    ///
    /// Names that upstream has reported missing `give_up_after` times are
    /// skipped; transient failures never count toward that.
    pub async fn list_unresolved_roster(
        &self,
        world_name: &str,
        give_up_after: u32,
        limit: usize,
    ) -> anyhow::Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            r#"
SELECT r.display_name, r.world_name, r.guild_label
FROM roster_entries AS r
LEFT JOIN entities AS e
    ON e.display_name = r.display_name AND e.world_name = r.world_name
LEFT JOIN pending_resolutions AS p
    ON p.display_name = r.display_name AND p.world_name = r.world_name
WHERE r.world_name = ?
  AND e.entity_id IS NULL
  AND (p.not_found_count IS NULL OR p.not_found_count < ?)
ORDER BY p.last_checked_at ASC, r.display_name ASC
LIMIT ?
            "#,
        )
        .bind(world_name)
        .bind(i64::from(give_up_after))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(RosterEntry::try_from_row).collect()
    }

    /// Record a failed name resolution and return the updated bookkeeping.
    pub async fn record_resolution_failure(
        &self,
        display_name: &str,
        world_name: &str,
        failure: ResolutionFailure,
        error: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> anyhow::Result<PendingResolution> {
        let increment = i64::from(matches!(failure, ResolutionFailure::NotFound));
        sqlx::query(
            r#"
INSERT INTO pending_resolutions (display_name, world_name, not_found_count, last_reason, last_error, last_checked_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(display_name, world_name) DO UPDATE SET
    not_found_count = pending_resolutions.not_found_count + ?3,
    last_reason = excluded.last_reason,
    last_error = excluded.last_error,
    last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(display_name)
        .bind(world_name)
        .bind(increment)
        .bind(failure.as_str())
        .bind(error)
        .bind(datetime_to_epoch_millis(checked_at))
        .execute(self.pool.as_ref())
        .await?;
        self.get_pending_resolution(display_name, world_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load pending resolution {display_name}"))
    }

    pub async fn get_pending_resolution(
        &self,
        display_name: &str,
        world_name: &str,
    ) -> anyhow::Result<Option<PendingResolution>> {
        let row = sqlx::query(
            r#"
SELECT display_name, world_name, not_found_count, last_reason, last_error, last_checked_at
FROM pending_resolutions
WHERE display_name = ? AND world_name = ?
            "#,
        )
        .bind(display_name)
        .bind(world_name)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| PendingResolution::try_from_row(&row))
            .transpose()
    }

    pub async fn clear_pending_resolution(
        &self,
        display_name: &str,
        world_name: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM pending_resolutions WHERE display_name = ? AND world_name = ?")
            .bind(display_name)
            .bind(world_name)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}
