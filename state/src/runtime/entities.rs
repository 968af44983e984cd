use super::*;
use crate::BackfillScope;
use crate::EntityRecord;
use crate::EntityStatus;
use crate::EntitySummary;
use crate::MissOutcome;
use crate::Observed;
use crate::SnapshotAttributes;
use crate::model::datetime_to_epoch_millis;
use crate::model::epoch_millis_to_datetime;
use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;

const ENTITY_COLUMNS: &str = r#"
    entity_id,
    display_name,
    world_name,
    guild_name,
    guild_name_observed_at,
    level,
    level_observed_at,
    power,
    power_observed_at,
    class_name,
    class_name_observed_at,
    gender,
    gender_observed_at,
    consecutive_miss_count,
    status,
    last_seen_at,
    last_attempted_at,
    last_miss_at,
    created_at
"#;

impl StateRuntime {
    /// Insert an entity on first resolution of its display name.
    ///
    /// An id that already exists only has its display name and world refreshed;
    /// liveness and attributes are left alone.
    pub async fn create_entity(
        &self,
        display_name: &str,
        world_name: &str,
        entity_id: &str,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<EntityRecord> {
        sqlx::query(
            r#"
INSERT INTO entities (entity_id, display_name, world_name, consecutive_miss_count, status, created_at)
VALUES (?, ?, ?, 0, ?, ?)
ON CONFLICT(entity_id) DO UPDATE SET
    display_name = excluded.display_name,
    world_name = excluded.world_name
            "#,
        )
        .bind(entity_id)
        .bind(display_name)
        .bind(world_name)
        .bind(EntityStatus::Active.as_str())
        .bind(datetime_to_epoch_millis(created_at))
        .execute(self.pool.as_ref())
        .await?;
        self.get_entity(entity_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created entity {entity_id}"))
    }

    pub async fn get_entity(&self, entity_id: &str) -> anyhow::Result<Option<EntityRecord>> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = ?");
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.map(|row| EntityRecord::try_from_row(&row)).transpose()
    }

    pub async fn get_entity_stats(
        &self,
        entity_id: &str,
    ) -> anyhow::Result<BTreeMap<String, Observed<f64>>> {
        let rows = sqlx::query(
            r#"
SELECT stat_name, stat_value, observed_at
FROM entity_stats
WHERE entity_id = ?
ORDER BY stat_name ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        let mut stats = BTreeMap::new();
        for row in rows {
            stats.insert(
                row.try_get("stat_name")?,
                Observed {
                    value: row.try_get("stat_value")?,
                    observed_at: epoch_millis_to_datetime(row.try_get("observed_at")?)?,
                },
            );
        }
        Ok(stats)
    }

    /// Best power per day, oldest day first.
    pub async fn power_history(&self, entity_id: &str) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
SELECT day, best_power
FROM power_history
WHERE entity_id = ?
ORDER BY day ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter()
            .map(|row| -> anyhow::Result<(String, i64)> {
                Ok((row.try_get("day")?, row.try_get("best_power")?))
            })
            .collect()
    }

    /// Merge observed attributes into the entity.
    ///
    /// Each field is replaced only when `observed_at` is strictly newer than
    /// the stamp already stored for that field, so writers may arrive in any
    /// order.
    pub async fn upsert_snapshot(
        &self,
        entity_id: &str,
        attributes: &SnapshotAttributes,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_snapshot_in(&mut tx, entity_id, attributes, observed_at).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Reset the miss streak after a successful contact.
    pub async fn mark_hit(&self, entity_id: &str, seen_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        mark_hit_in(&mut conn, entity_id, seen_at).await
    }

    /// Apply a successful fetch: snapshot merge and miss reset, atomically.
    pub async fn record_success(
        &self,
        entity_id: &str,
        attributes: &SnapshotAttributes,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_snapshot_in(&mut tx, entity_id, attributes, observed_at).await?;
        mark_hit_in(&mut tx, entity_id, observed_at).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Count one not-found outcome and evict once the streak reaches
    /// `threshold`.
    ///
    /// Single read-modify-write statement. A miss no newer than the last
    /// counted miss or the last contact is ignored, which makes replays of
    /// the same attempt harmless.
    pub async fn mark_miss(
        &self,
        entity_id: &str,
        attempted_at: DateTime<Utc>,
        threshold: u32,
    ) -> anyhow::Result<MissOutcome> {
        let attempted_at = datetime_to_epoch_millis(attempted_at);
        let row = sqlx::query(
            r#"
UPDATE entities
SET
    consecutive_miss_count = consecutive_miss_count + 1,
    status = CASE WHEN consecutive_miss_count + 1 >= ?1 THEN ?2 ELSE ?3 END,
    last_miss_at = ?4,
    last_attempted_at = MAX(COALESCE(last_attempted_at, ?4), ?4)
WHERE entity_id = ?5
  AND status != ?2
  AND (last_miss_at IS NULL OR last_miss_at < ?4)
  AND (last_seen_at IS NULL OR last_seen_at < ?4)
RETURNING consecutive_miss_count, status
            "#,
        )
        .bind(i64::from(threshold.max(1)))
        .bind(EntityStatus::Evicted.as_str())
        .bind(EntityStatus::Stale.as_str())
        .bind(attempted_at)
        .bind(entity_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        if let Some(row) = row {
            let count: i64 = row.try_get("consecutive_miss_count")?;
            let status: String = row.try_get("status")?;
            return Ok(MissOutcome {
                consecutive_miss_count: u32::try_from(count)
                    .map_err(|_| anyhow::anyhow!("invalid miss count: {count}"))?,
                status: EntityStatus::parse(status.as_str())?,
                counted: true,
            });
        }

        let current = self
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown entity {entity_id}"))?;
        Ok(MissOutcome {
            consecutive_miss_count: current.consecutive_miss_count,
            status: current.status,
            counted: false,
        })
    }

    /// Advance `last_attempted_at` without touching the miss streak.
    pub async fn mark_attempted(
        &self,
        entity_id: &str,
        attempted_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let attempted_at = datetime_to_epoch_millis(attempted_at);
        sqlx::query(
            r#"
UPDATE entities
SET last_attempted_at = MAX(COALESCE(last_attempted_at, ?1), ?1)
WHERE entity_id = ?2
            "#,
        )
        .bind(attempted_at)
        .bind(entity_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Non-evicted entities not attempted within `min_interval`, oldest first.
    ///
    /// Never-attempted entities sort ahead of everything else, so no entity is
    /// starved while others keep getting refreshed.
    pub async fn due_for_refresh(
        &self,
        now: DateTime<Utc>,
        min_interval: Duration,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<EntityRecord>> {
        let interval_ms = i64::try_from(min_interval.as_millis()).unwrap_or(i64::MAX);
        let cutoff = datetime_to_epoch_millis(now).saturating_sub(interval_ms);
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {ENTITY_COLUMNS} FROM entities"));
        builder
            .push(" WHERE status != ")
            .push_bind(EntityStatus::Evicted.as_str());
        builder
            .push(" AND (last_attempted_at IS NULL OR last_attempted_at <= ")
            .push_bind(cutoff)
            .push(")");
        builder.push(" ORDER BY last_attempted_at ASC, entity_id ASC");
        push_limit(&mut builder, limit);
        let rows = builder.build().fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(EntityRecord::try_from_row).collect()
    }

    /// Next page of a backfill sweep, keyset-paginated on `entity_id`.
    pub async fn list_backfill_batch(
        &self,
        after: Option<&str>,
        scope: &BackfillScope,
        limit: usize,
    ) -> anyhow::Result<Vec<EntityRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {ENTITY_COLUMNS} FROM entities"));
        builder
            .push(" WHERE status != ")
            .push_bind(EntityStatus::Evicted.as_str());
        if let Some(after) = after {
            builder.push(" AND entity_id > ").push_bind(after);
        }
        if let Some(from_entity) = scope.from_entity.as_deref() {
            builder.push(" AND entity_id >= ").push_bind(from_entity);
        }
        if let Some(to_entity) = scope.to_entity.as_deref() {
            builder.push(" AND entity_id <= ").push_bind(to_entity);
        }
        if let Some(seen_before) = scope.seen_before {
            builder
                .push(" AND (last_seen_at IS NULL OR last_seen_at < ")
                .push_bind(datetime_to_epoch_millis(seen_before))
                .push(")");
        }
        if scope.only_incomplete {
            builder.push(" AND (class_name IS NULL OR gender IS NULL OR level IS NULL)");
        }
        builder.push(" ORDER BY entity_id ASC");
        push_limit(&mut builder, Some(limit));
        let rows = builder.build().fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(EntityRecord::try_from_row).collect()
    }

    /// Status counts plus aggregates over non-evicted entities.
    pub async fn entity_summary(&self) -> anyhow::Result<EntitySummary> {
        let mut summary = EntitySummary::default();
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM entities GROUP BY status")
            .fetch_all(self.pool.as_ref())
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let total = u64::try_from(row.try_get::<i64, _>("total")?).unwrap_or(0);
            match EntityStatus::parse(status.as_str())? {
                EntityStatus::Active => summary.active = total,
                EntityStatus::Stale => summary.stale = total,
                EntityStatus::Evicted => summary.evicted = total,
            }
        }

        let row = sqlx::query(
            r#"
SELECT AVG(level) AS average_level, MAX(power) AS max_power
FROM entities
WHERE status != ?
            "#,
        )
        .bind(EntityStatus::Evicted.as_str())
        .fetch_one(self.pool.as_ref())
        .await?;
        summary.average_level = row.try_get("average_level")?;
        summary.max_power = row.try_get("max_power")?;

        let rows = sqlx::query(
            r#"
SELECT class_name, COUNT(*) AS total
FROM entities
WHERE status != ? AND class_name IS NOT NULL
GROUP BY class_name
ORDER BY total DESC, class_name ASC
            "#,
        )
        .bind(EntityStatus::Evicted.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;
        for row in rows {
            let total = u64::try_from(row.try_get::<i64, _>("total")?).unwrap_or_default();
            summary.classes.push((row.try_get("class_name")?, total));
        }
        Ok(summary)
    }
}

fn push_limit(builder: &mut QueryBuilder<'_, Sqlite>, limit: Option<usize>) {
    let limit = limit
        .and_then(|limit| i64::try_from(limit).ok())
        .unwrap_or(-1);
    builder.push(" LIMIT ").push_bind(limit);
}

/// `SET` clauses that replace `column` only when `?{value}` is non-null and
/// `?{stamp}` is newer than the stored stamp. SQLite evaluates every right
/// hand side against the pre-update row, so both clauses see the old stamp.
fn last_write_wins(column: &str, value: usize, stamp: usize) -> String {
    let newer = format!(
        "?{value} IS NOT NULL AND ({column}_observed_at IS NULL OR {column}_observed_at < ?{stamp})"
    );
    format!(
        "{column} = CASE WHEN {newer} THEN ?{value} ELSE {column} END, \
         {column}_observed_at = CASE WHEN {newer} THEN ?{stamp} ELSE {column}_observed_at END"
    )
}

async fn upsert_snapshot_in(
    conn: &mut SqliteConnection,
    entity_id: &str,
    attributes: &SnapshotAttributes,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let stamp = datetime_to_epoch_millis(observed_at);
    let assignments = [
        last_write_wins("guild_name", 1, 6),
        last_write_wins("level", 2, 6),
        last_write_wins("power", 3, 6),
        last_write_wins("class_name", 4, 6),
        last_write_wins("gender", 5, 6),
    ]
    .join(", ");
    let sql = format!("UPDATE entities SET {assignments} WHERE entity_id = ?7");
    let result = sqlx::query(&sql)
        .bind(attributes.guild_name.as_deref())
        .bind(attributes.level)
        .bind(attributes.power)
        .bind(attributes.class_name.as_deref())
        .bind(attributes.gender.as_deref())
        .bind(stamp)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(anyhow::anyhow!("unknown entity {entity_id}"));
    }

    for (stat_name, stat_value) in &attributes.stats {
        sqlx::query(
            r#"
INSERT INTO entity_stats (entity_id, stat_name, stat_value, observed_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(entity_id, stat_name) DO UPDATE SET
    stat_value = excluded.stat_value,
    observed_at = excluded.observed_at
WHERE excluded.observed_at > entity_stats.observed_at
            "#,
        )
        .bind(entity_id)
        .bind(stat_name.as_str())
        .bind(*stat_value)
        .bind(stamp)
        .execute(&mut *conn)
        .await?;
    }

    if let Some(power) = attributes.power {
        sqlx::query(
            r#"
INSERT INTO power_history (entity_id, day, best_power)
VALUES (?, ?, ?)
ON CONFLICT(entity_id, day) DO UPDATE SET
    best_power = MAX(power_history.best_power, excluded.best_power)
            "#,
        )
        .bind(entity_id)
        .bind(observed_at.date_naive().to_string())
        .bind(power)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn mark_hit_in(
    conn: &mut SqliteConnection,
    entity_id: &str,
    seen_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let seen_at = datetime_to_epoch_millis(seen_at);
    sqlx::query(
        r#"
UPDATE entities
SET
    consecutive_miss_count = CASE
        WHEN last_miss_at IS NULL OR last_miss_at < ?1 THEN 0
        ELSE consecutive_miss_count
    END,
    status = CASE
        WHEN last_miss_at IS NULL OR last_miss_at < ?1 THEN ?2
        ELSE status
    END,
    last_seen_at = MAX(COALESCE(last_seen_at, ?1), ?1),
    last_attempted_at = MAX(COALESCE(last_attempted_at, ?1), ?1)
WHERE entity_id = ?3
  AND status != ?4
        "#,
    )
    .bind(seen_at)
    .bind(EntityStatus::Active.as_str())
    .bind(entity_id)
    .bind(EntityStatus::Evicted.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::StateRuntime;
    use super::test_support::at;
    use super::test_support::unique_temp_dir;
    use crate::BackfillScope;
    use crate::EntityStatus;
    use crate::SnapshotAttributes;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    async fn runtime_with(ids: &[&str]) -> (std::path::PathBuf, Arc<StateRuntime>) {
        let home = unique_temp_dir();
        let runtime = StateRuntime::init(home.clone())
            .await
            .expect("initialize runtime");
        for id in ids {
            runtime
                .create_entity(&format!("name-{id}"), "Challenger", id, at(0))
                .await
                .expect("create entity");
        }
        (home, runtime)
    }

    fn snapshot(level: i64, power: i64, guild: &str) -> SnapshotAttributes {
        SnapshotAttributes {
            guild_name: Some(guild.to_string()),
            level: Some(level),
            power: Some(power),
            class_name: Some("Hero".to_string()),
            gender: Some("M".to_string()),
            stats: BTreeMap::from([("STR".to_string(), level as f64 * 10.0)]),
        }
    }

    #[tokio::test]
    async fn older_snapshot_never_overwrites_newer_fields() {
        let (home, runtime) = runtime_with(&["e1"]).await;

        runtime
            .upsert_snapshot("e1", &snapshot(275, 9_000, "Later"), at(20))
            .await
            .expect("apply t2");
        runtime
            .upsert_snapshot("e1", &snapshot(270, 8_000, "Earlier"), at(10))
            .await
            .expect("apply t1");

        let record = runtime.get_entity("e1").await.expect("load").expect("row");
        assert_eq!(record.level.map(|level| level.value), Some(275));
        assert_eq!(record.power.map(|power| power.value), Some(9_000));
        assert_eq!(
            record.guild_name.map(|guild| (guild.value, guild.observed_at)),
            Some(("Later".to_string(), at(20)))
        );
        let stats = runtime.get_entity_stats("e1").await.expect("stats");
        assert_eq!(stats.get("STR").map(|stat| stat.value), Some(2_750.0));

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn partial_snapshot_keeps_unreported_fields() {
        let (home, runtime) = runtime_with(&["e1"]).await;
        runtime
            .upsert_snapshot("e1", &snapshot(260, 5_000, "Guild"), at(10))
            .await
            .expect("full snapshot");
        runtime
            .upsert_snapshot(
                "e1",
                &SnapshotAttributes {
                    level: Some(261),
                    ..SnapshotAttributes::default()
                },
                at(20),
            )
            .await
            .expect("level only");

        let record = runtime.get_entity("e1").await.expect("load").expect("row");
        assert_eq!(record.level.map(|level| level.value), Some(261));
        assert_eq!(record.power.map(|power| power.observed_at), Some(at(10)));
        assert_eq!(record.class_name.map(|class| class.value), Some("Hero".to_string()));

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn power_history_keeps_best_of_day() {
        let (home, runtime) = runtime_with(&["e1"]).await;
        runtime
            .upsert_snapshot("e1", &snapshot(270, 9_000, "G"), at(10))
            .await
            .expect("first");
        runtime
            .upsert_snapshot("e1", &snapshot(270, 8_500, "G"), at(20))
            .await
            .expect("second");

        let history = runtime.power_history("e1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].1, 9_000);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn upsert_for_unknown_entity_fails() {
        let (home, runtime) = runtime_with(&[]).await;
        let err = runtime
            .upsert_snapshot("missing", &snapshot(1, 1, "G"), at(1))
            .await
            .expect_err("unknown entity");
        assert!(err.to_string().contains("unknown entity"));
        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn fifth_consecutive_miss_evicts() {
        let (home, runtime) = runtime_with(&["e1"]).await;
        for secs in 1..=4 {
            let outcome = runtime
                .mark_miss("e1", at(secs), 5)
                .await
                .expect("mark miss");
            assert_eq!(outcome.status, EntityStatus::Stale);
        }
        let record = runtime.get_entity("e1").await.expect("load").expect("row");
        assert_eq!(record.consecutive_miss_count, 4);
        assert_eq!(record.status, EntityStatus::Stale);

        let outcome = runtime.mark_miss("e1", at(5), 5).await.expect("fifth");
        assert_eq!(outcome.consecutive_miss_count, 5);
        assert_eq!(outcome.status, EntityStatus::Evicted);
        assert!(outcome.counted);

        let after = runtime.mark_miss("e1", at(6), 5).await.expect("sixth");
        assert_eq!(after.consecutive_miss_count, 5);
        assert!(!after.counted);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn replayed_miss_is_counted_once() {
        let (home, runtime) = runtime_with(&["e1"]).await;
        let first = runtime.mark_miss("e1", at(1), 5).await.expect("first");
        let replay = runtime.mark_miss("e1", at(1), 5).await.expect("replay");
        assert_eq!(first.consecutive_miss_count, 1);
        assert_eq!(replay.consecutive_miss_count, 1);
        assert!(!replay.counted);
        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn hit_resets_streak_but_not_eviction() {
        let (home, runtime) = runtime_with(&["e1", "e2"]).await;
        for secs in 1..=3 {
            runtime.mark_miss("e1", at(secs), 5).await.expect("miss");
        }
        runtime.mark_hit("e1", at(10)).await.expect("hit");
        let record = runtime.get_entity("e1").await.expect("load").expect("row");
        assert_eq!(record.consecutive_miss_count, 0);
        assert_eq!(record.status, EntityStatus::Active);
        assert_eq!(record.last_seen_at, Some(at(10)));

        for secs in 1..=5 {
            runtime.mark_miss("e2", at(secs), 5).await.expect("miss");
        }
        runtime.mark_hit("e2", at(10)).await.expect("hit");
        let evicted = runtime.get_entity("e2").await.expect("load").expect("row");
        assert_eq!(evicted.status, EntityStatus::Evicted);
        assert_eq!(evicted.consecutive_miss_count, 5);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn due_for_refresh_orders_by_staleness_and_skips_evicted() {
        let (home, runtime) = runtime_with(&["a", "b", "c", "d"]).await;
        runtime.mark_attempted("a", at(30)).await.expect("a");
        runtime.mark_attempted("b", at(10)).await.expect("b");
        for secs in 1..=5 {
            runtime.mark_miss("c", at(secs), 5).await.expect("evict c");
        }

        let due = runtime
            .due_for_refresh(at(100), Duration::from_secs(60), None)
            .await
            .expect("due");
        let ids: Vec<_> = due.iter().map(|record| record.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b", "a"]);

        let recent = runtime
            .due_for_refresh(at(100), Duration::from_secs(80), Some(5))
            .await
            .expect("due");
        let ids: Vec<_> = recent.iter().map(|record| record.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b"]);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn backfill_batches_follow_keyset_and_scope() {
        let (home, runtime) = runtime_with(&["a", "b", "c", "d", "e"]).await;
        runtime
            .record_success("b", &snapshot(250, 1, "G"), at(5))
            .await
            .expect("complete b");

        let scope = BackfillScope {
            from_entity: Some("b".to_string()),
            to_entity: Some("e".to_string()),
            only_incomplete: true,
            ..BackfillScope::default()
        };
        let first = runtime
            .list_backfill_batch(None, &scope, 2)
            .await
            .expect("first page");
        let ids: Vec<_> = first.iter().map(|record| record.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let second = runtime
            .list_backfill_batch(Some("d"), &scope, 2)
            .await
            .expect("second page");
        let ids: Vec<_> = second.iter().map(|record| record.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["e"]);

        let _ = tokio::fs::remove_dir_all(home).await;
    }

    #[tokio::test]
    async fn summary_excludes_evicted_entities() {
        let (home, runtime) = runtime_with(&["a", "b"]).await;
        runtime
            .record_success("a", &snapshot(200, 100, "G"), at(1))
            .await
            .expect("a");
        runtime
            .record_success("b", &snapshot(280, 900, "G"), at(1))
            .await
            .expect("b");
        for secs in 2..=6 {
            runtime.mark_miss("b", at(secs), 5).await.expect("miss");
        }

        let summary = runtime.entity_summary().await.expect("summary");
        assert_eq!(summary.active, 1);
        assert_eq!(summary.evicted, 1);
        assert_eq!(summary.average_level, Some(200.0));
        assert_eq!(summary.max_power, Some(100));
        assert_eq!(summary.classes, vec![("Hero".to_string(), 1)]);

        let _ = tokio::fs::remove_dir_all(home).await;
    }
}
