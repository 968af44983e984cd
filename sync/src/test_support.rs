use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use maple_client::CharacterSnapshot;
use maple_client::CharacterSource;
use maple_client::FetchAttempt;
use maple_client::ResolveAttempt;
use maple_state::EntityRecord;
use maple_state::EntityStatus;
use maple_state::StateRuntime;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
}

pub(crate) fn entity(entity_id: &str, status: EntityStatus, misses: u32) -> EntityRecord {
    EntityRecord {
        entity_id: entity_id.to_string(),
        display_name: format!("name-{entity_id}"),
        world_name: "Challenger".to_string(),
        guild_name: None,
        level: None,
        power: None,
        class_name: None,
        gender: None,
        consecutive_miss_count: misses,
        status,
        last_seen_at: None,
        last_attempted_at: None,
        last_miss_at: None,
        created_at: at(0),
    }
}

pub(crate) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!("maple-sync-test-{nanos}-{}", Uuid::new_v4()))
}

/// Fresh store seeded with entities created at `at(0)`.
pub(crate) async fn runtime_with(ids: &[&str]) -> (PathBuf, Arc<StateRuntime>) {
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

pub(crate) fn snapshot(level: i64) -> CharacterSnapshot {
    CharacterSnapshot {
        level: Some(level),
        class_name: Some("Hero".to_string()),
        gender: Some("M".to_string()),
        ..CharacterSnapshot::default()
    }
}

/// In-memory [`CharacterSource`] with per-entity scripted outcomes.
///
/// Entities without a script succeed. Cancellation is checked before the
/// simulated request, the way the real client checks it at the token wait.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    fetches: Mutex<HashMap<String, VecDeque<FetchAttempt>>>,
    resolves: Mutex<HashMap<String, ResolveAttempt>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn script(&self, entity_id: &str, attempts: Vec<FetchAttempt>) {
        self.fetches
            .lock()
            .expect("fetch script lock")
            .insert(entity_id.to_string(), attempts.into());
    }

    pub(crate) fn script_resolve(&self, display_name: &str, attempt: ResolveAttempt) {
        self.resolves
            .lock()
            .expect("resolve script lock")
            .insert(display_name.to_string(), attempt);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CharacterSource for ScriptedSource {
    async fn fetch(&self, entity_id: &str, cancel: &CancellationToken) -> Option<FetchAttempt> {
        if cancel.is_cancelled() {
            return None;
        }
        self.calls
            .lock()
            .expect("calls lock")
            .push(entity_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self
            .fetches
            .lock()
            .expect("fetch script lock")
            .get_mut(entity_id)
            .and_then(VecDeque::pop_front);
        Some(scripted.unwrap_or_else(|| FetchAttempt::Success(snapshot(275))))
    }

    async fn resolve(
        &self,
        display_name: &str,
        cancel: &CancellationToken,
    ) -> Option<ResolveAttempt> {
        if cancel.is_cancelled() {
            return None;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self
            .resolves
            .lock()
            .expect("resolve script lock")
            .get(display_name)
            .cloned();
        Some(scripted.unwrap_or_else(|| ResolveAttempt::Resolved(format!("ocid-{display_name}"))))
    }
}
