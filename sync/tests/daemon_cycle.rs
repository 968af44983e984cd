use maple_client::OpenApiClient;
use maple_client::OpenApiConfig;
use maple_client::ReqwestTransport;
use maple_client::TokenBucket;
use maple_state::BackfillScope;
use maple_state::EntityStatus;
use maple_state::StateRuntime;
use maple_sync::BackfillCoordinator;
use maple_sync::Scheduler;
use maple_sync::config::BackfillConfig;
use maple_sync::config::SchedulerConfig;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;

const WORLD: &str = "Challenger";

fn unique_temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("maple-sync-it-{}", uuid::Uuid::new_v4()))
}

fn client(server: &MockServer) -> Arc<OpenApiClient<ReqwestTransport>> {
    Arc::new(
        OpenApiClient::new(
            ReqwestTransport::new(reqwest::Client::new()),
            Arc::new(TokenBucket::new(100, Duration::from_secs(1))),
            OpenApiConfig {
                base_url: format!("{}/v1", server.uri()),
                api_key: "test".to_string(),
                timeout: Duration::from_secs(5),
                stat_min_level: 270,
                rate_limit_penalty: Duration::from_millis(100),
                max_retry_after: Duration::from_secs(600),
            },
        )
        .expect("client"),
    )
}

async fn mount_character(server: &MockServer, name: &str, ocid: &str, level: i64) {
    Mock::given(method("GET"))
        .and(path("/v1/id"))
        .and(query_param("character_name", name))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ocid": ocid })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/character/basic"))
        .and(query_param("ocid", ocid))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "character_name": name,
            "world_name": WORLD,
            "character_gender": "F",
            "character_class": "Bishop",
            "character_level": level,
            "character_guild_name": "Moonlight"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/character/stat"))
        .and(query_param("ocid", ocid))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "final_stat": [{"stat_name": "戰鬥力", "stat_value": "98765"}]
        })))
        .mount(server)
        .await;
}

async fn mount_missing(server: &MockServer, name: &str, ocid: &str) {
    Mock::given(method("GET"))
        .and(path("/v1/id"))
        .and(query_param("character_name", name))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ocid": ocid })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/character/basic"))
        .and(query_param("ocid", ocid))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"name": "OPENAPI00003", "message": "Please input valid id"}
        })))
        .mount(server)
        .await;
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        world: WORLD.to_string(),
        poll_interval: Duration::from_secs(3600),
        min_refresh_interval: Duration::ZERO,
        workers: 2,
        max_per_cycle: None,
        bootstrap_limit: 10,
        eviction_threshold: 5,
    }
}

#[tokio::test]
async fn cycle_resolves_roster_and_stores_snapshots() {
    let server = MockServer::start().await;
    mount_character(&server, "Alpha", "ocid-alpha", 281).await;
    mount_character(&server, "Bravo", "ocid-bravo", 250).await;

    let home = unique_temp_dir();
    let runtime = StateRuntime::init(home.clone())
        .await
        .expect("initialize runtime");
    for name in ["Alpha", "Bravo"] {
        runtime
            .upsert_roster_entry(name, WORLD, Some("Moonlight"))
            .await
            .expect("roster");
    }

    let scheduler = Scheduler::new(Arc::clone(&runtime), client(&server), scheduler_config());
    let report = scheduler.run_cycle(&CancellationToken::new()).await;
    assert_eq!(report.bootstrap.resolved, 2);
    assert_eq!(report.updated, 2);

    let alpha = runtime
        .get_entity("ocid-alpha")
        .await
        .expect("load")
        .expect("alpha");
    assert_eq!(alpha.level.map(|level| level.value), Some(281));
    assert_eq!(alpha.power.map(|power| power.value), Some(98_765));
    assert_eq!(alpha.status, EntityStatus::Active);

    let bravo = runtime
        .get_entity("ocid-bravo")
        .await
        .expect("load")
        .expect("bravo");
    assert_eq!(bravo.power, None, "below the stat level threshold");

    let summary = runtime.entity_summary().await.expect("summary");
    assert_eq!(summary.active, 2);
    assert_eq!(summary.max_power, Some(98_765));

    let _ = tokio::fs::remove_dir_all(home).await;
}

#[tokio::test]
async fn vanished_character_is_evicted_after_five_cycles() {
    let server = MockServer::start().await;
    mount_missing(&server, "Ghost", "ocid-ghost").await;

    let home = unique_temp_dir();
    let runtime = StateRuntime::init(home.clone())
        .await
        .expect("initialize runtime");
    runtime
        .upsert_roster_entry("Ghost", WORLD, None)
        .await
        .expect("roster");

    let scheduler = Scheduler::new(Arc::clone(&runtime), client(&server), scheduler_config());
    let cancel = CancellationToken::new();
    let mut evicted = 0;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        evicted += scheduler.run_cycle(&cancel).await.evicted;
    }
    assert_eq!(evicted, 1);

    let ghost = runtime
        .get_entity("ocid-ghost")
        .await
        .expect("load")
        .expect("ghost");
    assert_eq!(ghost.status, EntityStatus::Evicted);
    assert_eq!(ghost.consecutive_miss_count, 5);

    let _ = tokio::fs::remove_dir_all(home).await;
}

#[tokio::test]
async fn backfill_fills_incomplete_profiles() {
    let server = MockServer::start().await;
    mount_character(&server, "Alpha", "ocid-alpha", 275).await;
    mount_missing(&server, "Ghost", "ocid-ghost").await;

    let home = unique_temp_dir();
    let runtime = StateRuntime::init(home.clone())
        .await
        .expect("initialize runtime");
    let now = chrono::Utc::now();
    runtime
        .create_entity("Alpha", WORLD, "ocid-alpha", now)
        .await
        .expect("alpha");
    runtime
        .create_entity("Ghost", WORLD, "ocid-ghost", now)
        .await
        .expect("ghost");

    let coordinator = BackfillCoordinator::new(
        Arc::clone(&runtime),
        client(&server),
        BackfillConfig {
            sweep: "incomplete".to_string(),
            batch_size: 1,
            workers: 1,
            eviction_threshold: 5,
            scope: BackfillScope {
                only_incomplete: true,
                ..BackfillScope::default()
            },
            store_retry: Duration::from_millis(20),
        },
    );
    let summary = coordinator
        .run(&CancellationToken::new())
        .await
        .expect("backfill");
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.not_found_marked, 1);
    assert!(summary.completed);

    let alpha = runtime
        .get_entity("ocid-alpha")
        .await
        .expect("load")
        .expect("alpha");
    assert_eq!(alpha.is_incomplete(), false);

    let _ = tokio::fs::remove_dir_all(home).await;
}
