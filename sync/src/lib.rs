//! Synchronization engine: polls the Open API for tracked characters and
//! reconciles the results into the local store.

pub mod backfill;
pub mod bootstrap;
mod cli;
pub mod config;
mod fetch_pool;
pub mod reconcile;
pub mod scheduler;
#[cfg(test)]
mod test_support;

pub use backfill::BackfillCoordinator;
pub use backfill::BackfillSummary;
pub use cli::BackfillArgs;
pub use cli::Cli;
pub use cli::Command;
pub use cli::RosterCommand;
pub use config::ConfigError;
pub use config::SyncConfig;
pub use config::SyncConfigToml;
pub use scheduler::CycleReport;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerPhase;

use maple_client::OpenApiClient;
use maple_client::OpenApiConfig;
use maple_client::ReqwestTransport;
use maple_client::TokenBucket;
use maple_state::StateRuntime;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = "info";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    let mut config = SyncConfig::load(cli.config.as_deref())?;
    let runtime =
        StateRuntime::init_with_busy_timeout(config.home.clone(), config.busy_timeout).await?;

    match cli.command {
        Command::Daemon => {
            let source = open_api_client(&config)?;
            let cancel = shutdown_token();
            let scheduler = Scheduler::new(Arc::clone(&runtime), source, config.scheduler);
            scheduler.run(cancel).await;
        }
        Command::Backfill(args) => {
            apply_backfill_args(&mut config, args, &runtime).await?;
            let source = open_api_client(&config)?;
            let cancel = shutdown_token();
            let coordinator = BackfillCoordinator::new(Arc::clone(&runtime), source, config.backfill);
            let summary = coordinator.run(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Roster(RosterCommand::Add { name, guild }) => {
            runtime
                .upsert_roster_entry(name.trim(), &config.scheduler.world, guild.as_deref())
                .await?;
            info!(name = %name.trim(), world = %config.scheduler.world, "roster entry saved");
        }
        Command::Status => {
            let entities = runtime.entity_summary().await?;
            let backfill = runtime.get_backfill_cursor(&config.backfill.sweep).await?;
            let status = serde_json::json!({
                "world": config.scheduler.world,
                "entities": entities,
                "backfill": backfill,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    runtime.close().await;
    Ok(())
}

fn open_api_client(config: &SyncConfig) -> anyhow::Result<Arc<OpenApiClient<ReqwestTransport>>> {
    let bucket = Arc::new(TokenBucket::new(
        config.rate_limit.requests,
        config.rate_limit.per,
    ));
    let client = OpenApiClient::new(
        ReqwestTransport::new(reqwest::Client::new()),
        bucket,
        OpenApiConfig {
            base_url: config.api.base_url.clone(),
            api_key: config.api_key()?,
            timeout: config.api.timeout,
            stat_min_level: config.api.stat_min_level,
            rate_limit_penalty: config.rate_limit.penalty,
            max_retry_after: config.rate_limit.max_retry_after,
        },
    )?;
    Ok(Arc::new(client))
}

async fn apply_backfill_args(
    config: &mut SyncConfig,
    args: BackfillArgs,
    runtime: &StateRuntime,
) -> anyhow::Result<()> {
    let backfill = &mut config.backfill;
    if let Some(sweep) = args.sweep {
        backfill.sweep = sweep;
    }
    if args.from_entity.is_some() {
        backfill.scope.from_entity = args.from_entity;
    }
    if args.to_entity.is_some() {
        backfill.scope.to_entity = args.to_entity;
    }
    if let Some(seen_before) = args.seen_before.as_deref() {
        backfill.scope.seen_before = Some(config::parse_seen_before(seen_before)?);
    }
    if args.only_incomplete {
        backfill.scope.only_incomplete = true;
    }
    if args.restart {
        runtime.clear_backfill_cursor(&backfill.sweep).await?;
        info!(sweep = %backfill.sweep, "backfill cursor reset");
    }
    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested, finishing in-flight work");
                signal.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
    });
    cancel
}
