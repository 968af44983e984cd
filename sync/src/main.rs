//! Entry-point for the `maple-sync` binary.
use clap::Parser;
use maple_sync::Cli;
use maple_sync::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_main(Cli::parse()).await
}
