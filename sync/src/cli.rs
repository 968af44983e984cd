use clap::Args;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a local character database in sync with the Open API.")]
pub struct Cli {
    /// Path to `maple-sync.toml`. Defaults to `$MAPLE_SYNC_HOME/maple-sync.toml`.
    #[arg(long = "config", short = 'c', value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Poll the roster and due entities until interrupted.
    Daemon,

    /// Run (or resume) one backfill sweep.
    Backfill(BackfillArgs),

    /// Manage the tracked roster.
    #[command(subcommand)]
    Roster(RosterCommand),

    /// Print entity counts and backfill progress as JSON.
    Status,
}

#[derive(Args, Debug, Default)]
pub struct BackfillArgs {
    /// Cursor name; sweeps with different names progress independently.
    #[arg(long)]
    pub sweep: Option<String>,

    /// Lowest entity id to visit (inclusive).
    #[arg(long = "from", value_name = "ENTITY_ID")]
    pub from_entity: Option<String>,

    /// Highest entity id to visit (inclusive).
    #[arg(long = "to", value_name = "ENTITY_ID")]
    pub to_entity: Option<String>,

    /// Only entities not seen since this RFC 3339 timestamp.
    #[arg(long = "seen-before", value_name = "TIMESTAMP")]
    pub seen_before: Option<String>,

    /// Only entities missing class, gender or level.
    #[arg(long = "only-incomplete", default_value_t = false)]
    pub only_incomplete: bool,

    /// Drop any stored cursor and start from the beginning.
    #[arg(long = "restart", default_value_t = false)]
    pub restart: bool,
}

#[derive(Debug, clap::Subcommand)]
pub enum RosterCommand {
    /// Add (or relabel) a character name in the configured world.
    Add {
        name: String,

        #[arg(long)]
        guild: Option<String>,
    },
}
