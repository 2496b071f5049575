//! Tessera scenario runner
//!
//! Drives a full group lifecycle (create, load, exchange, remove, update,
//! delete) between simulated users sharing one in-process cloud.
//!
//! # Usage
//!
//! ```bash
//! tessera --participants 5 --messages 10
//! tessera --data-dir /tmp/tessera --seed 42 --log-level debug
//! ```

mod scenario;

use std::path::{Path, PathBuf};

use clap::Parser;
use tessera_core::{
    GroupConfig, MemoryStorage, ParticipantLimits, RedbStorage, SeededEnv, StorageError, SystemEnv,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::scenario::Settings;

/// Tessera group session scenario runner
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Run an end-to-end encrypted group lifecycle")]
#[command(version)]
struct Args {
    /// Users in the group, initiator included
    #[arg(long, default_value = "3")]
    participants: usize,

    /// Messages the initiator sends to every member
    #[arg(long, default_value = "5")]
    messages: usize,

    /// Tickets retained per group
    #[arg(long, default_value = "50")]
    max_tickets: usize,

    /// Largest allowed group
    #[arg(long, default_value = "50")]
    max_participants: usize,

    /// Directory for per-user Redb files (in-memory storage if omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed for deterministic keys and nonces
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn redb_at(dir: &Path) -> impl Fn(&str) -> Result<RedbStorage, StorageError> + '_ {
    move |name| RedbStorage::open(dir.join(format!("{name}.redb")))
}

fn seeded(seed: u64) -> impl Fn(u64) -> SeededEnv {
    move |user| SeededEnv::new(seed.wrapping_add(user), 0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = GroupConfig {
        max_tickets_in_group: args.max_tickets,
        participant_limits: ParticipantLimits {
            max: args.max_participants,
            ..ParticipantLimits::default()
        },
        ..GroupConfig::default()
    };
    config.validate()?;

    let settings = Settings { participants: args.participants, messages: args.messages, config };
    tracing::info!(
        participants = settings.participants,
        messages = settings.messages,
        persistent = args.data_dir.is_some(),
        seeded = args.seed.is_some(),
        "starting scenario"
    );

    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    let in_memory = |_: &str| Ok::<_, StorageError>(MemoryStorage::new());
    let report = match (&args.data_dir, args.seed) {
        (Some(dir), Some(seed)) => scenario::run(&settings, redb_at(dir), seeded(seed)).await?,
        (Some(dir), None) => scenario::run(&settings, redb_at(dir), |_| SystemEnv::new()).await?,
        (None, Some(seed)) => scenario::run(&settings, in_memory, seeded(seed)).await?,
        (None, None) => scenario::run(&settings, in_memory, |_| SystemEnv::new()).await?,
    };

    tracing::info!(
        epochs = report.epochs,
        delivered = report.delivered,
        removed = ?report.removed,
        "scenario complete"
    );

    Ok(())
}
