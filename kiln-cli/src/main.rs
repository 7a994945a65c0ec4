//! `kiln` command-line entry point.
//!
//! Offline maintenance of a cache directory: list stored keys, inspect a
//! record, or purge everything. Do not purge a directory that a running
//! cache instance is writing to; use the engine's own purge for that.

mod commands;
mod error;
mod telemetry;

use commands::Command;
use error::CliResult;
use kiln_core::CacheSettings;

async fn run() -> CliResult<()> {
    let invocation = commands::parse_args(std::env::args().skip(1))?;
    let mut stdout = std::io::stdout().lock();
    if invocation.command == Command::Help {
        return commands::run(&Command::Help, std::path::Path::new(""), &mut stdout).await;
    }

    telemetry::init()?;
    let env_dir = CacheSettings::from_env().cache_dir;
    let cache_dir = commands::resolve_cache_dir(&invocation, env_dir)?;
    tracing::debug!(cache_dir = %cache_dir.display(), command = ?invocation.command, "Running command");
    commands::run(&invocation.command, &cache_dir, &mut stdout).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("kiln: {}", e);
        std::process::exit(e.exit_code());
    }
}
