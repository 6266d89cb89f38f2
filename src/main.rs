//! ctmirror command line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, warn};

use ctmirror::archive::Archive;
use ctmirror::config::{Config, KnownLogs, LogDescriptor};
use ctmirror::packager::Packager;
use ctmirror::sync::SyncController;
use ctmirror::Error;

#[derive(Parser)]
#[command(
    name = "ctmirror",
    version,
    about = "Mirror Certificate Transparency logs into sharded archives republished as BitTorrent swarms."
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Log identifier from the known-logs list (scheme-less URL or
    /// description). All known logs when omitted.
    #[arg(short = 'u', long = "log")]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Extend the local mirror to the log's newest tree head (default).
    Sync,
    /// Regenerate torrents, magnet links and the RSS feed from existing
    /// shard manifests, without touching trust state.
    RebuildTorrents,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = Config::load(&cli.config)?;
    let known = KnownLogs::load(&config.known_logs)?;
    let logs: Vec<LogDescriptor> = match &cli.log {
        Some(identifier) => {
            let log = known.find(identifier).ok_or_else(|| {
                Error::Config(format!(
                    "log {} not found in {}",
                    identifier,
                    config.known_logs.display()
                ))
            })?;
            vec![log.descriptor()?]
        }
        None => known
            .logs
            .iter()
            .map(|log| log.descriptor())
            .collect::<Result<_, _>>()?,
    };
    let packager = Packager::new(&config);
    let command = cli.command.unwrap_or(Command::Sync);

    for log in logs {
        let archive = Archive::open(&config.archive_root, &log.name)?;
        match command {
            Command::Sync => {
                let mut controller = SyncController::new(&log, archive, &config)?;
                let outcome = controller.run_once().await?;
                if !outcome.sealed.is_empty() {
                    // The archive is already committed; a packaging failure
                    // is reported but does not fail the run.
                    if let Err(e) =
                        packager.package_all(&log.name, &controller.shards_dir(), &outcome.sealed)
                    {
                        warn!("packaging failed for {}: {}", log.name, e);
                    }
                }
            }
            Command::RebuildTorrents => {
                let manifests = archive.sealed_manifests()?;
                packager.package_all(&log.name, &archive.shards_dir(), &manifests)?;
            }
        }
    }
    Ok(())
}
