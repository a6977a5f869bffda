//! pgcdc - change-data-capture follower for PostgreSQL
//!
//! Streams decoded WAL from a logical replication slot into durable JSON
//! files, transforms them to prepared-statement SQL, and applies that SQL to
//! a target database, coordinating stop/resume through a shared sentinel.
//! Interface-compatible with pgcopydb's follow mode.

mod archive;
mod buffer;
mod catalog;
mod config;
mod errors;
mod hash;
mod jsonfile;
mod lsn;
mod protocol;
mod queue;
mod sentinel;
mod stream;
mod types;
mod utils;

use crate::catalog::GeneratedColumnCache;
use crate::config::CdcConfig;
use crate::errors::CdcResult;
use crate::lsn::Lsn;
use crate::sentinel::SentinelStore;
use crate::stream::apply::SqlApplier;
use crate::stream::follow::{FollowMode, FollowSupervisor, install_signal_handlers};
use crate::stream::receive::StreamReceiver;
use crate::stream::transform;
use crate::utils::{ConnKind, PgConnection};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "pgcdc",
    about = "Change-data-capture follower for PostgreSQL",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow changes continuously: prefetch and replay with mode switching
    Follow {
        /// Stop once the applier reaches this LSN
        #[arg(long)]
        endpos: Option<String>,
    },
    /// Operate one stage of the stream pipeline
    #[command(subcommand)]
    Stream(StreamCommand),
    /// Work with pg_restore archive listings
    #[command(subcommand)]
    Restore(RestoreCommand),
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Parse an archive TOC listing and print its restore-list names
    ParseList { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    /// Receive decoded WAL into JSON files
    Receive {
        /// Stop once the receiver reaches this LSN
        #[arg(long)]
        endpos: Option<String>,
    },
    /// Transform JSON files into SQL files (one file, or the whole directory)
    Transform {
        /// JSON input file; without it the whole CDC directory is brought current
        json: Option<PathBuf>,
        /// SQL output file, required with a JSON input file
        sql: Option<PathBuf>,
    },
    /// Apply SQL files from the CDC directory to the target
    Catchup,
    /// Run the live pipeline: receive, transform and apply through pipes
    Replay,
    /// Inspect or update the sentinel control record
    #[command(subcommand)]
    Sentinel(SentinelCommand),
}

#[derive(Subcommand, Debug)]
enum SentinelCommand {
    /// Create the sentinel with its stream boundaries
    Setup { startpos: String, endpos: String },
    /// Print the sentinel
    Get,
    /// Update one sentinel field
    #[command(subcommand)]
    Set(SentinelSetCommand),
}

#[derive(Subcommand, Debug)]
enum SentinelSetCommand {
    Startpos { lsn: String },
    Endpos { lsn: String },
    /// Enable applying changes to the target
    Apply,
    /// Disable apply; keep prefetching only
    Prefetch,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code().code());
    }
}

async fn run(cli: Cli) -> CdcResult<()> {
    let mut config = CdcConfig::from_env()?;

    match cli.command {
        Command::Follow { endpos } => {
            config.endpos = parse_endpos(endpos)?;
            FollowSupervisor::new(config).run().await
        }
        Command::Stream(stream) => run_stream(stream, config).await,
        Command::Restore(RestoreCommand::ParseList { file }) => {
            let content = std::fs::read_to_string(&file)?;
            for line in content.lines() {
                if let Some(entry) = archive::parse_toc_line(line)? {
                    println!("{} {}", entry.dump_id, entry.restore_list_name);
                }
            }
            Ok(())
        }
    }
}

async fn run_stream(command: StreamCommand, mut config: CdcConfig) -> CdcResult<()> {
    match command {
        StreamCommand::Receive { endpos } => {
            config.endpos = parse_endpos(endpos)?;
            let stop = Arc::new(AtomicBool::new(false));
            let stop_fast = Arc::new(AtomicBool::new(false));
            install_signal_handlers(stop.clone(), stop_fast.clone())?;
            std::fs::create_dir_all(&config.dir)?;

            tokio::task::spawn_blocking(move || {
                StreamReceiver::new(config, stop, stop_fast).run()
            })
            .await?
        }
        StreamCommand::Transform { json, sql } => {
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let target = PgConnection::connect(&config.target_pguri, ConnKind::Target)?;
                let cache = GeneratedColumnCache::from_target(&target)?;
                drop(target);

                match (json, sql) {
                    (Some(json), Some(sql)) => {
                        transform::transform_file(config.plugin, &cache, &json, &sql)
                    }
                    (None, None) => {
                        let transformed =
                            transform::transform_directory(config.plugin, &cache, &config.dir)?;
                        info!("Transformed {} file(s)", transformed);
                        Ok(())
                    }
                    _ => Err(crate::errors::CdcError::config(
                        "stream transform takes both a JSON and a SQL file, or neither",
                    )),
                }
            })
            .await?
        }
        StreamCommand::Catchup => {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_fast = Arc::new(AtomicBool::new(false));
            install_signal_handlers(stop.clone(), stop_fast.clone())?;

            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let mut applier = SqlApplier::connect(&config, stop, stop_fast)?;
                applier.run_catchup(&config.dir, true)
            })
            .await?
        }
        StreamCommand::Replay => {
            FollowSupervisor::new(config)
                .run_single(FollowMode::Replay)
                .await
        }
        StreamCommand::Sentinel(sentinel) => run_sentinel(sentinel, config).await,
    }
}

async fn run_sentinel(command: SentinelCommand, config: CdcConfig) -> CdcResult<()> {
    tokio::task::spawn_blocking(move || -> CdcResult<()> {
        let store = SentinelStore::connect(&config.source_pguri)?;
        match command {
            SentinelCommand::Setup { startpos, endpos } => {
                store.setup(startpos.parse()?, endpos.parse()?)
            }
            SentinelCommand::Get => {
                let sentinel = store.get()?;
                println!("startpos   {}", sentinel.startpos);
                println!("endpos     {}", sentinel.endpos);
                println!("apply      {}", if sentinel.apply { "enabled" } else { "disabled" });
                println!("write_lsn  {}", sentinel.write_lsn);
                println!("flush_lsn  {}", sentinel.flush_lsn);
                println!("replay_lsn {}", sentinel.replay_lsn);
                Ok(())
            }
            SentinelCommand::Set(set) => match set {
                SentinelSetCommand::Startpos { lsn } => store.update_startpos(lsn.parse()?),
                SentinelSetCommand::Endpos { lsn } => store.update_endpos(lsn.parse()?),
                SentinelSetCommand::Apply => store.update_apply(true),
                SentinelSetCommand::Prefetch => store.update_apply(false),
            },
        }
    })
    .await?
}

fn parse_endpos(endpos: Option<String>) -> CdcResult<Option<Lsn>> {
    endpos.map(|text| text.parse()).transpose()
}
