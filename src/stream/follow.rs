//! Follow supervisor
//!
//! Owns the three workers (receive, transform, apply) and switches between
//! the two pipeline shapes:
//! - `Prefetch`: receiver writes JSON files, the queue announces completed
//!   segments, the transformer renders whole files, the applier follows the
//!   SQL files on disk
//! - `Replay`: receiver, transformer and applier connected by in-process
//!   pipes, no intermediate SQL files (JSON files are still written for
//!   durability)
//!
//! The workers run as blocking tasks; the supervisor polls their liveness,
//! stops the siblings when one exits, and on a non-fatal failure runs a
//! synchronous on-disk catchup pass before restarting in the other mode.

use crate::catalog::GeneratedColumnCache;
use crate::config::CdcConfig;
use crate::errors::{CdcError, CdcResult, ExitCode};
use crate::queue::{QUEUE_SOCKET_NAME, QueueListener, QueueSender};
use crate::sentinel::SentinelStore;
use crate::stream::apply::SqlApplier;
use crate::stream::receive::{StreamReceiver, remove_sidecar_files};
use crate::stream::transform;
use crate::utils::{ConnKind, PgConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Liveness poll interval for the child workers
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(150);
/// Depth of the in-process pipes in replay mode
const PIPE_DEPTH: usize = 1024;

/// Pipeline shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowMode {
    Prefetch,
    Replay,
}

impl FollowMode {
    fn flipped(self) -> Self {
        match self {
            FollowMode::Prefetch => FollowMode::Replay,
            FollowMode::Replay => FollowMode::Prefetch,
        }
    }
}

struct WorkerResult {
    name: &'static str,
    result: CdcResult<()>,
}

/// Supervises the three-stage pipeline until endpos or a user stop
pub struct FollowSupervisor {
    config: CdcConfig,
    stop: Arc<AtomicBool>,
    stop_fast: Arc<AtomicBool>,
    session_id: Uuid,
}

impl FollowSupervisor {
    pub fn new(config: CdcConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            stop_fast: Arc::new(AtomicBool::new(false)),
            session_id: Uuid::new_v4(),
        }
    }

    /// Run the follow loop: pipeline, catchup pass, flip, repeat.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn run(&self) -> CdcResult<()> {
        install_signal_handlers(self.stop.clone(), self.stop_fast.clone())?;

        std::fs::create_dir_all(&self.config.dir)?;
        remove_sidecar_files(&self.config.dir)?;

        let mut mode = FollowMode::Prefetch;
        loop {
            info!("Starting pipeline in {:?} mode", mode);
            let results = self.run_pipeline(mode).await?;

            let mut all_clean = true;
            let mut fatal = None;
            for worker in results {
                match worker.result {
                    Ok(()) => info!("Worker {} exited cleanly", worker.name),
                    Err(e) => {
                        all_clean = false;
                        let code = e.exit_code();
                        error!("Worker {} failed ({:?}): {}", worker.name, code, e);
                        // target and usage failures are not recoverable by
                        // restarting the pipeline in the other mode
                        if matches!(code, ExitCode::Target | ExitCode::BadArgs)
                            && fatal.is_none()
                        {
                            fatal = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }

            if self.stop.load(Ordering::SeqCst) || self.stop_fast.load(Ordering::SeqCst) {
                info!("Stopped by user");
                return Ok(());
            }

            if all_clean && self.endpos_reached().await? {
                info!("All workers done and endpos reached");
                return Ok(());
            }

            self.catchup_pass().await?;
            if self.endpos_reached().await? {
                info!("Endpos reached during catchup pass");
                return Ok(());
            }
            mode = mode.flipped();
        }
    }

    /// Run one pipeline round in a fixed mode (the `stream replay` verb),
    /// with no catchup pass and no mode switching.
    pub async fn run_single(&self, mode: FollowMode) -> CdcResult<()> {
        install_signal_handlers(self.stop.clone(), self.stop_fast.clone())?;
        std::fs::create_dir_all(&self.config.dir)?;
        remove_sidecar_files(&self.config.dir)?;

        let results = self.run_pipeline(mode).await?;
        let mut first_error = None;
        for worker in results {
            match worker.result {
                Ok(()) => info!("Worker {} exited cleanly", worker.name),
                Err(e) => {
                    error!("Worker {} failed: {}", worker.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// True when the sentinel says the applier caught up with endpos
    async fn endpos_reached(&self) -> CdcResult<bool> {
        let source_pguri = self.config.source_pguri.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            SentinelStore::connect(&source_pguri)?.get()
        })
        .await??;
        Ok(snapshot.endpos.is_valid()
            && snapshot.replay_lsn.is_valid()
            && snapshot.endpos <= snapshot.replay_lsn)
    }

    /// Synchronous on-disk catchup: bring SQL files current and apply the
    /// backlog, without waiting for new input.
    async fn catchup_pass(&self) -> CdcResult<()> {
        info!("Running synchronous catchup pass");
        let config = self.config.clone();
        let stop = self.stop.clone();
        let stop_fast = self.stop_fast.clone();

        tokio::task::spawn_blocking(move || -> CdcResult<()> {
            let target = PgConnection::connect(&config.target_pguri, ConnKind::Target)?;
            let cache = GeneratedColumnCache::from_target(&target)?;
            drop(target);

            let transformed =
                transform::transform_directory(config.plugin, &cache, &config.dir)?;
            info!("Catchup pass transformed {} file(s)", transformed);

            let mut applier = SqlApplier::connect(&config, stop, stop_fast)?;
            applier.run_catchup(&config.dir, false)
        })
        .await?
    }

    /// Start the three workers for one pipeline round and wait for all of
    /// them, stopping the siblings as soon as any one exits.
    async fn run_pipeline(&self, mode: FollowMode) -> CdcResult<Vec<WorkerResult>> {
        let handles = match mode {
            FollowMode::Prefetch => self.spawn_prefetch_pipeline()?,
            FollowMode::Replay => self.spawn_replay_pipeline(),
        };

        // wait for the first exit, then ask everyone to stop
        'poll: loop {
            for (_, handle) in &handles {
                if handle.is_finished() {
                    break 'poll;
                }
            }
            if self.stop.load(Ordering::SeqCst) || self.stop_fast.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(CHILD_POLL_INTERVAL).await;
        }
        self.stop.store(true, Ordering::SeqCst);

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(CdcError::Task(e)),
            };
            results.push(WorkerResult { name, result });
        }

        // the stop request was for this round only
        if !self.stop_fast.load(Ordering::SeqCst) && !user_stopped() {
            self.stop.store(false, Ordering::SeqCst);
        }

        Ok(results)
    }

    /// Disk-buffered pipeline: queue between receiver and transformer,
    /// SQL files between transformer and applier.
    fn spawn_prefetch_pipeline(
        &self,
    ) -> CdcResult<Vec<(&'static str, JoinHandle<CdcResult<()>>)>> {
        let queue_path = self.config.dir_path(QUEUE_SOCKET_NAME);
        let listener = QueueListener::bind(&queue_path)?;

        let transform_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let target = PgConnection::connect(&config.target_pguri, ConnKind::Target)?;
                let cache = GeneratedColumnCache::from_target(&target)?;
                drop(target);

                let queue = match listener.accept_with_stop(&stop) {
                    Ok(queue) => queue,
                    Err(CdcError::Stopped) => return Ok(()),
                    Err(e) => return Err(e),
                };
                transform::run_queue(config.plugin, &cache, &config.dir, queue, &stop)
            })
        };

        let receive_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            let stop_fast = self.stop_fast.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let queue = QueueSender::connect(
                    &config.dir.join(QUEUE_SOCKET_NAME),
                    Duration::from_secs(10),
                )?;
                let mut receiver = StreamReceiver::new(config, stop, stop_fast);
                receiver.set_queue(queue);
                receiver.run()
            })
        };

        let apply_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            let stop_fast = self.stop_fast.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let mut applier = SqlApplier::connect(&config, stop, stop_fast)?;
                applier.run_catchup(&config.dir, true)
            })
        };

        Ok(vec![
            ("transform", transform_handle),
            ("receive", receive_handle),
            ("apply", apply_handle),
        ])
    }

    /// Piped pipeline: receiver → transformer → applier, no SQL files.
    fn spawn_replay_pipeline(&self) -> Vec<(&'static str, JoinHandle<CdcResult<()>>)> {
        let (json_tx, json_rx) = sync_channel::<String>(PIPE_DEPTH);
        let (sql_tx, sql_rx) = sync_channel::<String>(PIPE_DEPTH);

        let receive_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            let stop_fast = self.stop_fast.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let mut receiver = StreamReceiver::new(config, stop, stop_fast);
                receiver.set_downstream(json_tx);
                receiver.run()
            })
        };

        let transform_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let target = PgConnection::connect(&config.target_pguri, ConnKind::Target)?;
                let cache = GeneratedColumnCache::from_target(&target)?;
                drop(target);
                transform::run_pipe(config.plugin, &cache, json_rx, sql_tx, &stop)
            })
        };

        let apply_handle = {
            let config = self.config.clone();
            let stop = self.stop.clone();
            let stop_fast = self.stop_fast.clone();
            tokio::task::spawn_blocking(move || -> CdcResult<()> {
                let mut applier = SqlApplier::connect(&config, stop, stop_fast)?;
                applier.run_pipe(sql_rx)
            })
        };

        vec![
            ("receive", receive_handle),
            ("transform", transform_handle),
            ("apply", apply_handle),
        ]
    }
}

static USER_STOP: AtomicBool = AtomicBool::new(false);

fn user_stopped() -> bool {
    USER_STOP.load(Ordering::SeqCst)
}

/// Route SIGINT/SIGTERM into the stop flags: the first signal asks for a
/// clean stop (flush, promote, exit 0), a second one for a fast stop that
/// skips the final flush.
pub fn install_signal_handlers(
    stop: Arc<AtomicBool>,
    stop_fast: Arc<AtomicBool>,
) -> CdcResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let mut stops = 0u32;
        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            stops += 1;
            USER_STOP.store(true, Ordering::SeqCst);
            if stops == 1 {
                warn!("Stop requested, finishing cleanly (send again to stop fast)");
                stop.store(true, Ordering::SeqCst);
            } else {
                warn!("Fast stop requested");
                stop_fast.store(true, Ordering::SeqCst);
            }
        }
    });

    Ok(())
}
