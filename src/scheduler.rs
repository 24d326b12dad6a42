//! Queue service loop: hands pending work to one worker per bot.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::store::{LeaseToken, LockGuard, Store, StoreError};
use crate::worker::{run_worker, WorkerContext, WorkerReport};

pub type WorkerResult = Result<WorkerReport, WorkerError>;

/// Starts one worker invocation for a bot whose lease `token` the scheduler
/// has just acquired.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        bot_id: String,
        token: LeaseToken,
    ) -> impl Future<Output = WorkerResult> + Send + 'static;
}

/// Runs the trade worker in-process.
#[derive(Debug, Clone)]
pub struct WorkerDispatch {
    ctx: Arc<WorkerContext>,
}

impl WorkerDispatch {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

impl Dispatch for WorkerDispatch {
    fn dispatch(
        &self,
        bot_id: String,
        token: LeaseToken,
    ) -> impl Future<Output = WorkerResult> + Send + 'static {
        let ctx = self.ctx.clone();
        async move {
            let lock = LockGuard::held(ctx.store.clone(), &bot_id, token, ctx.master.lock_lease());
            run_worker(&ctx, lock).await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub lock_lease: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            lock_lease: Duration::from_secs(600),
        }
    }
}

struct RunningWorker {
    token: LeaseToken,
    handle: JoinHandle<WorkerResult>,
}

pub struct Scheduler<D> {
    store: Store,
    dispatcher: D,
    settings: SchedulerSettings,
    workers: HashMap<String, RunningWorker>,
}

impl<D: Dispatch> Scheduler<D> {
    pub fn new(store: Store, dispatcher: D, settings: SchedulerSettings) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            workers: HashMap::new(),
        }
    }

    /// Bot ids with a worker task that has not been reaped yet.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Polls until `token` is cancelled, then waits for the running workers
    /// to finish their batch. Locks are swept on the way in and on the way
    /// out.
    pub async fn run(mut self, token: CancellationToken) {
        match self.store.blocking(|store| store.clear_locks()).await {
            Ok(n) if n > 0 => warn!("[SCHEDULER] Removed {} stale lock(s) on startup", n),
            Ok(_) => {}
            Err(e) => error!("[SCHEDULER] Failed to sweep locks on startup: {}", e),
        }
        info!(
            "[SCHEDULER] Started, polling every {:?}",
            self.settings.poll_interval
        );

        loop {
            if let Err(e) = self.tick().await {
                error!("[SCHEDULER] Tick failed: {}", e);
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.settings.poll_interval) => {}
            }
        }

        self.drain().await;
        match self.store.blocking(|store| store.clear_locks()).await {
            Ok(n) => info!("[SCHEDULER] Removed {} lock(s)", n),
            Err(e) => error!("[SCHEDULER] Failed to sweep locks on shutdown: {}", e),
        }
    }

    /// One pass: reap finished workers, drop expired leases, dispatch.
    /// Returns the bot ids dispatched.
    pub async fn tick(&mut self) -> Result<Vec<String>, StoreError> {
        let crashed = self.reap();
        let running: HashSet<String> = self.workers.keys().cloned().collect();
        let lease = self.settings.lock_lease;

        let acquired = self
            .store
            .blocking(move |store| {
                for (bot_id, token) in &crashed {
                    if store.release_lock(bot_id, *token)? {
                        warn!("[SCHEDULER] Cleared orphaned lock of bot {}", bot_id);
                    }
                }

                let now = Utc::now();
                let expired = store.sweep_expired_locks(now)?;
                if expired > 0 {
                    warn!("[SCHEDULER] Removed {} expired lock(s)", expired);
                }

                let mut acquired = Vec::new();
                for bot_id in store.pending_bot_ids()? {
                    if running.contains(&bot_id) {
                        debug!("[SCHEDULER] Worker for bot {} still running", bot_id);
                        continue;
                    }
                    match store.try_acquire_lock(&bot_id, now, lease)? {
                        Some(token) => acquired.push((bot_id, token)),
                        None => debug!("[SCHEDULER] Bot {} is locked", bot_id),
                    }
                }
                Ok(acquired)
            })
            .await?;

        let mut dispatched = Vec::with_capacity(acquired.len());
        for (bot_id, token) in acquired {
            info!("[SCHEDULER] Dispatching worker for bot {}", bot_id);
            let handle = tokio::spawn(self.dispatcher.dispatch(bot_id.clone(), token));
            self.workers
                .insert(bot_id.clone(), RunningWorker { token, handle });
            dispatched.push(bot_id);
        }
        Ok(dispatched)
    }

    /// Collects finished workers. Returns the leases of the ones that
    /// crashed so their locks can be cleared.
    fn reap(&mut self) -> Vec<(String, LeaseToken)> {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(bot_id, _)| bot_id.clone())
            .collect();

        let mut crashed = Vec::new();
        for bot_id in finished {
            let Some(mut worker) = self.workers.remove(&bot_id) else {
                continue;
            };
            match (&mut worker.handle).now_or_never() {
                Some(result) => {
                    if !log_outcome(&bot_id, result) {
                        crashed.push((bot_id, worker.token));
                    }
                }
                // not ready yet; try again next tick
                None => {
                    self.workers.insert(bot_id, worker);
                }
            }
        }
        crashed
    }

    /// Waits up to one lock lease for the running workers.
    async fn drain(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!(
            "[SCHEDULER] Waiting for {} worker(s) to finish their batch",
            self.workers.len()
        );

        let deadline = Instant::now() + self.settings.lock_lease;
        for (bot_id, mut worker) in std::mem::take(&mut self.workers) {
            match timeout_at(deadline, &mut worker.handle).await {
                Ok(result) => {
                    log_outcome(&bot_id, result);
                }
                Err(_) => {
                    error!(
                        "[SCHEDULER] Worker for bot {} did not finish within {:?}, aborting",
                        bot_id, self.settings.lock_lease
                    );
                    worker.handle.abort();
                }
            }
        }
    }
}

/// Logs how a worker task ended. Returns false if it panicked or was
/// aborted.
fn log_outcome(bot_id: &str, result: Result<WorkerResult, JoinError>) -> bool {
    match result {
        Ok(Ok(report)) => {
            info!(
                "[SCHEDULER] Worker for bot {} finished: {} succeeded, {} failed",
                bot_id,
                report.succeeded(),
                report.failed()
            );
            true
        }
        Ok(Err(e)) => {
            warn!("[SCHEDULER] Worker for bot {} stopped: {}", bot_id, e);
            true
        }
        Err(e) => {
            error!("[SCHEDULER] Worker for bot {} crashed: {}", bot_id, e);
            false
        }
    }
}
