//! The queue processor: a process-scoped engine that leases QUEUED response
//! rows, dispatches them to the remote inference service under a bounded
//! concurrency budget, polls task results, and reaps stuck work.

mod dispatch;

use crate::breaker::CircuitBreakers;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between idle lease polls and between remote status polls.
    pub poll_interval: std::time::Duration,
    /// Upper bound on concurrently leased responses; the sole throttle.
    pub max_concurrent: u32,
    /// Deadline after which a PROCESSING row is considered stuck.
    pub task_timeout: std::time::Duration,
    /// Interval between stuck-task sweeps.
    pub stuck_sweep_interval: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(5),
            max_concurrent: 30,
            task_timeout: std::time::Duration::from_secs(30 * 60),
            stuck_sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub reaped: AtomicU64,
}

#[derive(Debug, serde::Serialize)]
pub struct ProcessorStatus {
    pub running: bool,
    pub max_concurrent: u32,
    pub active_leases: u32,
    pub open_circuits: usize,
    pub processed: u64,
    pub failed: u64,
    pub reaped: u64,
}

/// Everything a scheduler tick or worker needs; cheap to clone into tasks.
#[derive(Clone)]
struct WorkerCtx {
    app: crate::App,
    config: Config,
    breakers: Arc<CircuitBreakers>,
    stats: Arc<Stats>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    scheduler: tokio::task::JoinHandle<()>,
    reaper: tokio::task::JoinHandle<()>,
    semaphore: Arc<Semaphore>,
}

/// Process-wide queue processor with a start/stop/restart lifecycle. There
/// is exactly one of these per daemon; it owns its worker set and shares
/// only the work-store rows with the rest of the system.
pub struct Processor {
    app: crate::App,
    config: Config,
    breakers: Arc<CircuitBreakers>,
    stats: Arc<Stats>,
    running: Mutex<Option<Running>>,
}

impl Processor {
    pub fn new(app: crate::App, config: Config) -> Arc<Self> {
        Arc::new(Self {
            app,
            config,
            breakers: Arc::new(CircuitBreakers::new()),
            stats: Arc::new(Stats::default()),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Begin leasing and dispatching. A no-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            tracing::warn!("queue processor is already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent as usize));
        let ctx = WorkerCtx {
            app: self.app.clone(),
            config: self.config.clone(),
            breakers: self.breakers.clone(),
            stats: self.stats.clone(),
        };

        let scheduler = tokio::spawn(scheduler_loop(
            ctx.clone(),
            semaphore.clone(),
            shutdown_rx.clone(),
        ));
        let reaper = tokio::spawn(reaper_loop(ctx, shutdown_rx));

        *running = Some(Running {
            shutdown_tx,
            scheduler,
            reaper,
            semaphore,
        });
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval = ?self.config.poll_interval,
            "queue processor started"
        );
    }

    /// Stop leasing and drain active workers, bounded by the task timeout.
    /// Rows still PROCESSING after the drain are left for the reaper and
    /// startup recovery; they are never force-killed into a lost state.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().unwrap().take() else {
            tracing::warn!("queue processor is not running");
            return;
        };
        let _ = running.shutdown_tx.send(true);
        let _ = running.scheduler.await;
        let _ = running.reaper.await;

        // Workers hold permits; re-acquiring the full budget means drained.
        let drained = tokio::time::timeout(
            self.config.task_timeout,
            running.semaphore.acquire_many(self.config.max_concurrent),
        )
        .await;
        match drained {
            Ok(_) => tracing::info!("queue processor stopped, all workers drained"),
            Err(_) => tracing::warn!(
                "queue processor stopped with workers still in flight; \
                 the reaper will time their rows out"
            ),
        }
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }

    pub fn status(&self) -> ProcessorStatus {
        let running = self.running.lock().unwrap();
        let (is_running, active) = match running.as_ref() {
            Some(state) => (
                true,
                self.config.max_concurrent
                    - state.semaphore.available_permits().min(u32::MAX as usize) as u32,
            ),
            None => (false, 0),
        };
        ProcessorStatus {
            running: is_running,
            max_concurrent: self.config.max_concurrent,
            active_leases: active,
            open_circuits: self.breakers.open_count(),
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            reaped: self.stats.reaped.load(Ordering::Relaxed),
        }
    }
}

/// Lease-and-dispatch loop. Acquires every available permit, leases that
/// many QUEUED rows in one statement, and hands each row (with one permit)
/// to a spawned worker. When the queue is shallow the loop sleeps for the
/// jittered poll interval, waking early when a worker frees a permit.
async fn scheduler_loop(
    ctx: WorkerCtx,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Block until at least one permit is free, so a saturated worker set
        // never triggers empty lease queries.
        if semaphore.available_permits() == 0 {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => drop(permit),
                _ = shutdown.changed() => continue,
            }
        }

        let available = semaphore.available_permits() as u32;
        let Ok(mut permits) = semaphore.clone().acquire_many_owned(available).await else {
            break; // Semaphore closed.
        };

        let leased = crate::retry::with_store_retries("lease", || {
            eval_sql::responses::lease(permits.num_permits() as i64, &ctx.app.work)
        })
        .await;

        let leased = match leased {
            Ok(leased) => leased,
            Err(err) => {
                tracing::error!(?err, "failed to lease queued responses (will retry)");
                Vec::new()
            }
        };

        if !leased.is_empty() {
            tracing::debug!(count = leased.len(), "leased queued responses");
        }

        for response in leased {
            let Some(permit) = permits.split(1) else { break };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                dispatch::process_response(
                    &ctx.app,
                    &ctx.config,
                    &ctx.breakers,
                    &ctx.stats,
                    response,
                    permit,
                )
                .await;
            });
        }

        // Permits remain: the queue had less work than budget. Sleep with
        // jitter so multiple daemons spread their polls, waking early when
        // a worker completes.
        if permits.num_permits() != 0 {
            let jitter = 0.9 + rand::random::<f64>() * 0.2;
            tokio::select! {
                () = tokio::time::sleep(ctx.config.poll_interval.mul_f64(jitter)) => {}
                _ = semaphore.clone().acquire_owned() => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    tracing::info!("scheduler loop exited");
}

/// The stuck-task reaper: the only authority that ends PROCESSING without a
/// remote result. Flips over-deadline rows to TIMEOUT and runs the batch
/// fan-in for each affected batch.
async fn reaper_loop(ctx: WorkerCtx, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = tokio::time::interval(ctx.config.stuck_sweep_interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let reaped =
            match eval_sql::responses::reap_stuck(ctx.config.task_timeout, &ctx.app.work).await {
                Ok(reaped) => reaped,
                Err(err) => {
                    tracing::error!(?err, "stuck-task sweep failed (will retry)");
                    continue;
                }
            };
        if reaped.is_empty() {
            continue;
        }

        ctx.stats
            .reaped
            .fetch_add(reaped.len() as u64, Ordering::Relaxed);
        tracing::warn!(count = reaped.len(), "reaped stuck responses to TIMEOUT");

        let mut batches: Vec<i32> = reaped.into_iter().map(|(_, batch_id)| batch_id).collect();
        batches.sort_unstable();
        batches.dedup();
        for batch_id in batches {
            if let Err(err) = crate::batches::check_fan_in(&ctx.app, batch_id).await {
                tracing::error!(batch_id, ?err, "fan-in check failed after reap");
            }
        }
    }
    tracing::info!("reaper loop exited");
}
