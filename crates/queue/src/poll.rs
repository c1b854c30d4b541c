//! Per-job poll loop.
//!
//! Each (owner, job) gets one long-lived task fed through a channel. Posting
//! to the channel wakes the task; while a drive is already in progress the
//! post only updates the priority hint for the next cycle, so there is never
//! more than one active drive per job. The result handler posts here after
//! every outcome instead of calling back into the loop.
//!
//! A drive keeps running cycles until the job stops being runnable: a stop
//! was requested, the owner went offline, the status left `running`, or
//! nothing remains. The task then retires and leaves the loop table; the
//! next trigger spawns a fresh one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_common::{AppError, AppResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::dispatch;
use crate::engine::Engine;
use crate::jobs::{JobKey, JobStats, JobStatus};
use crate::pubsub::GatewayEvent;

#[derive(Default)]
pub(crate) struct LoopState {
    processing: AtomicBool,
    stop_requested: AtomicBool,
}

impl LoopState {
    pub(crate) fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Handle to a job's loop task.
pub(crate) struct JobLoop {
    tx: mpsc::UnboundedSender<Option<i16>>,
    state: Arc<LoopState>,
    task: JoinHandle<()>,
}

impl Engine {
    /// Wake the job's loop, spawning it if needed. A no-op apart from the
    /// hint if a drive is already in progress.
    pub(crate) async fn trigger_loop(self: &Arc<Self>, key: &JobKey, hint: Option<i16>) {
        let mut loops = self.loops.lock().await;
        let job_loop = loops
            .entry(key.clone())
            .and_modify(|l| {
                if l.task.is_finished() {
                    *l = spawn_loop(self, key);
                }
            })
            .or_insert_with(|| spawn_loop(self, key));

        if job_loop.state.is_processing() {
            debug!(job_id = %key.job_id, "Loop already processing");
        }
        // A closed channel means the loop is shutting down
        let _ = job_loop.tx.send(hint);
    }

    /// Wake the job's loop if one exists.
    pub(crate) async fn wake_loop(&self, key: &JobKey, hint: Option<i16>) {
        if let Some(job_loop) = self.loops.lock().await.get(key) {
            let _ = job_loop.tx.send(hint);
        }
    }

    /// Ask the job's loop to stop at its next iteration.
    pub(crate) async fn stop_loop(&self, key: &JobKey) {
        if let Some(job_loop) = self.loops.lock().await.get(key) {
            job_loop.state.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Clear a pending stop request.
    pub(crate) async fn resume_loop(&self, key: &JobKey) {
        if let Some(job_loop) = self.loops.lock().await.get(key) {
            job_loop.state.stop_requested.store(false, Ordering::SeqCst);
        }
    }

    /// Number of loop tasks still alive.
    pub(crate) async fn live_loops(&self) -> usize {
        self.loops
            .lock()
            .await
            .values()
            .filter(|l| !l.task.is_finished())
            .count()
    }

    /// Whether a drive is in progress for the job.
    pub(crate) async fn loop_processing(&self, key: &JobKey) -> bool {
        self.loops
            .lock()
            .await
            .get(key)
            .is_some_and(|l| l.state.is_processing())
    }

    /// Stop every loop and wait for in-flight cycles to finish.
    pub(crate) async fn shutdown_loops(&self) {
        let loops: Vec<JobLoop> = self.loops.lock().await.drain().map(|(_, l)| l).collect();
        for job_loop in &loops {
            job_loop.state.stop_requested.store(true, Ordering::SeqCst);
        }
        for job_loop in loops {
            drop(job_loop.tx);
            if let Err(e) = job_loop.task.await {
                error!(error = %e, "Job loop task panicked");
            }
        }
    }
}

fn spawn_loop(engine: &Arc<Engine>, key: &JobKey) -> JobLoop {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(LoopState::default());
    let task = tokio::spawn(run(engine.clone(), key.clone(), state.clone(), rx));
    debug!(owner_id = %key.owner_id, job_id = %key.job_id, "Spawned job loop");
    JobLoop { tx, state, task }
}

async fn run(
    engine: Arc<Engine>,
    key: JobKey,
    state: Arc<LoopState>,
    mut rx: mpsc::UnboundedReceiver<Option<i16>>,
) {
    while let Some(hint) = rx.recv().await {
        state.processing.store(true, Ordering::SeqCst);
        if let Err(e) = drive(&engine, &key, &state, &mut rx, hint).await {
            error!(
                owner_id = %key.owner_id,
                job_id = %key.job_id,
                error = %e,
                "Job loop stopped on error"
            );
        }
        state.processing.store(false, Ordering::SeqCst);

        if retire(&engine, &key, &state, &rx).await {
            break;
        }
    }
    debug!(job_id = %key.job_id, "Job loop closed");
}

/// Remove the loop from the table unless a wake-up is already waiting.
///
/// Posts happen under the table lock, so once the entry is gone every later
/// trigger spawns a new loop instead of posting to this one.
async fn retire(
    engine: &Engine,
    key: &JobKey,
    state: &Arc<LoopState>,
    rx: &mpsc::UnboundedReceiver<Option<i16>>,
) -> bool {
    let mut loops = engine.loops.lock().await;
    if !rx.is_empty() {
        return false;
    }
    if loops.get(key).is_some_and(|l| Arc::ptr_eq(&l.state, state)) {
        loops.remove(key);
    }
    true
}

/// Wait for a wake-up or the idle delay. Returns `false` if the channel closed.
async fn idle(
    engine: &Engine,
    rx: &mut mpsc::UnboundedReceiver<Option<i16>>,
    hint: &mut Option<i16>,
) -> bool {
    match timeout(engine.config.idle_delay(), rx.recv()).await {
        Ok(Some(h)) => {
            if h.is_some() {
                *hint = h;
            }
            true
        }
        Ok(None) => false,
        Err(_) => true,
    }
}

async fn drive(
    engine: &Arc<Engine>,
    key: &JobKey,
    state: &LoopState,
    rx: &mut mpsc::UnboundedReceiver<Option<i16>>,
    mut hint: Option<i16>,
) -> AppResult<()> {
    loop {
        while let Ok(h) = rx.try_recv() {
            if h.is_some() {
                hint = h;
            }
        }

        if state.stop_requested() {
            debug!(job_id = %key.job_id, "Stop requested");
            return Ok(());
        }
        if !engine.notifier.is_connected(&key.owner_id).await? {
            info!(owner_id = %key.owner_id, job_id = %key.job_id, "Owner offline, pausing job loop");
            return Ok(());
        }
        if engine.status_of(key).await? != JobStatus::Running {
            return Ok(());
        }

        let stats = engine
            .store
            .get_stats(&key.job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("counters for job {key}")))?;
        if stats.remaining <= 0 {
            engine
                .transition_from(key, JobStatus::Running, JobStatus::Idle, None)
                .await?;
            return Ok(());
        }

        let size = engine
            .config
            .batch_size
            .min(engine.config.concurrency_hint * 3)
            .min(stats.remaining as usize);
        let batch = engine.store.dequeue(key, size).await?;

        if batch.is_empty() {
            let stats = engine.store.get_stats(&key.job_id).await?.unwrap_or(stats);
            if stats.remaining <= 0 {
                engine
                    .transition_from(key, JobStatus::Running, JobStatus::Idle, None)
                    .await?;
                return Ok(());
            }
            signal_need_more(engine, key, &stats).await;
            if !idle(engine, rx, &mut hint).await {
                return Ok(());
            }
            continue;
        }

        let report = dispatch::run_cycle(engine, key, batch, hint.take()).await?;
        if report.attempted == 0 && !idle(engine, rx, &mut hint).await {
            return Ok(());
        }
    }
}

/// Ask the producer for more recipients, at most once per interval.
async fn signal_need_more(engine: &Engine, key: &JobKey, stats: &JobStats) {
    // In-flight sends will settle or requeue on their own
    if engine.registry.count_for_job(&key.job_id).await > 0 {
        return;
    }

    let cap = (stats.initial as f64 * engine.config.demand_multiplier).ceil() as i64;
    let need = stats.remaining.min(cap);
    if need <= 0 {
        return;
    }
    if !engine.throttle.check(&key.job_id).await {
        return;
    }

    debug!(job_id = %key.job_id, need, "Signalling for more work");
    engine
        .notify(
            &key.owner_id,
            GatewayEvent::NeedMore {
                job_id: key.job_id.clone(),
                need,
            },
        )
        .await;
}
