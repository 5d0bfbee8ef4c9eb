//! Scheduler module: the tick loop and the outcome dispatcher.

mod dispatcher;

use dispatcher::{run_dispatcher, Dispatch};

use crate::config::MIN_INTERVAL_MS;
use crate::events::EventPublisher;
use crate::log_writer::LogWriter;
use crate::models::SchedulerState;
use crate::probe::ProbeExecutor;
use crate::registry::TargetRegistry;
use crate::stats::StatsAggregator;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

/// Scheduler error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("interval must be at least 100ms, got {0}ms")]
    InvalidInterval(u64),
}

/// Components the scheduler routes outcomes into.
pub struct Sinks {
    pub stats: Arc<StatsAggregator>,
    pub log: Arc<LogWriter>,
    pub events: Arc<EventPublisher>,
}

struct Running {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Settings read fresh by every tick.
struct TickSettings {
    interval_ms: AtomicU64,
    timeout_ms: AtomicU64,
}

/// Periodically probes every enabled target and routes the outcomes.
pub struct Scheduler {
    registry: Arc<RwLock<TargetRegistry>>,
    executor: ProbeExecutor,
    settings: Arc<TickSettings>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: Mutex<Option<Running>>,
    ticks: TaskTracker,
}

impl Scheduler {
    /// Create a scheduler and spawn its dispatcher task. Must be called inside a Tokio runtime.
    pub fn new(
        registry: Arc<RwLock<TargetRegistry>>,
        executor: ProbeExecutor,
        sinks: Sinks,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(rx, sinks));

        Self {
            registry,
            executor,
            settings: Arc::new(TickSettings {
                interval_ms: AtomicU64::new((interval.as_millis() as u64).max(MIN_INTERVAL_MS)),
                timeout_ms: AtomicU64::new((timeout.as_millis() as u64).max(1)),
            }),
            dispatch_tx: tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            running: Mutex::new(None),
            ticks: TaskTracker::new(),
        }
    }

    /// Start ticking. The first tick fires immediately.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let ctx = TickContext {
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            settings: self.settings.clone(),
            dispatch_tx: self.dispatch_tx.clone(),
            ticks: self.ticks.clone(),
        };

        let handle = tokio::spawn(run_tick_loop(ctx, stop_rx));
        *running = Some(Running { stop_tx, handle });

        tracing::info!(
            "Scheduler: started with interval {}ms",
            self.settings.interval_ms.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Stop scheduling new ticks. Probes already in flight still deliver their outcomes.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.stop_tx.send(());
        if let Err(e) = running.handle.await {
            tracing::error!("Scheduler: tick loop ended abnormally: {}", e);
        }
        tracing::info!("Scheduler: stopped");
    }

    pub async fn state(&self) -> SchedulerState {
        match self.running.lock().await.as_ref() {
            Some(r) if !r.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Idle,
        }
    }

    /// Change the interval used from the next tick on.
    pub fn set_interval(&self, interval_ms: u64) -> Result<(), SchedulerError> {
        if interval_ms < MIN_INTERVAL_MS {
            return Err(SchedulerError::InvalidInterval(interval_ms));
        }
        self.settings.interval_ms.store(interval_ms, Ordering::Relaxed);
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.interval_ms.load(Ordering::Relaxed))
    }

    /// Change the per-probe timeout used from the next tick on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings
            .timeout_ms
            .store((timeout.as_millis() as u64).max(1), Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout_ms.load(Ordering::Relaxed))
    }

    /// Drop the sequence counter of a removed target.
    pub fn forget(&self, target_id: &str) {
        let _ = self.dispatch_tx.send(Dispatch::Forget(target_id.to_string()));
    }

    /// Wait until everything submitted so far has been routed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.dispatch_tx.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop, let in-flight ticks finish, drain the dispatcher and end it.
    pub async fn shutdown(&self) {
        self.stop().await;

        self.ticks.close();
        self.ticks.wait().await;
        self.ticks.reopen();

        let (tx, rx) = oneshot::channel();
        if self.dispatch_tx.send(Dispatch::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler: dispatcher ended abnormally: {}", e);
            }
        }
    }
}

#[derive(Clone)]
struct TickContext {
    registry: Arc<RwLock<TargetRegistry>>,
    executor: ProbeExecutor,
    settings: Arc<TickSettings>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    ticks: TaskTracker,
}

/// Fire a tick, then sleep until the next deadline or a stop request.
async fn run_tick_loop(ctx: TickContext, mut stop_rx: broadcast::Receiver<()>) {
    let mut tick: u64 = 0;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        tick += 1;
        dispatch_tick(&ctx, tick);

        let interval = Duration::from_millis(ctx.settings.interval_ms.load(Ordering::Relaxed));
        deadline += interval;

        // Missed deadlines are skipped rather than fired in a burst.
        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }
    }
}

/// Launch one probe per enabled target without waiting for any of them.
fn dispatch_tick(ctx: &TickContext, tick: u64) {
    let targets = ctx.registry.read().enabled();
    if targets.is_empty() {
        tracing::debug!("Scheduler: tick {} has no enabled targets", tick);
        return;
    }

    let timeout = Duration::from_millis(ctx.settings.timeout_ms.load(Ordering::Relaxed));
    tracing::debug!("Scheduler: tick {} probing {} targets", tick, targets.len());

    let executor = ctx.executor.clone();
    let tx = ctx.dispatch_tx.clone();

    ctx.ticks.spawn(async move {
        let mut probes = JoinSet::new();
        for target in targets {
            let executor = executor.clone();
            let tx = tx.clone();
            probes.spawn(async move {
                let outcome = executor.probe(&target, timeout).await;
                let _ = tx.send(Dispatch::Outcome(outcome));
            });
        }

        while let Some(res) = probes.join_next().await {
            if let Err(e) = res {
                tracing::error!("Scheduler: probe task failed: {}", e);
            }
        }

        let _ = tx.send(Dispatch::TickComplete(tick));
    });
}
