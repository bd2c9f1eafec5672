// Background sweep scheduler.
//
// Sweeps once at start, then on every interval tick or explicit nudge.
// Nudges that arrive while a sweep runs collapse into one follow-up sweep.
// Dropping the handle closes the shutdown channel, which stops the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::{SweepReport, SyncEngine, SyncMode};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable handle for requesting an early sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepTrigger {
    nudge: Arc<Notify>,
}

impl SweepTrigger {
    pub fn request_sweep(&self) {
        self.nudge.notify_one();
    }
}

pub struct Scheduler;

impl Scheduler {
    pub fn start(engine: Arc<SyncEngine>, interval: Duration) -> SchedulerHandle {
        let interval = interval.max(MIN_INTERVAL);
        let trigger = SweepTrigger::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reports_tx, reports_rx) = watch::channel(None);

        let nudge = trigger.nudge.clone();
        let task = tokio::spawn(async move {
            scheduler_loop(engine, interval, nudge, shutdown_rx, reports_tx).await;
        });
        info!(interval_sec = interval.as_secs(), "sync scheduler started");

        SchedulerHandle { trigger, shutdown_tx, reports: reports_rx, task: Some(task) }
    }
}

pub struct SchedulerHandle {
    trigger: SweepTrigger,
    shutdown_tx: watch::Sender<bool>,
    reports: watch::Receiver<Option<Arc<SweepReport>>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn request_sweep(&self) {
        self.trigger.request_sweep();
    }

    pub fn trigger(&self) -> SweepTrigger {
        self.trigger.clone()
    }

    /// Latest finished sweep; changes after every sweep.
    pub fn reports(&self) -> watch::Receiver<Option<Arc<SweepReport>>> {
        self.reports.clone()
    }

    /// Signal shutdown and wait for the in-progress sweep (if any) to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "sync scheduler task ended abnormally");
            }
        }
    }
}

async fn scheduler_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    nudge: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    reports_tx: watch::Sender<Option<Arc<SweepReport>>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => "interval",
            () = nudge.notified() => "requested",
        };

        debug!(trigger, "starting sweep");
        let report = engine.sweep(SyncMode::Scheduled).await;
        info!(
            trigger,
            status = report.status.as_str(),
            targets = report.runs.len(),
            "scheduled sweep finished"
        );
        reports_tx.send_replace(Some(Arc::new(report)));

        if *shutdown_rx.borrow() {
            break;
        }
    }
    info!("sync scheduler stopped");
}
