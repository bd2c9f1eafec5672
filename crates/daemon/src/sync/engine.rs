// Sync engine: drains each target's pending deliveries into remote commits.
//
// Per run: select the oldest pending batch, render it, call the remote with
// a timeout, record per-message results, then advance the cursor over the
// committed prefix. Targets are independent; a failing target never blocks
// another. At most one run per target is in flight; concurrent requests for
// the same target wait for it and receive a copy of its result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chatlog_common::protocol::http::{PushResponse, PushStatus, RunSummary};
use chatlog_common::types::MessageId;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error::{CommitError, SyncError};
use super::remote::{CommitReceipt, FileOutcome, RemoteRepositoryClient};
use super::render::{render_batch, RenderedBatch};
use super::target::{advance_cursor_if_contiguous, TargetSpec};
use crate::config::{CommitStrategy, SyncConfig};
use crate::store::{MessageStore, StoreError};

const CURSOR_SCAN_PAGE: usize = 500;

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub commit_strategy: CommitStrategy,
    pub unhealthy_threshold: u32,
    pub commit_timeout: Duration,
    /// Also the cap on unhealthy-target backoff.
    pub sweep_interval: Duration,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            commit_strategy: config.commit_strategy,
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            commit_timeout: Duration::from_secs(config.commit_timeout_sec),
            sweep_interval: Duration::from_secs(config.sweep_interval_sec),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

// ── Run records ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Background sweep; unhealthy targets inside their backoff window are skipped.
    Scheduled,
    /// Explicit push; ignores backoff.
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Suspended { reason: String },
    BackingOff { until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was pending.
    NoOp,
    Committed { commit_id: String },
    /// Some files landed, others need another attempt.
    Partial { commit_id: String, committed: Vec<MessageId>, failed: Vec<MessageId> },
    Failed { error: SyncError },
    Skipped { reason: SkipReason },
    /// The local store failed; nothing about the remote is known.
    EngineError { message: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Committed { .. } => "committed",
            Self::Partial { .. } => "partial",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
            Self::EngineError { .. } => "engine_error",
        }
    }

    pub fn commit_id(&self) -> Option<&str> {
        match self {
            Self::Committed { commit_id } | Self::Partial { commit_id, .. } => Some(commit_id),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Failed { error } => Some(error.to_string()),
            Self::Skipped { reason: SkipReason::Suspended { reason } } => {
                Some(format!("target suspended: {reason}"))
            }
            Self::Skipped { reason: SkipReason::BackingOff { until } } => {
                Some(format!("backing off until {}", until.to_rfc3339()))
            }
            Self::Partial { failed, .. } => Some(format!("{} message(s) not committed", failed.len())),
            Self::EngineError { message } => Some(message.clone()),
            Self::NoOp | Self::Committed { .. } => None,
        }
    }
}

/// Record of one per-target run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRun {
    pub target: String,
    /// Message ids attempted, ascending.
    pub batch: Vec<MessageId>,
    pub outcome: RunOutcome,
    pub cursor: Option<MessageId>,
    /// Deliveries still owed to the target after the run.
    pub pending: u64,
    /// This caller joined a run that was already in flight.
    pub coalesced: bool,
    /// Messages whose commit could not be recorded because of a conflicting state.
    pub skipped_transitions: Vec<MessageId>,
}

impl SyncRun {
    fn engine_error(target: &str, message: impl Into<String>) -> Self {
        Self {
            target: target.to_string(),
            batch: Vec::new(),
            outcome: RunOutcome::EngineError { message: message.into() },
            cursor: None,
            pending: 0,
            coalesced: false,
            skipped_transitions: Vec::new(),
        }
    }

    /// Nothing left to do for this target.
    pub fn is_settled(&self) -> bool {
        matches!(self.outcome, RunOutcome::NoOp | RunOutcome::Committed { .. }) && self.pending == 0
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            outcome: self.outcome.label().to_string(),
            batch: self.batch.clone(),
            commit_id: self.outcome.commit_id().map(str::to_string),
            cursor: self.cursor,
            pending: self.pending,
            coalesced: self.coalesced,
            error: self.outcome.error_message(),
        }
    }

    fn log(&self) {
        let outcome = self.outcome.label();
        let commit_id = self.outcome.commit_id().unwrap_or("");
        match &self.outcome {
            RunOutcome::NoOp | RunOutcome::Committed { .. } => info!(
                target_name = %self.target,
                outcome,
                batch = self.batch.len(),
                commit_id = %commit_id,
                cursor = ?self.cursor,
                pending = self.pending,
                "sync run finished"
            ),
            RunOutcome::Skipped { .. } => info!(
                target_name = %self.target,
                outcome,
                reason = %self.outcome.error_message().unwrap_or_default(),
                pending = self.pending,
                "sync run skipped"
            ),
            _ => warn!(
                target_name = %self.target,
                outcome,
                batch = self.batch.len(),
                commit_id = %commit_id,
                cursor = ?self.cursor,
                pending = self.pending,
                error = %self.outcome.error_message().unwrap_or_default(),
                "sync run did not complete"
            ),
        }
    }
}

/// Result of running every target once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub status: PushStatus,
    /// In configured target order.
    pub runs: Vec<SyncRun>,
}

impl SweepReport {
    pub fn from_runs(runs: Vec<SyncRun>) -> Self {
        let status = if runs.iter().any(|r| matches!(r.outcome, RunOutcome::EngineError { .. })) {
            PushStatus::Error
        } else if runs.iter().all(SyncRun::is_settled) {
            PushStatus::Success
        } else {
            PushStatus::Partial
        };
        Self { status, runs }
    }

    pub fn run(&self, target: &str) -> Option<&SyncRun> {
        self.runs.iter().find(|r| r.target == target)
    }

    pub fn message(&self) -> String {
        match self.status {
            PushStatus::Success => "Push completed; all targets up to date".to_string(),
            PushStatus::Partial => {
                let behind = self.runs.iter().filter(|r| !r.is_settled()).count();
                format!("{behind} of {} target(s) still have undelivered messages", self.runs.len())
            }
            PushStatus::Error => {
                let detail = self
                    .runs
                    .iter()
                    .find_map(|r| match &r.outcome {
                        RunOutcome::EngineError { message } => Some(message.as_str()),
                        _ => None,
                    })
                    .unwrap_or("unknown failure");
                format!("Push failed: {detail}")
            }
        }
    }

    pub fn to_response(&self) -> PushResponse {
        PushResponse {
            status: self.status,
            message: self.message(),
            results: self.runs.iter().map(|r| (r.target.clone(), r.summary())).collect(),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

type InFlight = HashMap<String, watch::Receiver<Option<SyncRun>>>;

enum Slot {
    Leader(watch::Sender<Option<SyncRun>>),
    Follower(watch::Receiver<Option<SyncRun>>),
}

/// Clears the in-flight entry when the leading run ends or is cancelled.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<InFlight>,
    target: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(self.target);
    }
}

pub struct SyncEngine {
    store: Arc<MessageStore>,
    client: Arc<dyn RemoteRepositoryClient>,
    targets: Vec<TargetSpec>,
    settings: SyncSettings,
    in_flight: Mutex<InFlight>,
}

impl SyncEngine {
    /// Register every target with the store (backfilling their pending
    /// deliveries) and build the engine.
    pub fn new(
        store: Arc<MessageStore>,
        client: Arc<dyn RemoteRepositoryClient>,
        targets: Vec<TargetSpec>,
        settings: SyncSettings,
    ) -> Result<Self, StoreError> {
        for target in &targets {
            store.register_target(target)?;
        }
        Ok(Self { store, client, targets, settings, in_flight: Mutex::new(HashMap::new()) })
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn targets(&self) -> &[TargetSpec] {
        &self.targets
    }

    pub fn target(&self, name: &str) -> Option<&TargetSpec> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run every target once, concurrently.
    pub async fn sweep(self: &Arc<Self>, mode: SyncMode) -> SweepReport {
        let handles: Vec<_> = self
            .targets
            .iter()
            .map(|target| {
                let engine = Arc::clone(self);
                let name = target.name.clone();
                let handle = tokio::spawn(async move { engine.sync_target(&name, mode).await });
                (target.name.clone(), handle)
            })
            .collect();

        let mut runs = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let run = match handle.await {
                Ok(run) => run,
                Err(join_error) => {
                    error!(target_name = %name, error = %join_error, "sync task failed");
                    SyncRun::engine_error(&name, format!("sync task failed: {join_error}"))
                }
            };
            runs.push(run);
        }

        let report = SweepReport::from_runs(runs);
        debug!(status = report.status.as_str(), ?mode, "sweep finished");
        report
    }

    /// Run one target, or join its in-flight run.
    pub async fn sync_target(&self, name: &str, mode: SyncMode) -> SyncRun {
        let Some(spec) = self.target(name) else {
            return SyncRun::engine_error(name, format!("unknown target `{name}`"));
        };

        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(name) {
                Some(rx) => Slot::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(name.to_string(), rx);
                    Slot::Leader(tx)
                }
            }
        };

        match slot {
            Slot::Follower(mut rx) => {
                debug!(target_name = %name, "joining in-flight sync run");
                let finished = rx.wait_for(Option::is_some).await.ok().and_then(|run| run.clone());
                match finished {
                    Some(mut run) => {
                        run.coalesced = true;
                        run
                    }
                    None => SyncRun::engine_error(name, "in-flight sync run was cancelled"),
                }
            }
            Slot::Leader(tx) => {
                let _guard = InFlightGuard { in_flight: &self.in_flight, target: name };
                let run = self.run_target(spec, mode).await;
                tx.send_replace(Some(run.clone()));
                run
            }
        }
    }

    async fn run_target(&self, spec: &TargetSpec, mode: SyncMode) -> SyncRun {
        match self.try_run(spec, mode).await {
            Ok(run) => run,
            Err(error) => {
                error!(target_name = %spec.name, %error, "sync run aborted by store failure");
                let run = SyncRun::engine_error(&spec.name, error.to_string());
                run.log();
                run
            }
        }
    }

    async fn try_run(&self, spec: &TargetSpec, mode: SyncMode) -> Result<SyncRun, StoreError> {
        let record = self.store.target_record(&spec.name)?;
        if record.health.suspended {
            let reason = record.health.suspended_reason.unwrap_or_else(|| "suspended".to_string());
            let outcome = RunOutcome::Skipped { reason: SkipReason::Suspended { reason } };
            return self.finish(spec, Vec::new(), outcome, Vec::new());
        }
        if mode == SyncMode::Scheduled {
            let not_before = record
                .health
                .retry_not_before(self.settings.unhealthy_threshold, self.settings.sweep_interval);
            if let Some(until) = not_before.filter(|until| Utc::now() < *until) {
                let outcome = RunOutcome::Skipped { reason: SkipReason::BackingOff { until } };
                return self.finish(spec, Vec::new(), outcome, Vec::new());
            }
        }

        let batch = self.store.pending_for(&spec.name, self.settings.batch_size)?;
        if batch.is_empty() {
            return self.finish(spec, Vec::new(), RunOutcome::NoOp, Vec::new());
        }
        let ids: Vec<MessageId> = batch.iter().map(|m| m.id).collect();
        let rendered = render_batch(spec, &batch, self.settings.commit_strategy);
        debug!(
            target_name = %spec.name,
            batch = ids.len(),
            files = rendered.files.len(),
            idempotency_key = %rendered.idempotency_key,
            "committing batch"
        );

        let call = self.client.commit(spec, rendered.request());
        let result = match tokio::time::timeout(self.settings.commit_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CommitError::Ambiguous {
                reason: format!("no response within {}s", self.settings.commit_timeout.as_secs()),
            }),
        };

        let now = Utc::now();
        let (outcome, skipped) = match result {
            Ok(receipt) => self.apply_receipt(spec, &rendered, &receipt, now)?,
            Err(error) => (self.apply_failure(spec, &ids, &rendered, &error, now)?, Vec::new()),
        };
        self.finish(spec, ids, outcome, skipped)
    }

    fn apply_receipt(
        &self,
        spec: &TargetSpec,
        rendered: &RenderedBatch,
        receipt: &CommitReceipt,
        now: DateTime<Utc>,
    ) -> Result<(RunOutcome, Vec<MessageId>), StoreError> {
        let mut committed = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        // First auth-class failure wins, otherwise the first failure.
        let mut worst: Option<SyncError> = None;

        for file in &rendered.files {
            match receipt.outcome_for(&file.change.path) {
                FileOutcome::Applied { commit_id } => {
                    for id in &file.message_ids {
                        match self.store.mark_delivered(&spec.name, *id, &commit_id) {
                            Ok(_) => committed.push(*id),
                            Err(
                                error @ (StoreError::InvalidTransition { .. }
                                | StoreError::UnknownDelivery { .. }),
                            ) => {
                                error!(
                                    target_name = %spec.name,
                                    message_id = id,
                                    commit_id = %commit_id,
                                    %error,
                                    "delivery state conflict; skipping message"
                                );
                                skipped.push(*id);
                            }
                            Err(error) => return Err(error),
                        }
                    }
                }
                FileOutcome::Failed { error } => {
                    let sync_error = SyncError::from_commit(&error, &rendered.idempotency_key);
                    let reason = sync_error.to_string();
                    for id in &file.message_ids {
                        self.store.mark_failed(&spec.name, *id, &reason)?;
                        failed.push(*id);
                    }
                    let replace = match &worst {
                        None => true,
                        Some(current) => sync_error.suspends_target() && !current.suspends_target(),
                    };
                    if replace {
                        worst = Some(sync_error);
                    }
                }
            }
        }

        let Some(error) = worst else {
            self.store.record_success(&spec.name, now)?;
            return Ok((RunOutcome::Committed { commit_id: receipt.commit_id.clone() }, skipped));
        };

        let reason = error.to_string();
        self.store.record_failure(&spec.name, &reason, now)?;
        if error.suspends_target() {
            self.suspend_target(spec, &reason)?;
        }
        let outcome = RunOutcome::Partial { commit_id: receipt.commit_id.clone(), committed, failed };
        Ok((outcome, skipped))
    }

    fn apply_failure(
        &self,
        spec: &TargetSpec,
        ids: &[MessageId],
        rendered: &RenderedBatch,
        error: &CommitError,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, StoreError> {
        let sync_error = SyncError::from_commit(error, &rendered.idempotency_key);
        let reason = sync_error.to_string();

        if let SyncError::Ambiguous { idempotency_key, .. } = &sync_error {
            warn!(
                target_name = %spec.name,
                idempotency_key = %idempotency_key,
                batch = ?ids,
                "commit outcome unknown; the retry may create a duplicate commit \
                 if the remote does not honour the idempotency key"
            );
        }

        for id in ids {
            self.store.mark_failed(&spec.name, *id, &reason)?;
        }
        self.store.record_failure(&spec.name, &reason, now)?;

        if sync_error.suspends_target() {
            self.suspend_target(spec, &reason)?;
        }
        Ok(RunOutcome::Failed { error: sync_error })
    }

    fn suspend_target(&self, spec: &TargetSpec, reason: &str) -> Result<(), StoreError> {
        self.store.suspend(&spec.name, reason)?;
        error!(
            target_name = %spec.name,
            repo = %spec.full_name(),
            error = %reason,
            "target suspended until resumed"
        );
        Ok(())
    }

    fn finish(
        &self,
        spec: &TargetSpec,
        batch: Vec<MessageId>,
        outcome: RunOutcome,
        skipped_transitions: Vec<MessageId>,
    ) -> Result<SyncRun, StoreError> {
        let cursor = self.advance_cursor(&spec.name)?;
        let pending = self.store.pending_count(&spec.name)?;
        let run = SyncRun {
            target: spec.name.clone(),
            batch,
            outcome,
            cursor,
            pending,
            coalesced: false,
            skipped_transitions,
        };
        run.log();
        Ok(run)
    }

    /// Move `target`'s cursor over the contiguous committed prefix and
    /// return the resulting value.
    pub fn advance_cursor(&self, target: &str) -> Result<Option<MessageId>, StoreError> {
        let mut cursor = self.store.target_record(target)?.cursor;
        loop {
            let states = self.store.delivery_states_after(target, cursor, CURSOR_SCAN_PAGE)?;
            let next = advance_cursor_if_contiguous(cursor, &states);
            let whole_page_committed =
                states.len() == CURSOR_SCAN_PAGE && next == states.last().map(|(id, _)| *id);

            if let Some(id) = next.filter(|_| next != cursor) {
                self.store.save_cursor(target, id)?;
            }
            cursor = next;
            if !whole_page_committed {
                return Ok(cursor);
            }
        }
    }
}
