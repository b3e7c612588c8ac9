// Alert engine: reconciliation sweep, one-shot timers, and the subscription hook

use super::cadence;
use super::timers::TimerSet;
use crate::clock::Clock;
use crate::config::{AlertsConfig, RedisConfig};
use crate::errors::{GatewayError, LedgerError, ScheduleError, SweepError};
use crate::evaluator::{self, DueItem};
use crate::ledger::{ClaimOutcome, DispatchLedger};
use crate::lock::{DistributedLock, SWEEP_LEASE_RESOURCE};
use crate::models::{DispatchRecord, DispatchTrigger, MilestoneKind, TrackedPair};
use crate::notify::{AlertNotice, NotificationDispatcher};
use crate::resolver::SubscriptionResolver;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Runtime configuration of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sweep_cron: String,
    pub timezone: Tz,
    pub sweep_on_startup: bool,
    pub max_concurrency: usize,
    pub retention_days: u32,
    pub claim_ttl: chrono::Duration,
    pub timer_offsets_days: Vec<u32>,
    pub timer_time_of_day: NaiveTime,
    pub lease_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_cron: "0 0 0 * * *".to_string(),
            timezone: chrono_tz::UTC,
            sweep_on_startup: true,
            max_concurrency: 8,
            retention_days: 1,
            claim_ttl: chrono::Duration::seconds(300),
            timer_offsets_days: vec![1],
            timer_time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(
        alerts: &AlertsConfig,
        redis: Option<&RedisConfig>,
    ) -> Result<Self, ScheduleError> {
        let defaults = Self::default();
        Ok(Self {
            sweep_cron: alerts.sweep_cron.clone(),
            timezone: alerts.timezone()?,
            sweep_on_startup: alerts.sweep_on_startup,
            max_concurrency: alerts.max_concurrency.max(1),
            retention_days: alerts.retention_days,
            claim_ttl: chrono::Duration::seconds(alerts.claim_ttl_seconds as i64),
            timer_offsets_days: alerts.timer_offsets_days.clone(),
            timer_time_of_day: alerts.timer_time()?,
            lease_ttl: redis
                .map(|r| Duration::from_secs(r.lock_ttl_seconds))
                .unwrap_or(defaults.lease_ttl),
        })
    }
}

/// Counters for one sweep (or one subscription hook run)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pairs: usize,
    pub due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub invalid_milestones: usize,
    pub timers_armed: usize,
    pub pruned: u64,
}

/// What happened to a single due item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    AlreadySent,
    InFlight,
    Failed,
}

/// Scheduler operations of the alert engine
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the cadence loop until `stop` is called
    async fn start(&self) -> Result<(), ScheduleError>;

    /// Signal the loop to exit and cancel armed timers
    async fn stop(&self);

    /// Run one reconciliation sweep now
    async fn run_sweep(&self) -> Result<SweepReport, SweepError>;
}

struct EngineInner {
    config: EngineConfig,
    schedule: CronSchedule,
    resolver: Arc<dyn SubscriptionResolver>,
    ledger: Arc<dyn DispatchLedger>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    lock: Option<Arc<dyn DistributedLock>>,
    sweeping: AtomicBool,
    timers: TimerSet,
}

/// Clears the in-progress flag when the sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The deadline alert engine
pub struct AlertEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: watch::Sender<bool>,
}

impl AlertEngine {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn SubscriptionResolver>,
        ledger: Arc<dyn DispatchLedger>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScheduleError> {
        let schedule = cadence::parse_cron_expression(&config.sweep_cron)?;
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                schedule,
                resolver,
                ledger,
                dispatcher,
                clock,
                lock: None,
                sweeping: AtomicBool::new(false),
                timers: TimerSet::new(),
            }),
            shutdown_tx,
        })
    }

    /// Coordinate sweeps across instances through a distributed lock
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.lock = Some(lock);
        }
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Whether a sweep is currently running in this instance
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeping.load(Ordering::Acquire)
    }

    /// Timers that are armed and have not fired
    pub fn timers_armed(&self) -> usize {
        self.inner.timers.armed()
    }

    /// Next scheduled sweep after the current clock time
    pub fn next_sweep(&self) -> Result<DateTime<Utc>, ScheduleError> {
        cadence::next_sweep_after(
            &self.inner.schedule,
            self.inner.config.timezone,
            self.inner.clock.now(),
        )
    }

    /// Evaluate and dispatch due alerts for a user who just subscribed.
    ///
    /// Goes through the same ledger path as the sweep, so it never causes a
    /// duplicate; also arms timers for the user's pairs.
    #[instrument(skip(self))]
    pub async fn on_subscription_created(&self, user_id: i64) -> Result<SweepReport, SweepError> {
        let pairs = self.inner.resolver.tracked_pairs_for_user(user_id).await?;
        let report = EngineInner::process_pairs(&self.inner, &pairs, DispatchTrigger::Subscription).await?;

        info!(
            user_id,
            pairs = report.pairs,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Subscription alerts processed"
        );
        Ok(report)
    }
}

impl EngineInner {
    fn try_begin_sweep(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(&self.sweeping))
    }

    #[instrument(skip(this), fields(trigger = "sweep"))]
    async fn sweep(this: &Arc<Self>) -> Result<SweepReport, SweepError> {
        let Some(_guard) = this.try_begin_sweep() else {
            debug!("Sweep already running, skipping");
            return Err(SweepError::AlreadyRunning);
        };

        let _lease = match &this.lock {
            Some(lock) => match lock.acquire(SWEEP_LEASE_RESOURCE, this.config.lease_ttl).await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    info!("Sweep lease held by another instance, skipping");
                    return Err(SweepError::LeaseUnavailable);
                }
                Err(e) => {
                    warn!(error = %e, "Sweep lease unavailable, relying on the ledger alone");
                    None
                }
            },
            None => None,
        };

        let started = Instant::now();
        let result = Self::sweep_pairs(this).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(report) => {
                telemetry::record_sweep("completed", elapsed);
                info!(
                    pairs = report.pairs,
                    due = report.due,
                    sent = report.sent,
                    skipped = report.skipped,
                    failed = report.failed,
                    invalid_milestones = report.invalid_milestones,
                    timers_armed = report.timers_armed,
                    pruned = report.pruned,
                    duration_seconds = elapsed,
                    "Sweep completed"
                );
            }
            Err(e) => {
                telemetry::record_sweep("aborted", elapsed);
                error!(error = %e, duration_seconds = elapsed, "Sweep aborted");
            }
        }

        result
    }

    async fn sweep_pairs(this: &Arc<Self>) -> Result<SweepReport, SweepError> {
        let pairs = this.resolver.list_tracked_pairs().await?;
        let mut report = Self::process_pairs(this, &pairs, DispatchTrigger::Sweep).await?;

        let today = this.clock.today(this.config.timezone);
        if let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(this.config.retention_days))) {
            match this.ledger.prune(cutoff).await {
                Ok(pruned) => report.pruned = pruned,
                Err(e) => warn!(error = %e, "Failed to prune dispatch ledger"),
            }
        }

        Ok(report)
    }

    /// Evaluate pairs, dispatch everything due today, then arm timers
    async fn process_pairs(
        this: &Arc<Self>,
        pairs: &[TrackedPair],
        trigger: DispatchTrigger,
    ) -> Result<SweepReport, SweepError> {
        let today = this.clock.today(this.config.timezone);
        let mut report = SweepReport {
            pairs: pairs.len(),
            ..SweepReport::default()
        };

        let mut work: Vec<(Arc<TrackedPair>, DueItem)> = Vec::new();
        for pair in pairs {
            let (due, invalid) = evaluator::evaluate_pair(today, pair);
            for err in &invalid {
                warn!(user_id = pair.user_id, error = %err, "Skipping invalid milestone date");
            }
            report.invalid_milestones += invalid.len();
            if !due.is_empty() {
                let pair = Arc::new(pair.clone());
                work.extend(due.into_iter().map(|item| (Arc::clone(&pair), item)));
            }
        }
        report.due = work.len();

        let engine = Arc::clone(this);
        let outcomes: Vec<DispatchOutcome> = stream::iter(work)
            .map(move |(pair, item)| {
                let engine = Arc::clone(&engine);
                async move { engine.dispatch_item(&pair, item, trigger).await }
            })
            .buffer_unordered(this.config.max_concurrency)
            .try_collect()
            .await?;

        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Sent => report.sent += 1,
                DispatchOutcome::AlreadySent | DispatchOutcome::InFlight => report.skipped += 1,
                DispatchOutcome::Failed => report.failed += 1,
            }
        }

        report.timers_armed = Self::arm_timers(this, pairs);
        Ok(report)
    }

    /// Claim, send, then record (or release on failure)
    #[instrument(skip(self, pair, item), fields(
        user_id = pair.user_id,
        exam_id = pair.exam.id,
        milestone = %item.milestone.kind,
        offset_days = item.offset_days
    ))]
    async fn dispatch_item(
        &self,
        pair: &TrackedPair,
        item: DueItem,
        trigger: DispatchTrigger,
    ) -> Result<DispatchOutcome, LedgerError> {
        let key = item.dispatch_key(pair.user_id);
        let owner = Uuid::new_v4();

        match self
            .ledger
            .try_claim(&key, owner, self.clock.now(), self.config.claim_ttl)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadySent => {
                debug!("Alert already sent");
                telemetry::record_alert_skipped("already_sent");
                return Ok(DispatchOutcome::AlreadySent);
            }
            ClaimOutcome::InFlight => {
                debug!("Alert in flight elsewhere");
                telemetry::record_alert_skipped("in_flight");
                return Ok(DispatchOutcome::InFlight);
            }
        }

        let notice = AlertNotice::new(pair, &item);
        if let Err(e) = self.dispatcher.dispatch(&notice).await {
            warn!(error = %e, "Alert not accepted by gateway, will retry on next sweep");
            telemetry::record_alert_failed(item.milestone.kind.as_str(), gateway_failure_reason(&e));
            if let Err(release_err) = self.ledger.release(&key, owner).await {
                warn!(error = %release_err, "Failed to release dispatch claim");
            }
            return Ok(DispatchOutcome::Failed);
        }

        let record = DispatchRecord::new(key, pair.contact.clone(), trigger, self.clock.now());
        match self.ledger.record_sent(&record).await {
            Ok(()) => {
                info!(trigger = %trigger, "Alert sent");
                telemetry::record_alert_sent(item.milestone.kind.as_str(), &trigger.to_string());
                Ok(DispatchOutcome::Sent)
            }
            Err(LedgerError::Conflict(reason)) => {
                warn!(reason = %reason, "Alert was recorded concurrently");
                telemetry::record_alert_skipped("already_sent");
                Ok(DispatchOutcome::AlreadySent)
            }
            Err(e) => {
                // The claim stays in place until it expires, holding off a resend
                error!(error = %e, "Alert sent but not recorded");
                Err(e)
            }
        }
    }

    /// Arm one-shot timers for configured offsets that fire before the next sweep.
    ///
    /// With a daily sweep at local midnight, a timer for an offset that was
    /// already due at that sweep acts as a same-day retry: it sends only if
    /// the sweep's gateway call failed, and otherwise ends as `AlreadySent`.
    fn arm_timers(this: &Arc<Self>, pairs: &[TrackedPair]) -> usize {
        if this.config.timer_offsets_days.is_empty() {
            return 0;
        }

        let now = this.clock.now();
        let next_sweep = match cadence::next_sweep_after(&this.schedule, this.config.timezone, now) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "No next sweep, timers not armed");
                return 0;
            }
        };

        let mut armed = 0;
        for pair in pairs {
            let (milestones, _) = crate::catalog::milestones(&pair.exam);
            for milestone in milestones {
                for &offset in &this.config.timer_offsets_days {
                    let Some(fire_at) = cadence::timer_fire_at(
                        milestone.date,
                        offset,
                        this.config.timer_time_of_day,
                        this.config.timezone,
                    ) else {
                        continue;
                    };
                    if fire_at <= now || fire_at >= next_sweep {
                        continue;
                    }
                    let Ok(delay) = (fire_at - now).to_std() else {
                        continue;
                    };

                    let key = crate::models::DispatchKey {
                        user_id: pair.user_id,
                        exam_id: pair.exam.id,
                        kind: milestone.kind,
                        offset_days: offset,
                        milestone_date: milestone.date,
                    };
                    let engine = Arc::clone(this);
                    let (user_id, exam_id, kind) = (pair.user_id, pair.exam.id, milestone.kind);
                    if this.timers.arm(key, delay, async move {
                        engine.fire_timer(user_id, exam_id, kind, offset).await;
                    }) {
                        armed += 1;
                    }
                }
            }
        }

        armed
    }

    /// Re-resolve the pair and dispatch if the offset is still due today
    #[instrument(skip(self))]
    async fn fire_timer(&self, user_id: i64, exam_id: i64, kind: MilestoneKind, offset_days: u32) {
        let pairs = match self.resolver.tracked_pairs_for_user(user_id).await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(error = %e, "Timer could not resolve subscription, leaving it to the sweep");
                return;
            }
        };
        let Some(pair) = pairs.into_iter().find(|p| p.exam.id == exam_id) else {
            debug!("Subscription no longer exists");
            return;
        };

        let today = self.clock.today(self.config.timezone);
        let (due, _) = evaluator::evaluate_pair(today, &pair);
        let Some(item) = due
            .into_iter()
            .find(|item| item.milestone.kind == kind && item.offset_days == offset_days)
        else {
            debug!("Timer fired but alert is no longer due");
            return;
        };

        if let Err(e) = self.dispatch_item(&pair, item, DispatchTrigger::Timer).await {
            warn!(error = %e, "Timer dispatch failed, leaving it to the sweep");
        }
    }
}

fn gateway_failure_reason(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::InvalidAddress { .. } => "invalid_address",
        GatewayError::Rejected(_) => "rejected",
        GatewayError::Transport(_) => "transport",
        GatewayError::Config(_) => "config",
    }
}

impl AlertEngine {
    /// Run a sweep, abandoning it if shutdown is signalled first.
    ///
    /// Items already sent but not yet recorded keep their claim until it
    /// expires.
    async fn sweep_until_shutdown(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            result = self.run_sweep() => {
                if let Err(e) = result {
                    warn!(error = %e, "Sweep did not complete");
                }
            }
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                info!("Shutdown signal received, abandoning sweep in progress");
            }
        }
    }
}

#[async_trait]
impl Scheduler for AlertEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), ScheduleError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            sweep_cron = %self.inner.config.sweep_cron,
            timezone = %self.inner.config.timezone,
            "Starting alert engine"
        );

        if self.inner.config.sweep_on_startup && !*shutdown_rx.borrow() {
            self.sweep_until_shutdown(&mut shutdown_rx).await;
        }

        while !*shutdown_rx.borrow() {
            let now = self.inner.clock.now();
            let next = cadence::next_sweep_after(&self.inner.schedule, self.inner.config.timezone, now)?;
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next_sweep = %next, "Waiting for next sweep");

            let shutdown = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = shutdown_rx.changed() => true,
            };
            if shutdown {
                info!("Shutdown signal received, stopping alert engine");
                break;
            }

            self.sweep_until_shutdown(&mut shutdown_rx).await;
        }

        info!("Alert engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) {
        info!("Stopping alert engine");
        self.shutdown_tx.send_replace(true);
        self.inner.timers.cancel_all();
    }

    async fn run_sweep(&self) -> Result<SweepReport, SweepError> {
        EngineInner::sweep(&self.inner).await
    }
}
