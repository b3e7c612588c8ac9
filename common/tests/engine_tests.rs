// Behaviour tests for the alert engine against in-memory collaborators

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::clock::FixedClock;
use common::errors::{GatewayError, LedgerError, ResolverError, SweepError};
use common::ledger::{ClaimOutcome, DispatchLedger, InMemoryDispatchLedger};
use common::lock::{DistributedLock, LocalLock, SWEEP_LEASE_RESOURCE};
use common::models::{
    DispatchKey, DispatchRecord, DispatchTrigger, Exam, MilestoneKind, TrackedPair,
};
use common::notify::{MessagingGateway, NotificationDispatcher};
use common::resolver::{StaticSubscriptionResolver, SubscriptionResolver};
use common::scheduler::{AlertEngine, EngineConfig, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SentMessage {
    to: String,
    subject: String,
    body: String,
}

/// Gateway that records messages and can fail or stall on demand
#[derive(Default)]
struct RecordingGateway {
    sent: Mutex<Vec<SentMessage>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingGateway {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }

        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "recording"
    }
}

struct UnavailableResolver;

#[async_trait]
impl SubscriptionResolver for UnavailableResolver {
    async fn list_tracked_pairs(&self) -> Result<Vec<TrackedPair>, ResolverError> {
        Err(ResolverError::Unavailable("connection reset".to_string()))
    }
}

struct UnavailableLedger;

#[async_trait]
impl DispatchLedger for UnavailableLedger {
    async fn has_sent(&self, _key: &DispatchKey) -> Result<bool, LedgerError> {
        Err(LedgerError::Unavailable("down".to_string()))
    }

    async fn try_claim(
        &self,
        _key: &DispatchKey,
        _owner: Uuid,
        _now: DateTime<Utc>,
        _ttl: chrono::Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        Err(LedgerError::Unavailable("down".to_string()))
    }

    async fn record_sent(&self, _record: &DispatchRecord) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable("down".to_string()))
    }

    async fn release(&self, _key: &DispatchKey, _owner: Uuid) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable("down".to_string()))
    }

    async fn prune(&self, _before: NaiveDate) -> Result<u64, LedgerError> {
        Err(LedgerError::Unavailable("down".to_string()))
    }
}

/// Ledger whose claims work but whose records cannot be written
#[derive(Default)]
struct RecordFailingLedger {
    inner: InMemoryDispatchLedger,
}

#[async_trait]
impl DispatchLedger for RecordFailingLedger {
    async fn has_sent(&self, key: &DispatchKey) -> Result<bool, LedgerError> {
        self.inner.has_sent(key).await
    }

    async fn try_claim(
        &self,
        key: &DispatchKey,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        self.inner.try_claim(key, owner, now, ttl).await
    }

    async fn record_sent(&self, _record: &DispatchRecord) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable("write timed out".to_string()))
    }

    async fn release(&self, key: &DispatchKey, owner: Uuid) -> Result<(), LedgerError> {
        self.inner.release(key, owner).await
    }

    async fn prune(&self, before: NaiveDate) -> Result<u64, LedgerError> {
        self.inner.prune(before).await
    }
}

struct Harness {
    engine: Arc<AlertEngine>,
    ledger: Arc<InMemoryDispatchLedger>,
    gateway: Arc<RecordingGateway>,
    resolver: Arc<StaticSubscriptionResolver>,
    clock: Arc<FixedClock>,
}

fn no_timers() -> EngineConfig {
    EngineConfig {
        timer_offsets_days: Vec::new(),
        ..EngineConfig::default()
    }
}

fn harness(
    config: EngineConfig,
    pairs: Vec<TrackedPair>,
    gateway: RecordingGateway,
    now: DateTime<Utc>,
) -> Harness {
    let ledger = Arc::new(InMemoryDispatchLedger::new());
    let gateway = Arc::new(gateway);
    let resolver = Arc::new(StaticSubscriptionResolver::new(pairs));
    let clock = Arc::new(FixedClock::new(now));

    let engine = AlertEngine::new(
        config,
        resolver.clone(),
        ledger.clone(),
        NotificationDispatcher::new(gateway.clone()),
        clock.clone(),
    )
    .unwrap();

    Harness {
        engine: Arc::new(engine),
        ledger,
        gateway,
        resolver,
        clock,
    }
}

/// 2025-10-26, noon UTC
fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 26, 12, 0, 0).unwrap()
}

fn enem() -> Exam {
    Exam::new(1, "ENEM 2025", "MEC")
        .with_milestone(MilestoneKind::FirstPhase, "2025-11-02")
        .with_milestone(MilestoneKind::Results, "2025-12-10")
        .with_milestone(MilestoneKind::Enrollment, "2025-10-26")
}

fn pair(user_id: i64, exam: Exam) -> TrackedPair {
    TrackedPair::new(user_id, format!("user{}@example.com", user_id), exam)
}

#[tokio::test]
async fn sweep_sends_each_due_alert_once() {
    let h = harness(no_timers(), vec![pair(1, enem())], RecordingGateway::default(), noon());

    let first = h.engine.run_sweep().await.unwrap();
    assert_eq!(first.pairs, 1);
    assert_eq!(first.due, 2);
    assert_eq!(first.sent, 2);

    let sent = h.gateway.sent();
    assert!(sent.iter().all(|m| m.to == "user1@example.com"));
    assert!(sent
        .iter()
        .any(|m| m.subject == "Alert: First Phase - ENEM 2025 (MEC)"
            && m.body.contains("There are 7 day(s) left")));
    assert!(sent
        .iter()
        .any(|m| m.subject == "Alert: Enrollment - ENEM 2025 (MEC)" && m.body.contains("is today")));

    let second = h.engine.run_sweep().await.unwrap();
    assert_eq!(second.sent, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(h.gateway.sent().len(), 2);
    assert_eq!(h.ledger.record_count(), 2);
    assert!(h
        .ledger
        .records()
        .iter()
        .all(|r| r.trigger == DispatchTrigger::Sweep));
}

#[tokio::test]
async fn concurrent_engines_on_one_ledger_send_once() {
    let ledger = Arc::new(InMemoryDispatchLedger::new());
    let gateway = Arc::new(RecordingGateway::with_delay(Duration::from_millis(20)));
    let resolver = Arc::new(StaticSubscriptionResolver::new(vec![pair(
        1,
        Exam::new(2, "Fuvest", "USP").with_milestone(MilestoneKind::SecondPhase, "2025-10-29"),
    )]));

    let engines: Vec<AlertEngine> = (0..8)
        .map(|_| {
            AlertEngine::new(
                no_timers(),
                resolver.clone(),
                ledger.clone(),
                NotificationDispatcher::new(gateway.clone()),
                Arc::new(FixedClock::new(noon())),
            )
            .unwrap()
        })
        .collect();

    let reports = futures::future::join_all(engines.iter().map(|e| e.run_sweep())).await;

    let sent: usize = reports.iter().map(|r| r.as_ref().unwrap().sent).sum();
    let skipped: usize = reports.iter().map(|r| r.as_ref().unwrap().skipped).sum();
    assert_eq!(sent, 1);
    assert_eq!(skipped, 7);
    assert_eq!(gateway.sent().len(), 1);
    assert_eq!(ledger.record_count(), 1);
}

#[tokio::test]
async fn gateway_failure_is_retried_on_next_sweep() {
    let exam = Exam::new(3, "Unicamp", "Unicamp").with_milestone(MilestoneKind::PaymentDeadline, "2025-10-29");
    let h = harness(no_timers(), vec![pair(1, exam)], RecordingGateway::failing(1), noon());

    let first = h.engine.run_sweep().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.sent, 0);
    assert_eq!(h.ledger.record_count(), 0);

    let second = h.engine.run_sweep().await.unwrap();
    assert_eq!(second.sent, 1);
    assert_eq!(h.ledger.record_count(), 1);
    assert_eq!(h.gateway.sent().len(), 1);
}

#[tokio::test]
async fn each_subscriber_gets_their_own_alert() {
    let exam = Exam::new(4, "UERJ", "UERJ").with_milestone(MilestoneKind::EndRegistration, "2025-11-05");
    let h = harness(
        no_timers(),
        vec![pair(1, exam.clone()), pair(2, exam)],
        RecordingGateway::default(),
        noon(),
    );

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.sent, 2);

    let mut recipients: Vec<String> = h.gateway.sent().into_iter().map(|m| m.to).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["user1@example.com", "user2@example.com"]);
}

#[tokio::test]
async fn milestone_outside_lead_times_waits_for_thirty_day_mark() {
    // 45 days out
    let exam = Exam::new(5, "UFMG", "UFMG").with_milestone(MilestoneKind::FirstPhase, "2025-12-10");
    let h = harness(no_timers(), vec![pair(1, exam)], RecordingGateway::default(), noon());

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.due, 0);
    assert!(h.gateway.sent().is_empty());

    h.clock.advance(chrono::Duration::days(15));
    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(h.gateway.sent()[0].body.contains("There are 30 day(s) left"));
}

#[tokio::test]
async fn past_milestones_never_alert() {
    let exam = Exam::new(6, "Old", "Old").with_milestone(MilestoneKind::Results, "2025-10-25");
    let h = harness(no_timers(), vec![pair(1, exam)], RecordingGateway::default(), noon());

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.due, 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn malformed_milestone_does_not_block_others() {
    let exam = Exam::new(7, "Mixed", "Mixed")
        .with_milestone(MilestoneKind::FirstCall, "soon")
        .with_milestone(MilestoneKind::SecondCall, "2025-10-27");
    let h = harness(no_timers(), vec![pair(1, exam)], RecordingGateway::default(), noon());

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.invalid_milestones, 1);
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn today_follows_engine_timezone() {
    let config = EngineConfig {
        timezone: chrono_tz::America::Sao_Paulo,
        ..no_timers()
    };
    let exam = Exam::new(8, "UnB", "UnB").with_milestone(MilestoneKind::Results, "2025-10-27");
    // 02:00 UTC is still 23:00 on the 26th in Sao Paulo
    let now = Utc.with_ymd_and_hms(2025, 10, 27, 2, 0, 0).unwrap();
    let h = harness(config, vec![pair(1, exam)], RecordingGateway::default(), now);

    h.engine.run_sweep().await.unwrap();
    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("There are 1 day(s) left"));
}

#[tokio::test]
async fn overlapping_sweep_is_rejected() {
    let exam = Exam::new(9, "Slow", "Slow").with_milestone(MilestoneKind::Enrollment, "2025-10-26");
    let h = harness(
        no_timers(),
        vec![pair(1, exam)],
        RecordingGateway::with_delay(Duration::from_millis(200)),
        noon(),
    );

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.run_sweep().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.engine.is_sweeping());
    assert!(matches!(
        h.engine.run_sweep().await,
        Err(SweepError::AlreadyRunning)
    ));

    assert_eq!(first.await.unwrap().unwrap().sent, 1);
    assert!(!h.engine.is_sweeping());
}

#[tokio::test]
async fn sweep_skipped_while_lease_held_elsewhere() {
    let lock = LocalLock::new();
    let exam = Exam::new(10, "Leased", "Leased").with_milestone(MilestoneKind::Enrollment, "2025-10-26");

    let ledger = Arc::new(InMemoryDispatchLedger::new());
    let gateway = Arc::new(RecordingGateway::default());
    let engine = AlertEngine::new(
        no_timers(),
        Arc::new(StaticSubscriptionResolver::new(vec![pair(1, exam)])),
        ledger.clone(),
        NotificationDispatcher::new(gateway.clone()),
        Arc::new(FixedClock::new(noon())),
    )
    .unwrap()
    .with_lock(Arc::new(lock.clone()));

    let held = lock
        .acquire(SWEEP_LEASE_RESOURCE, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(matches!(
        engine.run_sweep().await,
        Err(SweepError::LeaseUnavailable)
    ));
    assert!(gateway.sent().is_empty());

    drop(held);
    assert_eq!(engine.run_sweep().await.unwrap().sent, 1);
}

#[tokio::test]
async fn resolver_failure_aborts_sweep() {
    let gateway = Arc::new(RecordingGateway::default());
    let engine = AlertEngine::new(
        no_timers(),
        Arc::new(UnavailableResolver),
        Arc::new(InMemoryDispatchLedger::new()),
        NotificationDispatcher::new(gateway.clone()),
        Arc::new(FixedClock::new(noon())),
    )
    .unwrap();

    assert!(matches!(
        engine.run_sweep().await,
        Err(SweepError::ResolverUnavailable(_))
    ));
    assert!(gateway.sent().is_empty());
    assert!(!engine.is_sweeping());
}

#[tokio::test]
async fn ledger_failure_aborts_sweep_without_sending() {
    let gateway = Arc::new(RecordingGateway::default());
    let engine = AlertEngine::new(
        no_timers(),
        Arc::new(StaticSubscriptionResolver::new(vec![pair(1, enem())])),
        Arc::new(UnavailableLedger),
        NotificationDispatcher::new(gateway.clone()),
        Arc::new(FixedClock::new(noon())),
    )
    .unwrap();

    assert!(matches!(
        engine.run_sweep().await,
        Err(SweepError::LedgerUnavailable(_))
    ));
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn sweep_prunes_records_past_retention() {
    let exam = Exam::new(11, "Prune", "Prune").with_milestone(MilestoneKind::Enrollment, "2025-10-26");
    let h = harness(no_timers(), vec![pair(1, exam)], RecordingGateway::default(), noon());

    h.engine.run_sweep().await.unwrap();
    assert_eq!(h.ledger.record_count(), 1);

    // retention_days = 1: on the 28th the cutoff is the 27th
    h.clock.advance(chrono::Duration::days(2));
    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(h.ledger.record_count(), 0);
}

#[tokio::test]
async fn subscription_hook_alerts_new_subscriber_once() {
    let h = harness(no_timers(), Vec::new(), RecordingGateway::default(), noon());
    assert_eq!(h.engine.run_sweep().await.unwrap().pairs, 0);

    h.resolver.subscribe(pair(42, enem()));
    let report = h.engine.on_subscription_created(42).await.unwrap();
    assert_eq!(report.sent, 2);
    assert!(h
        .ledger
        .records()
        .iter()
        .all(|r| r.trigger == DispatchTrigger::Subscription));

    let again = h.engine.on_subscription_created(42).await.unwrap();
    assert_eq!(again.sent, 0);
    let sweep = h.engine.run_sweep().await.unwrap();
    assert_eq!(sweep.sent, 0);
    assert_eq!(h.gateway.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn timer_fires_between_sweeps_and_sweep_does_not_repeat_it() {
    let config = EngineConfig {
        sweep_cron: "0 0 0 * * Mon".to_string(),
        timer_offsets_days: vec![1],
        timer_time_of_day: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        ..EngineConfig::default()
    };
    let exam = Exam::new(12, "Timed", "Timed").with_milestone(MilestoneKind::FirstPhase, "2025-10-31");
    // Wednesday; next weekly sweep is Monday 2025-11-03
    let now = Utc.with_ymd_and_hms(2025, 10, 29, 12, 0, 0).unwrap();
    let h = harness(config, vec![pair(1, exam)], RecordingGateway::default(), now);

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.timers_armed, 1);
    assert_eq!(h.engine.timers_armed(), 1);

    // Re-sweeping does not arm the same timer twice
    assert_eq!(h.engine.run_sweep().await.unwrap().timers_armed, 0);

    h.clock.set(Utc.with_ymd_and_hms(2025, 10, 30, 9, 0, 0).unwrap());
    tokio::time::sleep(Duration::from_secs(22 * 3600)).await;

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].body.contains("There are 1 day(s) left"));
    assert!(h
        .ledger
        .records()
        .iter()
        .any(|r| r.trigger == DispatchTrigger::Timer && r.key.offset_days == 1));

    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_armed_timers() {
    let config = EngineConfig {
        sweep_cron: "0 0 0 * * Mon".to_string(),
        timer_offsets_days: vec![1],
        ..EngineConfig::default()
    };
    let exam = Exam::new(13, "Cancelled", "Cancelled").with_milestone(MilestoneKind::FirstPhase, "2025-10-31");
    let now = Utc.with_ymd_and_hms(2025, 10, 29, 12, 0, 0).unwrap();
    let h = harness(config, vec![pair(1, exam)], RecordingGateway::default(), now);

    h.engine.run_sweep().await.unwrap();
    assert_eq!(h.engine.timers_armed(), 1);

    h.engine.stop().await;
    assert_eq!(h.engine.timers_armed(), 0);

    h.clock.set(Utc.with_ymd_and_hms(2025, 10, 30, 9, 0, 0).unwrap());
    tokio::time::sleep(Duration::from_secs(22 * 3600)).await;
    assert_eq!(h.gateway.sent().len(), 1);
}

#[tokio::test]
async fn unrecorded_send_keeps_claim_and_aborts_sweep() {
    let exam = Exam::new(14, "Unrecorded", "Unrecorded")
        .with_milestone(MilestoneKind::FirstPhase, "2025-11-02");
    let ledger = Arc::new(RecordFailingLedger::default());
    let gateway = Arc::new(RecordingGateway::default());
    let engine = AlertEngine::new(
        no_timers(),
        Arc::new(StaticSubscriptionResolver::new(vec![pair(1, exam)])),
        ledger.clone(),
        NotificationDispatcher::new(gateway.clone()),
        Arc::new(FixedClock::new(noon())),
    )
    .unwrap();

    assert!(matches!(
        engine.run_sweep().await,
        Err(SweepError::LedgerUnavailable(_))
    ));
    assert_eq!(gateway.sent().len(), 1);

    // The claim is still live, so the next sweep does not resend
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(gateway.sent().len(), 1);
}

#[tokio::test]
async fn stop_abandons_sweep_in_progress() {
    let exam = Exam::new(15, "Stalled", "Stalled").with_milestone(MilestoneKind::Enrollment, "2025-10-26");
    let h = harness(
        no_timers(),
        vec![pair(1, exam)],
        RecordingGateway::with_delay(Duration::from_secs(30)),
        noon(),
    );

    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.start().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.engine.is_sweeping());

    h.engine.stop().await;
    let stopped = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("engine did not stop while sweeping");
    assert!(stopped.unwrap().is_ok());

    assert!(!h.engine.is_sweeping());
    assert!(h.gateway.sent().is_empty());
    assert_eq!(h.ledger.record_count(), 0);
}
