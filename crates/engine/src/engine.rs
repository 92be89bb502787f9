use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use drip_channels::{DeliveryAdapter, MessageComposer};
use drip_core::config::AppConfig;
use drip_core::event_bus::{noop_sink, EventSink};
use drip_core::types::{FlowEvent, FlowEventKind, FlowStatus, RunLogEntry};
use drip_core::{DripResult, StoreError};
use drip_store::{
    AccountDirectory, EntrySource, FlowCatalog, RunLog, StatusStore, TransactionLedger,
};

use crate::advancer::{AdvanceOutcome, Advancer};
use crate::retry::RetryPolicy;
use crate::scanner::DueScanner;
use crate::state_machine::{FlowStateMachine, StateKind, Trigger};
use crate::triggers::{EnrollmentTriggers, TriggerReport};

/// Everything the engine reads from or writes to.
#[derive(Clone)]
pub struct EngineDeps {
    pub catalog: Arc<dyn FlowCatalog>,
    pub statuses: Arc<dyn StatusStore>,
    pub run_log: Arc<dyn RunLog>,
    pub entries: Arc<dyn EntrySource>,
    pub ledger: Arc<dyn TransactionLedger>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub delivery: Arc<dyn DeliveryAdapter>,
}

/// Batch summary returned by every invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Due rows handed to the advancer.
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    pub completed: u32,
    pub skipped: u32,
    pub enrolled: u32,
    pub branch_skipped: u32,
    pub chained: u32,
    /// Per-row errors plus failed deliveries.
    pub errors: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    fn absorb_triggers(&mut self, report: &TriggerReport) {
        self.enrolled += report.enrolled;
        self.branch_skipped += report.branch_skipped;
        self.chained += report.chained;
        self.errors += report.errors;
    }

    fn absorb_outcome(&mut self, outcome: &AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::Sent { next_send_at, .. } => {
                self.sent += 1;
                if next_send_at.is_none() {
                    self.completed += 1;
                }
            }
            AdvanceOutcome::Completed => self.completed += 1,
            AdvanceOutcome::Failed { .. } => {
                self.failed += 1;
                self.errors += 1;
            }
            AdvanceOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Everything recorded about one phone number, for support lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberHistory {
    pub phone: String,
    pub statuses: Vec<FlowStatus>,
    pub attempts: Vec<RunLogEntry>,
}

/// One invocation of the drip engine: triggers, due scan, advance loop.
///
/// Holds no per-invocation state, so a single instance can be driven by a
/// cron-style loop or invoked once and dropped.
pub struct FlowEngine {
    triggers: EnrollmentTriggers,
    scanner: DueScanner,
    advancer: Advancer,
    machine: FlowStateMachine,
    statuses: Arc<dyn StatusStore>,
    run_log: Arc<dyn RunLog>,
    events: Arc<dyn EventSink>,
    node_id: String,
}

impl FlowEngine {
    pub fn new(config: &AppConfig, deps: EngineDeps) -> DripResult<Self> {
        config.validate()?;
        let composer = MessageComposer::new(config.composer.clone())?;
        let lease = config.claim_lease()?;

        let triggers = EnrollmentTriggers::new(
            config.enrollment.clone(),
            deps.statuses.clone(),
            deps.entries,
            deps.ledger,
            deps.accounts,
            lease,
            config.node_id.clone(),
        );
        let scanner = DueScanner::new(
            deps.catalog.clone(),
            deps.statuses.clone(),
            config.batch_size,
            lease,
        );
        let advancer = Advancer::new(
            deps.catalog,
            deps.statuses.clone(),
            deps.run_log.clone(),
            deps.delivery,
            composer,
            RetryPolicy::from_config(&config.retry)?,
            lease,
            config.node_id.clone(),
        );

        info!(
            node_id = %config.node_id,
            batch_size = config.batch_size,
            lease_secs = config.claim_lease_secs,
            "Flow engine initialized"
        );

        Ok(Self {
            triggers,
            scanner,
            advancer,
            machine: FlowStateMachine::new(),
            statuses: deps.statuses,
            run_log: deps.run_log,
            events: noop_sink(),
            node_id: config.node_id.clone(),
        })
    }

    /// Attach an event sink for emitting flow events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.triggers.events = sink.clone();
        self.advancer.events = sink.clone();
        self.events = sink;
        self
    }

    /// Run one invocation as of `now`. A fatal error aborts and is returned;
    /// the rows already advanced keep their new state.
    pub async fn run_once(&self, now: DateTime<Utc>) -> DripResult<RunSummary> {
        let mut summary = RunSummary::default();
        let started = Instant::now();
        let result = self.run_into(now, &mut summary).await;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        result.map(|()| {
            summary.success = true;
            summary
        })
    }

    /// Like [`run_once`](Self::run_once) but always returns a summary. A
    /// fatal error is reported through `success` and `error`, alongside the
    /// counts gathered before it.
    pub async fn invoke(&self, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::default();
        let started = Instant::now();
        let result = self.run_into(now, &mut summary).await;
        summary.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                summary.success = true;
                info!(
                    processed = summary.processed,
                    sent = summary.sent,
                    failed = summary.failed,
                    completed = summary.completed,
                    enrolled = summary.enrolled,
                    errors = summary.errors,
                    duration_ms = summary.duration_ms,
                    "Invocation complete"
                );
                metrics::counter!("drip.runs", "status" => "ok").increment(1);
            }
            Err(err) => {
                error!(error = %err, processed = summary.processed, "Invocation aborted");
                summary.success = false;
                summary.error = Some(err.to_string());
                metrics::counter!("drip.runs", "status" => "failed").increment(1);
            }
        }
        metrics::histogram!("drip.run_duration_ms").record(summary.duration_ms as f64);
        summary
    }

    async fn run_into(&self, now: DateTime<Utc>, summary: &mut RunSummary) -> DripResult<()> {
        let report = self.triggers.run(now).await?;
        summary.absorb_triggers(&report);

        let due = self.scanner.scan(now).await?;
        for status in due {
            summary.processed += 1;
            match self.advancer.advance(status.id, now).await {
                Ok(outcome) => summary.absorb_outcome(&outcome),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        status_id = %status.id,
                        flow_id = %status.flow_id,
                        error = %err,
                        "Failed to advance flow status"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Operator pause or resume. Returns `None` when the row's state has no
    /// such edge, which is the case for completed rows.
    pub async fn set_paused(
        &self,
        status_id: Uuid,
        paused: bool,
        now: DateTime<Utc>,
    ) -> DripResult<Option<FlowStatus>> {
        let current = self.status(status_id).await?;
        let from = StateKind::from(&current.state);
        let (to, trigger) = if paused {
            (StateKind::Paused, Trigger::OperatorPause)
        } else {
            (StateKind::Scheduled, Trigger::OperatorResume)
        };
        if from == to {
            return Ok(Some(current));
        }
        if !self.machine.can_transition(from, to, trigger) {
            warn!(status_id = %status_id, ?from, ?trigger, "Operator command not allowed");
            return Ok(None);
        }

        let updated = self.statuses.set_paused(status_id, paused, now).await?;
        match &updated {
            Some(status) if paused && status.is_paused() => {
                info!(status_id = %status_id, "Flow status paused by operator");
                self.events.emit(FlowEvent::for_status(
                    FlowEventKind::Paused,
                    status,
                    None,
                    &self.node_id,
                    now,
                ));
            }
            Some(_) => info!(status_id = %status_id, paused, "Flow status pause flag set"),
            None => warn!(status_id = %status_id, "Flow status completed before operator command"),
        }
        Ok(updated)
    }

    /// Every flow status and delivery attempt recorded for `phone`.
    pub async fn history(&self, phone: &str) -> DripResult<SubscriberHistory> {
        let statuses = self.statuses.for_subscriber(phone).await?;
        let attempts = self.run_log.for_subscriber(phone).await?;
        Ok(SubscriberHistory {
            phone: phone.to_string(),
            statuses,
            attempts,
        })
    }

    /// Looks up a single status row.
    pub async fn status(&self, status_id: Uuid) -> DripResult<FlowStatus> {
        self.statuses
            .get(status_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(status_id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use chrono::Duration;
    use drip_core::types::ContestEntry;
    use drip_core::{DeliveryError, DripError};

    fn contest_entry(h: &Harness, phone: &str) -> ContestEntry {
        ContestEntry {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            account_id: None,
            prize_code: "FREE_SHOUTOUT".to_string(),
            created_at: h.now - Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn test_new_entry_is_sent_in_same_invocation() {
        let h = Harness::new();
        h.entries.push(contest_entry(&h, "+15550000001"));
        let engine = h.engine();

        let summary = engine.run_once(h.now).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.enrolled, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.errors, 0);

        let sent = h.delivery.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+15550000001");
        assert!(sent[0].body.ends_with("coupon=WINNER100"));
    }

    #[tokio::test]
    async fn test_second_invocation_is_quiet() {
        let h = Harness::new();
        h.entries.push(contest_entry(&h, "+15550000001"));
        let engine = h.engine();
        engine.run_once(h.now).await.unwrap();

        let summary = engine.run_once(h.now + Duration::minutes(5)).await.unwrap();
        assert_eq!(summary.enrolled, 0);
        assert_eq!(summary.processed, 0);
        assert_eq!(h.delivery.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_processing() {
        let h = Harness::new();
        for i in 0..5 {
            h.enroll(&format!("+1555000000{}", i), "ongoing", h.now).await;
        }
        let mut config = h.config();
        config.batch_size = 2;
        let engine = h.engine_with(config);

        let summary = engine.run_once(h.now).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.completed, 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_counted_not_fatal() {
        let h = Harness::new();
        h.enroll("+15550000001", "ongoing", h.now).await;
        h.enroll("+15550000002", "ongoing", h.now).await;
        h.delivery
            .fail_next(DeliveryError::Transport("timeout".into()));

        let summary = h.engine().invoke(h.now).await;
        assert!(summary.success);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn test_fatal_delivery_error_aborts_with_partial_counts() {
        let h = Harness::new();
        h.enroll("+15550000001", "ongoing", h.now - Duration::minutes(2)).await;
        h.enroll("+15550000002", "ongoing", h.now - Duration::minutes(1)).await;
        h.enroll("+15550000003", "ongoing", h.now).await;
        let engine = h.engine();
        // First row fails transport, second finds credentials missing.
        h.delivery
            .fail_next(DeliveryError::Transport("timeout".into()));
        h.delivery
            .fail_next(DeliveryError::NotConfigured("missing sms.auth_token".into()));

        let summary = engine.invoke(h.now).await;
        assert!(!summary.success);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.error.as_deref().unwrap().contains("not configured"));

        let rerun = engine.run_once(h.now).await.unwrap();
        assert_eq!(rerun.sent, 3);
    }

    #[tokio::test]
    async fn test_store_outage_is_fatal() {
        let h = Harness::new();
        h.enroll("+15550000001", "ongoing", h.now).await;
        h.statuses.set_available(false);

        let err = h.engine().run_once(h.now).await.unwrap_err();
        assert!(matches!(err, DripError::Store(StoreError::Unavailable(_))));
        assert!(h.delivery.sent().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let h = Harness::new();
        let mut config = h.config();
        config.batch_size = 0;
        assert!(FlowEngine::new(&config, h.deps()).is_err());

        let mut config = h.config();
        config.claim_lease_secs = u64::MAX;
        assert!(matches!(
            FlowEngine::new(&config, h.deps()),
            Err(DripError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = Harness::new();
        let id = h.enroll("+15550000001", "ongoing", h.now).await;
        let engine = h.engine();

        let paused = engine.set_paused(id, true, h.now).await.unwrap().unwrap();
        assert!(paused.is_paused());
        let summary = engine.run_once(h.now).await.unwrap();
        assert_eq!(summary.processed, 0);

        let later = h.now + Duration::hours(1);
        let resumed = engine.set_paused(id, false, later).await.unwrap().unwrap();
        assert_eq!(resumed.next_send_at(), Some(later));
        let summary = engine.run_once(later).await.unwrap();
        assert_eq!(summary.sent, 1);

        assert!(engine.set_paused(id, true, later).await.unwrap().is_none());
        assert_eq!(h.events.count_kind(FlowEventKind::Paused), 1);
    }

    #[tokio::test]
    async fn test_operator_commands_follow_transition_table() {
        let h = Harness::new();
        let id = h.enroll("+15550000001", "ongoing", h.now).await;
        let engine = h.engine();

        // Resuming a scheduled row changes nothing.
        let same = engine.set_paused(id, false, h.now).await.unwrap().unwrap();
        assert_eq!(same.next_send_at(), Some(h.now));

        engine.set_paused(id, true, h.now).await.unwrap();
        let again = engine.set_paused(id, true, h.now).await.unwrap().unwrap();
        assert!(again.is_paused());
        assert_eq!(h.events.count_kind(FlowEventKind::Paused), 1);

        let missing = engine.set_paused(Uuid::new_v4(), true, h.now).await.unwrap_err();
        assert!(matches!(missing, DripError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_lists_rows_and_attempts() {
        let h = Harness::new();
        h.entries.push(contest_entry(&h, "+15550000001"));
        let engine = h.engine();
        engine.run_once(h.now).await.unwrap();

        let history = engine.history("+15550000001").await.unwrap();
        assert_eq!(history.statuses.len(), 2);
        assert_eq!(history.attempts.len(), 1);
        assert_eq!(history.attempts[0].sequence, 1);
    }

    #[test]
    fn test_summary_serializes_without_error_on_success() {
        let summary = RunSummary {
            sent: 3,
            success: true,
            ..RunSummary::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["sent"], 3);
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }
}
