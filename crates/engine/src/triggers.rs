//! Enrollment triggers: initial enrollment from contest entries, the
//! coupon-redeemed branch skip, and chaining from follow-up to ongoing.
//!
//! Each routine is idempotent. Enrollment relies on the store's atomic
//! `insert_if_absent`, so running a trigger twice (or from two overlapping
//! invocations) never produces a second row for the same phone and flow.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use drip_core::config::EnrollmentConfig;
use drip_core::event_bus::{noop_sink, EventSink};
use drip_core::types::{
    CompletionReason, ContestEntry, FlowEvent, FlowEventKind, FlowId, FlowStatus, Subscriber,
};
use drip_core::DripResult;
use drip_store::{AccountDirectory, EntrySource, InsertOutcome, StatusStore, TransactionLedger};

use crate::state_machine::{FlowStateMachine, StateKind, Trigger};

/// Counters produced by one pass of the triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReport {
    pub enrolled: u32,
    pub duplicates: u32,
    pub branch_skipped: u32,
    pub chained: u32,
    pub errors: u32,
}

impl TriggerReport {
    fn merge(&mut self, other: TriggerReport) {
        self.enrolled += other.enrolled;
        self.duplicates += other.duplicates;
        self.branch_skipped += other.branch_skipped;
        self.chained += other.chained;
        self.errors += other.errors;
    }

    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.enrolled += 1,
            InsertOutcome::AlreadyEnrolled => self.duplicates += 1,
        }
    }
}

pub struct EnrollmentTriggers {
    config: EnrollmentConfig,
    statuses: Arc<dyn StatusStore>,
    entries: Arc<dyn EntrySource>,
    ledger: Arc<dyn TransactionLedger>,
    accounts: Arc<dyn AccountDirectory>,
    lease: Duration,
    machine: FlowStateMachine,
    pub(crate) events: Arc<dyn EventSink>,
    node_id: String,
}

impl EnrollmentTriggers {
    pub fn new(
        config: EnrollmentConfig,
        statuses: Arc<dyn StatusStore>,
        entries: Arc<dyn EntrySource>,
        ledger: Arc<dyn TransactionLedger>,
        accounts: Arc<dyn AccountDirectory>,
        lease: Duration,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            statuses,
            entries,
            ledger,
            accounts,
            lease,
            machine: FlowStateMachine::new(),
            events: noop_sink(),
            node_id: node_id.into(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Run all three routines in order: initial enrollment, branch skip,
    /// chaining. A fatal error aborts immediately; anything else is counted.
    pub async fn run(&self, now: DateTime<Utc>) -> DripResult<TriggerReport> {
        let mut report = self.enroll_new_entries(now).await?;
        report.merge(self.skip_redeemed_follow_ups(now).await?);
        report.merge(self.chain_completed_follow_ups(now).await?);
        Ok(report)
    }

    /// Enroll every entry from the trailing window into the welcome flow
    /// (due now) and the follow-up flow (due after the follow-up delay),
    /// both carrying the coupon for the entry's prize.
    pub async fn enroll_new_entries(&self, now: DateTime<Utc>) -> DripResult<TriggerReport> {
        let cutoff = now - Duration::hours(i64::from(self.config.entry_window_hours));
        let entries = self.entries.entries_since(cutoff).await?;
        let mut report = TriggerReport::default();

        for entry in entries {
            match self.enroll_entry(&entry, now, &mut report).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        phone = %entry.phone,
                        entry_id = %entry.id,
                        error = %err,
                        "Failed to enroll contest entry"
                    );
                    report.errors += 1;
                }
            }
        }

        if report.enrolled > 0 {
            info!(
                enrolled = report.enrolled,
                duplicates = report.duplicates,
                "Enrolled new contest entries"
            );
        }
        Ok(report)
    }

    async fn enroll_entry(
        &self,
        entry: &ContestEntry,
        now: DateTime<Utc>,
        report: &mut TriggerReport,
    ) -> DripResult<()> {
        let welcome = &self.config.welcome_flow;
        let follow_up = &self.config.follow_up_flow;
        if self.statuses.exists(&entry.phone, welcome).await?
            && self.statuses.exists(&entry.phone, follow_up).await?
        {
            report.duplicates += 2;
            return Ok(());
        }

        let coupon = self.config.coupon_for_prize(&entry.prize_code).map(String::from);
        if coupon.is_none() {
            debug!(phone = %entry.phone, prize_code = %entry.prize_code, "No coupon for prize");
        }

        let mut subscriber = Subscriber::new(entry.phone.clone());
        let mut metadata = HashMap::from([("prize".to_string(), entry.prize_code.clone())]);
        subscriber.account_id = entry.account_id;
        if let Some(account) = self.accounts.account_for_phone(&entry.phone).await? {
            subscriber.account_id = Some(account.id);
            if let Some(name) = account.display_name {
                metadata.insert("name".to_string(), name);
            }
        }
        if let Some(account_id) = subscriber.account_id {
            metadata.insert("account_id".to_string(), account_id.to_string());
        }

        let follow_up_at = now + Duration::hours(i64::from(self.config.follow_up_delay_hours));
        for (flow_id, send_at) in [(welcome, now), (follow_up, follow_up_at)] {
            let status = FlowStatus::enroll(subscriber.clone(), flow_id.clone(), send_at, now)
                .with_coupon(coupon.clone())
                .with_metadata(metadata.clone());
            self.insert(status, now, report).await?;
        }
        Ok(())
    }

    /// Complete follow-up rows that are due for their first message when
    /// the coupon they carry has already been redeemed. Nothing is sent and
    /// nothing is written to the run log for these rows.
    pub async fn skip_redeemed_follow_ups(&self, now: DateTime<Utc>) -> DripResult<TriggerReport> {
        let candidates = self
            .statuses
            .awaiting_first_send(&self.config.follow_up_flow, now)
            .await?;
        let mut report = TriggerReport::default();

        for status in candidates {
            let Some(code) = status.coupon_code.as_deref() else {
                continue;
            };
            match self.skip_if_redeemed(&status, code, now).await {
                Ok(true) => report.branch_skipped += 1,
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(status_id = %status.id, error = %err, "Branch check failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn skip_if_redeemed(
        &self,
        status: &FlowStatus,
        code: &str,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        if !self.ledger.coupon_redeemed(code).await? {
            return Ok(false);
        }
        self.machine.ensure(
            StateKind::from(&status.state),
            StateKind::Completed,
            Trigger::CouponRedeemed,
        )?;
        // Conditional: loses to an advancer that claimed the row first.
        let Some(updated) = self
            .statuses
            .complete_if_untouched(status.id, now, CompletionReason::CouponRedeemed, self.lease)
            .await?
        else {
            debug!(status_id = %status.id, "Row changed before branch skip, leaving it");
            return Ok(false);
        };

        info!(
            status_id = %updated.id,
            flow_id = %updated.flow_id,
            coupon = %code,
            "Coupon already redeemed, follow-up skipped"
        );
        metrics::counter!("drip.branch_skipped").increment(1);
        self.emit(FlowEventKind::BranchSkipped, &updated, now);
        Ok(true)
    }

    /// Enroll subscribers whose follow-up flow completed at least the
    /// cooldown ago into the ongoing flow, due immediately.
    pub async fn chain_completed_follow_ups(&self, now: DateTime<Utc>) -> DripResult<TriggerReport> {
        let cutoff = now - Duration::days(i64::from(self.config.chain_cooldown_days));
        let completed = self
            .statuses
            .completed_before(&self.config.follow_up_flow, cutoff)
            .await?;
        let mut report = TriggerReport::default();

        for source in completed {
            match self
                .chain_one(&source, &self.config.ongoing_flow, now, &mut report)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(status_id = %source.id, error = %err, "Chained enrollment failed");
                    report.errors += 1;
                }
            }
        }

        if report.chained > 0 {
            info!(chained = report.chained, "Chained follow-up completions into ongoing flow");
        }
        Ok(report)
    }

    async fn chain_one(
        &self,
        source: &FlowStatus,
        target: &FlowId,
        now: DateTime<Utc>,
        report: &mut TriggerReport,
    ) -> DripResult<()> {
        if self.statuses.exists(source.phone(), target).await? {
            return Ok(());
        }
        let status = FlowStatus::enroll(source.subscriber.clone(), target.clone(), now, now)
            .with_metadata(source.metadata.clone());
        let mut inner = TriggerReport::default();
        self.insert(status, now, &mut inner).await?;
        report.chained += inner.enrolled;
        Ok(())
    }

    async fn insert(
        &self,
        status: FlowStatus,
        now: DateTime<Utc>,
        report: &mut TriggerReport,
    ) -> DripResult<()> {
        let outcome = self.statuses.insert_if_absent(status.clone()).await?;
        report.record(outcome);

        if outcome == InsertOutcome::Inserted {
            debug!(
                status_id = %status.id,
                phone = %status.subscriber.phone,
                flow_id = %status.flow_id,
                next_send_at = ?status.next_send_at(),
                "Subscriber enrolled"
            );
            metrics::counter!("drip.enrollments", "flow" => status.flow_id.to_string()).increment(1);
            self.emit(FlowEventKind::Entered, &status, now);
        }
        Ok(())
    }

    fn emit(&self, kind: FlowEventKind, status: &FlowStatus, now: DateTime<Utc>) {
        self.events
            .emit(FlowEvent::for_status(kind, status, None, &self.node_id, now));
    }
}
