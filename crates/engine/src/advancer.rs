use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_channels::{DeliveryAdapter, DeliveryRequest, MessageComposer};
use drip_core::event_bus::{noop_sink, EventSink};
use drip_core::types::{
    DeliveryOutcome, FlowEvent, FlowEventKind, FlowMessage, FlowStatus, RunLogEntry,
};
use drip_core::{DeliveryError, DripResult};
use drip_store::{FlowCatalog, RunLog, StatusStore};

use crate::retry::RetryPolicy;
use crate::state_machine::FlowStateMachine;

/// What happened to one due row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AdvanceOutcome {
    /// Message delivered. `next_send_at` is `None` when the flow completed.
    Sent {
        position: u32,
        next_send_at: Option<DateTime<Utc>>,
    },
    /// No message at the next position; the flow is complete.
    Completed,
    /// Delivery failed; position unchanged.
    Failed { attempts: u32, paused: bool },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another invocation holds the row, or it stopped being due.
    NotClaimed,
    /// The row references a flow the catalog does not know.
    FlowMissing,
}

/// Drives a single due row one step forward: claim, look up, compose,
/// deliver, log, commit.
pub struct Advancer {
    catalog: Arc<dyn FlowCatalog>,
    statuses: Arc<dyn StatusStore>,
    run_log: Arc<dyn RunLog>,
    delivery: Arc<dyn DeliveryAdapter>,
    composer: MessageComposer,
    machine: FlowStateMachine,
    retry: RetryPolicy,
    lease: Duration,
    pub(crate) events: Arc<dyn EventSink>,
    node_id: String,
}

impl std::fmt::Debug for Advancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advancer")
            .field("retry", &self.retry)
            .field("lease", &self.lease)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Advancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn FlowCatalog>,
        statuses: Arc<dyn StatusStore>,
        run_log: Arc<dyn RunLog>,
        delivery: Arc<dyn DeliveryAdapter>,
        composer: MessageComposer,
        retry: RetryPolicy,
        lease: Duration,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            statuses,
            run_log,
            delivery,
            composer,
            machine: FlowStateMachine::new(),
            retry,
            lease,
            events: noop_sink(),
            node_id: node_id.into(),
        }
    }

    /// Attach an event sink for emitting flow events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Advance the row `status_id` as of `now`.
    ///
    /// The row is claimed before anything with side effects happens; if the
    /// claim fails the row is skipped untouched. On error the claim is
    /// released so the row is picked up again by a later scan.
    pub async fn advance(&self, status_id: Uuid, now: DateTime<Utc>) -> DripResult<AdvanceOutcome> {
        let token = Uuid::new_v4();
        let Some(mut status) = self
            .statuses
            .claim(status_id, token, now, self.lease)
            .await?
        else {
            debug!(status_id = %status_id, "Row not claimable, skipping");
            return Ok(AdvanceOutcome::Skipped {
                reason: SkipReason::NotClaimed,
            });
        };

        match self.advance_claimed(&mut status, token, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(release_err) = self.statuses.release(status_id, token).await {
                    warn!(
                        status_id = %status_id,
                        error = %release_err,
                        "Failed to release claim"
                    );
                }
                Err(err)
            }
        }
    }

    async fn advance_claimed(
        &self,
        status: &mut FlowStatus,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> DripResult<AdvanceOutcome> {
        let Some(flow) = self.catalog.flow(&status.flow_id).await? else {
            warn!(
                status_id = %status.id,
                flow_id = %status.flow_id,
                "Flow missing from catalog, skipping row"
            );
            self.statuses.release(status.id, token).await?;
            return Ok(AdvanceOutcome::Skipped {
                reason: SkipReason::FlowMissing,
            });
        };

        let sequence = status.position + 1;
        let Some(message) = self.catalog.message(&flow.id, sequence).await? else {
            self.machine.exhaust(status, now)?;
            self.statuses.commit(status.clone(), token).await?;
            info!(
                status_id = %status.id,
                flow_id = %status.flow_id,
                position = status.position,
                "Flow complete, no further messages"
            );
            metrics::counter!("drip.flows_completed").increment(1);
            self.emit(FlowEventKind::Completed, status, None, now);
            return Ok(AdvanceOutcome::Completed);
        };

        // Read before sending so a failed lookup never follows a delivery.
        let following = self.catalog.message(&flow.id, sequence + 1).await?;

        let body = self.composer.compose(&message, status);
        let request = DeliveryRequest {
            to: status.subscriber.phone.clone(),
            body,
            sender: flow.sender,
        };
        let attempt = status.failed_attempts + 1;

        let result = self.delivery.deliver(&request).await;
        match result {
            Ok(receipt) => {
                // The attempt is logged before the row moves so a failed commit
                // never hides a delivered message.
                self.log_attempt(
                    status,
                    &message,
                    request.body,
                    attempt,
                    Ok(receipt.provider_message_id),
                    now,
                )
                .await?;
                self.machine
                    .mark_sent(status, following.map(|m| m.delay.as_duration()), now)?;
                self.statuses.commit(status.clone(), token).await?;

                info!(
                    status_id = %status.id,
                    flow_id = %status.flow_id,
                    position = status.position,
                    segments = receipt.segments,
                    next_send_at = ?status.next_send_at(),
                    "Flow message sent"
                );
                metrics::counter!("drip.messages_sent").increment(1);
                self.emit(FlowEventKind::MessageSent, status, Some(sequence), now);
                if status.is_completed() {
                    metrics::counter!("drip.flows_completed").increment(1);
                    self.emit(FlowEventKind::Completed, status, None, now);
                }

                Ok(AdvanceOutcome::Sent {
                    position: status.position,
                    next_send_at: status.next_send_at(),
                })
            }
            // Missing credentials abort the invocation rather than burn a retry.
            Err(err @ DeliveryError::NotConfigured(_)) => Err(err.into()),
            Err(err) => {
                self.log_attempt(status, &message, request.body, attempt, Err(&err), now)
                    .await?;
                let paused = self.machine.mark_failed(status, &self.retry, now)?;
                self.statuses.commit(status.clone(), token).await?;

                warn!(
                    status_id = %status.id,
                    flow_id = %status.flow_id,
                    sequence = sequence,
                    attempts = status.failed_attempts,
                    paused = paused,
                    error = %err,
                    "Flow message delivery failed"
                );
                metrics::counter!("drip.messages_failed").increment(1);
                self.emit(FlowEventKind::MessageFailed, status, Some(sequence), now);
                if paused {
                    self.emit(FlowEventKind::Paused, status, Some(sequence), now);
                }

                Ok(AdvanceOutcome::Failed {
                    attempts: status.failed_attempts,
                    paused,
                })
            }
        }
    }

    async fn log_attempt(
        &self,
        status: &FlowStatus,
        message: &FlowMessage,
        body: String,
        attempt: u32,
        result: Result<String, &DeliveryError>,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        let (outcome, provider_message_id, error) = match result {
            Ok(provider_id) => (DeliveryOutcome::Sent, Some(provider_id), None),
            Err(err) => (DeliveryOutcome::Failed, None, Some(err.to_string())),
        };
        self.run_log
            .append(RunLogEntry {
                id: Uuid::new_v4(),
                status_id: status.id,
                phone: status.subscriber.phone.clone(),
                flow_id: status.flow_id.clone(),
                message_id: message.id,
                sequence: message.sequence,
                body,
                outcome,
                error,
                provider_message_id,
                attempt,
                created_at: now,
            })
            .await?;
        Ok(())
    }

    fn emit(&self, kind: FlowEventKind, status: &FlowStatus, sequence: Option<u32>, now: DateTime<Utc>) {
        self.events
            .emit(FlowEvent::for_status(kind, status, sequence, &self.node_id, now));
    }
}
