use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use drip_core::types::{CompletionReason, FlowState, FlowStatus};
use drip_core::{DripError, DripResult};

use crate::retry::{RetryDecision, RetryPolicy};

/// Coarse state of a flow status, ignoring the data each state carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Scheduled,
    Paused,
    Completed,
}

impl StateKind {
    fn label(self) -> &'static str {
        match self {
            StateKind::Scheduled => "scheduled",
            StateKind::Paused => "paused",
            StateKind::Completed => "completed",
        }
    }
}

impl From<&FlowState> for StateKind {
    fn from(state: &FlowState) -> Self {
        match state {
            FlowState::Scheduled { .. } => StateKind::Scheduled,
            FlowState::Paused { .. } => StateKind::Paused,
            FlowState::Completed { .. } => StateKind::Completed,
        }
    }
}

/// Event that moves a flow status from one state to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    MessageSent,
    DeliveryRetry,
    FlowExhausted,
    CouponRedeemed,
    RetriesExhausted,
    OperatorPause,
    OperatorResume,
}

/// Describes a single valid state transition for a flow status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: StateKind,
    pub to: StateKind,
    pub trigger: Trigger,
}

/// Guards flow-status mutations by enforcing a finite set of valid
/// transitions. The advancer mutates rows through here; the triggers and
/// operator commands check their edge with [`ensure`](Self::ensure) before
/// the store applies the change atomically.
#[derive(Debug, Clone)]
pub struct FlowStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl FlowStateMachine {
    /// Creates a state machine with all valid transitions pre-configured.
    pub fn new() -> Self {
        let edge = |from, to, trigger| StateTransition { from, to, trigger };
        let transitions = vec![
            // Scheduled ->
            edge(StateKind::Scheduled, StateKind::Scheduled, Trigger::MessageSent),
            edge(StateKind::Scheduled, StateKind::Scheduled, Trigger::DeliveryRetry),
            edge(StateKind::Scheduled, StateKind::Completed, Trigger::MessageSent),
            edge(StateKind::Scheduled, StateKind::Completed, Trigger::FlowExhausted),
            edge(StateKind::Scheduled, StateKind::Completed, Trigger::CouponRedeemed),
            edge(StateKind::Scheduled, StateKind::Paused, Trigger::RetriesExhausted),
            edge(StateKind::Scheduled, StateKind::Paused, Trigger::OperatorPause),
            // Paused ->
            edge(StateKind::Paused, StateKind::Scheduled, Trigger::OperatorResume),
        ];

        Self { transitions }
    }

    /// Returns `true` if `trigger` may move a row from `from` to `to`.
    pub fn can_transition(&self, from: StateKind, to: StateKind, trigger: Trigger) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to && t.trigger == trigger)
    }

    /// Fails with `InvalidTransition` unless the edge exists.
    pub fn ensure(&self, from: StateKind, to: StateKind, trigger: Trigger) -> DripResult<()> {
        if self.can_transition(from, to, trigger) {
            Ok(())
        } else {
            Err(DripError::InvalidTransition {
                from: from.label(),
                to: to.label(),
            })
        }
    }

    fn transition(
        &self,
        status: &mut FlowStatus,
        to: FlowState,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        self.ensure(StateKind::from(&status.state), StateKind::from(&to), trigger)?;
        status.state = to;
        status.updated_at = now;
        Ok(())
    }

    /// A message was delivered. Moves the position forward by one and
    /// schedules the following message after `following_delay` (the delay
    /// of the message at the new position + 1), or completes the flow when
    /// there is no following message.
    pub fn mark_sent(
        &self,
        status: &mut FlowStatus,
        following_delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        let next = match following_delay {
            Some(delay) => FlowState::Scheduled {
                next_send_at: now + delay,
            },
            None => FlowState::Completed {
                at: now,
                reason: CompletionReason::Exhausted,
            },
        };
        self.transition(status, next, Trigger::MessageSent, now)?;
        status.position += 1;
        status.failed_attempts = 0;
        Ok(())
    }

    /// No message exists at the next position.
    pub fn exhaust(&self, status: &mut FlowStatus, now: DateTime<Utc>) -> DripResult<()> {
        let completed = FlowState::Completed {
            at: now,
            reason: CompletionReason::Exhausted,
        };
        self.transition(status, completed, Trigger::FlowExhausted, now)
    }

    /// A delivery attempt failed. Position never moves; the schedule follows
    /// the retry policy. Returns `true` if the row was paused.
    pub fn mark_failed(
        &self,
        status: &mut FlowStatus,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        let scheduled = status.next_send_at().ok_or(DripError::InvalidTransition {
            from: StateKind::from(&status.state).label(),
            to: StateKind::Scheduled.label(),
        })?;
        let attempts = status.failed_attempts + 1;

        let (next, trigger) = match retry.after_failure(attempts, scheduled, now) {
            RetryDecision::RetryAt(at) => (
                FlowState::Scheduled { next_send_at: at },
                Trigger::DeliveryRetry,
            ),
            RetryDecision::GiveUp => (
                FlowState::Paused {
                    resume_at: Some(scheduled),
                },
                Trigger::RetriesExhausted,
            ),
        };
        let paused = trigger == Trigger::RetriesExhausted;
        self.transition(status, next, trigger, now)?;
        status.failed_attempts = attempts;
        Ok(paused)
    }
}

impl Default for FlowStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
