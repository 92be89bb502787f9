use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable slug identifying a flow in the catalog (e.g. `contest_welcome`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which outbound number the delivery adapter should send from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderIdentity {
    #[default]
    Primary,
    Marketing,
}

/// A named, ordered message sequence. Read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sender: SenderIdentity,
}

/// Wait between a message and the one before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelay {
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub hours: u32,
}

impl MessageDelay {
    pub fn new(days: u32, hours: u32) -> Self {
        Self { days, hours }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::days(i64::from(self.days)) + Duration::hours(i64::from(self.hours))
    }
}

/// One step of a flow.
///
/// `sequence` starts at 1 and is unique within the flow. Lookups are exact
/// match, so a gap in the sequence ends the flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMessage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub flow_id: FlowId,
    pub sequence: u32,
    pub template: String,
    #[serde(default)]
    pub delay: MessageDelay,
    #[serde(default)]
    pub includes_coupon: bool,
    #[serde(default)]
    pub includes_link: bool,
    #[serde(default)]
    pub link_tag: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// The person moving through a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub phone: String,
    #[serde(default)]
    pub account_id: Option<Uuid>,
}

impl Subscriber {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            account_id: None,
        }
    }
}

/// Why a flow status reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// No message exists at the next sequence position.
    Exhausted,
    /// The subscriber already redeemed the flow's coupon.
    CouponRedeemed,
}

/// Progress state of a subscriber within one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FlowState {
    Scheduled {
        next_send_at: DateTime<Utc>,
    },
    /// Held out of the due scan. `resume_at` is restored on resume.
    Paused {
        resume_at: Option<DateTime<Utc>>,
    },
    Completed {
        at: DateTime<Utc>,
        reason: CompletionReason,
    },
}

impl FlowState {
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Scheduled { .. } => "scheduled",
            FlowState::Paused { .. } => "paused",
            FlowState::Completed { .. } => "completed",
        }
    }
}

/// A processing claim held by one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
}

/// Per-(subscriber, flow) progress record. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStatus {
    pub id: Uuid,
    pub subscriber: Subscriber,
    pub flow_id: FlowId,
    /// Sequence of the last message sent or skipped; 0 before the first send.
    pub position: u32,
    pub state: FlowState,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub coupon_used: bool,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowStatus {
    /// New enrollment at position 0, first send due at `next_send_at`.
    pub fn enroll(
        subscriber: Subscriber,
        flow_id: FlowId,
        next_send_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber,
            flow_id,
            position: 0,
            state: FlowState::Scheduled { next_send_at },
            coupon_code: None,
            metadata: HashMap::new(),
            coupon_used: false,
            failed_attempts: 0,
            claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_coupon(mut self, coupon_code: Option<String>) -> Self {
        self.coupon_code = coupon_code;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn phone(&self) -> &str {
        &self.subscriber.phone
    }

    pub fn next_send_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            FlowState::Scheduled { next_send_at } => Some(next_send_at),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            FlowState::Completed { at, .. } => Some(at),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, FlowState::Completed { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, FlowState::Paused { .. })
    }

    /// Scheduled and the send time has arrived. Claims are not considered.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_send_at().is_some_and(|at| at <= now)
    }

    /// True while another invocation holds a claim younger than `lease`.
    pub fn is_claimed(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.claim
            .is_some_and(|claim| now.signed_duration_since(claim.claimed_at) < lease)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

/// Append-only audit record of a delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: Uuid,
    pub status_id: Uuid,
    pub phone: String,
    pub flow_id: FlowId,
    pub message_id: Uuid,
    pub sequence: u32,
    pub body: String,
    pub outcome: DeliveryOutcome,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    /// 1-based attempt number for this sequence position.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// A contest entry or signup read from the trailing-window event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContestEntry {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub phone: String,
    #[serde(default)]
    pub account_id: Option<Uuid>,
    pub prize_code: String,
    pub created_at: DateTime<Utc>,
}

/// Internal account linked to a phone number, used for personalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: Uuid,
    pub display_name: Option<String>,
}

/// Kinds of flow lifecycle events emitted for analytics consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    Entered,
    MessageSent,
    MessageFailed,
    Completed,
    BranchSkipped,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub kind: FlowEventKind,
    pub status_id: Uuid,
    pub flow_id: FlowId,
    pub phone: String,
    pub sequence: Option<u32>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_at(now: DateTime<Utc>) -> FlowStatus {
        FlowStatus::enroll(
            Subscriber::new("+15550001111"),
            FlowId::from("welcome"),
            now,
            now,
        )
    }

    #[test]
    fn test_delay_duration() {
        let delay = MessageDelay::new(2, 5);
        assert_eq!(delay.as_duration(), Duration::hours(53));
        assert_eq!(MessageDelay::default().as_duration(), Duration::zero());
    }

    #[test]
    fn test_enroll_is_scheduled_at_position_zero() {
        let now = Utc::now();
        let status = status_at(now);
        assert_eq!(status.position, 0);
        assert_eq!(status.next_send_at(), Some(now));
        assert!(status.completed_at().is_none());
        assert!(status.is_due(now));
        assert!(!status.is_due(now - Duration::seconds(1)));
    }

    #[test]
    fn test_completed_has_no_next_send() {
        let now = Utc::now();
        let mut status = status_at(now);
        status.state = FlowState::Completed {
            at: now,
            reason: CompletionReason::Exhausted,
        };
        assert!(status.next_send_at().is_none());
        assert_eq!(status.completed_at(), Some(now));
        assert!(!status.is_due(now));
    }

    #[test]
    fn test_claim_lease() {
        let now = Utc::now();
        let mut status = status_at(now);
        assert!(!status.is_claimed(now, Duration::minutes(5)));

        status.claim = Some(Claim {
            token: Uuid::new_v4(),
            claimed_at: now,
        });
        assert!(status.is_claimed(now + Duration::minutes(4), Duration::minutes(5)));
        assert!(!status.is_claimed(now + Duration::minutes(5), Duration::minutes(5)));
    }

    #[test]
    fn test_flow_message_defaults_from_json() {
        let msg: FlowMessage = serde_json::from_value(serde_json::json!({
            "flow_id": "welcome",
            "sequence": 1,
            "template": "Hi {{name}}"
        }))
        .unwrap();
        assert!(msg.active);
        assert!(!msg.includes_coupon);
        assert_eq!(msg.delay, MessageDelay::default());
    }

    #[test]
    fn test_state_serializes_tagged() {
        let state = FlowState::Completed {
            at: Utc::now(),
            reason: CompletionReason::CouponRedeemed,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "completed");
        assert_eq!(json["reason"], "coupon_redeemed");
    }
}
