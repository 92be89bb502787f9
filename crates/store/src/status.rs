//! Flow status table: the only shared mutable state of the engine.
//!
//! Every mutation that races with another invocation goes through a
//! conditional update here (claim, commit, insert-if-absent,
//! complete-if-untouched) so overlapping runs cannot double-send.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use drip_core::types::{Claim, CompletionReason, FlowId, FlowState, FlowStatus};
use drip_core::StoreError;

/// Parameters of the due-subscriber query.
#[derive(Debug, Clone)]
pub struct DueQuery<'a> {
    pub now: DateTime<Utc>,
    /// Rows of flows outside this set are never returned.
    pub active_flows: &'a [FlowId],
    pub limit: usize,
    /// Claims younger than this hide a row from the scan.
    pub lease: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyEnrolled,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<FlowStatus>, StoreError>;

    /// Scheduled, unpaused, unclaimed rows whose send time has arrived.
    async fn due(&self, query: &DueQuery<'_>) -> Result<Vec<FlowStatus>, StoreError>;

    /// Claim a row for processing. Returns `None` when the row is no longer
    /// due or another live claim holds it.
    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<FlowStatus>, StoreError>;

    /// Write back a claimed row and drop the claim. Fails with `ClaimLost`
    /// if `token` no longer owns the row.
    async fn commit(&self, status: FlowStatus, token: Uuid) -> Result<(), StoreError>;

    /// Drop a claim without touching anything else.
    async fn release(&self, id: Uuid, token: Uuid) -> Result<(), StoreError>;

    /// Insert unless any row (completed ones included) already exists for
    /// the same phone and flow.
    async fn insert_if_absent(&self, status: FlowStatus) -> Result<InsertOutcome, StoreError>;

    async fn exists(&self, phone: &str, flow_id: &FlowId) -> Result<bool, StoreError>;

    /// Rows of `flow_id` still at position 0 whose first send is due.
    async fn awaiting_first_send(
        &self,
        flow_id: &FlowId,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowStatus>, StoreError>;

    /// Completed rows of `flow_id` whose completion is at or before `cutoff`.
    async fn completed_before(
        &self,
        flow_id: &FlowId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FlowStatus>, StoreError>;

    /// Complete a scheduled row that has not sent anything and is not claimed.
    /// Returns the updated row, or `None` if the condition no longer held.
    async fn complete_if_untouched(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        reason: CompletionReason,
        lease: Duration,
    ) -> Result<Option<FlowStatus>, StoreError>;

    /// Pause or resume a row. Completed rows are left alone (`None`).
    async fn set_paused(
        &self,
        id: Uuid,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowStatus>, StoreError>;

    async fn for_subscriber(&self, phone: &str) -> Result<Vec<FlowStatus>, StoreError>;
}

/// In-memory status table. Row-level atomicity comes from DashMap shard
/// locks held across each check-and-write.
pub struct MemoryStatusStore {
    rows: DashMap<Uuid, FlowStatus>,
    /// (phone, flow) -> row id, for enrollment idempotence.
    enrollments: DashMap<(String, FlowId), Uuid>,
    available: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            enrollments: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the backing store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Snapshot of every row, for inspection.
    pub fn all(&self) -> Vec<FlowStatus> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("status store offline".into()))
        }
    }
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, id: Uuid) -> Result<Option<FlowStatus>, StoreError> {
        self.check()?;
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn due(&self, query: &DueQuery<'_>) -> Result<Vec<FlowStatus>, StoreError> {
        self.check()?;
        let mut due: Vec<FlowStatus> = self
            .rows
            .iter()
            .filter(|r| {
                r.is_due(query.now)
                    && !r.is_claimed(query.now, query.lease)
                    && query.active_flows.contains(&r.flow_id)
            })
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|s| s.next_send_at());
        due.truncate(query.limit);
        Ok(due)
    }

    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<FlowStatus>, StoreError> {
        self.check()?;
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if !row.is_due(now) || row.is_claimed(now, lease) {
            debug!(status_id = %id, "Claim refused");
            return Ok(None);
        }
        row.claim = Some(Claim {
            token,
            claimed_at: now,
        });
        Ok(Some(row.clone()))
    }

    async fn commit(&self, mut status: FlowStatus, token: Uuid) -> Result<(), StoreError> {
        self.check()?;
        let id = status.id;
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if row.claim.map(|c| c.token) != Some(token) {
            return Err(StoreError::ClaimLost(id));
        }
        status.claim = None;
        *row = status;
        Ok(())
    }

    async fn release(&self, id: Uuid, token: Uuid) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut row) = self.rows.get_mut(&id) {
            if row.claim.map(|c| c.token) == Some(token) {
                row.claim = None;
            }
        }
        Ok(())
    }

    async fn insert_if_absent(&self, status: FlowStatus) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let key = (status.subscriber.phone.clone(), status.flow_id.clone());
        match self.enrollments.entry(key) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyEnrolled),
            Entry::Vacant(slot) => {
                // Row goes in before the index entry guard drops.
                self.rows.insert(status.id, status.clone());
                slot.insert(status.id);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn exists(&self, phone: &str, flow_id: &FlowId) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .enrollments
            .contains_key(&(phone.to_string(), flow_id.clone())))
    }

    async fn awaiting_first_send(
        &self,
        flow_id: &FlowId,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowStatus>, StoreError> {
        self.check()?;
        Ok(self
            .rows
            .iter()
            .filter(|r| r.flow_id == *flow_id && r.position == 0 && r.is_due(now))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn completed_before(
        &self,
        flow_id: &FlowId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FlowStatus>, StoreError> {
        self.check()?;
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                r.flow_id == *flow_id && r.completed_at().is_some_and(|at| at <= cutoff)
            })
            .map(|r| r.value().clone())
            .collect())
    }

    async fn complete_if_untouched(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        reason: CompletionReason,
        lease: Duration,
    ) -> Result<Option<FlowStatus>, StoreError> {
        self.check()?;
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        let scheduled = matches!(row.state, FlowState::Scheduled { .. });
        if row.position != 0 || !scheduled || row.is_claimed(now, lease) {
            return Ok(None);
        }
        row.state = FlowState::Completed { at: now, reason };
        row.coupon_used = reason == CompletionReason::CouponRedeemed;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn set_paused(
        &self,
        id: Uuid,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowStatus>, StoreError> {
        self.check()?;
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        let next = match (&row.state, paused) {
            (FlowState::Scheduled { next_send_at }, true) => FlowState::Paused {
                resume_at: Some(*next_send_at),
            },
            (FlowState::Paused { resume_at }, false) => FlowState::Scheduled {
                next_send_at: resume_at.map_or(now, |at| at.max(now)),
            },
            (FlowState::Completed { .. }, _) => return Ok(None),
            _ => return Ok(Some(row.clone())),
        };
        row.state = next;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn for_subscriber(&self, phone: &str) -> Result<Vec<FlowStatus>, StoreError> {
        self.check()?;
        let mut rows: Vec<FlowStatus> = self
            .rows
            .iter()
            .filter(|r| r.subscriber.phone == phone)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}
