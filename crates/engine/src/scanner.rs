use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use drip_core::types::FlowStatus;
use drip_core::DripResult;
use drip_store::{DueQuery, FlowCatalog, StatusStore};

/// Selects the rows ready for the advancer. Read-only.
pub struct DueScanner {
    catalog: Arc<dyn FlowCatalog>,
    statuses: Arc<dyn StatusStore>,
    batch_size: usize,
    lease: Duration,
}

impl DueScanner {
    pub fn new(
        catalog: Arc<dyn FlowCatalog>,
        statuses: Arc<dyn StatusStore>,
        batch_size: usize,
        lease: Duration,
    ) -> Self {
        Self {
            catalog,
            statuses,
            batch_size,
            lease,
        }
    }

    /// Up to `batch_size` unpaused, uncompleted rows of active flows whose
    /// next send time is at or before `now`.
    pub async fn scan(&self, now: DateTime<Utc>) -> DripResult<Vec<FlowStatus>> {
        let active_flows = self.catalog.active_flows().await?;
        if active_flows.is_empty() {
            debug!("No active flows in catalog");
            return Ok(Vec::new());
        }

        let due = self
            .statuses
            .due(&DueQuery {
                now,
                active_flows: &active_flows,
                limit: self.batch_size,
                lease: self.lease,
            })
            .await?;

        debug!(due = due.len(), batch_size = self.batch_size, "Due scan complete");
        Ok(due)
    }
}
