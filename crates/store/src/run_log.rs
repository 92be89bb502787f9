//! Append-only delivery audit trail.

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use drip_core::types::RunLogEntry;
use drip_core::StoreError;

#[async_trait]
pub trait RunLog: Send + Sync {
    async fn append(&self, entry: RunLogEntry) -> Result<(), StoreError>;

    async fn for_status(&self, status_id: Uuid) -> Result<Vec<RunLogEntry>, StoreError>;

    async fn for_subscriber(&self, phone: &str) -> Result<Vec<RunLogEntry>, StoreError>;
}

#[derive(Default)]
pub struct MemoryRunLog {
    entries: RwLock<Vec<RunLogEntry>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn append(&self, entry: RunLogEntry) -> Result<(), StoreError> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn for_status(&self, status_id: Uuid) -> Result<Vec<RunLogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.status_id == status_id)
            .cloned()
            .collect())
    }

    async fn for_subscriber(&self, phone: &str) -> Result<Vec<RunLogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.phone == phone)
            .cloned()
            .collect())
    }
}
