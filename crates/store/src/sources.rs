//! External read-only sources consulted by the enrollment triggers.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use drip_core::types::{ContestEntry, LinkedAccount};
use drip_core::StoreError;

/// Trailing-window feed of new contest entries and signups.
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// Entries created at or after `cutoff`.
    async fn entries_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContestEntry>, StoreError>;
}

/// Completed transactions, consulted only for coupon redemption.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    async fn coupon_redeemed(&self, coupon_code: &str) -> Result<bool, StoreError>;
}

/// Optional phone -> internal account lookup.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account_for_phone(&self, phone: &str) -> Result<Option<LinkedAccount>, StoreError>;
}

#[derive(Default)]
pub struct MemoryEntrySource {
    entries: RwLock<Vec<ContestEntry>>,
}

impl MemoryEntrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Unavailable(format!("reading entries {}: {}", path.display(), e))
        })?;
        let entries: Vec<ContestEntry> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        info!(entries = entries.len(), "Contest entries loaded");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn push(&self, entry: ContestEntry) {
        self.entries.write().push(entry);
    }
}

#[async_trait]
impl EntrySource for MemoryEntrySource {
    async fn entries_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContestEntry>, StoreError> {
        let mut entries: Vec<ContestEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.created_at >= cutoff)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }
}

/// Redemption counts keyed by coupon code.
#[derive(Default)]
pub struct MemoryLedger {
    redemptions: DashMap<String, u32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_redemption(&self, coupon_code: &str) {
        *self
            .redemptions
            .entry(coupon_code.to_string())
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl TransactionLedger for MemoryLedger {
    async fn coupon_redeemed(&self, coupon_code: &str) -> Result<bool, StoreError> {
        Ok(self
            .redemptions
            .get(coupon_code)
            .is_some_and(|count| *count > 0))
    }
}

#[derive(Default)]
pub struct MemoryAccounts {
    by_phone: DashMap<String, LinkedAccount>,
}

impl MemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, phone: &str, account: LinkedAccount) {
        self.by_phone.insert(phone.to_string(), account);
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccounts {
    async fn account_for_phone(&self, phone: &str) -> Result<Option<LinkedAccount>, StoreError> {
        Ok(self.by_phone.get(phone).map(|a| a.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn entry(phone: &str, created_at: DateTime<Utc>) -> ContestEntry {
        ContestEntry {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            account_id: None,
            prize_code: "FREE_SHOUTOUT".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_entries_since_window() {
        let now = Utc::now();
        let source = MemoryEntrySource::new();
        source.push(entry("+1", now - Duration::hours(30)));
        source.push(entry("+2", now - Duration::hours(1)));
        source.push(entry("+3", now - Duration::hours(5)));

        let recent = source.entries_since(now - Duration::hours(24)).await.unwrap();
        let phones: Vec<&str> = recent.iter().map(|e| e.phone.as_str()).collect();
        assert_eq!(phones, vec!["+3", "+2"]);
    }

    #[tokio::test]
    async fn test_ledger_redemption() {
        let ledger = MemoryLedger::new();
        assert!(!ledger.coupon_redeemed("WINNER100").await.unwrap());
        ledger.record_redemption("WINNER100");
        assert!(ledger.coupon_redeemed("WINNER100").await.unwrap());
        assert!(!ledger.coupon_redeemed("winner100").await.unwrap());
    }

    #[tokio::test]
    async fn test_account_lookup() {
        let accounts = MemoryAccounts::new();
        let id = Uuid::new_v4();
        accounts.link(
            "+1",
            LinkedAccount {
                id,
                display_name: Some("Ada".to_string()),
            },
        );
        assert_eq!(
            accounts.account_for_phone("+1").await.unwrap().map(|a| a.id),
            Some(id)
        );
        assert!(accounts.account_for_phone("+2").await.unwrap().is_none());
    }
}
