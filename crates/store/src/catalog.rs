//! Flow catalog: flow definitions and their ordered messages.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use drip_core::types::{Flow, FlowId, FlowMessage, MessageDelay, SenderIdentity};
use drip_core::StoreError;

/// Read-only access to flow definitions.
#[async_trait]
pub trait FlowCatalog: Send + Sync {
    async fn flow(&self, id: &FlowId) -> Result<Option<Flow>, StoreError>;

    /// Ids of every flow whose active flag is set.
    async fn active_flows(&self) -> Result<Vec<FlowId>, StoreError>;

    /// Exact-match lookup of an active message. Inactive messages read as
    /// absent.
    async fn message(
        &self,
        flow_id: &FlowId,
        sequence: u32,
    ) -> Result<Option<FlowMessage>, StoreError>;
}

/// On-disk shape of a catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub messages: Vec<FlowMessage>,
}

/// Catalog held in memory, keyed by flow id and (flow id, sequence).
#[derive(Default)]
pub struct MemoryCatalog {
    flows: DashMap<FlowId, Flow>,
    messages: DashMap<(FlowId, u32), FlowMessage>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a document, rejecting duplicate positions and
    /// messages for unknown flows.
    pub fn from_document(doc: CatalogDocument) -> Result<Self, StoreError> {
        let catalog = Self::new();
        for flow in doc.flows {
            catalog.add_flow(flow);
        }
        for msg in doc.messages {
            if !catalog.flows.contains_key(&msg.flow_id) {
                return Err(StoreError::Serialization(format!(
                    "message {} references unknown flow {}",
                    msg.id, msg.flow_id
                )));
            }
            if msg.sequence == 0 {
                return Err(StoreError::Serialization(format!(
                    "message {} in flow {} has sequence 0",
                    msg.id, msg.flow_id
                )));
            }
            let key = (msg.flow_id.clone(), msg.sequence);
            if catalog.messages.contains_key(&key) {
                return Err(StoreError::Serialization(format!(
                    "duplicate sequence {} in flow {}",
                    msg.sequence, msg.flow_id
                )));
            }
            catalog.messages.insert(key, msg);
        }
        info!(
            flows = catalog.flows.len(),
            messages = catalog.messages.len(),
            "Flow catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Unavailable(format!("reading catalog {}: {}", path.display(), e))
        })?;
        let doc: CatalogDocument =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::from_document(doc)
    }

    pub fn add_flow(&self, flow: Flow) {
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn add_message(&self, msg: FlowMessage) {
        self.messages.insert((msg.flow_id.clone(), msg.sequence), msg);
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Seeds the three contest flows for development runs.
    pub fn seed_demo(&self, welcome: &FlowId, follow_up: &FlowId, ongoing: &FlowId) {
        info!("Seeding demo flows");

        let flows = [
            (welcome, "Contest Welcome", SenderIdentity::Primary),
            (follow_up, "Contest Follow-up", SenderIdentity::Primary),
            (ongoing, "Contest Ongoing", SenderIdentity::Marketing),
        ];
        for (id, name, sender) in flows {
            self.add_flow(Flow {
                id: id.clone(),
                name: name.to_string(),
                active: true,
                sender,
            });
        }

        let messages = [
            (
                welcome,
                1,
                "Hey {{name}}, you won! Your prize is waiting.",
                MessageDelay::default(),
                true,
            ),
            (
                welcome,
                2,
                "Reminder {{name}}: your prize expires soon.",
                MessageDelay::new(2, 0),
                true,
            ),
            (
                follow_up,
                1,
                "Still thinking it over? Your coupon is still good.",
                MessageDelay::default(),
                true,
            ),
            (
                ongoing,
                1,
                "New talent just joined. Come take a look!",
                MessageDelay::default(),
                false,
            ),
            (
                ongoing,
                2,
                "Book a personalized video this week.",
                MessageDelay::new(14, 0),
                false,
            ),
        ];
        for (flow_id, sequence, template, delay, includes_coupon) in messages {
            self.add_message(FlowMessage {
                id: uuid::Uuid::new_v4(),
                flow_id: flow_id.clone(),
                sequence,
                template: template.to_string(),
                delay,
                includes_coupon,
                includes_link: !includes_coupon,
                link_tag: None,
                active: true,
            });
        }

        info!(flows = self.flows.len(), "Seeded demo flows");
    }
}

#[async_trait]
impl FlowCatalog for MemoryCatalog {
    async fn flow(&self, id: &FlowId) -> Result<Option<Flow>, StoreError> {
        Ok(self.flows.get(id).map(|f| f.clone()))
    }

    async fn active_flows(&self) -> Result<Vec<FlowId>, StoreError> {
        Ok(self
            .flows
            .iter()
            .filter(|f| f.active)
            .map(|f| f.id.clone())
            .collect())
    }

    async fn message(
        &self,
        flow_id: &FlowId,
        sequence: u32,
    ) -> Result<Option<FlowMessage>, StoreError> {
        Ok(self
            .messages
            .get(&(flow_id.clone(), sequence))
            .filter(|m| m.active)
            .map(|m| m.clone()))
    }
}
