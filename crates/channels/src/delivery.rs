//! Delivery adapter boundary. Transport-level retries and rate limiting
//! belong to the adapter; the engine makes exactly one call per attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use drip_core::types::SenderIdentity;
use drip_core::DeliveryError;

/// A single outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub to: String,
    pub body: String,
    pub sender: SenderIdentity,
}

/// What the adapter reports back for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub segments: u32,
}

#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError>;
}
