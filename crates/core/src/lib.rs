pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{DeliveryError, DripError, DripResult, StoreError};
pub use types::{
    CompletionReason, Flow, FlowId, FlowMessage, FlowState, FlowStatus, RunLogEntry,
    SenderIdentity, Subscriber,
};
