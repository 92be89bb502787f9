use thiserror::Error;
use uuid::Uuid;

pub type DripResult<T> = Result<T, DripError>;

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl DripError {
    /// Fatal errors abort the whole invocation; everything else is counted
    /// against the current subscriber and the batch continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DripError::Config(_)
                | DripError::Store(StoreError::Unavailable(_))
                | DripError::Delivery(DeliveryError::NotConfigured(_))
        )
    }
}

impl From<config::ConfigError> for DripError {
    fn from(err: config::ConfigError) -> Self {
        DripError::Config(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("flow status {0} not found")]
    NotFound(Uuid),

    #[error("claim on flow status {0} was lost")]
    ClaimLost(Uuid),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery adapter not configured: {0}")]
    NotConfigured(String),

    #[error("invalid destination {0}")]
    InvalidDestination(String),

    #[error("rejected by provider ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("transport failure: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DripError::Config("missing".into()).is_fatal());
        assert!(DripError::from(StoreError::Unavailable("down".into())).is_fatal());
        assert!(DripError::from(DeliveryError::NotConfigured("no sid".into())).is_fatal());

        assert!(!DripError::from(StoreError::ClaimLost(Uuid::new_v4())).is_fatal());
        assert!(!DripError::from(DeliveryError::Transport("timeout".into())).is_fatal());
        assert!(!DripError::InvalidTransition {
            from: "completed",
            to: "scheduled",
        }
        .is_fatal());
    }
}
