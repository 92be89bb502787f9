//! Drip flow engine: advances subscribers through ordered, time-delayed
//! message flows, one batch per externally scheduled invocation.
//!
//! Each invocation runs the enrollment triggers, scans for due rows, and
//! advances every due row through claim, compose, deliver and commit.

pub mod advancer;
pub mod engine;
pub mod retry;
pub mod scanner;
pub mod state_machine;
pub mod triggers;

pub use advancer::{AdvanceOutcome, Advancer, SkipReason};
pub use engine::{EngineDeps, FlowEngine, RunSummary, SubscriberHistory};
pub use retry::{RetryDecision, RetryPolicy};
pub use scanner::DueScanner;
pub use state_machine::{FlowStateMachine, StateKind, Trigger};
pub use triggers::{EnrollmentTriggers, TriggerReport};

#[cfg(test)]
pub(crate) mod testing;
