//! Storage seams for the drip flow engine.
//!
//! Every table the engine touches sits behind an async trait: the read-only
//! flow catalog, the mutable flow status table, the append-only run log, and
//! the external sources consulted by enrollment triggers. The in-memory
//! implementations back the runner binary and the test suites.

pub mod catalog;
pub mod run_log;
pub mod sources;
pub mod status;

pub use catalog::{CatalogDocument, FlowCatalog, MemoryCatalog};
pub use run_log::{MemoryRunLog, RunLog};
pub use sources::{
    AccountDirectory, EntrySource, MemoryAccounts, MemoryEntrySource, MemoryLedger,
    TransactionLedger,
};
pub use status::{DueQuery, InsertOutcome, MemoryStatusStore, StatusStore};
