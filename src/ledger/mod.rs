/// Fjall-based persistence for job records
///
/// The ledger is the single source of truth for job state. Components never
/// cache job snapshots; they call the repository's atomic mutators and act
/// on the post-update view it returns.
pub mod error;
pub mod memory;
pub mod partitions;
pub mod store;

pub use error::{LedgerError, Result};
pub use memory::MemoryJobStore;
pub use store::{FjallJobStore, JobRepository, StatusPatch};
