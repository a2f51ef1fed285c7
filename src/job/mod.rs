//! Export job domain model
//!
//! A job tracks one bulk export end-to-end: intake, provider polling,
//! artifact downloads, and the terminal workflow callback. The record is a
//! plain value; every transition returns a fresh copy and the repository is
//! the single source of truth for the persisted view.

mod model;
mod task;

pub use model::{
    ExportJob, JobError, JobStatus, NewJob, DEFAULT_MAX_POLLING_ATTEMPTS,
    DEFAULT_POLLING_INTERVAL_MS,
};
pub use task::{derive_output_key, ExportTask};
