//! Job intake: message queue consumer + handler
//!
//! Intake persists a new job, asks the provider where the export stands,
//! and hands the job to dispatch, polling, or the terminal failure path.

mod consumer;
mod handler;

pub use consumer::{IntakeConsumer, IntakeConsumerConfig};
pub use handler::{IntakeError, IntakeHandler, IntakeOutcome};
