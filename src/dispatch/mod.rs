//! Task fan-out and completion accounting
//!
//! The dispatcher splits a ready export into tasks exactly once and routes
//! each one to the worker pool or, when the pool is saturated, to the
//! overflow queue. The aggregator counts outcomes from both paths and
//! closes the job with the terminal workflow callback.

mod completion;
mod dispatcher;

pub use completion::CompletionAggregator;
pub use dispatcher::{
    DispatchConfig, DispatchError, DispatchReport, TaskDestination, TaskDispatcher,
    DEFAULT_DISPATCH_BATCH_SIZE,
};
