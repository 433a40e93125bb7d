//! Completion tracking for asynchronous copies.

mod pool;
mod queue;

pub use pool::{DescId, SignalDesc, SignalPool};
pub use queue::{SignalQueue, dispatch_fired};
