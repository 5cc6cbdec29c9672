//! Worker pool: consumes task messages from the durable queue and drives
//! each task through its lifecycle with transactional status updates.

pub mod handlers;
pub mod runtime;

pub use handlers::{HandlerRegistry, HandlerResult};
pub use runtime::{poll_once, run_worker, WorkerContext, MAX_RETRIES};
