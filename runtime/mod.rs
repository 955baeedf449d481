//! Settlement Runtime - Concurrency Primitives
//!
//! Small building blocks shared by the executor and the orchestrator:
//! - Keyed advisory locks (one settlement pass per unit, one execution per record)
//! - Exponential backoff for transient payment failures
//! - Cooperative cancellation of not-yet-dispatched payments

pub mod cancel;
pub mod locks;
pub mod retry;

pub use cancel::CancelToken;
pub use locks::{KeyGuard, SettlementLockManager};
pub use retry::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES};
