//! Abstraction over the async runtime the balancer's background tasks run on.
//!
//! The subscription engine, resolver loop and polling adapter all need to
//! spawn background work and sleep between retries. Routing those two
//! operations through a trait keeps the balancer runtime-agnostic and lets
//! tests substitute a deterministic clock instead of real sleeps.

use std::future::Future;
use std::time::Duration;

pub mod tokio;

/// Trait for async runtime operations used by the balancer's background tasks.
pub trait Runtime: Send + Sync + Clone + 'static {
    /// Spawn a future to run in the background.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}
