//! Seed Channel Pool.
//!
//! Caches one transport channel per seed endpoint, reused for topology
//! calls. Grounded on `tonic::transport::Endpoint`'s lazy-connect builder
//! (`connect_lazy`) for channel construction, and on the
//! check-then-insert concurrent map idiom tonic itself favors for its
//! hot paths (no single global lock held across a connect).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
use tracing::debug;

use crate::error::{Error, Result};
use crate::topology::Endpoint;

/// A hook to mutate channel construction options before a seed channel is
/// built.
pub type ChannelOptionsHook = Arc<dyn Fn(TonicEndpoint) -> TonicEndpoint + Send + Sync>;

struct Inner {
    channels: Mutex<HashMap<Endpoint, Channel>>,
    closed: std::sync::atomic::AtomicBool,
    tls: bool,
    options_hook: Option<ChannelOptionsHook>,
}

/// Caches one transport channel per seed endpoint for the pool's
/// lifetime.
#[derive(Clone)]
pub struct SeedChannelPool {
    inner: Arc<Inner>,
}

impl SeedChannelPool {
    /// Create a new, empty pool. `tls` selects `http`/`https` scheme for
    /// every channel the pool builds; `options_hook`, if given, mutates
    /// each channel's builder before it connects.
    pub fn new(tls: bool, options_hook: Option<ChannelOptionsHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
                tls,
                options_hook,
            }),
        }
    }

    /// Return the cached channel for `endpoint`, creating it on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceClosed`] if the pool has been closed.
    pub async fn get_channel(&self, endpoint: &Endpoint) -> Result<Channel> {
        if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::ResourceClosed);
        }

        let mut channels = self.inner.channels.lock().await;
        if let Some(channel) = channels.get(endpoint) {
            return Ok(channel.clone());
        }

        // Re-check under the lock (another waiter may have just closed
        // the pool or inserted the same endpoint).
        if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::ResourceClosed);
        }

        let mut builder = TonicEndpoint::from_shared(endpoint.to_uri(self.inner.tls))
            .map_err(|e| Error::LoadBalancingConfiguration(e.to_string()))?;
        if let Some(hook) = &self.inner.options_hook {
            builder = hook(builder);
        }
        let channel = builder.connect_lazy();

        debug!(%endpoint, "seed channel pool: created channel");
        channels.insert(endpoint.clone(), channel.clone());
        Ok(channel)
    }

    /// Number of distinct seed channels created so far.
    pub async fn len(&self) -> usize {
        self.inner.channels.lock().await.len()
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Close the pool: no channel objects are dropped out from under
    /// in-flight RPCs (tonic's `Channel` is clone-and-share), but further
    /// `get_channel` calls fail with [`Error::ResourceClosed`].
    pub fn close(&self) {
        self.inner
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
        debug!("seed channel pool: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_channel_for_same_endpoint() {
        let pool = SeedChannelPool::new(false, None);
        let e = Endpoint::new("localhost", 50051);
        let a = pool.get_channel(&e).await.unwrap();
        let b = pool.get_channel(&e).await.unwrap();
        // tonic::Channel doesn't expose identity comparison, but we can
        // assert the pool only grew by one entry for two gets of the
        // same endpoint.
        drop((a, b));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_endpoints_get_distinct_entries() {
        let pool = SeedChannelPool::new(false, None);
        pool.get_channel(&Endpoint::new("a", 1)).await.unwrap();
        pool.get_channel(&Endpoint::new("b", 1)).await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn fails_after_close() {
        let pool = SeedChannelPool::new(false, None);
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get_channel(&Endpoint::new("a", 1)).await,
            Err(Error::ResourceClosed)
        ));
    }
}
