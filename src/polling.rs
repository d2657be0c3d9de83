//! Polling→Streaming adapter.
//!
//! Wraps a [`PollingTopologySource`] so the subscription engine can treat
//! it uniformly with a native streaming source: repeatedly poll, yield
//! the result, sleep `delay`, and retry-with-backoff on transient
//! failure. The stream itself is built with the same `async-stream`
//! idiom `tonic`'s `transport` feature uses for ad hoc streams.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::resilience::Backoff;
use crate::source::{
    BoxTopologyStream, NodeComparer, PollingTopologySource, SourceError, StreamingTopologySource,
    TopologyContext,
};
use crate::topology::Topology;

/// Adapts a [`PollingTopologySource`] into a [`StreamingTopologySource`].
///
/// If `delay` is zero, the adapter yields exactly one snapshot and
/// completes (one-shot mode).
pub struct PollingToStreamingAdapter<P> {
    source: Arc<P>,
    delay: Duration,
    max_consecutive_failures: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl<P: PollingTopologySource> PollingToStreamingAdapter<P> {
    /// Wrap `source`, polling every `delay` (or once, if `delay` is
    /// zero), and propagating a failure upward after
    /// `max_consecutive_failures` consecutive poll failures so the
    /// subscription engine can try another seed. `initial_backoff` and
    /// `max_backoff` bound the backoff applied between failed polls —
    /// normally the resolver's own `ResilienceConfig` values.
    pub fn new(
        source: P,
        delay: Duration,
        max_consecutive_failures: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            source: Arc::new(source),
            delay,
            max_consecutive_failures: max_consecutive_failures.max(1),
            initial_backoff,
            max_backoff,
        }
    }
}

impl<P: PollingTopologySource> StreamingTopologySource for PollingToStreamingAdapter<P> {
    fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream {
        let source = Arc::clone(&self.source);
        let delay = self.delay;
        let max_consecutive_failures = self.max_consecutive_failures;
        let initial_backoff = self.initial_backoff;
        let max_backoff = self.max_backoff;
        let endpoint = ctx.endpoint.clone();

        let stream = async_stream::stream! {
            let mut backoff = Backoff::new(initial_backoff, max_backoff);
            let mut consecutive_failures: usize = 0;

            loop {
                match source.poll(&ctx).await {
                    Ok(topology) => {
                        consecutive_failures = 0;
                        backoff.reset();
                        yield Ok(topology);

                        if delay.is_zero() {
                            debug!(%endpoint, "polling adapter: one-shot mode, stopping after first snapshot");
                            return;
                        }
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= max_consecutive_failures {
                            warn!(%endpoint, consecutive_failures, "polling adapter: giving up on this seed");
                            yield Err(err);
                            return;
                        }
                        let wait = backoff.next_backoff();
                        debug!(%endpoint, consecutive_failures, ?wait, "polling adapter: poll failed, backing off");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        };

        Box::pin(stream)
    }

    fn comparer(&self) -> Option<NodeComparer> {
        self.source.comparer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Endpoint, Node};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    struct OneShot;

    #[async_trait::async_trait]
    impl PollingTopologySource for OneShot {
        async fn poll(&self, _ctx: &TopologyContext) -> Result<Topology, SourceError> {
            Ok(Topology::new([Node::new(Endpoint::new("a", 1), true, 0)]))
        }
    }

    fn ctx() -> TopologyContext {
        TopologyContext {
            channel: tonic::transport::Endpoint::from_static("http://127.0.0.1:1")
                .connect_lazy(),
            timeout: Duration::from_secs(1),
            endpoint: Endpoint::new("127.0.0.1", 1),
        }
    }

    #[tokio::test]
    async fn zero_delay_yields_exactly_one_then_completes() {
        let adapter = PollingToStreamingAdapter::new(
            OneShot,
            Duration::ZERO,
            3,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        let mut stream = adapter.subscribe(ctx());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
    }

    struct AlwaysFails(AtomicUsize);

    #[async_trait::async_trait]
    impl PollingTopologySource for AlwaysFails {
        async fn poll(&self, _ctx: &TopologyContext) -> Result<Topology, SourceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn propagates_failure_after_max_consecutive_failures() {
        let calls = AtomicUsize::new(0);
        let adapter = PollingToStreamingAdapter::new(
            AlwaysFails(calls),
            Duration::from_millis(1),
            3,
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let mut stream = adapter.subscribe(ctx());
        let result = stream.next().await.unwrap();
        assert!(result.is_err());
        assert!(stream.next().await.is_none());
    }
}
