//! Resolver.
//!
//! Owns the subscription loop, diffs consecutive snapshots, and publishes
//! a sorted, eligible-only address list to the subchannel manager over a
//! `tokio::sync::watch` channel — the same lock-free "latest value wins"
//! primitive `xds-client`'s worker loop uses to hand resource updates to
//! watchers, generalized here from per-resource-type dispatch to a single
//! address-list publication point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::runtime::Runtime;
use crate::source::StreamingTopologySource;
use crate::subscription::SubscriptionEngine;
use crate::topology::{Endpoint, Topology};

/// One address in a resolver's published list: an endpoint plus the
/// priority attribute carried from its source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The node's endpoint.
    pub endpoint: Endpoint,
    /// Lower is preferred.
    pub priority: i32,
}

/// What the resolver publishes on every change.
#[derive(Debug, Clone)]
pub enum ResolverUpdate {
    /// A fresh, eligible-only address list, sorted ascending by priority.
    Addresses(Arc<[Address]>),
    /// The subscription could not produce a usable topology; carries the
    /// root cause ([`Error::NoEligibleNodes`] or [`Error::ClusterDiscovery`]).
    /// The subchannel manager should treat this as "no addresses" without
    /// tearing down existing subchannels.
    Unavailable(Arc<Error>),
}

/// Fallback retry delay used when the subscription stream ends without
/// an error and there is no other natural delay to fall back on.
const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(5);

struct RunState {
    generation: u64,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Drives a [`SubscriptionEngine`], republishing the current address list
/// whenever the topology changes.
pub struct Resolver<S, R> {
    engine: Arc<SubscriptionEngine<S>>,
    runtime: R,
    retry_delay: Duration,
    sender: watch::Sender<ResolverUpdate>,
    run: Mutex<RunState>,
}

impl<S, R> Resolver<S, R>
where
    S: StreamingTopologySource,
    R: Runtime,
{
    /// Build a resolver and its initial (empty) update receiver.
    ///
    /// `retry_delay` is the wait between the subscription loop ending (in
    /// either failure or normal completion) and the next round; pass
    /// [`Duration::ZERO`] to fall back to a few seconds, mirroring the
    /// polling adapter's `Delay` semantics.
    pub fn new(
        engine: SubscriptionEngine<S>,
        runtime: R,
        retry_delay: Duration,
    ) -> (Arc<Self>, watch::Receiver<ResolverUpdate>) {
        let (sender, receiver) = watch::channel(ResolverUpdate::Addresses(Arc::from(
            Vec::<Address>::new(),
        )));
        let resolver = Arc::new(Self {
            engine: Arc::new(engine),
            runtime,
            retry_delay: if retry_delay.is_zero() {
                FALLBACK_RETRY_DELAY
            } else {
                retry_delay
            },
            sender,
            run: Mutex::new(RunState {
                generation: 0,
                handle: None,
            }),
        });
        (resolver, receiver)
    }

    /// Begin the subscription loop. No-op if already started.
    pub async fn start(self: &Arc<Self>) {
        let mut run = self.run.lock().await;
        if run.handle.is_some() {
            return;
        }
        run.generation += 1;
        run.handle = Some(self.spawn_loop(run.generation));
    }

    /// Atomically cancel the current subscription and start a new one.
    /// Idempotent w.r.t. rapid repeats: concurrent callers coalesce onto
    /// whichever generation wins the lock last.
    pub async fn refresh(self: &Arc<Self>) {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.handle.take() {
            handle.abort();
        }
        run.generation += 1;
        info!(generation = run.generation, "resolver: refresh requested");
        run.handle = Some(self.spawn_loop(run.generation));
    }

    /// Cancel and await the loop. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn spawn_loop(self: &Arc<Self>, generation: u64) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop(generation).await })
    }

    async fn run_loop(self: Arc<Self>, generation: u64) {
        let mut last: Option<Topology> = None;
        let mut first = true;

        loop {
            let mut stream = self.engine.subscribe();
            let mut saw_any_snapshot = false;

            while let Some(event) = stream.next().await {
                if !self.still_current(generation).await {
                    return;
                }
                match event {
                    Ok(topology) => {
                        saw_any_snapshot = true;
                        self.handle_topology(&mut last, &mut first, topology);
                    }
                    Err(err) => {
                        warn!(error = %err, "resolver: subscription failed, publishing Unavailable");
                        let _ = self.sender.send(ResolverUpdate::Unavailable(Arc::new(err)));
                    }
                }
            }

            if !self.still_current(generation).await {
                return;
            }

            if saw_any_snapshot {
                debug!("resolver: subscription stream ended normally, resubscribing");
            } else {
                debug!("resolver: subscription loop idle, retrying after delay");
                self.runtime.sleep(self.retry_delay).await;
            }
        }
    }

    async fn still_current(&self, generation: u64) -> bool {
        self.run.lock().await.generation == generation
    }

    fn handle_topology(&self, last: &mut Option<Topology>, first: &mut bool, topology: Topology) {
        if topology.has_no_eligible_nodes() {
            warn!(
                total_nodes = topology.count(),
                "resolver: topology has no eligible nodes"
            );
            let _ = self.sender.send(ResolverUpdate::Unavailable(Arc::new(
                Error::NoEligibleNodes {
                    total_nodes: topology.count(),
                },
            )));
            *last = Some(topology);
            *first = false;
            return;
        }

        let changed = *first
            || last
                .as_ref()
                .map(|l| l.comparison_set() != topology.comparison_set())
                .unwrap_or(true);

        if changed {
            let (added, removed) = diff(last.as_ref(), &topology);
            info!(added = added.len(), removed = removed.len(), "resolver: topology changed, publishing");
            let addresses = publish_order(&topology);
            let _ = self
                .sender
                .send(ResolverUpdate::Addresses(Arc::from(addresses)));
        }

        *last = Some(topology);
        *first = false;
    }
}

/// Build the published address list: eligible nodes only, sorted
/// ascending by priority.
fn publish_order(topology: &Topology) -> Vec<Address> {
    let mut addresses: Vec<Address> = topology
        .nodes()
        .iter()
        .filter(|n| n.is_eligible())
        .map(|n| Address {
            endpoint: n.endpoint().clone(),
            priority: n.priority(),
        })
        .collect();
    addresses.sort_by_key(|a| a.priority);
    addresses
}

/// Endpoints added and removed between two topologies, by `(host, port)`
/// set difference.
fn diff(previous: Option<&Topology>, next: &Topology) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let before: HashSet<Endpoint> = previous
        .map(|t| t.nodes().iter().map(|n| n.endpoint().clone()).collect())
        .unwrap_or_default();
    let after: HashSet<Endpoint> = next.nodes().iter().map(|n| n.endpoint().clone()).collect();

    let added = after.difference(&before).cloned().collect();
    let removed = before.difference(&after).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ResilienceConfig;
    use crate::runtime::tokio::TokioRuntime;
    use crate::seed_pool::SeedChannelPool;
    use crate::source::{BoxTopologyStream, SourceError, TopologyContext};
    use crate::topology::Node;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SingleSnapshot(AtomicUsize);

    impl StreamingTopologySource for SingleSnapshot {
        fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async_stream::stream! {
                yield Ok::<Topology, SourceError>(Topology::new([
                    Node::new(ctx.endpoint.clone(), true, 0),
                ]));
            })
        }
    }

    fn engine() -> SubscriptionEngine<SingleSnapshot> {
        SubscriptionEngine::new(
            SingleSnapshot(AtomicUsize::new(0)),
            SeedChannelPool::new(false, None),
            vec![Endpoint::new("a", 1)],
            ResilienceConfig::default(),
        )
    }

    #[tokio::test]
    async fn publishes_addresses_for_first_topology() {
        let (resolver, mut updates) = Resolver::new(engine(), TokioRuntime, Duration::ZERO);
        resolver.start().await;

        updates.changed().await.unwrap();
        match &*updates.borrow() {
            ResolverUpdate::Addresses(addrs) => {
                assert_eq!(addrs.len(), 1);
                assert_eq!(addrs[0].endpoint, Endpoint::new("a", 1));
            }
            other => panic!("expected Addresses, got {other:?}"),
        }
        resolver.close().await;
    }

    struct NoEligibleSnapshot;

    impl StreamingTopologySource for NoEligibleSnapshot {
        fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream {
            Box::pin(async_stream::stream! {
                yield Ok::<Topology, SourceError>(Topology::new([
                    Node::new(ctx.endpoint.clone(), false, 0),
                ]));
            })
        }
    }

    #[tokio::test]
    async fn publishes_typed_no_eligible_nodes_error() {
        let engine = SubscriptionEngine::new(
            NoEligibleSnapshot,
            SeedChannelPool::new(false, None),
            vec![Endpoint::new("a", 1)],
            ResilienceConfig::default(),
        );
        let (resolver, mut updates) = Resolver::new(engine, TokioRuntime, Duration::ZERO);
        resolver.start().await;

        updates.changed().await.unwrap();
        match &*updates.borrow() {
            ResolverUpdate::Unavailable(err) => {
                assert!(matches!(**err, Error::NoEligibleNodes { total_nodes: 1 }));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        resolver.close().await;
    }

    #[test]
    fn publish_order_filters_ineligible_and_sorts_by_priority() {
        let topology = Topology::new([
            Node::new(Endpoint::new("p", 1), true, 1),
            Node::new(Endpoint::new("q", 1), true, 0),
            Node::new(Endpoint::new("r", 1), false, -1),
        ]);
        let addresses = publish_order(&topology);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].endpoint, Endpoint::new("q", 1));
        assert_eq!(addresses[1].endpoint, Endpoint::new("p", 1));
    }

    #[test]
    fn diff_computes_added_and_removed() {
        let before = Topology::new([
            Node::new(Endpoint::new("a", 1), true, 0),
            Node::new(Endpoint::new("b", 1), true, 0),
        ]);
        let after = Topology::new([
            Node::new(Endpoint::new("b", 1), true, 0),
            Node::new(Endpoint::new("c", 1), true, 0),
        ]);
        let (added, removed) = diff(Some(&before), &after);
        assert_eq!(added, vec![Endpoint::new("c", 1)]);
        assert_eq!(removed, vec![Endpoint::new("a", 1)]);
    }
}
