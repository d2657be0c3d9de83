//! The topology source interfaces consumed by the balancer.
//!
//! Two shapes are supported: a polling source returns one [`Topology`]
//! per call; a streaming source returns a lazy sequence. Both are
//! user-supplied — how a source actually reaches the cluster control
//! plane is left entirely to the caller — and both must be re-entrant,
//! since the subscription engine invokes them concurrently across
//! seeds.

use std::pin::Pin;
use std::time::Duration;

use tokio_stream::Stream;
use tonic::transport::Channel;

use crate::topology::{Endpoint, Node, Topology};

/// Ordering comparer a topology source may provide over its own nodes.
///
/// When present, the resolver and picker may use it instead of the
/// default `Node::priority` ordering. Kept as a plain function pointer
/// (rather than a trait) since sources rarely need more than a
/// `Fn(&Node, &Node) -> Ordering`.
pub type NodeComparer = std::sync::Arc<dyn Fn(&Node, &Node) -> std::cmp::Ordering + Send + Sync>;

/// Context passed to a topology source on every call.
#[derive(Clone)]
pub struct TopologyContext {
    /// The transport channel to the seed this call is addressed to,
    /// obtained from the [`SeedChannelPool`](crate::seed_pool::SeedChannelPool).
    pub channel: Channel,
    /// Per-attempt inactivity deadline.
    pub timeout: Duration,
    /// The seed endpoint this context was built for.
    pub endpoint: Endpoint,
}

/// An error surfaced by a topology source call.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A topology source that returns one snapshot per call.
///
/// Always consumed through the [`PollingToStreamingAdapter`](crate::polling::PollingToStreamingAdapter),
/// which the subscription engine treats as an ordinary streaming source —
/// the engine itself only ever consumes streaming shapes.
#[async_trait::async_trait]
pub trait PollingTopologySource: Send + Sync + 'static {
    /// Fetch one topology snapshot.
    async fn poll(&self, ctx: &TopologyContext) -> Result<Topology, SourceError>;

    /// An optional ordering comparer over this source's nodes.
    fn comparer(&self) -> Option<NodeComparer> {
        None
    }
}

/// A boxed, type-erased stream of topology snapshots.
pub type BoxTopologyStream =
    Pin<Box<dyn Stream<Item = Result<Topology, SourceError>> + Send + 'static>>;

/// A topology source that returns a lazy, finite-or-infinite sequence of
/// snapshots. The sequence ending normally signals "resubscribe".
pub trait StreamingTopologySource: Send + Sync + 'static {
    /// Begin a subscription against the given context. May be called
    /// multiple times (once per seed, and again on every resolver
    /// refresh).
    fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream;

    /// An optional ordering comparer over this source's nodes.
    fn comparer(&self) -> Option<NodeComparer> {
        None
    }
}

// Type-erasure forwarding impls: the builder stores whatever concrete
// source the caller supplies behind a trait object, but the subscription
// engine and polling adapter are generic over `S: ...TopologySource`, not
// `dyn ...TopologySource`. Forwarding through `Arc` lets a boxed source
// satisfy that bound directly.

#[async_trait::async_trait]
impl PollingTopologySource for std::sync::Arc<dyn PollingTopologySource> {
    async fn poll(&self, ctx: &TopologyContext) -> Result<Topology, SourceError> {
        (**self).poll(ctx).await
    }

    fn comparer(&self) -> Option<NodeComparer> {
        (**self).comparer()
    }
}

impl StreamingTopologySource for std::sync::Arc<dyn StreamingTopologySource> {
    fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream {
        (**self).subscribe(ctx)
    }

    fn comparer(&self) -> Option<NodeComparer> {
        (**self).comparer()
    }
}
