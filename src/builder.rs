//! Builder surface and the materialized client channel.
//!
//! Mirrors the consuming-builder shape of `xds-client`'s
//! `ClientConfig`/`ServerConfig`, generalized from xDS transport config
//! to the balancer's seeds/resilience/topology-source/refresh options,
//! and wires the eight components into one `tower::Service` channel
//! applications dial RPCs through.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body::Body;
use tonic::transport::{Channel as TonicChannel, Endpoint as TonicEndpoint};
use tonic::{Code, Status};
use tower_service::Service;

use crate::error::{Error, Result};
use crate::interceptor::{predicate_from_codes, wrap_response, RefreshAction, RefreshPredicate, RefreshTriggerBody};
use crate::resilience::ResilienceConfig;
use crate::resolver::{Resolver, ResolverUpdate};
use crate::runtime::tokio::TokioRuntime;
use crate::runtime::Runtime;
use crate::seed_pool::{ChannelOptionsHook, SeedChannelPool};
use crate::source::{PollingTopologySource, StreamingTopologySource};
use crate::subchannel::SubchannelManager;
use crate::subscription::SubscriptionEngine;
use crate::topology::Endpoint;

type BoxedStreamingSource = Arc<dyn StreamingTopologySource>;

enum SourceConfig {
    Polling {
        source: Arc<dyn PollingTopologySource>,
        delay: Duration,
        max_consecutive_failures: usize,
    },
    Streaming(BoxedStreamingSource),
}

/// Fluent configuration for a [`ClusterChannel`].
pub struct ClusterChannelBuilder<R = TokioRuntime> {
    seeds: Vec<Endpoint>,
    resilience: ResilienceConfig,
    source: Option<SourceConfig>,
    both_source_shapes_set: bool,
    refresh_predicate: Option<RefreshPredicate>,
    tls: bool,
    options_hook: Option<ChannelOptionsHook>,
    runtime: R,
}

impl Default for ClusterChannelBuilder<TokioRuntime> {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterChannelBuilder<TokioRuntime> {
    /// Start a new builder on the default `tokio` runtime.
    pub fn new() -> Self {
        Self {
            seeds: Vec::new(),
            resilience: ResilienceConfig::default(),
            source: None,
            both_source_shapes_set: false,
            refresh_predicate: None,
            tls: false,
            options_hook: None,
            runtime: TokioRuntime,
        }
    }
}

impl<R: Runtime> ClusterChannelBuilder<R> {
    /// Use a different [`Runtime`] for the balancer's background tasks
    /// (primarily useful for tests that need a deterministic clock).
    pub fn with_runtime<R2: Runtime>(self, runtime: R2) -> ClusterChannelBuilder<R2> {
        ClusterChannelBuilder {
            seeds: self.seeds,
            resilience: self.resilience,
            source: self.source,
            both_source_shapes_set: self.both_source_shapes_set,
            refresh_predicate: self.refresh_predicate,
            tls: self.tls,
            options_hook: self.options_hook,
            runtime,
        }
    }

    /// Accumulate additional seed endpoints. The first seed ever added
    /// remains first in the list the subscription engine races.
    pub fn with_seeds(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.seeds.extend(endpoints);
        self
    }

    /// Set the resilience configuration (`Timeout`, `MaxDiscoveryAttempts`,
    /// `InitialBackoff`, `MaxBackoff`, `RefreshOnStatusCodes`).
    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Use a polling topology source, polled every `delay` (or once, if
    /// `delay` is zero). Mutually exclusive with
    /// [`with_streaming_topology_source`](Self::with_streaming_topology_source).
    pub fn with_polling_topology_source(
        mut self,
        source: impl PollingTopologySource,
        delay: Duration,
    ) -> Self {
        if self.source.is_some() {
            self.both_source_shapes_set = true;
        }
        self.source = Some(SourceConfig::Polling {
            source: Arc::new(source),
            delay,
            max_consecutive_failures: self.resilience.max_discovery_attempts,
        });
        self
    }

    /// Use a streaming topology source. Mutually exclusive with
    /// [`with_polling_topology_source`](Self::with_polling_topology_source).
    pub fn with_streaming_topology_source(mut self, source: impl StreamingTopologySource) -> Self {
        if self.source.is_some() {
            self.both_source_shapes_set = true;
        }
        self.source = Some(SourceConfig::Streaming(Arc::new(source)));
        self
    }

    /// Override the default refresh predicate (built from
    /// `RefreshOnStatusCodes`) with an arbitrary one.
    pub fn with_refresh_policy(mut self, predicate: RefreshPredicate) -> Self {
        self.refresh_predicate = Some(predicate);
        self
    }

    /// Mutate every seed and subchannel transport channel's construction
    /// options.
    pub fn configure_channel(
        mut self,
        hook: impl Fn(TonicEndpoint) -> TonicEndpoint + Send + Sync + 'static,
    ) -> Self {
        self.options_hook = Some(Arc::new(hook));
        self
    }

    /// Select `http` (`false`) or `https` (`true`) scheme for every
    /// channel the balancer builds.
    pub fn use_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Validate and materialize a client channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadBalancingConfiguration`] if no seeds were
    /// given, no topology source was configured, or both source shapes
    /// were configured.
    pub async fn build(self) -> Result<ClusterChannel<R>> {
        if self.seeds.is_empty() {
            return Err(Error::LoadBalancingConfiguration(
                "at least one seed is required".into(),
            ));
        }
        if self.both_source_shapes_set {
            return Err(Error::LoadBalancingConfiguration(
                "polling and streaming topology sources are mutually exclusive".into(),
            ));
        }

        let streaming_source: BoxedStreamingSource = match self.source {
            None => {
                return Err(Error::LoadBalancingConfiguration(
                    "no topology source configured".into(),
                ))
            }
            Some(SourceConfig::Streaming(source)) => source,
            Some(SourceConfig::Polling {
                source,
                delay,
                max_consecutive_failures,
            }) => Arc::new(crate::polling::PollingToStreamingAdapter::new(
                source,
                delay,
                max_consecutive_failures,
                self.resilience.initial_backoff,
                self.resilience.max_backoff,
            )),
        };

        let pool = SeedChannelPool::new(self.tls, self.options_hook);
        let engine = SubscriptionEngine::new(streaming_source, pool, self.seeds, self.resilience.clone());
        let (resolver, mut updates) = Resolver::new(engine, self.runtime.clone(), self.resilience.initial_backoff);
        resolver.start().await;

        let (manager, _aggregate) = SubchannelManager::new(self.tls, self.runtime.clone());

        {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let update = updates.borrow().clone();
                    match update {
                        ResolverUpdate::Addresses(addresses) => {
                            manager.reconcile(&addresses).await;
                        }
                        ResolverUpdate::Unavailable(message) => {
                            tracing::warn!(%message, "cluster channel: resolver reported unavailable");
                        }
                    }
                }
            });
        }

        let predicate = self
            .refresh_predicate
            .unwrap_or_else(|| predicate_from_codes(self.resilience.refresh_on_status_codes.clone()));

        Ok(ClusterChannel {
            manager,
            resolver,
            predicate,
        })
    }
}

/// A materialized, cluster-aware client channel.
///
/// Implements `tower_service::Service` for any request body `tonic`'s
/// generated clients use, so it can be passed directly to a generated
/// client constructor in place of a plain `tonic::transport::Channel`.
pub struct ClusterChannel<R> {
    manager: Arc<SubchannelManager<R>>,
    resolver: Arc<Resolver<Arc<dyn StreamingTopologySource>, R>>,
    predicate: RefreshPredicate,
}

impl<R> Clone for ClusterChannel<R> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            resolver: Arc::clone(&self.resolver),
            predicate: self.predicate.clone(),
        }
    }
}

impl<R: Runtime> ClusterChannel<R> {
    /// A refresh action that asks this channel's resolver to
    /// re-subscribe, suitable for installing a
    /// [`RefreshTriggerLayer`](crate::interceptor::RefreshTriggerLayer).
    pub fn refresh_action(&self) -> RefreshAction {
        let resolver = Arc::clone(&self.resolver);
        Arc::new(move || {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                resolver.refresh().await;
            });
        })
    }

    /// The refresh predicate this channel was built with.
    pub fn refresh_predicate(&self) -> RefreshPredicate {
        self.predicate.clone()
    }

    /// The status codes this channel's default resilience configuration
    /// treats as refresh triggers.
    pub fn default_refresh_codes() -> Vec<Code> {
        crate::resilience::default_refresh_codes()
    }
}

impl<ReqBody, ResBody, R> Service<http::Request<ReqBody>> for ClusterChannel<R>
where
    R: Runtime,
    TonicChannel: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    <TonicChannel as Service<http::Request<ReqBody>>>::Error: Into<tonic::codegen::StdError>,
    <TonicChannel as Service<http::Request<ReqBody>>>::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body + Send + 'static,
{
    type Response = http::Response<RefreshTriggerBody<ResBody>>;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Status>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        // Readiness is decided per-call by the picker instead: a
        // momentarily empty ready set isn't a hard backpressure signal
        // the way a single transport connection's `poll_ready` is.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let picker = self.manager.picker();
        let predicate = self.predicate.clone();
        let refresh = self.refresh_action();
        Box::pin(async move {
            let mut channel = picker.pick()?;
            let response = channel
                .call(req)
                .await
                .map_err(|e| Status::from_error(e.into()))?;
            Ok(wrap_response(response, predicate, refresh))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BoxTopologyStream, SourceError, TopologyContext};
    use crate::topology::{Node, Topology};

    struct OneNode;

    impl StreamingTopologySource for OneNode {
        fn subscribe(&self, ctx: TopologyContext) -> BoxTopologyStream {
            Box::pin(async_stream::stream! {
                yield Ok::<Topology, SourceError>(Topology::new([
                    Node::new(ctx.endpoint.clone(), true, 0),
                ]));
            })
        }
    }

    #[tokio::test]
    async fn build_rejects_missing_seeds() {
        let result = ClusterChannelBuilder::new()
            .with_streaming_topology_source(OneNode)
            .build()
            .await;
        assert!(matches!(result, Err(Error::LoadBalancingConfiguration(_))));
    }

    #[tokio::test]
    async fn build_rejects_missing_topology_source() {
        let result = ClusterChannelBuilder::new()
            .with_seeds([Endpoint::new("a", 1)])
            .build()
            .await;
        assert!(matches!(result, Err(Error::LoadBalancingConfiguration(_))));
    }

    struct OnePoll;

    #[async_trait::async_trait]
    impl PollingTopologySource for OnePoll {
        async fn poll(
            &self,
            ctx: &TopologyContext,
        ) -> std::result::Result<Topology, crate::source::SourceError> {
            Ok(Topology::new([Node::new(ctx.endpoint.clone(), true, 0)]))
        }
    }

    #[tokio::test]
    async fn build_rejects_both_source_shapes_configured() {
        let result = ClusterChannelBuilder::new()
            .with_seeds([Endpoint::new("a", 1)])
            .with_polling_topology_source(OnePoll, Duration::from_secs(1))
            .with_streaming_topology_source(OneNode)
            .build()
            .await;
        assert!(matches!(result, Err(Error::LoadBalancingConfiguration(_))));
    }

    #[tokio::test]
    async fn build_succeeds_with_seeds_and_a_streaming_source() {
        let channel = ClusterChannelBuilder::new()
            .with_seeds([Endpoint::new("a", 1)])
            .with_streaming_topology_source(OneNode)
            .build()
            .await
            .unwrap();
        let _ = channel.refresh_action();
    }
}
