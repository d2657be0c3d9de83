//! Example demonstrating `tonic-cluster` usage.
//!
//! This example shows:
//! - How to implement `PollingTopologySource` against a fixed node list
//! - How to build a `ClusterChannel` with seeds, resilience and TLS options
//! - How to install the refresh trigger interceptor on the call path
//!
//! # Configuration (environment variables)
//!
//! - `CLUSTER_SEEDS` — comma-separated `host:port` seed list (default: `127.0.0.1:50051`)
//!
//! # Usage
//!
//! ```sh
//! CLUSTER_SEEDS=127.0.0.1:50051,127.0.0.1:50052 cargo run -p tonic-cluster --example basic
//! ```

use std::time::Duration;

use tower_layer::Layer;

use tonic_cluster::builder::ClusterChannelBuilder;
use tonic_cluster::interceptor::RefreshTriggerLayer;
use tonic_cluster::resilience::ResilienceConfig;
use tonic_cluster::source::{PollingTopologySource, SourceError, TopologyContext};
use tonic_cluster::topology::{Endpoint, Node, Topology};

/// A topology source that advertises a fixed list of nodes — a stand-in
/// for a real cluster control plane, which is out of this crate's scope.
struct StaticCluster {
    nodes: Vec<Endpoint>,
}

#[async_trait::async_trait]
impl PollingTopologySource for StaticCluster {
    async fn poll(&self, _ctx: &TopologyContext) -> Result<Topology, SourceError> {
        Ok(Topology::new(
            self.nodes
                .iter()
                .enumerate()
                .map(|(i, endpoint)| Node::new(endpoint.clone(), true, i as i32)),
        ))
    }
}

fn parse_seeds() -> Vec<Endpoint> {
    std::env::var("CLUSTER_SEEDS")
        .unwrap_or_else(|_| "127.0.0.1:50051".to_string())
        .split(',')
        .map(|s| s.trim().parse().expect("CLUSTER_SEEDS entry must be \"host:port\""))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let seeds = parse_seeds();
    println!("tonic-cluster example\n");
    println!("Seeds: {seeds:?}");

    let resilience = ResilienceConfig::new(
        Duration::from_secs(5),
        5,
        Duration::from_millis(200),
        Duration::from_secs(10),
    )?;

    let channel = ClusterChannelBuilder::new()
        .with_seeds(seeds.clone())
        .with_resilience(resilience)
        .with_polling_topology_source(StaticCluster { nodes: seeds }, Duration::from_secs(30))
        .use_tls(false)
        .build()
        .await?;

    let refresh_layer = RefreshTriggerLayer::new(
        channel.refresh_action(),
        channel.refresh_predicate(),
    );
    let _service = refresh_layer.layer(channel);

    println!("Cluster channel built; wire `_service` into a generated client to make calls.");
    Ok(())
}
