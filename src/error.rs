//! Error types surfaced by the balancer to callers and to the channel itself.

use crate::topology::Endpoint;

/// Errors surfaced by the cluster balancer.
///
/// Per-seed subscription failures (a single seed losing the race) are
/// represented as [`Error::Topology`] and accumulated without being
/// surfaced individually; they only reach a caller bundled inside
/// [`Error::ClusterDiscovery::causes`] once every seed has lost for a
/// whole discovery round.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The builder was misconfigured. Raised from `Build()`; no channel
    /// is produced.
    #[error("load balancing configuration error: {0}")]
    LoadBalancingConfiguration(String),

    /// Every seed was exhausted after the configured number of discovery
    /// attempts.
    #[error(
        "cluster discovery failed after {attempts} attempt(s) against {seeds} seed(s): {}",
        join_causes(.causes)
    )]
    ClusterDiscovery {
        /// Number of discovery rounds attempted before giving up.
        attempts: usize,
        /// Number of seeds that were tried.
        seeds: usize,
        /// The accumulated per-seed failures from the last round, each a
        /// [`Error::Topology`].
        causes: Vec<Error>,
    },

    /// A topology was observed but it contained no eligible node.
    #[error("topology observed with {total_nodes} node(s) but none are eligible")]
    NoEligibleNodes {
        /// Total number of nodes in the offending topology.
        total_nodes: usize,
    },

    /// A single seed's subscription attempt failed.
    #[error("subscription to seed {endpoint} failed: {source}")]
    Topology {
        /// The seed endpoint whose subscription attempt failed.
        endpoint: Endpoint,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The seed channel pool has been closed; no further channels can be
    /// handed out.
    #[error("seed channel pool is closed")]
    ResourceClosed,
}

impl Error {
    /// Build a per-seed subscription failure (`Error::Topology`) from a
    /// human-readable message.
    pub(crate) fn topology(endpoint: Endpoint, message: impl Into<String>) -> Self {
        Error::Topology {
            endpoint,
            source: Box::<dyn std::error::Error + Send + Sync>::from(message.into()),
        }
    }
}

fn join_causes(causes: &[Error]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for balancer operations.
pub type Result<T> = std::result::Result<T, Error>;
