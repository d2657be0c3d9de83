//! The balancer's data model: endpoints, nodes and topology snapshots.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A `(host, port)` pair identifying one backend.
///
/// Equality and hashing are by both fields, mirroring
/// `tonic::transport::Endpoint`'s role as the unit the balancer dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The endpoint's host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The endpoint's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Render this endpoint as a URI tonic can connect to, e.g.
    /// `http://host:port` or `https://host:port` depending on `tls`.
    pub fn to_uri(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when an endpoint string of the form `"host:port"` fails
/// to parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint {0:?}, expected \"host:port\"")]
pub struct ParseEndpointError(String);

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseEndpointError(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ParseEndpointError(s.to_string()))?;
        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<&str> for Endpoint {
    type Error = ParseEndpointError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ParseEndpointError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A node advertised by a topology source: an endpoint plus eligibility
/// and an ordering priority.
///
/// Two nodes are equal iff their endpoint, eligibility and priority are
/// all equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    endpoint: Endpoint,
    eligible: bool,
    priority: i32,
}

impl Node {
    /// Create a new node.
    pub fn new(endpoint: Endpoint, eligible: bool, priority: i32) -> Self {
        Self {
            endpoint,
            eligible,
            priority,
        }
    }

    /// This node's endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether this node may currently receive traffic.
    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// This node's priority; lower is preferred.
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// An ordered, deduplicated set of [`Node`]s produced by a topology
/// source, plus derived counts.
///
/// Construction deduplicates by endpoint, keeping the first occurrence
/// when a source reports the same endpoint twice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    nodes: Vec<Node>,
}

impl Topology {
    /// Build a topology from an iterator of nodes, deduplicating by
    /// endpoint (first occurrence wins).
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for node in nodes {
            if seen.insert(node.endpoint().clone()) {
                deduped.push(node);
            }
        }
        Self { nodes: deduped }
    }

    /// All nodes in this topology, in source order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Total number of nodes.
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of eligible nodes.
    pub fn eligible_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_eligible()).count()
    }

    /// True if this topology has no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if this topology has nodes but none are eligible.
    pub fn has_no_eligible_nodes(&self) -> bool {
        !self.nodes.is_empty() && self.eligible_count() == 0
    }

    /// The set of `(host, port, eligible, priority)` tuples this topology
    /// represents, used for change detection by the resolver.
    pub(crate) fn comparison_set(&self) -> HashSet<(Endpoint, bool, i32)> {
        self.nodes
            .iter()
            .map(|n| (n.endpoint().clone(), n.is_eligible(), n.priority()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_host_port() {
        let e: Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(e.host(), "example.com");
        assert_eq!(e.port(), 443);
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        assert!("example.com".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_parses_ipv6_like_host_with_colon() {
        // rsplit_once keeps this simple and deterministic: the last colon
        // always separates the port.
        let e: Endpoint = "a:b:1".parse().unwrap();
        assert_eq!(e.host(), "a:b");
        assert_eq!(e.port(), 1);
    }

    #[test]
    fn topology_deduplicates_keeping_first() {
        let a = Endpoint::new("a", 1);
        let first = Node::new(a.clone(), true, 0);
        let second = Node::new(a.clone(), false, 5);
        let topo = Topology::new([first.clone(), second]);
        assert_eq!(topo.count(), 1);
        assert_eq!(topo.nodes()[0], first);
    }

    #[test]
    fn eligible_count_never_exceeds_count() {
        let topo = Topology::new([
            Node::new(Endpoint::new("a", 1), true, 0),
            Node::new(Endpoint::new("b", 1), false, 0),
        ]);
        assert!(topo.eligible_count() <= topo.count());
        assert_eq!(topo.eligible_count(), 1);
    }

    #[test]
    fn empty_topology_has_no_eligible_nodes_is_false() {
        let topo = Topology::default();
        assert!(topo.is_empty());
        assert!(!topo.has_no_eligible_nodes());
    }
}
