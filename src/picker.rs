//! Picker.
//!
//! Per-RPC subchannel selection. Construction is the only place that
//! allocates; `pick` itself touches only a slice and an atomic counter,
//! matching the "lock-free, allocation-free hot path" requirement the
//! seed channel pool and subchannel manager already follow for their own
//! read paths.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tonic::transport::Channel;
use tonic::Status;

use crate::subchannel::{ConnectivityState, Subchannel};

/// An immutable, allocation-free subchannel selector.
///
/// Never mutated after construction — the subchannel manager publishes a
/// new `Picker` by atomic replacement instead.
pub struct Picker {
    ready: Vec<Arc<Subchannel>>,
    counter: AtomicI64,
}

impl Picker {
    /// Build a picker from the subchannels observed `Ready` at
    /// construction time, sorted ascending by priority.
    ///
    /// Any subchannel not in state `Ready` is dropped silently: this is
    /// a programming error in the caller (the manager only passes
    /// already-filtered subchannels), not a runtime condition worth
    /// surfacing.
    pub fn new(mut ready: Vec<Arc<Subchannel>>) -> Self {
        ready.retain(|s| s.state() == ConnectivityState::Ready);
        ready.sort_by_key(|s| s.priority());
        Self {
            ready,
            counter: AtomicI64::new(0),
        }
    }

    /// A picker with no ready subchannels; every pick fails.
    pub fn empty() -> Self {
        Self {
            ready: Vec::new(),
            counter: AtomicI64::new(0),
        }
    }

    /// Number of subchannels this picker can select from.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// Whether this picker has no subchannels to select from.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Select the next subchannel's transport channel, round-robin in
    /// priority order.
    ///
    /// # Errors
    ///
    /// Returns `Status::unavailable` if no subchannel is ready.
    pub fn pick(&self) -> Result<Channel, Status> {
        Ok(self.ready[self.next_index()?].channel())
    }

    fn next_index(&self) -> Result<usize, Status> {
        let n = self.ready.len();
        if n == 0 {
            return Err(Status::unavailable("no ready nodes available"));
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        // `rem_euclid` keeps the index in `[0, n)` even as `counter`
        // wraps through negative values on i64 overflow.
        Ok(counter.rem_euclid(n as i64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Endpoint;
    use tonic::transport::Endpoint as TonicEndpoint;

    fn ready_subchannel(host: &str, priority: i32) -> Arc<Subchannel> {
        let channel = TonicEndpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let sc = Subchannel::new(Endpoint::new(host, 1), priority, channel);
        sc.set_state(ConnectivityState::Ready);
        sc
    }

    #[test]
    fn empty_picker_fails_every_pick() {
        let picker = Picker::empty();
        assert!(picker.pick().is_err());
    }

    #[test]
    fn single_ready_subchannel_always_picked() {
        let picker = Picker::new(vec![ready_subchannel("a", 0)]);
        for _ in 0..5 {
            assert!(picker.pick().is_ok());
        }
    }

    #[test]
    fn round_robin_visits_every_subchannel_within_first_2n_picks() {
        let subchannels = vec![
            ready_subchannel("a", 0),
            ready_subchannel("b", 0),
            ready_subchannel("c", 0),
        ];
        let picker = Picker::new(subchannels);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..(2 * picker.len()) {
            seen.insert(picker.next_index().unwrap());
        }
        assert_eq!(seen.len(), picker.len());
    }

    #[test]
    fn picker_filters_out_non_ready_subchannels() {
        let channel = TonicEndpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let idle = Subchannel::new(Endpoint::new("idle", 1), 0, channel);
        let picker = Picker::new(vec![idle, ready_subchannel("ready", 0)]);
        assert_eq!(picker.len(), 1);
    }
}
