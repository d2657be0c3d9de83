//! Subchannel and Subchannel Manager.
//!
//! A subchannel owns one address's transport channel and tracks its
//! connectivity. The manager reconciles the resolver's address list
//! against the current subchannel set under a single mutex, then
//! rebuilds and atomically publishes the picker — the same
//! lock-on-write, lock-free-on-read split the seed channel pool uses for
//! its map, generalized here to cover connectivity state as well.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex};
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
use tracing::{debug, info};

use crate::picker::Picker;
use crate::resolver::Address;
use crate::runtime::Runtime;
use crate::topology::Endpoint;

/// A subchannel's connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// One address's transport channel plus its observed connectivity.
pub struct Subchannel {
    endpoint: Endpoint,
    priority: AtomicI32,
    channel: Channel,
    state: watch::Sender<ConnectivityState>,
}

impl Subchannel {
    pub(crate) fn new(endpoint: Endpoint, priority: i32, channel: Channel) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Arc::new(Self {
            endpoint,
            priority: AtomicI32::new(priority),
            channel,
            state,
        })
    }

    /// This subchannel's endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// This subchannel's current priority attribute.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    /// The transport channel RPCs are dispatched through.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// This subchannel's current connectivity state.
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn set_state(&self, state: ConnectivityState) {
        let _ = self.state.send(state);
    }

    /// Request a connection: marks the subchannel Connecting and spawns a
    /// one-shot handshake to observe Ready/TransientFailure. The
    /// channel used for RPC dispatch is built lazily up front and
    /// reconnects on its own thereafter — the manager only tracks the
    /// state transition, it does not own the reconnect loop; the
    /// transport's own backoff applies once Ready has been observed at
    /// least once.
    fn request_connection<R: Runtime>(self: &Arc<Self>, tls: bool, runtime: &R) {
        self.set_state(ConnectivityState::Connecting);
        let this = Arc::clone(self);
        let uri = this.endpoint.to_uri(tls);
        runtime.spawn(async move {
            let outcome = match TonicEndpoint::from_shared(uri) {
                Ok(endpoint) => endpoint.connect().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => {
                    debug!(endpoint = %this.endpoint, "subchannel: handshake succeeded");
                    this.set_state(ConnectivityState::Ready);
                }
                Err(e) => {
                    debug!(endpoint = %this.endpoint, error = %e, "subchannel: handshake failed");
                    this.set_state(ConnectivityState::TransientFailure);
                }
            }
        });
    }

    /// Watch this subchannel's own state and re-arm a connection attempt
    /// whenever something (e.g. the transport idling a long-unused
    /// connection out) moves it back to `Idle`. `TransientFailure` is
    /// deliberately left alone here — the transport's own backoff owns
    /// recovery from that state.
    fn spawn_auto_reconnect<R: Runtime>(self: &Arc<Self>, tls: bool, runtime: R) {
        let this = Arc::clone(self);
        let mut states = this.state.subscribe();
        runtime.spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                let state = *states.borrow();
                if state == ConnectivityState::Shutdown {
                    return;
                }
                if state == ConnectivityState::Idle {
                    debug!(endpoint = %this.endpoint, "subchannel: re-arming connection after going idle");
                    this.request_connection(tls, &runtime);
                }
            }
        });
    }

    fn shutdown(&self) {
        self.set_state(ConnectivityState::Shutdown);
    }
}

/// Aggregate connectivity across a subchannel set.
pub fn aggregate_state(subchannels: &[Arc<Subchannel>]) -> ConnectivityState {
    use ConnectivityState::*;
    if subchannels.iter().any(|s| s.state() == Ready) {
        Ready
    } else if subchannels.iter().any(|s| s.state() == Connecting) {
        Connecting
    } else if !subchannels.is_empty() {
        TransientFailure
    } else {
        Idle
    }
}

/// Reconciles the resolver's address list with per-endpoint subchannels,
/// rebuilds the picker on every change, and publishes it lock-free.
pub struct SubchannelManager<R> {
    tls: bool,
    runtime: R,
    subchannels: Mutex<HashMap<Endpoint, Arc<Subchannel>>>,
    picker: ArcSwap<Picker>,
    aggregate: watch::Sender<ConnectivityState>,
}

impl<R: Runtime> SubchannelManager<R> {
    /// Build an empty manager. `tls` is forwarded to every subchannel's
    /// channel construction.
    pub fn new(tls: bool, runtime: R) -> (Arc<Self>, watch::Receiver<ConnectivityState>) {
        let (aggregate, aggregate_rx) = watch::channel(ConnectivityState::Idle);
        let manager = Arc::new(Self {
            tls,
            runtime,
            subchannels: Mutex::new(HashMap::new()),
            picker: ArcSwap::from_pointee(Picker::empty()),
            aggregate,
        });
        (manager, aggregate_rx)
    }

    /// The currently published picker.
    pub fn picker(&self) -> Arc<Picker> {
        self.picker.load_full()
    }

    /// Reconcile the current subchannel set against `addresses`,
    /// rebuild, and publish the picker.
    pub async fn reconcile(self: &Arc<Self>, addresses: &[Address]) {
        let mut subchannels = self.subchannels.lock().await;

        let next: HashMap<&Endpoint, &Address> =
            addresses.iter().map(|a| (&a.endpoint, a)).collect();

        let to_remove: Vec<Endpoint> = subchannels
            .keys()
            .filter(|e| !next.contains_key(e))
            .cloned()
            .collect();
        for endpoint in to_remove {
            if let Some(sc) = subchannels.remove(&endpoint) {
                sc.shutdown();
                info!(%endpoint, "subchannel manager: removed subchannel");
            }
        }

        for address in addresses {
            match subchannels.get(&address.endpoint) {
                Some(existing) => {
                    if existing.priority() != address.priority {
                        existing.set_priority(address.priority);
                    }
                }
                None => match self.build_channel(&address.endpoint) {
                    Ok(channel) => {
                        let sc = Subchannel::new(address.endpoint.clone(), address.priority, channel);
                        sc.request_connection(self.tls, &self.runtime);
                        sc.spawn_auto_reconnect(self.tls, self.runtime.clone());
                        self.spawn_picker_refresh(Arc::clone(&sc));
                        info!(endpoint = %address.endpoint, "subchannel manager: created subchannel");
                        subchannels.insert(address.endpoint.clone(), sc);
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %address.endpoint, error = %e, "subchannel manager: failed to build channel");
                    }
                },
            }
        }

        drop(subchannels);
        self.republish().await;
    }

    /// Recompute the Ready set from the live subchannel map, publish a
    /// fresh picker, and republish the aggregate connectivity state.
    /// Called after every `reconcile` and whenever any subchannel's own
    /// state transitions, so the picker reflects handshakes that land
    /// asynchronously after the address list was last reconciled.
    async fn republish(&self) {
        let all: Vec<Arc<Subchannel>> = self.subchannels.lock().await.values().cloned().collect();
        let ready: Vec<Arc<Subchannel>> = all
            .iter()
            .filter(|s| s.state() == ConnectivityState::Ready)
            .cloned()
            .collect();
        self.picker.store(Arc::new(Picker::new(ready)));
        let _ = self.aggregate.send(aggregate_state(&all));
    }

    /// Subscribe to one subchannel's state transitions and republish the
    /// picker/aggregate state on every change, so a handshake completing
    /// (or failing, or idling out) after `reconcile` returns is reflected
    /// without waiting for the next address-list change.
    fn spawn_picker_refresh(self: &Arc<Self>, sc: Arc<Subchannel>) {
        let manager = Arc::clone(self);
        let mut states = sc.state.subscribe();
        self.runtime.spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                let state = *states.borrow();
                manager.republish().await;
                if state == ConnectivityState::Shutdown {
                    return;
                }
            }
        });
    }

    fn build_channel(&self, endpoint: &Endpoint) -> Result<Channel, tonic::transport::Error> {
        Ok(TonicEndpoint::from_shared(endpoint.to_uri(self.tls))?.connect_lazy())
    }

    /// Current endpoint set, for tests and diagnostics.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.subchannels.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tokio::TokioRuntime;

    fn addr(host: &str, priority: i32) -> Address {
        Address {
            endpoint: Endpoint::new(host, 1),
            priority,
        }
    }

    #[tokio::test]
    async fn reconcile_creates_and_removes_subchannels_across_churn() {
        let (manager, _aggregate) = SubchannelManager::new(false, TokioRuntime);

        manager.reconcile(&[addr("a", 0), addr("b", 0)]).await;
        let mut endpoints = manager.endpoints().await;
        endpoints.sort_by(|a, b| a.host().cmp(b.host()));
        assert_eq!(endpoints, vec![Endpoint::new("a", 1), Endpoint::new("b", 1)]);

        manager
            .reconcile(&[addr("a", 0), addr("b", 0), addr("c", 0)])
            .await;
        let mut endpoints = manager.endpoints().await;
        endpoints.sort_by(|a, b| a.host().cmp(b.host()));
        assert_eq!(
            endpoints,
            vec![Endpoint::new("a", 1), Endpoint::new("b", 1), Endpoint::new("c", 1)]
        );

        manager.reconcile(&[addr("b", 0), addr("c", 0)]).await;
        let mut endpoints = manager.endpoints().await;
        endpoints.sort_by(|a, b| a.host().cmp(b.host()));
        assert_eq!(endpoints, vec![Endpoint::new("b", 1), Endpoint::new("c", 1)]);
    }

    #[tokio::test]
    async fn reconcile_updates_priority_in_place_without_churn() {
        let (manager, _aggregate) = SubchannelManager::new(false, TokioRuntime);
        manager.reconcile(&[addr("a", 5)]).await;
        manager.reconcile(&[addr("a", 1)]).await;
        let subchannels = manager.subchannels.lock().await;
        assert_eq!(subchannels.get(&Endpoint::new("a", 1)).unwrap().priority(), 1);
    }

    #[tokio::test]
    async fn idle_transition_re_arms_a_connection_attempt() {
        let channel = TonicEndpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let sc = Subchannel::new(Endpoint::new("a", 1), 0, channel);
        sc.spawn_auto_reconnect(false, TokioRuntime);
        sc.set_state(ConnectivityState::Ready);
        sc.set_state(ConnectivityState::Idle);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if sc.state() == ConnectivityState::Connecting {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subchannel did not re-arm after going idle");
    }

    #[test]
    fn aggregate_state_prefers_ready_over_connecting_and_failure() {
        let channel = TonicEndpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let ready = Subchannel::new(Endpoint::new("a", 1), 0, channel.clone());
        ready.set_state(ConnectivityState::Ready);
        let connecting = Subchannel::new(Endpoint::new("b", 1), 0, channel.clone());
        connecting.set_state(ConnectivityState::Connecting);

        assert_eq!(aggregate_state(&[ready.clone(), connecting.clone()]), ConnectivityState::Ready);
        assert_eq!(aggregate_state(&[connecting]), ConnectivityState::Connecting);
        assert_eq!(aggregate_state(&[]), ConnectivityState::Idle);
    }
}
