//! Topology Subscription Engine.
//!
//! Races subscription attempts across all seeds, consumes the winning
//! stream until it ends or fails, and retries with exponential backoff
//! on total failure. The race group is a `tokio::task::JoinSet`: the
//! idiomatic tokio replacement for a hand-rolled cancellation-scope
//! tree — dropping the `JoinSet` aborts every task that hasn't
//! finished, so cancelling the returned stream cancels the whole race
//! group along with it.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::error::Error;
use crate::resilience::ResilienceConfig;
use crate::seed_pool::SeedChannelPool;
use crate::source::{BoxTopologyStream, StreamingTopologySource, TopologyContext};
use crate::topology::{Endpoint, Topology};

/// A stream of topology snapshots, terminated by at most one
/// [`Error::ClusterDiscovery`] when every seed has been exhausted.
pub type SubscriptionStream = Pin<Box<dyn Stream<Item = Result<Topology, Error>> + Send>>;

/// Races subscription attempts across a fixed set of seeds.
pub struct SubscriptionEngine<S> {
    source: Arc<S>,
    pool: SeedChannelPool,
    seeds: Vec<Endpoint>,
    resilience: ResilienceConfig,
}

impl<S: StreamingTopologySource> SubscriptionEngine<S> {
    /// Create a new engine. `seeds` must be non-empty — the builder
    /// validates this at build time.
    pub fn new(
        source: S,
        pool: SeedChannelPool,
        seeds: Vec<Endpoint>,
        resilience: ResilienceConfig,
    ) -> Self {
        Self {
            source: Arc::new(source),
            pool,
            seeds,
            resilience,
        }
    }

    /// Produce snapshots until the returned stream is dropped.
    ///
    /// Each snapshot is delivered at most once before the next is
    /// offered. Calling `subscribe` again after the previous stream
    /// ended begins a fresh round counter.
    pub fn subscribe(&self) -> SubscriptionStream {
        let source = Arc::clone(&self.source);
        let pool = self.pool.clone();
        let seeds = self.seeds.clone();
        let resilience = self.resilience.clone();

        let stream = async_stream::stream! {
            let mut attempt: usize = 0;

            loop {
                attempt += 1;
                let (winner, mut failures) = race_seeds(&source, &pool, &seeds, resilience.timeout).await;

                let Some((endpoint, mut rest, first_snapshot)) = winner else {
                    if attempt >= resilience.max_discovery_attempts {
                        warn!(attempts = attempt, seeds = seeds.len(), "subscription engine: all seeds exhausted");
                        yield Err(Error::ClusterDiscovery {
                            attempts: attempt,
                            seeds: seeds.len(),
                            causes: std::mem::take(&mut failures),
                        });
                        return;
                    }
                    let wait = resilience.backoff_for_attempt(attempt);
                    warn!(attempt, ?wait, "subscription engine: round failed, backing off");
                    tokio::time::sleep(wait).await;
                    continue;
                };

                info!(%endpoint, "subscription engine: seed won the race");
                attempt = 0;
                yield Ok(first_snapshot);

                loop {
                    let next = tokio::time::timeout(resilience.timeout, rest.next()).await;
                    match next {
                        Ok(Some(Ok(topology))) => yield Ok(topology),
                        Ok(Some(Err(e))) => {
                            warn!(%endpoint, error = %e, "subscription engine: winning stream failed, resubscribing");
                            break;
                        }
                        Ok(None) => {
                            info!(%endpoint, "subscription engine: stream ended normally, resubscribing");
                            break;
                        }
                        Err(_elapsed) => {
                            warn!(%endpoint, "subscription engine: inactivity timeout, resubscribing");
                            break;
                        }
                    }
                }
            }
        };

        Box::pin(stream)
    }
}

/// Run one discovery round: spawn one task per seed, return the first
/// winner (endpoint, its still-live stream, first snapshot) along with
/// whatever failures were accumulated from losers, or `None` if every
/// seed lost.
async fn race_seeds<S: StreamingTopologySource>(
    source: &Arc<S>,
    pool: &SeedChannelPool,
    seeds: &[Endpoint],
    timeout: Duration,
) -> (
    Option<(Endpoint, BoxTopologyStream, Topology)>,
    Vec<Error>,
) {
    let mut join_set = JoinSet::new();
    for seed in seeds {
        let source = Arc::clone(source);
        let pool = pool.clone();
        let seed = seed.clone();
        join_set.spawn(async move { attempt_seed(source, pool, seed, timeout).await });
    }

    let mut failures = Vec::new();
    let mut winner = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(win)) => {
                winner = Some(win);
                break;
            }
            Ok(Err(failure)) => failures.push(failure),
            Err(_join_error) => {
                // The task panicked or was aborted; there is nothing
                // useful to attribute this to, so it is silently
                // dropped — it does not count as a seed failure to
                // avoid double-accounting aborted losers.
            }
        }
    }

    // Dropping the JoinSet aborts every task that hasn't finished yet —
    // this is the "cancel all other tasks" step of the race.
    drop(join_set);

    (winner, failures)
}

/// Attempt a single seed: acquire its channel, subscribe, and await the
/// first snapshot within `timeout`. A zero-node snapshot is rejected as
/// an empty-topology failure local to this seed. A snapshot with nodes
/// but none eligible is *not* rejected here — it is the resolver's job
/// to decide what to do with a topology that has no eligible nodes.
async fn attempt_seed<S: StreamingTopologySource>(
    source: Arc<S>,
    pool: SeedChannelPool,
    seed: Endpoint,
    timeout: Duration,
) -> Result<(Endpoint, BoxTopologyStream, Topology), Error> {
    let fail = |message: String| Error::topology(seed.clone(), message);

    let channel = pool
        .get_channel(&seed)
        .await
        .map_err(|e| fail(e.to_string()))?;

    let ctx = TopologyContext {
        channel,
        timeout,
        endpoint: seed.clone(),
    };

    let mut stream = source.subscribe(ctx);

    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(Ok(topology))) if topology.is_empty() => Err(fail("empty topology".into())),
        Ok(Some(Ok(topology))) => Ok((seed, stream, topology)),
        Ok(Some(Err(e))) => Err(fail(e.to_string())),
        Ok(None) => Err(fail("stream ended before first snapshot".into())),
        Err(_elapsed) => Err(fail("timed out waiting for first snapshot".into())),
    }
}
