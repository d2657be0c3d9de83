//! A client-side, cluster-aware load balancer for [`tonic`] channels.
//!
//! A cluster exposes its own membership through a user-supplied
//! [`source::PollingTopologySource`] or [`source::StreamingTopologySource`].
//! The balancer seeds a handful of bootstrap addresses
//! ([`seed_pool::SeedChannelPool`]), races them for the first topology
//! snapshot ([`subscription::SubscriptionEngine`]), and keeps a `tonic`
//! channel's connection set in sync with the cluster as it changes
//! ([`resolver`], [`subchannel`], [`picker`]). An optional
//! [`interceptor`] layer triggers an out-of-band refresh when RPCs start
//! failing with a configurable set of status codes.

pub mod builder;
pub mod error;
pub mod interceptor;
pub mod picker;
pub mod polling;
pub mod resilience;
pub mod resolver;
pub mod runtime;
pub mod seed_pool;
pub mod source;
pub mod subchannel;
pub mod subscription;
pub mod topology;
