//! Key routing across the cluster.
//!
//! The router keeps the newest topology of every cache and maps keys onto
//! segments with the configured [`KeyHasher`](hotrod_core::KeyHasher). The
//! dispatcher asks it for candidate servers on every attempt, so a topology
//! installed by one response benefits the very next request.

mod router;

pub use router::ConsistentHashRouter;
