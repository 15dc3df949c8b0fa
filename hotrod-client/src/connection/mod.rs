//! Connection management for Hot Rod servers.
//!
//! A [`Transport`] is one multiplexed TCP connection; the [`TransportPool`]
//! keeps a bounded set of them per server and connects lazily. Bootstrap
//! addresses come from a [`ServerDiscovery`].

mod discovery;
mod pool;
mod transport;

pub use discovery::{ServerDiscovery, StaticServerDiscovery};
pub use pool::{PooledTransport, TransportPool};
pub use transport::{
    next_message_id, EventSink, PendingResponse, Transport, TransportFactory, TransportId,
};
