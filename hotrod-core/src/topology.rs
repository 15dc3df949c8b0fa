//! Cluster topology snapshots.

use std::fmt;
use std::str::FromStr;

use crate::error::HotRodError;
use crate::protocol::ClientIntelligence;

/// A server endpoint, identified by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Creates an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = HotRodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HotRodError::Configuration(format!("invalid server address '{}'", s));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for ServerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Owners of a single segment; the first owner is the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOwners {
    segment: u32,
    owners: Vec<ServerAddress>,
}

impl SegmentOwners {
    /// Creates the owner list for `segment`.
    pub fn new(segment: u32, owners: Vec<ServerAddress>) -> Self {
        Self { segment, owners }
    }

    /// Returns the segment index.
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Returns the owners, primary first.
    pub fn owners(&self) -> &[ServerAddress] {
        &self.owners
    }

    /// Returns the primary owner, if the segment has one.
    pub fn primary(&self) -> Option<&ServerAddress> {
        self.owners.first()
    }
}

/// An immutable snapshot of segment ownership for one cache.
///
/// A new topology replaces the previous one wholesale; snapshots are never
/// patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    id: u64,
    servers: Vec<ServerAddress>,
    segments: Vec<SegmentOwners>,
    hash_version: u8,
    intelligence: ClientIntelligence,
}

impl Topology {
    /// Creates a topology with segment ownership.
    pub fn new(
        id: u64,
        servers: Vec<ServerAddress>,
        segments: Vec<SegmentOwners>,
        hash_version: u8,
    ) -> Self {
        Self {
            id,
            servers,
            segments,
            hash_version,
            intelligence: ClientIntelligence::HashDistributionAware,
        }
    }

    /// Creates a topology that only lists servers.
    pub fn servers_only(id: u64, servers: Vec<ServerAddress>) -> Self {
        Self {
            id,
            servers,
            segments: Vec::new(),
            hash_version: 0,
            intelligence: ClientIntelligence::TopologyAware,
        }
    }

    /// Builds a topology from a segment-to-owners table, deriving the server list.
    pub fn from_owner_table(id: u64, owners: Vec<Vec<ServerAddress>>) -> Self {
        let mut servers: Vec<ServerAddress> = Vec::new();
        for address in owners.iter().flatten() {
            if !servers.contains(address) {
                servers.push(address.clone());
            }
        }
        let segments = owners
            .into_iter()
            .enumerate()
            .map(|(index, owners)| SegmentOwners::new(index as u32, owners))
            .collect();
        Self::new(id, servers, segments, 0)
    }

    /// Returns the topology id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns every server in the cluster view.
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    /// Returns segment ownership, ordered by segment index.
    pub fn segments(&self) -> &[SegmentOwners] {
        &self.segments
    }

    /// Returns the number of segments, zero when ownership is unknown.
    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Returns the hash function version announced by the server.
    pub fn hash_version(&self) -> u8 {
        self.hash_version
    }

    /// Returns the intelligence level this snapshot was produced for.
    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    /// Returns the owners of `segment`, primary first.
    pub fn owners_of(&self, segment: u32) -> &[ServerAddress] {
        self.segments
            .get(segment as usize)
            .map(SegmentOwners::owners)
            .unwrap_or(&[])
    }

    /// Returns the segments whose primary owner is `address`.
    pub fn primary_segments_of(&self, address: &ServerAddress) -> Vec<u32> {
        self.segments
            .iter()
            .filter(|s| s.primary() == Some(address))
            .map(SegmentOwners::segment)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_address_display_and_parse() {
        let a: ServerAddress = "cache-1.local:11222".parse().unwrap();
        assert_eq!(a.host(), "cache-1.local");
        assert_eq!(a.port(), 11222);
        assert_eq!(a.to_string(), "cache-1.local:11222");
    }

    #[test]
    fn test_address_ipv6() {
        let a: ServerAddress = "[::1]:11222".parse().unwrap();
        assert_eq!(a.host(), "::1");
        assert_eq!(a.to_string(), "[::1]:11222");
    }

    #[test]
    fn test_address_parse_errors() {
        assert!("no-port".parse::<ServerAddress>().is_err());
        assert!(":11222".parse::<ServerAddress>().is_err());
        assert!("host:99999".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_address_identity_by_value() {
        assert_eq!(addr(1), ServerAddress::new("127.0.0.1".to_string(), 1));
        assert_ne!(addr(1), addr(2));
    }

    #[test]
    fn test_from_owner_table() {
        let topology = Topology::from_owner_table(
            7,
            vec![
                vec![addr(1), addr(2)],
                vec![addr(1)],
                vec![addr(2), addr(1)],
                vec![addr(2)],
            ],
        );
        assert_eq!(topology.id(), 7);
        assert_eq!(topology.segment_count(), 4);
        assert_eq!(topology.servers(), &[addr(1), addr(2)]);
        assert_eq!(topology.owners_of(2), &[addr(2), addr(1)]);
        assert_eq!(topology.primary_segments_of(&addr(1)), vec![0, 1]);
    }

    #[test]
    fn test_owners_of_unknown_segment_is_empty() {
        let topology = Topology::servers_only(1, vec![addr(1)]);
        assert!(topology.owners_of(0).is_empty());
        assert_eq!(topology.segment_count(), 0);
        assert_eq!(topology.intelligence(), ClientIntelligence::TopologyAware);
    }

    #[test]
    fn test_topology_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Topology>();
        assert_send_sync::<ServerAddress>();
    }
}
