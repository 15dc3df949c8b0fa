//! Client-side mirror of segment ownership.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hotrod_core::{segment_of, KeyHasher, ServerAddress, Topology};

#[derive(Debug, Default)]
struct RouterState {
    bootstrap: Vec<ServerAddress>,
    topologies: HashMap<String, Arc<Topology>>,
    latest: Option<Arc<Topology>>,
}

/// Tracks the newest topology of every cache and answers which servers own a key.
///
/// Topologies are installed by compare-and-swap on their id: an id that is
/// not greater than the installed one is ignored, so a late response from a
/// slow connection never rolls routing back. Readers get `Arc` snapshots and
/// never observe a half-installed topology.
#[derive(Debug)]
pub struct ConsistentHashRouter {
    hasher: Arc<dyn KeyHasher>,
    state: RwLock<RouterState>,
    generation: AtomicU64,
    round_robin: AtomicUsize,
}

impl ConsistentHashRouter {
    /// Creates a router that starts from `bootstrap` servers.
    pub fn new(hasher: Arc<dyn KeyHasher>, bootstrap: Vec<ServerAddress>) -> Self {
        Self {
            hasher,
            state: RwLock::new(RouterState {
                bootstrap,
                ..RouterState::default()
            }),
            generation: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Replaces the bootstrap servers used before any topology is known.
    pub fn set_bootstrap(&self, servers: Vec<ServerAddress>) {
        self.write().bootstrap = servers;
    }

    /// Returns the bootstrap servers.
    pub fn bootstrap_servers(&self) -> Vec<ServerAddress> {
        self.read().bootstrap.clone()
    }

    /// Installs `topology` for `cache_name` if it is newer than the current one.
    ///
    /// Returns `true` if it was installed.
    pub fn apply_topology(&self, cache_name: &str, topology: Topology) -> bool {
        let mut state = self.write();
        if let Some(current) = state.topologies.get(cache_name) {
            if topology.id() <= current.id() {
                tracing::trace!(
                    cache = cache_name,
                    current = current.id(),
                    received = topology.id(),
                    "ignoring topology that is not newer"
                );
                return false;
            }
        }

        if topology.segment_count() > 0
            && topology.hash_version() != 0
            && topology.hash_version() != self.hasher.version()
        {
            tracing::debug!(
                cache = cache_name,
                server_hash = topology.hash_version(),
                client_hash = self.hasher.version(),
                "hash function version differs from the server's"
            );
        }

        let topology = Arc::new(topology);
        tracing::info!(
            cache = cache_name,
            topology_id = topology.id(),
            servers = topology.servers().len(),
            segments = topology.segment_count(),
            "installed new topology"
        );
        state.latest = Some(Arc::clone(&topology));
        state.topologies.insert(cache_name.to_string(), topology);
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Returns the installed topology of `cache_name`.
    pub fn current_topology(&self, cache_name: &str) -> Option<Arc<Topology>> {
        self.read().topologies.get(cache_name).cloned()
    }

    /// Returns the topology id sent in request headers, zero when none is known.
    pub fn topology_id(&self, cache_name: &str) -> u64 {
        self.read()
            .topologies
            .get(cache_name)
            .map(|t| t.id())
            .unwrap_or(0)
    }

    /// Counts installed topologies; used to notice changes cheaply.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the segment `key` falls in, if segment ownership is known.
    pub fn segment_for(&self, cache_name: &str, key: &[u8]) -> Option<u32> {
        let topology = self.current_topology(cache_name)?;
        segment_of(self.hasher.as_ref(), key, topology.segment_count())
    }

    /// Returns the owners of `key`, primary first.
    ///
    /// Empty when the cache has no segment ownership yet.
    pub fn owners_for(&self, cache_name: &str, key: &[u8]) -> Vec<ServerAddress> {
        let Some(topology) = self.current_topology(cache_name) else {
            return Vec::new();
        };
        match segment_of(self.hasher.as_ref(), key, topology.segment_count()) {
            Some(segment) => {
                let owners = topology.owners_of(segment).to_vec();
                tracing::trace!(cache = cache_name, segment, owners = owners.len(), "routed key");
                owners
            }
            None => Vec::new(),
        }
    }

    /// Returns the servers requests for `cache_name` may go to.
    ///
    /// The cache's own topology wins; otherwise the most recent topology of any
    /// cache, and the bootstrap list before anything was learned.
    pub fn known_servers(&self, cache_name: &str) -> Vec<ServerAddress> {
        let state = self.read();
        if let Some(topology) = state.topologies.get(cache_name) {
            if !topology.servers().is_empty() {
                return topology.servers().to_vec();
            }
        }
        match &state.latest {
            Some(latest) if !latest.servers().is_empty() => latest.servers().to_vec(),
            _ => state.bootstrap.clone(),
        }
    }

    /// Every server of every installed topology, or the bootstrap list when
    /// none is installed.
    pub fn all_servers(&self) -> Vec<ServerAddress> {
        let state = self.read();
        if state.topologies.is_empty() {
            return state.bootstrap.clone();
        }
        let mut servers: Vec<ServerAddress> = state
            .topologies
            .values()
            .flat_map(|t| t.servers().iter().cloned())
            .collect();
        servers.sort();
        servers.dedup();
        servers
    }

    /// Picks the next known server in round-robin order.
    pub fn next_server(&self, cache_name: &str) -> Option<ServerAddress> {
        let servers = self.known_servers(cache_name);
        if servers.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers.into_iter().nth(index)
    }

    /// Servers to try for one attempt, best first.
    ///
    /// Owners of `key` come first in owner order, followed by the remaining
    /// known servers starting at the round-robin cursor.
    pub fn candidates(&self, cache_name: &str, key: Option<&[u8]>) -> Vec<ServerAddress> {
        let mut candidates = key
            .map(|key| self.owners_for(cache_name, key))
            .unwrap_or_default();

        let servers = self.known_servers(cache_name);
        if !servers.is_empty() {
            let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % servers.len();
            for server in servers.iter().cycle().skip(start).take(servers.len()) {
                if !candidates.contains(server) {
                    candidates.push(server.clone());
                }
            }
        }
        candidates
    }

    /// Groups the segments of `cache_name` by primary owner.
    pub fn segments_by_primary(&self, cache_name: &str) -> BTreeMap<ServerAddress, Vec<u32>> {
        let mut grouped: BTreeMap<ServerAddress, Vec<u32>> = BTreeMap::new();
        if let Some(topology) = self.current_topology(cache_name) {
            for segment in topology.segments() {
                if let Some(primary) = segment.primary() {
                    grouped
                        .entry(primary.clone())
                        .or_default()
                        .push(segment.segment());
                }
            }
        }
        grouped
    }

    /// Returns the configured hash function.
    pub fn hasher(&self) -> &Arc<dyn KeyHasher> {
        &self.hasher
    }

    fn read(&self) -> RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}
