//! In-process Hot Rod cluster for integration tests.
//!
//! Every node shares one in-memory store, one topology and one listener
//! table, the way replicas of a real cluster converge. Faults are injected
//! per node.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hotrod_client::iteration::encode_segments;
use hotrod_client::{ClientConfig, ClientConfigBuilder};
use hotrod_core::protocol::constants::*;
use hotrod_core::protocol::{
    vint, write_response_header, ClientIntelligence, DecodeError, DecodeResult, WireReader,
};
use hotrod_core::{SegmentOwners, ServerAddress, Topology};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Segments in every topology the mock cluster announces.
pub const SEGMENTS: u32 = 4;

/// What a node does with incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answers normally.
    None,
    /// Records the request, then drops the connection without answering.
    ResetOnRequest,
    /// Records the request and never answers, keeping the connection open.
    Silent,
}

/// What a node sends back for one request.
enum Reply {
    Frame(BytesMut),
    Nothing,
    Reset,
}

/// One request a node received.
#[derive(Debug, Clone)]
pub struct Received {
    pub node: usize,
    pub opcode: u8,
    pub cache: String,
    pub key: Option<Bytes>,
}

#[derive(Debug)]
struct Request {
    message_id: u64,
    opcode: u8,
    cache: String,
    flags: u32,
    topology_id: u64,
    key: Option<Bytes>,
    value: Option<Bytes>,
    version: Option<i64>,
    listener_id: Option<Bytes>,
    iteration_id: Option<String>,
}

struct Listener {
    id: Bytes,
    cache: String,
    outbound: mpsc::UnboundedSender<BytesMut>,
}

struct Iteration {
    cache: String,
    drained: bool,
}

#[derive(Default)]
struct ClusterState {
    topology: Option<Topology>,
    entries: HashMap<(String, Bytes), (Bytes, i64)>,
    next_version: i64,
    next_iteration: u64,
    iterations: HashMap<String, Iteration>,
    listeners: Vec<Listener>,
    faults: HashMap<usize, Fault>,
    log: Vec<Received>,
}

/// A running mock cluster.
pub struct MockCluster {
    nodes: Vec<ServerAddress>,
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    /// Binds `size` nodes on loopback and starts serving.
    pub async fn start(size: usize) -> Self {
        let state = Arc::new(Mutex::new(ClusterState {
            next_version: 1,
            ..ClusterState::default()
        }));
        let mut nodes = Vec::with_capacity(size);
        for node in 0..size {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            nodes.push(ServerAddress::new("127.0.0.1", port));
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(socket, node, Arc::clone(&state)));
                }
            });
        }
        Self { nodes, state }
    }

    /// Returns the address of `node`.
    pub fn address(&self, node: usize) -> ServerAddress {
        self.nodes[node].clone()
    }

    /// Returns the index of the node listening on `address`.
    pub fn node_of(&self, address: &ServerAddress) -> Option<usize> {
        self.nodes.iter().position(|a| a == address)
    }

    /// Announces a topology in which every segment has `owners` as owners,
    /// primary first.
    pub fn set_ownership(&self, id: u64, owners: &[usize]) {
        let owners: Vec<ServerAddress> = owners.iter().map(|&n| self.address(n)).collect();
        let segments = (0..SEGMENTS)
            .map(|segment| SegmentOwners::new(segment, owners.clone()))
            .collect();
        let topology = Topology::new(id, self.nodes.clone(), segments, 0);
        self.state.lock().unwrap().topology = Some(topology);
    }

    /// Sets how `node` treats requests from now on.
    pub fn set_fault(&self, node: usize, fault: Fault) {
        self.state.lock().unwrap().faults.insert(node, fault);
    }

    /// Returns every request `node` received with `opcode`.
    pub fn received(&self, node: usize, opcode: u8) -> Vec<Received> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.node == node && r.opcode == opcode)
            .cloned()
            .collect()
    }

    /// Returns how many requests with `opcode` the whole cluster received.
    pub fn total_received(&self, opcode: u8) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.opcode == opcode)
            .count()
    }

    /// Returns the number of listeners the cluster pushes events to.
    pub fn listener_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| !l.outbound.is_closed());
        state.listeners.len()
    }

    /// Returns the stored value of `key`, bypassing every client.
    pub fn stored(&self, cache: &str, key: &[u8]) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(&(cache.to_string(), Bytes::copy_from_slice(key)))
            .map(|(value, _)| value.clone())
    }

    /// A config builder bootstrapping from `nodes`, with short timeouts.
    pub fn config(&self, nodes: &[usize]) -> ClientConfigBuilder {
        ClientConfig::builder()
            .servers(nodes.iter().map(|&n| self.address(n)))
            .connect_timeout(Duration::from_millis(500))
            .socket_timeout(Duration::from_secs(5))
            .retry(|r| {
                r.initial_backoff(Duration::from_millis(10))
                    .max_backoff(Duration::from_millis(50))
            })
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn serve_connection(socket: TcpStream, node: usize, state: Arc<Mutex<ClusterState>>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BytesMut>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = BytesMut::with_capacity(4096);
    'connection: loop {
        loop {
            match parse_request(&buffer) {
                Ok((request, consumed)) => {
                    buffer.advance(consumed);
                    let reply = state.lock().unwrap().handle(node, request, &tx);
                    match reply {
                        Reply::Frame(frame) => {
                            let _ = tx.send(frame);
                        }
                        Reply::Nothing => {}
                        Reply::Reset => break 'connection,
                    }
                }
                Err(DecodeError::Incomplete) => break,
                Err(_) => break 'connection,
            }
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    writer_task.abort();
}

fn parse_request(buf: &[u8]) -> DecodeResult<(Request, usize)> {
    let mut reader = WireReader::new(buf);
    reader.read_u8()?;
    let message_id = reader.read_vlong()?;
    reader.read_u8()?;
    let opcode = reader.read_u8()?;
    let cache = reader.read_string()?;
    let flags = reader.read_vint()?;
    reader.read_u8()?;
    let topology_id = u64::from(reader.read_vint()?);
    // key and value media types, both "no type"
    reader.read_u8()?;
    reader.read_u8()?;

    let mut request = Request {
        message_id,
        opcode,
        cache,
        flags,
        topology_id,
        key: None,
        value: None,
        version: None,
        listener_id: None,
        iteration_id: None,
    };
    match opcode {
        GET_REQUEST | GET_WITH_VERSION_REQUEST | GET_WITH_METADATA_REQUEST
        | CONTAINS_KEY_REQUEST | REMOVE_REQUEST => {
            request.key = Some(reader.read_array()?);
        }
        PUT_REQUEST | PUT_IF_ABSENT_REQUEST | REPLACE_REQUEST => {
            request.key = Some(reader.read_array()?);
            skip_expiration(&mut reader)?;
            request.value = Some(reader.read_array()?);
        }
        REPLACE_IF_UNMODIFIED_REQUEST => {
            request.key = Some(reader.read_array()?);
            skip_expiration(&mut reader)?;
            request.version = Some(reader.read_i64()?);
            request.value = Some(reader.read_array()?);
        }
        REMOVE_IF_UNMODIFIED_REQUEST => {
            request.key = Some(reader.read_array()?);
            request.version = Some(reader.read_i64()?);
        }
        ADD_CLIENT_LISTENER_REQUEST => {
            request.listener_id = Some(reader.read_array()?);
            reader.read_u8()?;
            skip_factory(&mut reader)?;
            skip_factory(&mut reader)?;
            reader.read_u8()?;
            reader.read_vint()?;
        }
        ADD_BLOOM_NEAR_CACHE_LISTENER_REQUEST => {
            request.listener_id = Some(reader.read_array()?);
            reader.read_vint()?;
        }
        UPDATE_BLOOM_FILTER_REQUEST => {
            request.listener_id = Some(reader.read_array()?);
            reader.read_array()?;
        }
        REMOVE_CLIENT_LISTENER_REQUEST => {
            request.listener_id = Some(reader.read_array()?);
        }
        ITERATION_START_REQUEST => {
            reader.read_optional_array()?;
            skip_factory(&mut reader)?;
            reader.read_vint()?;
            reader.read_u8()?;
        }
        ITERATION_NEXT_REQUEST | ITERATION_END_REQUEST => {
            request.iteration_id = Some(reader.read_string()?);
        }
        _ => {}
    }
    Ok((request, reader.position()))
}

fn skip_expiration(reader: &mut WireReader<'_>) -> DecodeResult<()> {
    let units = reader.read_u8()?;
    for unit in [units >> 4, units & 0x0F] {
        if unit != TIME_UNIT_DEFAULT && unit != TIME_UNIT_INFINITE {
            reader.read_vlong()?;
        }
    }
    Ok(())
}

fn skip_factory(reader: &mut WireReader<'_>) -> DecodeResult<()> {
    if !reader.read_string()?.is_empty() {
        for _ in 0..reader.read_u8()? {
            reader.read_array()?;
        }
    }
    Ok(())
}

impl ClusterState {
    /// Applies one request.
    fn handle(
        &mut self,
        node: usize,
        request: Request,
        outbound: &mpsc::UnboundedSender<BytesMut>,
    ) -> Reply {
        self.log.push(Received {
            node,
            opcode: request.opcode,
            cache: request.cache.clone(),
            key: request.key.clone(),
        });
        match self.faults.get(&node).copied().unwrap_or(Fault::None) {
            Fault::None => {}
            Fault::ResetOnRequest => return Reply::Reset,
            Fault::Silent => return Reply::Nothing,
        }

        let mut body = BytesMut::new();
        let status = self.execute(&request, outbound, &mut body);

        let mut out = BytesMut::new();
        let topology = self
            .topology
            .as_ref()
            .filter(|t| t.id() != request.topology_id)
            .map(|t| (t, ClientIntelligence::HashDistributionAware));
        write_response_header(
            &mut out,
            request.message_id,
            request.opcode + 1,
            status,
            topology,
        )
        .unwrap();
        out.extend_from_slice(&body);
        Reply::Frame(out)
    }

    fn execute(
        &mut self,
        request: &Request,
        outbound: &mpsc::UnboundedSender<BytesMut>,
        body: &mut BytesMut,
    ) -> u8 {
        let cache = request.cache.clone();
        let slot = request.key.clone().map(|key| (cache.clone(), key));
        match request.opcode {
            GET_REQUEST => match slot.and_then(|s| self.entries.get(&s).cloned()) {
                Some((value, _)) => {
                    vint::put_array(body, &value);
                    NO_ERROR_STATUS
                }
                None => KEY_DOES_NOT_EXIST_STATUS,
            },
            GET_WITH_VERSION_REQUEST => match slot.and_then(|s| self.entries.get(&s).cloned()) {
                Some((value, version)) => {
                    body.put_i64(version);
                    vint::put_array(body, &value);
                    NO_ERROR_STATUS
                }
                None => KEY_DOES_NOT_EXIST_STATUS,
            },
            CONTAINS_KEY_REQUEST => match slot.map(|s| self.entries.contains_key(&s)) {
                Some(true) => NO_ERROR_STATUS,
                _ => KEY_DOES_NOT_EXIST_STATUS,
            },
            PUT_REQUEST => {
                let slot = slot.unwrap_or_default();
                let previous = self.store(slot, request.value.clone().unwrap_or_default());
                self.with_previous(request, previous.map(|(v, _)| v), body, NO_ERROR_STATUS)
            }
            PUT_IF_ABSENT_REQUEST => {
                let slot = slot.unwrap_or_default();
                match self.entries.get(&slot).cloned() {
                    Some((value, _)) => {
                        self.with_previous(request, Some(value), body, NOT_PUT_REMOVED_REPLACED_STATUS)
                    }
                    None => {
                        self.store(slot, request.value.clone().unwrap_or_default());
                        self.with_previous(request, None, body, NO_ERROR_STATUS)
                    }
                }
            }
            REPLACE_REQUEST => {
                let slot = slot.unwrap_or_default();
                if self.entries.contains_key(&slot) {
                    let previous = self.store(slot, request.value.clone().unwrap_or_default());
                    self.with_previous(request, previous.map(|(v, _)| v), body, NO_ERROR_STATUS)
                } else {
                    NOT_PUT_REMOVED_REPLACED_STATUS
                }
            }
            REPLACE_IF_UNMODIFIED_REQUEST => {
                let slot = slot.unwrap_or_default();
                match self.entries.get(&slot).cloned() {
                    None => KEY_DOES_NOT_EXIST_STATUS,
                    Some((_, version)) if Some(version) != request.version => {
                        NOT_PUT_REMOVED_REPLACED_STATUS
                    }
                    Some(_) => {
                        self.store(slot, request.value.clone().unwrap_or_default());
                        NO_ERROR_STATUS
                    }
                }
            }
            REMOVE_REQUEST => {
                let slot = slot.unwrap_or_default();
                match self.delete(slot) {
                    Some((value, _)) => self.with_previous(request, Some(value), body, NO_ERROR_STATUS),
                    None => KEY_DOES_NOT_EXIST_STATUS,
                }
            }
            REMOVE_IF_UNMODIFIED_REQUEST => {
                let slot = slot.unwrap_or_default();
                match self.entries.get(&slot).cloned() {
                    None => KEY_DOES_NOT_EXIST_STATUS,
                    Some((_, version)) if Some(version) != request.version => {
                        NOT_PUT_REMOVED_REPLACED_STATUS
                    }
                    Some(_) => {
                        self.delete(slot);
                        NO_ERROR_STATUS
                    }
                }
            }
            CLEAR_REQUEST => {
                let keys: Vec<_> = self
                    .entries
                    .keys()
                    .filter(|(c, _)| *c == cache)
                    .cloned()
                    .collect();
                for slot in keys {
                    self.delete(slot);
                }
                NO_ERROR_STATUS
            }
            SIZE_REQUEST => {
                vint::put_vlong(body, self.count(&cache));
                NO_ERROR_STATUS
            }
            STATS_REQUEST => {
                vint::put_vint(body, 1);
                vint::put_string(body, "currentNumberOfEntries");
                vint::put_string(body, &self.count(&cache).to_string());
                NO_ERROR_STATUS
            }
            ADD_CLIENT_LISTENER_REQUEST | ADD_BLOOM_NEAR_CACHE_LISTENER_REQUEST => {
                if let Some(id) = request.listener_id.clone() {
                    self.listeners.push(Listener {
                        id,
                        cache,
                        outbound: outbound.clone(),
                    });
                }
                NO_ERROR_STATUS
            }
            REMOVE_CLIENT_LISTENER_REQUEST => {
                let before = self.listeners.len();
                self.listeners
                    .retain(|l| Some(&l.id) != request.listener_id.as_ref());
                if self.listeners.len() < before {
                    NO_ERROR_STATUS
                } else {
                    NOT_PUT_REMOVED_REPLACED_STATUS
                }
            }
            ITERATION_START_REQUEST => {
                self.next_iteration += 1;
                let id = format!("iteration-{}", self.next_iteration);
                vint::put_string(body, &id);
                self.iterations.insert(
                    id,
                    Iteration {
                        cache,
                        drained: false,
                    },
                );
                NO_ERROR_STATUS
            }
            ITERATION_NEXT_REQUEST => {
                let id = request.iteration_id.clone().unwrap_or_default();
                let Some(iteration) = self.iterations.get_mut(&id) else {
                    return INVALID_ITERATION_STATUS;
                };
                if iteration.drained {
                    vint::put_array(body, &[]);
                    vint::put_vint(body, 0);
                    return NO_ERROR_STATUS;
                }
                iteration.drained = true;
                let cache = iteration.cache.clone();
                let all: Vec<u32> = (0..SEGMENTS).collect();
                vint::put_array(body, &encode_segments(&all));
                let entries: Vec<_> = self
                    .entries
                    .iter()
                    .filter(|((c, _), _)| *c == cache)
                    .map(|((_, k), (v, _))| (k.clone(), v.clone()))
                    .collect();
                vint::put_vint(body, entries.len() as u32);
                for (key, value) in entries {
                    vint::put_array(body, &key);
                    vint::put_array(body, &value);
                }
                NO_ERROR_STATUS
            }
            ITERATION_END_REQUEST => {
                let id = request.iteration_id.clone().unwrap_or_default();
                match self.iterations.remove(&id) {
                    Some(_) => NO_ERROR_STATUS,
                    None => INVALID_ITERATION_STATUS,
                }
            }
            _ => NO_ERROR_STATUS,
        }
    }

    fn with_previous(
        &self,
        request: &Request,
        previous: Option<Bytes>,
        body: &mut BytesMut,
        status: u8,
    ) -> u8 {
        if request.flags & FORCE_RETURN_VALUE == 0 {
            return status;
        }
        vint::put_array(body, previous.as_deref().unwrap_or_default());
        match status {
            NO_ERROR_STATUS => SUCCESS_WITH_PREVIOUS_STATUS,
            _ => NOT_EXECUTED_WITH_PREVIOUS_STATUS,
        }
    }

    fn count(&self, cache: &str) -> u64 {
        self.entries.keys().filter(|(c, _)| c == cache).count() as u64
    }

    fn store(&mut self, slot: (String, Bytes), value: Bytes) -> Option<(Bytes, i64)> {
        let version = self.next_version;
        self.next_version += 1;
        let previous = self.entries.insert(slot.clone(), (value, version));
        let event = match previous {
            Some(_) => CACHE_ENTRY_MODIFIED_EVENT,
            None => CACHE_ENTRY_CREATED_EVENT,
        };
        self.notify(&slot.0, event, &slot.1, Some(version));
        previous
    }

    fn delete(&mut self, slot: (String, Bytes)) -> Option<(Bytes, i64)> {
        let previous = self.entries.remove(&slot);
        if previous.is_some() {
            self.notify(&slot.0, CACHE_ENTRY_REMOVED_EVENT, &slot.1, None);
        }
        previous
    }

    fn notify(&mut self, cache: &str, event: u8, key: &Bytes, version: Option<i64>) {
        self.listeners.retain(|l| !l.outbound.is_closed());
        for listener in self.listeners.iter().filter(|l| l.cache == cache) {
            let mut frame = BytesMut::new();
            write_response_header(&mut frame, 0, event, NO_ERROR_STATUS, None).unwrap();
            vint::put_array(&mut frame, &listener.id);
            // not custom, not retried
            frame.put_u8(0);
            frame.put_u8(0);
            vint::put_array(&mut frame, key);
            if let Some(version) = version {
                frame.put_i64(version);
            }
            let _ = listener.outbound.send(frame);
        }
    }
}
