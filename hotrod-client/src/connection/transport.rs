//! A single TCP connection to one Hot Rod server.
//!
//! Requests are queued to a writer task and answered out of order: a reader
//! task decodes every inbound frame and hands responses to whoever is waiting
//! on the matching message id. Events pushed by the server go to an optional
//! event sink, so the same connection can carry listener traffic.
//!
//! Only the writer task touches the socket's write half, so a frame is either
//! written whole or the transport fails. Callers that give up early stop
//! waiting; they never cut a frame short.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hotrod_core::protocol::{
    ClientEvent, HotRodCodec, Inbound, PendingShapes, Request, RequestBody, RequestFrame, Response,
    ResponseShape, WireCodec,
};
use hotrod_core::{HotRodError, Result, ServerAddress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use crate::telemetry::Telemetry;

/// Unique identifier for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    /// Generates a new unique transport ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Returns a message id never handed out before in this process.
///
/// Every attempt of every call gets its own id, so a late answer to an
/// abandoned attempt can never be mistaken for the answer to a newer one.
pub fn next_message_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Sink for events pushed on a transport.
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

type Waiter = oneshot::Sender<Result<Response>>;

/// Frames queued for the writer task before `send` waits for room.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Everything needed to open transports.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    wire: Arc<WireCodec>,
    connect_timeout: Duration,
    tcp_no_delay: bool,
    telemetry: Arc<dyn Telemetry>,
}

impl TransportFactory {
    /// Creates a factory.
    pub fn new(
        wire: Arc<WireCodec>,
        connect_timeout: Duration,
        tcp_no_delay: bool,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            wire,
            connect_timeout,
            tcp_no_delay,
            telemetry,
        }
    }

    /// Returns the wire codec shared by every transport.
    pub fn wire(&self) -> &Arc<WireCodec> {
        &self.wire
    }

    /// Opens a transport whose pushed events are dropped.
    pub async fn connect(&self, address: &ServerAddress) -> Result<Transport> {
        self.open(address, None).await
    }

    /// Opens a transport that forwards pushed events to `events`.
    pub async fn connect_with_events(
        &self,
        address: &ServerAddress,
        events: EventSink,
    ) -> Result<Transport> {
        self.open(address, Some(events)).await
    }

    async fn open(&self, address: &ServerAddress, events: Option<EventSink>) -> Result<Transport> {
        let connect = TcpStream::connect((address.host(), address.port()));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                HotRodError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    address, self.connect_timeout
                ))
            })?
            .map_err(|e| HotRodError::Connection(format!("failed to connect to {}: {}", address, e)))?;

        if self.tcp_no_delay {
            stream.set_nodelay(true).map_err(|e| {
                HotRodError::Connection(format!("failed to set TCP_NODELAY: {}", e))
            })?;
        }

        let transport = Transport::start(
            stream,
            address.clone(),
            HotRodCodec::new(Arc::clone(&self.wire)),
            events,
            Arc::clone(&self.telemetry),
        );
        tracing::debug!(address = %address, id = %transport.id(), "established connection");
        self.telemetry.connection_opened(address);
        Ok(transport)
    }
}

/// An encoded frame and the channel told once it is on the socket.
struct QueuedFrame {
    bytes: Bytes,
    written: oneshot::Sender<Result<()>>,
}

struct Shared {
    id: TransportId,
    address: ServerAddress,
    pending: Mutex<HashMap<u64, Waiter>>,
    shapes: PendingShapes,
    closed: AtomicBool,
    telemetry: Arc<dyn Telemetry>,
}

impl Shared {
    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn closed_error(&self) -> HotRodError {
        HotRodError::Connection(format!("transport to {} is closed", self.address))
    }

    fn complete(&self, response: Response) {
        let message_id = response.header.message_id;
        match self.waiters().remove(&message_id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None => {
                tracing::trace!(
                    address = %self.address,
                    message_id,
                    "dropping response for abandoned request"
                );
            }
        }
    }

    /// Marks the transport closed and fails every waiter with `error`.
    fn fail_all(&self, error: &HotRodError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.telemetry.connection_closed(&self.address);
        }
        let waiters: Vec<Waiter> = self.waiters().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(error.duplicate()));
        }
    }
}

/// A connection bound to exactly one server address.
///
/// Several requests may be in flight at once; answers are matched by message
/// id. A transport that failed once is closed for good.
pub struct Transport {
    shared: Arc<Shared>,
    codec: HotRodCodec,
    outbound: mpsc::Sender<QueuedFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    created_at: Instant,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    fn start(
        stream: TcpStream,
        address: ServerAddress,
        codec: HotRodCodec,
        events: Option<EventSink>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            id: TransportId::new(),
            address,
            pending: Mutex::new(HashMap::new()),
            shapes: codec.shapes().clone(),
            closed: AtomicBool::new(false),
            telemetry,
        });

        let reader = tokio::spawn(read_loop(
            Arc::clone(&shared),
            read_half,
            codec.clone(),
            events,
        ));
        let (outbound, queued) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), write_half, queued));

        Self {
            shared,
            codec,
            outbound,
            reader,
            writer,
            created_at: Instant::now(),
        }
    }

    /// Returns the transport's unique identifier.
    pub fn id(&self) -> TransportId {
        self.shared.id
    }

    /// Returns the server this transport talks to.
    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    /// Returns when this transport was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns whether the transport has failed or been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of requests awaiting an answer.
    pub fn in_flight(&self) -> usize {
        self.shared.waiters().len()
    }

    /// Writes a request and returns a handle resolving to its answer.
    ///
    /// Dropping the handle, or this future, abandons the request: a frame
    /// already queued is still written whole and a late answer is discarded.
    /// The transport stays usable unless the answer's layout depends on the
    /// request, in which case it is closed.
    pub async fn send(&self, frame: RequestFrame) -> Result<PendingResponse> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }

        let message_id = frame.message_id;
        let body = &frame.request.body;
        let layout_fixed = body.expected_shape() == ResponseShape::for_opcode(body.opcode() + 1);
        let (tx, rx) = oneshot::channel();
        self.shared.waiters().insert(message_id, tx);
        let pending = PendingResponse {
            shared: Arc::clone(&self.shared),
            message_id,
            layout_fixed,
            receiver: rx,
        };

        let mut buffer = BytesMut::new();
        self.codec.clone().encode(frame, &mut buffer)?;
        let (written, on_socket) = oneshot::channel();
        let queued = QueuedFrame {
            bytes: buffer.freeze(),
            written,
        };
        if self.outbound.send(queued).await.is_err() {
            return Err(self.shared.closed_error());
        }
        match on_socket.await {
            Ok(Ok(())) => Ok(pending),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Sends a request and waits for its answer.
    pub async fn execute(&self, frame: RequestFrame) -> Result<Response> {
        self.send(frame).await?.await_response().await
    }

    /// Sends a PING and checks that the server answers successfully.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let frame = RequestFrame {
            message_id: next_message_id(),
            topology_id: 0,
            request: Request::new("", RequestBody::Ping),
        };
        let response = tokio::time::timeout(timeout, self.execute(frame))
            .await
            .map_err(|_| {
                HotRodError::Timeout(format!("ping to {} timed out", self.shared.address))
            })??;
        if response.status().is_error() {
            return Err(HotRodError::Server {
                status: response.status().raw(),
                message: response.error_message().unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    /// Closes the transport, failing every request still in flight.
    pub fn close(&self) {
        self.shared.fail_all(&HotRodError::Closed(format!(
            "transport to {} closed",
            self.shared.address
        )));
        self.reader.abort();
        self.writer.abort();
        tracing::debug!(id = %self.shared.id, address = %self.shared.address, "connection closed");
    }

    #[cfg(test)]
    fn tracked_shapes(&self) -> usize {
        self.shared.shapes.len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
        self.reader.abort();
        self.writer.abort();
    }
}

/// An answer not received yet.
#[derive(Debug)]
pub struct PendingResponse {
    shared: Arc<Shared>,
    message_id: u64,
    layout_fixed: bool,
    receiver: oneshot::Receiver<Result<Response>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PendingResponse {
    /// Returns the message id the answer must carry.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Waits for the answer.
    pub async fn await_response(mut self) -> Result<Response> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(HotRodError::Connection(format!(
                "connection to {} dropped the request",
                self.shared.address
            ))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let abandoned = self.shared.waiters().remove(&self.message_id).is_some();
        let registered = self.shared.shapes.remove(self.message_id).is_some();
        if abandoned && registered && !self.layout_fixed {
            // A late answer would be read with the opcode's default layout.
            tracing::debug!(
                address = %self.shared.address,
                message_id = self.message_id,
                "closing transport after abandoning a request with a custom layout"
            );
            self.shared.fail_all(&HotRodError::Connection(format!(
                "request {} to {} was abandoned mid-exchange",
                self.message_id, self.shared.address
            )));
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut stream: OwnedWriteHalf,
    mut queued: mpsc::Receiver<QueuedFrame>,
) {
    while let Some(QueuedFrame { bytes, written }) = queued.recv().await {
        if shared.closed.load(Ordering::SeqCst) {
            let _ = written.send(Err(shared.closed_error()));
            continue;
        }
        if let Err(e) = stream.write_all(&bytes).await {
            let error = HotRodError::Connection(format!(
                "failed to write to {}: {}",
                shared.address, e
            ));
            let _ = written.send(Err(error.duplicate()));
            shared.fail_all(&error);
            return;
        }
        let _ = written.send(Ok(()));
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stream: OwnedReadHalf,
    mut codec: HotRodCodec,
    events: Option<EventSink>,
) {
    let mut buffer = BytesMut::with_capacity(8192);
    let error = loop {
        match codec.decode(&mut buffer) {
            Ok(Some(Inbound::Response(response))) => {
                shared.complete(response);
                continue;
            }
            Ok(Some(Inbound::Event(event))) => {
                match &events {
                    Some(sink) => {
                        let _ = sink.send(event);
                    }
                    None => tracing::trace!(
                        address = %shared.address,
                        kind = ?event.kind,
                        "dropping event on a transport without listeners"
                    ),
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => break e,
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) if buffer.is_empty() => {
                break HotRodError::Connection(format!(
                    "connection to {} closed by server",
                    shared.address
                ));
            }
            Ok(0) => {
                break HotRodError::Connection(format!(
                    "connection to {} closed unexpectedly",
                    shared.address
                ));
            }
            Ok(_) => {}
            Err(e) => {
                break HotRodError::Connection(format!(
                    "failed to read from {}: {}",
                    shared.address, e
                ));
            }
        }
    };

    if !shared.closed.load(Ordering::SeqCst) {
        tracing::warn!(address = %shared.address, error = %error, "transport failed");
    }
    shared.fail_all(&error);
}
