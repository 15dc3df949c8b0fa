//! Server-push listeners and the registry that keeps them connected.

mod registry;

pub use registry::ListenerRegistry;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use hotrod_core::protocol::{ClientEvent, FactoryRef};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Unique identifier for a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Creates a new unique listener ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a listener ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the id as sent on the wire.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }

    /// Returns whether `bytes` is this id in wire form.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.0.as_bytes()[..] == *bytes
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Server-side filtering and conversion applied to a listener's events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerFilter {
    /// Filter factory deciding which events are sent.
    pub filter_factory: Option<FactoryRef>,
    /// Converter factory shaping the event payload.
    pub converter_factory: Option<FactoryRef>,
    /// Replay the current cache contents as created events on registration.
    pub include_current_state: bool,
    /// Deliver converter output without unmarshalling it on the server.
    pub use_raw_data: bool,
}

impl ListenerFilter {
    /// Creates a filter that lets every event through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter factory.
    pub fn filter(mut self, factory: FactoryRef) -> Self {
        self.filter_factory = Some(factory);
        self
    }

    /// Sets the converter factory.
    pub fn converter(mut self, factory: FactoryRef) -> Self {
        self.converter_factory = Some(factory);
        self
    }

    /// Requests created events for entries already present.
    pub fn include_current_state(mut self, include: bool) -> Self {
        self.include_current_state = include;
        self
    }

    /// Requests raw converter output.
    pub fn use_raw_data(mut self, raw: bool) -> Self {
        self.use_raw_data = raw;
        self
    }
}

/// Active flag plus the signal that stops a listener's task.
#[derive(Debug)]
pub(crate) struct ListenerControl {
    active: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerControl {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active: AtomicBool::new(true),
            shutdown_tx,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// A registered listener.
///
/// Yields the events the server pushes, as a [`Stream`] or through
/// [`next_event`](Self::next_event). Dropping the handle deregisters the
/// listener in the background; [`ListenerRegistry::unregister`] does the same
/// and waits for the server to acknowledge.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    cache_name: String,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    control: Arc<ListenerControl>,
}

impl ListenerHandle {
    pub(crate) fn new(
        id: ListenerId,
        cache_name: String,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        control: Arc<ListenerControl>,
    ) -> Self {
        Self {
            id,
            cache_name,
            events,
            control,
        }
    }

    /// Returns the listener ID.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the cache the listener watches.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Returns `true` until the listener is deregistered or the client closes.
    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    /// Waits for the next event. Returns `None` once the listener is gone.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Returns an event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }
}

impl Stream for ListenerHandle {
    type Item = ClientEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.control.deactivate();
    }
}

/// Statistics for listener operations.
#[derive(Debug, Default)]
pub struct ListenerStats {
    events_received: AtomicU64,
    errors: AtomicU64,
    reregistrations: AtomicU64,
}

impl ListenerStats {
    /// Creates new listener statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the events received counter.
    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the error counter.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the re-registration counter.
    pub fn record_reregistration(&self) {
        self.reregistrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of events received.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Returns the number of events that could not be delivered.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns how often a listener moved to another server.
    pub fn reregistrations(&self) -> u64 {
        self.reregistrations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use hotrod_core::protocol::{EventKind, EventPayload};

    fn event(id: ListenerId, key: &'static [u8]) -> ClientEvent {
        ClientEvent {
            listener_id: id.to_bytes(),
            kind: EventKind::Created,
            retried: false,
            payload: EventPayload::Key {
                key: Bytes::from_static(key),
                version: Some(1),
            },
        }
    }

    #[test]
    fn test_listener_id_uniqueness() {
        let id1 = ListenerId::new();
        let id2 = ListenerId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_listener_id_display() {
        let id = ListenerId::new();
        assert!(id.to_string().starts_with("listener-"));
    }

    #[test]
    fn test_listener_id_wire_form() {
        let id = ListenerId::new();
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert!(id.matches(&bytes));
        assert!(!ListenerId::new().matches(&bytes));
    }

    #[test]
    fn test_listener_filter_builder() {
        let filter = ListenerFilter::new()
            .filter(FactoryRef::new("key-prefix").param(Bytes::from_static(b"user:")))
            .converter(FactoryRef::new("key-only"))
            .include_current_state(true);
        assert_eq!(filter.filter_factory.as_ref().map(|f| f.name.as_str()), Some("key-prefix"));
        assert_eq!(filter.filter_factory.as_ref().map(|f| f.params.len()), Some(1));
        assert!(filter.include_current_state);
        assert!(!filter.use_raw_data);
    }

    #[tokio::test]
    async fn test_handle_streams_events() {
        let id = ListenerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = ListenerHandle::new(id, "c".to_string(), rx, Arc::new(ListenerControl::new()));
        assert!(handle.try_next_event().is_none());

        tx.send(event(id, b"k1")).unwrap();
        tx.send(event(id, b"k2")).unwrap();
        drop(tx);

        assert_eq!(handle.next_event().await.and_then(|e| e.key().cloned()), Some(Bytes::from_static(b"k1")));
        let rest: Vec<_> = (&mut handle).collect().await;
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_handle_drop_deactivates() {
        let control = Arc::new(ListenerControl::new());
        let mut shutdown = control.shutdown_receiver();
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = ListenerHandle::new(ListenerId::new(), "c".to_string(), rx, Arc::clone(&control));
        assert!(handle.is_active());

        drop(handle);
        assert!(!control.is_active());
        assert!(shutdown.has_changed().unwrap());
        assert!(*shutdown.borrow_and_update());
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::new();
        stats.record_event();
        stats.record_event();
        stats.record_error();
        stats.record_reregistration();

        assert_eq!(stats.events_received(), 2);
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.reregistrations(), 1);
    }

    #[test]
    fn test_listener_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ListenerId>();
        assert_send_sync::<ListenerHandle>();
        assert_send_sync::<ListenerStats>();
    }
}
