//! Segment-aware iteration over the entries of a remote cache.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use hotrod_core::protocol::constants::INVALID_ITERATION_STATUS;
use hotrod_core::protocol::{FactoryRef, IterationEntry};
use hotrod_core::{HotRodError, Result, ServerAddress};

use crate::dispatcher::Dispatcher;
use crate::operation::OperationFactory;
use crate::routing::ConsistentHashRouter;

/// How often one iterator reopens unfinished segments after losing a server.
const MAX_RESTARTS: u32 = 3;

/// Options for iterating a cache.
#[derive(Debug, Clone)]
pub struct IterationOptions {
    /// Number of entries fetched per batch.
    pub batch_size: u32,
    /// Whether entries carry their metadata.
    pub metadata: bool,
    /// Server-side filter applied to entries.
    pub filter: Option<FactoryRef>,
    /// Segments to iterate; all segments when `None`.
    pub segments: Option<Vec<u32>>,
}

impl Default for IterationOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            metadata: false,
            filter: None,
            segments: None,
        }
    }
}

impl IterationOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Requests entry metadata.
    pub fn metadata(mut self, metadata: bool) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets a server-side filter.
    pub fn filter(mut self, filter: FactoryRef) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restricts the iteration to `segments`.
    pub fn segments(mut self, segments: impl IntoIterator<Item = u32>) -> Self {
        self.segments = Some(segments.into_iter().collect());
        self
    }
}

/// Encodes segment numbers as a little-endian bit set.
pub fn encode_segments(segments: &[u32]) -> Bytes {
    let Some(max) = segments.iter().max() else {
        return Bytes::new();
    };
    let mut bits = vec![0u8; (*max as usize) / 8 + 1];
    for segment in segments {
        bits[(*segment as usize) / 8] |= 1 << (segment % 8);
    }
    Bytes::from(bits)
}

/// Decodes a little-endian bit set into segment numbers.
pub fn decode_segments(bits: &[u8]) -> Vec<u32> {
    let mut segments = Vec::new();
    for (index, byte) in bits.iter().enumerate() {
        for bit in 0..8u32 {
            if byte & (1 << bit) != 0 {
                segments.push(index as u32 * 8 + bit);
            }
        }
    }
    segments
}

/// Work still to be opened: a segment subset and the server expected to own it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    segments: Option<Vec<u32>>,
    preferred: Option<ServerAddress>,
}

/// An iteration open on one server.
#[derive(Debug)]
struct Cursor {
    address: ServerAddress,
    iteration_id: String,
    segments: Option<Vec<u32>>,
}

/// Splits the iteration by primary owner when segment ownership is known.
fn plan(
    router: &ConsistentHashRouter,
    cache_name: &str,
    requested: Option<&[u32]>,
    segment_aware: bool,
) -> Result<VecDeque<Target>> {
    if !segment_aware {
        if requested.is_some() {
            return Err(HotRodError::Configuration(
                "iterating a segment subset needs protocol 2.3 or later".to_string(),
            ));
        }
        return Ok(VecDeque::from([Target {
            segments: None,
            preferred: None,
        }]));
    }

    let grouped = router.segments_by_primary(cache_name);
    if grouped.is_empty() {
        return Ok(VecDeque::from([Target {
            segments: requested.map(<[u32]>::to_vec),
            preferred: None,
        }]));
    }

    let wanted: Option<HashSet<u32>> = requested.map(|s| s.iter().copied().collect());
    Ok(grouped
        .into_iter()
        .filter_map(|(primary, segments)| {
            let segments: Vec<u32> = match &wanted {
                Some(wanted) => segments.into_iter().filter(|s| wanted.contains(s)).collect(),
                None => segments,
            };
            (!segments.is_empty()).then(|| Target {
                segments: Some(segments),
                preferred: Some(primary),
            })
        })
        .collect())
}

/// Iterates the entries of a cache in batches.
///
/// With segment ownership known, one server-side iteration is opened per
/// primary owner, covering the segments it owns. If a server is lost midway,
/// the segments it had not finished are reopened elsewhere and keys already
/// returned from them are skipped.
///
/// # Example
///
/// ```ignore
/// let mut entries = cache.iter(IterationOptions::new().batch_size(500));
/// while let Some(entry) = entries.next().await? {
///     println!("{:?} = {:?}", entry.key, entry.value);
/// }
/// entries.close().await;
/// ```
pub struct EntryIterator {
    dispatcher: Arc<Dispatcher>,
    operations: OperationFactory,
    options: IterationOptions,
    segment_aware: bool,
    pending: Option<VecDeque<Target>>,
    current: Option<Cursor>,
    buffer: VecDeque<IterationEntry>,
    finished: BTreeSet<u32>,
    seen: HashMap<u32, HashSet<Bytes>>,
    restarts: u32,
    exhausted: bool,
}

impl std::fmt::Debug for EntryIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryIterator")
            .field("cache_name", &self.operations.cache_name())
            .field("batch_size", &self.options.batch_size)
            .field("buffered", &self.buffer.len())
            .field("finished_segments", &self.finished.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl EntryIterator {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        operations: OperationFactory,
        options: IterationOptions,
        segment_aware: bool,
    ) -> Self {
        Self {
            dispatcher,
            operations,
            options,
            segment_aware,
            pending: None,
            current: None,
            buffer: VecDeque::new(),
            finished: BTreeSet::new(),
            seen: HashMap::new(),
            restarts: 0,
            exhausted: false,
        }
    }

    /// Returns the cache being iterated.
    pub fn cache_name(&self) -> &str {
        self.operations.cache_name()
    }

    /// Returns `true` once every entry was returned.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns the segments the servers reported as finished.
    pub fn finished_segments(&self) -> impl Iterator<Item = u32> + '_ {
        self.finished.iter().copied()
    }

    /// Returns the next entry, fetching another batch if needed.
    pub async fn next(&mut self) -> Result<Option<IterationEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }
            if self.exhausted {
                return Ok(None);
            }

            if self.current.is_none() {
                if self.pending.is_none() {
                    self.pending = Some(plan(
                        self.dispatcher.router(),
                        self.operations.cache_name(),
                        self.options.segments.as_deref(),
                        self.segment_aware,
                    )?);
                }
                match self.pending.as_mut().and_then(VecDeque::pop_front) {
                    Some(target) => self.open(target).await?,
                    None => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
                continue;
            }

            self.fetch().await?;
        }
    }

    /// Returns the key of the next entry.
    pub async fn next_key(&mut self) -> Result<Option<Bytes>> {
        Ok(self.next().await?.map(|entry| entry.key))
    }

    /// Collects all remaining entries.
    pub async fn collect(mut self) -> Result<Vec<IterationEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        self.close().await;
        Ok(entries)
    }

    /// Turns the iterator into a [`Stream`] of entries.
    pub fn into_stream(self) -> impl Stream<Item = Result<IterationEntry>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut iterator = state?;
            match iterator.next().await {
                Ok(Some(entry)) => Some((Ok(entry), Some(iterator))),
                Ok(None) => {
                    iterator.close().await;
                    None
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Releases the server-side iteration, if one is open.
    pub async fn close(&mut self) {
        if let Some(cursor) = self.current.take() {
            self.end(cursor).await;
        }
        self.exhausted = true;
        self.buffer.clear();
    }

    async fn open(&mut self, target: Target) -> Result<()> {
        let segments = target.segments.as_deref().map(encode_segments);
        let operation = self.operations.iteration_start(
            segments,
            self.options.filter.clone(),
            self.options.batch_size,
            self.options.metadata,
        );

        let router = self.dispatcher.router();
        let mut candidates = router.candidates(self.operations.cache_name(), None);
        if let Some(preferred) = &target.preferred {
            candidates.retain(|c| c != preferred);
            candidates.insert(0, preferred.clone());
        }

        let mut last_error = None;
        for address in candidates {
            match self.dispatcher.execute_on(&address, &operation).await {
                Ok(iteration_id) => {
                    tracing::debug!(
                        cache = self.operations.cache_name(),
                        address = %address,
                        iteration_id = %iteration_id,
                        segments = ?target.segments,
                        "iteration opened"
                    );
                    self.current = Some(Cursor {
                        address,
                        iteration_id,
                        segments: target.segments,
                    });
                    return Ok(());
                }
                Err(e) if e.root_cause().is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            HotRodError::Connection("no server available to iterate".to_string())
        }))
    }

    async fn fetch(&mut self) -> Result<()> {
        let Some(cursor) = self.current.as_ref() else {
            return Ok(());
        };
        let operation = self
            .operations
            .iteration_next(cursor.iteration_id.clone(), self.options.metadata);
        let address = cursor.address.clone();

        match self.dispatcher.execute_on(&address, &operation).await {
            Ok(batch) => {
                if batch.entries.is_empty() {
                    if let Some(cursor) = self.current.take() {
                        self.end(cursor).await;
                    }
                    return Ok(());
                }
                self.accept(batch.entries);
                for segment in decode_segments(&batch.finished_segments) {
                    self.finished.insert(segment);
                    self.seen.remove(&segment);
                }
                Ok(())
            }
            Err(e) if self.can_resume(&e) => {
                tracing::warn!(
                    cache = self.operations.cache_name(),
                    address = %address,
                    error = %e,
                    "iteration lost its server, reopening unfinished segments"
                );
                self.resume();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Buffers new entries, skipping keys returned before a restart.
    fn accept(&mut self, entries: Vec<IterationEntry>) {
        let router = self.dispatcher.router();
        let cache_name = self.operations.cache_name();
        for entry in entries {
            match router.segment_for(cache_name, &entry.key) {
                Some(segment) if !self.finished.contains(&segment) => {
                    if !self.seen.entry(segment).or_default().insert(entry.key.clone()) {
                        continue;
                    }
                }
                _ => {}
            }
            self.buffer.push_back(entry);
        }
    }

    fn can_resume(&self, error: &HotRodError) -> bool {
        if !self.segment_aware || self.restarts >= MAX_RESTARTS {
            return false;
        }
        match error.root_cause() {
            HotRodError::Server { status, .. } => *status == INVALID_ITERATION_STATUS,
            other => other.is_retryable(),
        }
    }

    fn resume(&mut self) {
        self.restarts += 1;
        let Some(cursor) = self.current.take() else {
            return;
        };

        let segments = match cursor.segments {
            Some(segments) => segments,
            None => {
                let count = self
                    .dispatcher
                    .router()
                    .current_topology(self.operations.cache_name())
                    .map(|t| t.segment_count())
                    .unwrap_or(0);
                (0..count).collect()
            }
        };
        let remaining: Vec<u32> = segments
            .into_iter()
            .filter(|s| !self.finished.contains(s))
            .collect();

        let target = Target {
            segments: (!remaining.is_empty()).then_some(remaining),
            preferred: None,
        };
        if target.segments.is_none() && !self.finished.is_empty() {
            return;
        }
        self.pending
            .get_or_insert_with(VecDeque::new)
            .push_front(target);
    }

    async fn end(&self, cursor: Cursor) {
        let operation = self.operations.iteration_end(cursor.iteration_id.clone());
        match self.dispatcher.execute_on(&cursor.address, &operation).await {
            Ok(known) => tracing::debug!(iteration_id = %cursor.iteration_id, known, "iteration closed"),
            Err(e) => tracing::debug!(iteration_id = %cursor.iteration_id, error = %e, "failed to close iteration"),
        }
    }
}

impl Drop for EntryIterator {
    fn drop(&mut self) {
        let Some(cursor) = self.current.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let operation = self.operations.iteration_end(cursor.iteration_id);
        handle.spawn(async move {
            let _ = dispatcher.execute_on(&cursor.address, &operation).await;
        });
    }
}
