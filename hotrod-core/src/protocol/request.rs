//! Request model: header fields plus an operation-specific body.

use std::time::Duration;

use bytes::Bytes;

use super::constants::*;
use super::response::ResponseShape;

/// How long an entry lives, or how long it may stay idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// Use the server's configured default.
    #[default]
    Default,
    /// Never expire.
    Infinite,
    /// Expire after the given duration.
    Finite(Duration),
}

impl Lifetime {
    /// Converts a wire `(value, unit)` pair back into a lifetime.
    pub fn from_wire(value: u64, unit: u8) -> Option<Self> {
        let duration = match unit {
            TIME_UNIT_SECONDS => Duration::from_secs(value),
            TIME_UNIT_MILLISECONDS => Duration::from_millis(value),
            TIME_UNIT_NANOSECONDS => Duration::from_nanos(value),
            TIME_UNIT_MICROSECONDS => Duration::from_micros(value),
            TIME_UNIT_MINUTES => Duration::from_secs(value.checked_mul(60)?),
            TIME_UNIT_HOURS => Duration::from_secs(value.checked_mul(3_600)?),
            TIME_UNIT_DAYS => Duration::from_secs(value.checked_mul(86_400)?),
            TIME_UNIT_DEFAULT => return Some(Lifetime::Default),
            TIME_UNIT_INFINITE => return Some(Lifetime::Infinite),
            _ => return None,
        };
        Some(Lifetime::Finite(duration))
    }

    /// Picks the coarsest unit that represents the duration exactly.
    pub fn to_wire(self) -> (u8, Option<u64>) {
        match self {
            Lifetime::Default => (TIME_UNIT_DEFAULT, None),
            Lifetime::Infinite => (TIME_UNIT_INFINITE, None),
            Lifetime::Finite(d) => {
                if d.subsec_nanos() == 0 {
                    let secs = d.as_secs();
                    if secs % 86_400 == 0 && secs > 0 {
                        (TIME_UNIT_DAYS, Some(secs / 86_400))
                    } else if secs % 3_600 == 0 && secs > 0 {
                        (TIME_UNIT_HOURS, Some(secs / 3_600))
                    } else if secs % 60 == 0 && secs > 0 {
                        (TIME_UNIT_MINUTES, Some(secs / 60))
                    } else {
                        (TIME_UNIT_SECONDS, Some(secs))
                    }
                } else if d.subsec_nanos() % 1_000_000 == 0 {
                    (TIME_UNIT_MILLISECONDS, Some(d.as_millis() as u64))
                } else if d.subsec_nanos() % 1_000 == 0 {
                    (TIME_UNIT_MICROSECONDS, Some(d.as_micros() as u64))
                } else {
                    (TIME_UNIT_NANOSECONDS, Some(d.as_nanos() as u64))
                }
            }
        }
    }

    /// Whole seconds for the pre-2.2 encoding, rounding sub-second values up.
    pub fn whole_seconds(self) -> u32 {
        match self {
            Lifetime::Finite(d) => {
                let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
                u32::try_from(secs).unwrap_or(u32::MAX)
            }
            Lifetime::Default | Lifetime::Infinite => 0,
        }
    }
}

/// Lifespan and max-idle for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration {
    /// Time after which the entry expires regardless of access.
    pub lifespan: Lifetime,
    /// Time after which the entry expires if not accessed.
    pub max_idle: Lifetime,
}

impl Expiration {
    /// Uses the server defaults for both settings.
    pub fn server_default() -> Self {
        Self::default()
    }

    /// Entry never expires.
    pub fn never() -> Self {
        Self {
            lifespan: Lifetime::Infinite,
            max_idle: Lifetime::Infinite,
        }
    }

    /// Entry expires after `lifespan`, idle expiry left to the server.
    pub fn lifespan(lifespan: Duration) -> Self {
        Self {
            lifespan: Lifetime::Finite(lifespan),
            max_idle: Lifetime::Default,
        }
    }

    /// Sets the max-idle setting.
    pub fn with_max_idle(mut self, max_idle: Lifetime) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Media type tag sent with requests from protocol 2.8 on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MediaType {
    /// No media type; the server assumes its configured default.
    #[default]
    Unspecified,
    /// A MIME type such as `application/octet-stream`.
    Custom(String),
}

impl MediaType {
    /// Raw bytes, the format this client treats keys and values as.
    pub fn octet_stream() -> Self {
        MediaType::Custom("application/octet-stream".to_string())
    }
}

/// A server-side filter or converter factory and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryRef {
    /// Factory name as registered on the server.
    pub name: String,
    /// Opaque parameters passed to the factory.
    pub params: Vec<Bytes>,
}

impl FactoryRef {
    /// Creates a reference with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Appends a parameter.
    pub fn param(mut self, value: impl Into<Bytes>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Operation-specific request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Read a value.
    Get {
        /// Key bytes.
        key: Bytes,
    },
    /// Read a value and its data version.
    GetWithVersion {
        /// Key bytes.
        key: Bytes,
    },
    /// Read a value, version, and expiration metadata.
    GetWithMetadata {
        /// Key bytes.
        key: Bytes,
    },
    /// Test key presence.
    ContainsKey {
        /// Key bytes.
        key: Bytes,
    },
    /// Store a value.
    Put {
        /// Key bytes.
        key: Bytes,
        /// Value bytes.
        value: Bytes,
        /// Lifespan and max-idle.
        expiration: Expiration,
    },
    /// Store a value only when the key is absent.
    PutIfAbsent {
        /// Key bytes.
        key: Bytes,
        /// Value bytes.
        value: Bytes,
        /// Lifespan and max-idle.
        expiration: Expiration,
    },
    /// Replace a value only when the key is present.
    Replace {
        /// Key bytes.
        key: Bytes,
        /// Value bytes.
        value: Bytes,
        /// Lifespan and max-idle.
        expiration: Expiration,
    },
    /// Replace only when the stored version equals `version`.
    ReplaceIfUnmodified {
        /// Key bytes.
        key: Bytes,
        /// Value bytes.
        value: Bytes,
        /// Lifespan and max-idle.
        expiration: Expiration,
        /// Expected data version.
        version: i64,
    },
    /// Remove a key.
    Remove {
        /// Key bytes.
        key: Bytes,
    },
    /// Remove only when the stored version equals `version`.
    RemoveIfUnmodified {
        /// Key bytes.
        key: Bytes,
        /// Expected data version.
        version: i64,
    },
    /// Remove every entry.
    Clear,
    /// Count entries.
    Size,
    /// Fetch server statistics.
    Stats,
    /// Liveness probe.
    Ping,
    /// Register a listener on the receiving server.
    AddClientListener {
        /// Client-chosen listener id.
        listener_id: Bytes,
        /// Replay existing entries as created events.
        include_current_state: bool,
        /// Optional server-side event filter.
        filter: Option<FactoryRef>,
        /// Optional server-side event converter.
        converter: Option<FactoryRef>,
        /// Deliver filter/converter output without unmarshalling.
        use_raw_data: bool,
    },
    /// Register a near-cache listener gated by a bloom filter.
    AddBloomNearCacheListener {
        /// Client-chosen listener id.
        listener_id: Bytes,
        /// Bit length of the bloom filter the client will ship.
        bloom_bits: u32,
    },
    /// Replace the bloom filter of a near-cache listener.
    UpdateBloomFilter {
        /// Listener id the filter belongs to.
        listener_id: Bytes,
        /// Serialized bit set.
        bits: Bytes,
    },
    /// Remove a listener.
    RemoveClientListener {
        /// Listener id to remove.
        listener_id: Bytes,
    },
    /// Open an iteration.
    IterationStart {
        /// Segment bit set to iterate, `None` for all segments.
        segments: Option<Bytes>,
        /// Optional server-side filter.
        filter: Option<FactoryRef>,
        /// Entries per batch.
        batch_size: u32,
        /// Ask for entry metadata.
        metadata: bool,
    },
    /// Fetch the next iteration batch.
    IterationNext {
        /// Id returned by the server when the iteration started.
        iteration_id: String,
        /// Whether the iteration was opened with metadata.
        metadata: bool,
    },
    /// Release an iteration.
    IterationEnd {
        /// Id returned by the server when the iteration started.
        iteration_id: String,
    },
}

impl RequestBody {
    /// Returns the request opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            RequestBody::Get { .. } => GET_REQUEST,
            RequestBody::GetWithVersion { .. } => GET_WITH_VERSION_REQUEST,
            RequestBody::GetWithMetadata { .. } => GET_WITH_METADATA_REQUEST,
            RequestBody::ContainsKey { .. } => CONTAINS_KEY_REQUEST,
            RequestBody::Put { .. } => PUT_REQUEST,
            RequestBody::PutIfAbsent { .. } => PUT_IF_ABSENT_REQUEST,
            RequestBody::Replace { .. } => REPLACE_REQUEST,
            RequestBody::ReplaceIfUnmodified { .. } => REPLACE_IF_UNMODIFIED_REQUEST,
            RequestBody::Remove { .. } => REMOVE_REQUEST,
            RequestBody::RemoveIfUnmodified { .. } => REMOVE_IF_UNMODIFIED_REQUEST,
            RequestBody::Clear => CLEAR_REQUEST,
            RequestBody::Size => SIZE_REQUEST,
            RequestBody::Stats => STATS_REQUEST,
            RequestBody::Ping => PING_REQUEST,
            RequestBody::AddClientListener { .. } => ADD_CLIENT_LISTENER_REQUEST,
            RequestBody::AddBloomNearCacheListener { .. } => ADD_BLOOM_NEAR_CACHE_LISTENER_REQUEST,
            RequestBody::UpdateBloomFilter { .. } => UPDATE_BLOOM_FILTER_REQUEST,
            RequestBody::RemoveClientListener { .. } => REMOVE_CLIENT_LISTENER_REQUEST,
            RequestBody::IterationStart { .. } => ITERATION_START_REQUEST,
            RequestBody::IterationNext { .. } => ITERATION_NEXT_REQUEST,
            RequestBody::IterationEnd { .. } => ITERATION_END_REQUEST,
        }
    }

    /// Returns the key this request is routed by, if any.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            RequestBody::Get { key }
            | RequestBody::GetWithVersion { key }
            | RequestBody::GetWithMetadata { key }
            | RequestBody::ContainsKey { key }
            | RequestBody::Put { key, .. }
            | RequestBody::PutIfAbsent { key, .. }
            | RequestBody::Replace { key, .. }
            | RequestBody::ReplaceIfUnmodified { key, .. }
            | RequestBody::Remove { key }
            | RequestBody::RemoveIfUnmodified { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Returns the expiration carried by write requests.
    pub fn expiration(&self) -> Option<&Expiration> {
        match self {
            RequestBody::Put { expiration, .. }
            | RequestBody::PutIfAbsent { expiration, .. }
            | RequestBody::Replace { expiration, .. }
            | RequestBody::ReplaceIfUnmodified { expiration, .. } => Some(expiration),
            _ => None,
        }
    }

    /// Returns the shape of the response body this request expects.
    pub fn expected_shape(&self) -> ResponseShape {
        match self {
            RequestBody::IterationNext { metadata, .. } => ResponseShape::IterationNext {
                metadata: *metadata,
            },
            other => ResponseShape::for_opcode(other.opcode() + 1),
        }
    }
}

/// A request ready to be framed, minus the per-attempt message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Target cache; empty for the default cache.
    pub cache_name: String,
    /// Request flags (`FORCE_RETURN_VALUE`, `SKIP_CACHE_LOAD`, ...).
    pub flags: u32,
    /// Operation-specific payload.
    pub body: RequestBody,
}

impl Request {
    /// Creates a request with no flags.
    pub fn new(cache_name: impl Into<String>, body: RequestBody) -> Self {
        Self {
            cache_name: cache_name.into(),
            flags: 0,
            body,
        }
    }

    /// Adds request flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }
}
