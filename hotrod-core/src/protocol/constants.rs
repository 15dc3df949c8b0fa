//! Protocol constants for the Hot Rod binary protocol.

/// Magic byte opening every request frame.
pub const REQUEST_MAGIC: u8 = 0xA0;

/// Magic byte opening every response and event frame.
pub const RESPONSE_MAGIC: u8 = 0xA1;

/// Maximum number of bytes in a VInt (32-bit) encoding.
pub const MAX_VINT_BYTES: usize = 5;

/// Maximum number of bytes in a VLong (64-bit) encoding.
pub const MAX_VLONG_BYTES: usize = 10;

/// Name of the server's default cache.
pub const DEFAULT_CACHE_NAME: &str = "";

// Request opcodes. The matching response opcode is always `request + 1`.

/// Stores a value under a key.
pub const PUT_REQUEST: u8 = 0x01;
/// Reads the value for a key.
pub const GET_REQUEST: u8 = 0x03;
/// Stores a value only when the key is absent.
pub const PUT_IF_ABSENT_REQUEST: u8 = 0x05;
/// Replaces the value only when the key is present.
pub const REPLACE_REQUEST: u8 = 0x07;
/// Replaces the value only when the data version matches.
pub const REPLACE_IF_UNMODIFIED_REQUEST: u8 = 0x09;
/// Removes a key.
pub const REMOVE_REQUEST: u8 = 0x0B;
/// Removes a key only when the data version matches.
pub const REMOVE_IF_UNMODIFIED_REQUEST: u8 = 0x0D;
/// Tests key presence.
pub const CONTAINS_KEY_REQUEST: u8 = 0x0F;
/// Reads value plus data version.
pub const GET_WITH_VERSION_REQUEST: u8 = 0x11;
/// Removes every entry.
pub const CLEAR_REQUEST: u8 = 0x13;
/// Reads server statistics.
pub const STATS_REQUEST: u8 = 0x15;
/// Liveness probe, also used to fetch the initial topology.
pub const PING_REQUEST: u8 = 0x17;
/// Reads value, version, and expiration metadata.
pub const GET_WITH_METADATA_REQUEST: u8 = 0x1B;
/// Registers a client listener on the receiving server.
pub const ADD_CLIENT_LISTENER_REQUEST: u8 = 0x25;
/// Removes a previously registered client listener.
pub const REMOVE_CLIENT_LISTENER_REQUEST: u8 = 0x27;
/// Counts entries.
pub const SIZE_REQUEST: u8 = 0x29;
/// Opens a server-side iteration.
pub const ITERATION_START_REQUEST: u8 = 0x31;
/// Fetches the next iteration batch.
pub const ITERATION_NEXT_REQUEST: u8 = 0x33;
/// Releases a server-side iteration.
pub const ITERATION_END_REQUEST: u8 = 0x35;
/// Registers a near-cache listener gated by a client bloom filter.
pub const ADD_BLOOM_NEAR_CACHE_LISTENER_REQUEST: u8 = 0x41;
/// Replaces the bloom filter of a near-cache listener.
pub const UPDATE_BLOOM_FILTER_REQUEST: u8 = 0x43;

/// Generic error response, sent when the request opcode could not be read.
pub const ERROR_RESPONSE: u8 = 0x50;

/// Event: an entry was created.
pub const CACHE_ENTRY_CREATED_EVENT: u8 = 0x60;
/// Event: an entry was modified.
pub const CACHE_ENTRY_MODIFIED_EVENT: u8 = 0x61;
/// Event: an entry was removed.
pub const CACHE_ENTRY_REMOVED_EVENT: u8 = 0x62;
/// Event: an entry expired.
pub const CACHE_ENTRY_EXPIRED_EVENT: u8 = 0x63;

// Status codes.

/// Success.
pub const NO_ERROR_STATUS: u8 = 0x00;
/// Conditional operation not executed: the entry was modified.
pub const NOT_PUT_REMOVED_REPLACED_STATUS: u8 = 0x01;
/// The key does not exist.
pub const KEY_DOES_NOT_EXIST_STATUS: u8 = 0x02;
/// Success, previous value follows.
pub const SUCCESS_WITH_PREVIOUS_STATUS: u8 = 0x03;
/// Not executed, previous value follows.
pub const NOT_EXECUTED_WITH_PREVIOUS_STATUS: u8 = 0x04;
/// The iteration id is unknown to the server.
pub const INVALID_ITERATION_STATUS: u8 = 0x05;
/// Success on an object-storage cache.
pub const NO_ERROR_STATUS_OBJ_STORAGE: u8 = 0x06;
/// Success with previous value on an object-storage cache.
pub const SUCCESS_WITH_PREVIOUS_OBJ_STORAGE: u8 = 0x07;
/// Not executed with previous value on an object-storage cache.
pub const NOT_EXECUTED_WITH_PREVIOUS_OBJ_STORAGE: u8 = 0x08;
/// Invalid magic byte or message id.
pub const INVALID_MAGIC_OR_MESSAGE_ID_STATUS: u8 = 0x81;
/// Unknown command.
pub const UNKNOWN_COMMAND_STATUS: u8 = 0x82;
/// Unknown protocol version.
pub const UNKNOWN_VERSION_STATUS: u8 = 0x83;
/// Request parsing error.
pub const REQUEST_PARSING_ERROR_STATUS: u8 = 0x84;
/// Generic server error.
pub const SERVER_ERROR_STATUS: u8 = 0x85;
/// Command timed out on the server.
pub const COMMAND_TIMEOUT_STATUS: u8 = 0x86;
/// The node that owns the key is suspected of having failed.
pub const NODE_SUSPECTED_STATUS: u8 = 0x87;
/// The cache is starting, stopping, or rebalancing.
pub const ILLEGAL_LIFECYCLE_STATE_STATUS: u8 = 0x88;

// Request flags.

/// Ask the server to return the previous value.
pub const FORCE_RETURN_VALUE: u32 = 0x01;
/// Use the server's default lifespan.
pub const DEFAULT_LIFESPAN: u32 = 0x02;
/// Use the server's default max-idle.
pub const DEFAULT_MAXIDLE: u32 = 0x04;
/// Do not load missing entries from a cache store.
pub const SKIP_CACHE_LOAD: u32 = 0x08;
/// Do not update indexes.
pub const SKIP_INDEXING: u32 = 0x10;
/// Do not fire listener notifications for this write.
pub const SKIP_LISTENER_NOTIFICATION: u32 = 0x20;

// Metadata flags in GET_WITH_METADATA and iteration responses.

/// The entry never expires by lifespan; created/lifespan are omitted.
pub const INFINITE_LIFESPAN_FLAG: u8 = 0x01;
/// The entry never expires by idleness; last-used/max-idle are omitted.
pub const INFINITE_MAXIDLE_FLAG: u8 = 0x02;

// Time unit nibbles used from protocol 2.2 on.

/// Seconds.
pub const TIME_UNIT_SECONDS: u8 = 0x00;
/// Milliseconds.
pub const TIME_UNIT_MILLISECONDS: u8 = 0x01;
/// Nanoseconds.
pub const TIME_UNIT_NANOSECONDS: u8 = 0x02;
/// Microseconds.
pub const TIME_UNIT_MICROSECONDS: u8 = 0x03;
/// Minutes.
pub const TIME_UNIT_MINUTES: u8 = 0x04;
/// Hours.
pub const TIME_UNIT_HOURS: u8 = 0x05;
/// Days.
pub const TIME_UNIT_DAYS: u8 = 0x06;
/// Server default, no value follows.
pub const TIME_UNIT_DEFAULT: u8 = 0x07;
/// Never expires, no value follows.
pub const TIME_UNIT_INFINITE: u8 = 0x08;

// Media type encodings (protocol 2.8+).

/// No media type; the server assumes its configured default.
pub const MEDIA_TYPE_NONE: u8 = 0x00;
/// Media type identified by a predefined numeric id.
pub const MEDIA_TYPE_PREDEFINED: u8 = 0x01;
/// Media type given as a MIME string followed by parameters.
pub const MEDIA_TYPE_CUSTOM: u8 = 0x02;
