//! Typed outcomes of cache operations.

use bytes::Bytes;
use hotrod_core::protocol::IterationEntry;

/// Outcome of a version-guarded write or remove.
///
/// All three variants are normal answers; none of them is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedOutcome {
    /// The stored version matched and the operation ran.
    ///
    /// Servers do not echo the new data version, so `new_version` is `None`
    /// on every supported protocol version; re-read with `get_versioned` to
    /// learn it.
    Success {
        /// New data version, when the server reports one.
        new_version: Option<i64>,
    },
    /// No entry exists for the key.
    NotFound,
    /// The entry exists but its version differs from the expected one.
    Modified,
}

impl VersionedOutcome {
    /// Returns whether the operation ran.
    pub fn is_success(&self) -> bool {
        matches!(self, VersionedOutcome::Success { .. })
    }
}

/// Outcome of a conditional write that does not check versions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    /// Whether the server applied the write.
    pub executed: bool,
    /// Previous value, when previous values are requested.
    pub previous: Option<Bytes>,
}

/// Statistics reported by a server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatistics {
    entries: Vec<(String, String)>,
}

impl ServerStatistics {
    /// Wraps name/value pairs in server order.
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Returns the raw value of a statistic.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a statistic parsed as an integer.
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.parse().ok()
    }

    /// Iterates over every statistic.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of statistics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the server sent no statistics.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One batch of a server-side iteration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IterationBatch {
    /// Bit set of the segments this batch completed.
    pub finished_segments: Bytes,
    /// Entries in the batch; empty once the iteration is exhausted.
    pub entries: Vec<IterationEntry>,
}
