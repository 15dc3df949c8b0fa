//! Builds operations bound to one cache.

use bytes::Bytes;
use hotrod_core::protocol::constants::FORCE_RETURN_VALUE;
use hotrod_core::protocol::{
    Expiration, FactoryRef, MetadataValue, Request, RequestBody, Response, ResponseBody,
    VersionedValue,
};
use hotrod_core::{HotRodError, Result};

use super::result::{IterationBatch, ServerStatistics, VersionedOutcome, WriteOutcome};
use super::Operation;

/// Creates the operations of one cache.
#[derive(Debug, Clone)]
pub struct OperationFactory {
    cache_name: String,
    force_return_values: bool,
}

impl OperationFactory {
    /// Creates a factory for `cache_name`.
    ///
    /// With `force_return_values`, writes ask the server for the previous value.
    pub fn new(cache_name: impl Into<String>, force_return_values: bool) -> Self {
        Self {
            cache_name: cache_name.into(),
            force_return_values,
        }
    }

    /// Returns the cache name.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Returns whether writes ask for previous values.
    pub fn force_return_values(&self) -> bool {
        self.force_return_values
    }

    /// Returns a copy that does or does not ask for previous values.
    pub fn with_force_return_values(&self, enabled: bool) -> Self {
        Self {
            cache_name: self.cache_name.clone(),
            force_return_values: enabled,
        }
    }

    fn request(&self, body: RequestBody) -> Request {
        Request::new(self.cache_name.clone(), body)
    }

    fn write_request(&self, body: RequestBody) -> Request {
        let request = self.request(body);
        if self.force_return_values {
            request.with_flags(FORCE_RETURN_VALUE)
        } else {
            request
        }
    }

    /// Reads a value.
    pub fn get(&self, key: Bytes) -> Operation<Option<Bytes>> {
        Operation::new("get", self.request(RequestBody::Get { key }), decode_value)
    }

    /// Reads a value and its data version.
    pub fn get_versioned(&self, key: Bytes) -> Operation<Option<VersionedValue>> {
        Operation::new(
            "get_versioned",
            self.request(RequestBody::GetWithVersion { key }),
            |response| match response.body {
                ResponseBody::Versioned(value) => Ok(value),
                other => Err(unexpected("get_versioned", &other)),
            },
        )
    }

    /// Reads a value with its version and expiration metadata.
    pub fn get_with_metadata(&self, key: Bytes) -> Operation<Option<MetadataValue>> {
        Operation::new(
            "get_with_metadata",
            self.request(RequestBody::GetWithMetadata { key }),
            |response| match response.body {
                ResponseBody::Metadata(value) => Ok(value),
                other => Err(unexpected("get_with_metadata", &other)),
            },
        )
    }

    /// Tests whether a key exists.
    pub fn contains_key(&self, key: Bytes) -> Operation<bool> {
        Operation::new(
            "contains_key",
            self.request(RequestBody::ContainsKey { key }),
            |response| Ok(response.status().is_success()),
        )
    }

    /// Stores a value, returning the previous one when previous values are requested.
    pub fn put(&self, key: Bytes, value: Bytes, expiration: Expiration) -> Operation<Option<Bytes>> {
        Operation::new(
            "put",
            self.write_request(RequestBody::Put {
                key,
                value,
                expiration,
            }),
            decode_value,
        )
    }

    /// Stores a value only if the key is absent.
    pub fn put_if_absent(
        &self,
        key: Bytes,
        value: Bytes,
        expiration: Expiration,
    ) -> Operation<WriteOutcome> {
        Operation::new(
            "put_if_absent",
            self.write_request(RequestBody::PutIfAbsent {
                key,
                value,
                expiration,
            }),
            decode_write_outcome,
        )
    }

    /// Replaces a value only if the key is present.
    pub fn replace(&self, key: Bytes, value: Bytes, expiration: Expiration) -> Operation<WriteOutcome> {
        Operation::new(
            "replace",
            self.write_request(RequestBody::Replace {
                key,
                value,
                expiration,
            }),
            decode_write_outcome,
        )
    }

    /// Replaces a value only if its data version equals `version`.
    pub fn replace_if_unmodified(
        &self,
        key: Bytes,
        value: Bytes,
        version: i64,
        expiration: Expiration,
    ) -> Operation<VersionedOutcome> {
        Operation::new(
            "replace_if_unmodified",
            self.request(RequestBody::ReplaceIfUnmodified {
                key,
                value,
                expiration,
                version,
            }),
            decode_versioned_outcome,
        )
    }

    /// Removes a key.
    pub fn remove(&self, key: Bytes) -> Operation<WriteOutcome> {
        Operation::new(
            "remove",
            self.write_request(RequestBody::Remove { key }),
            decode_write_outcome,
        )
    }

    /// Removes a key only if its data version equals `version`.
    pub fn remove_if_unmodified(&self, key: Bytes, version: i64) -> Operation<VersionedOutcome> {
        Operation::new(
            "remove_if_unmodified",
            self.request(RequestBody::RemoveIfUnmodified { key, version }),
            decode_versioned_outcome,
        )
    }

    /// Removes every entry.
    pub fn clear(&self) -> Operation<()> {
        Operation::new("clear", self.request(RequestBody::Clear), decode_unit)
    }

    /// Counts entries.
    pub fn size(&self) -> Operation<u64> {
        Operation::new("size", self.request(RequestBody::Size), |response| {
            match response.body {
                ResponseBody::Size(size) => Ok(size),
                other => Err(unexpected("size", &other)),
            }
        })
    }

    /// Reads server statistics.
    pub fn stats(&self) -> Operation<ServerStatistics> {
        Operation::new("stats", self.request(RequestBody::Stats), |response| {
            match response.body {
                ResponseBody::Stats(entries) => Ok(ServerStatistics::new(entries)),
                other => Err(unexpected("stats", &other)),
            }
        })
    }

    /// Liveness probe; the answer also carries the cache topology.
    pub fn ping(&self) -> Operation<()> {
        Operation::new("ping", self.request(RequestBody::Ping), decode_unit)
    }

    /// Registers a client listener.
    pub fn add_client_listener(
        &self,
        listener_id: Bytes,
        include_current_state: bool,
        filter: Option<FactoryRef>,
        converter: Option<FactoryRef>,
        use_raw_data: bool,
    ) -> Operation<()> {
        Operation::new(
            "add_client_listener",
            self.request(RequestBody::AddClientListener {
                listener_id,
                include_current_state,
                filter,
                converter,
                use_raw_data,
            }),
            decode_unit,
        )
    }

    /// Registers a near-cache listener gated by a bloom filter of `bloom_bits` bits.
    pub fn add_bloom_near_cache_listener(&self, listener_id: Bytes, bloom_bits: u32) -> Operation<()> {
        Operation::new(
            "add_bloom_near_cache_listener",
            self.request(RequestBody::AddBloomNearCacheListener {
                listener_id,
                bloom_bits,
            }),
            decode_unit,
        )
    }

    /// Replaces the bloom filter of a near-cache listener.
    pub fn update_bloom_filter(&self, listener_id: Bytes, bits: Bytes) -> Operation<()> {
        Operation::new(
            "update_bloom_filter",
            self.request(RequestBody::UpdateBloomFilter { listener_id, bits }),
            decode_unit,
        )
    }

    /// Removes a listener. Resolves to `false` if the server did not know it.
    pub fn remove_client_listener(&self, listener_id: Bytes) -> Operation<bool> {
        Operation::new(
            "remove_client_listener",
            self.request(RequestBody::RemoveClientListener { listener_id }),
            |response| Ok(response.status().is_success()),
        )
    }

    /// Opens an iteration over `segments`, or all segments when `None`.
    pub fn iteration_start(
        &self,
        segments: Option<Bytes>,
        filter: Option<FactoryRef>,
        batch_size: u32,
        metadata: bool,
    ) -> Operation<String> {
        Operation::new(
            "iteration_start",
            self.request(RequestBody::IterationStart {
                segments,
                filter,
                batch_size,
                metadata,
            }),
            |response| match response.body {
                ResponseBody::IterationStarted(id) => Ok(id),
                other => Err(unexpected("iteration_start", &other)),
            },
        )
    }

    /// Fetches the next batch of an iteration.
    pub fn iteration_next(&self, iteration_id: String, metadata: bool) -> Operation<IterationBatch> {
        Operation::new(
            "iteration_next",
            self.request(RequestBody::IterationNext {
                iteration_id,
                metadata,
            }),
            |response| {
                let status = response.status();
                if status.is_invalid_iteration() {
                    return Err(HotRodError::Server {
                        status: status.raw(),
                        message: "iteration is not known to the server".to_string(),
                    });
                }
                match response.body {
                    ResponseBody::IterationBatch {
                        finished_segments,
                        entries,
                    } => Ok(IterationBatch {
                        finished_segments,
                        entries,
                    }),
                    other => Err(unexpected("iteration_next", &other)),
                }
            },
        )
    }

    /// Releases an iteration. Resolves to `false` if the server did not know it.
    pub fn iteration_end(&self, iteration_id: String) -> Operation<bool> {
        Operation::new(
            "iteration_end",
            self.request(RequestBody::IterationEnd { iteration_id }),
            |response| Ok(!response.status().is_invalid_iteration()),
        )
    }
}

fn unexpected(operation: &str, body: &ResponseBody) -> HotRodError {
    HotRodError::Protocol(format!("unexpected response body for {}: {:?}", operation, body))
}

fn decode_unit(_: Response) -> Result<()> {
    Ok(())
}

fn decode_value(response: Response) -> Result<Option<Bytes>> {
    match response.body {
        ResponseBody::Value(value) => Ok(value),
        ResponseBody::Empty => Ok(None),
        other => Err(unexpected("value", &other)),
    }
}

fn decode_write_outcome(response: Response) -> Result<WriteOutcome> {
    let executed = response.status().is_success();
    let previous = decode_value(response)?;
    Ok(WriteOutcome { executed, previous })
}

fn decode_versioned_outcome(response: Response) -> Result<VersionedOutcome> {
    let status = response.status();
    if status.is_success() {
        Ok(VersionedOutcome::Success { new_version: None })
    } else if status.is_key_missing() {
        Ok(VersionedOutcome::NotFound)
    } else if status.is_not_executed() {
        Ok(VersionedOutcome::Modified)
    } else {
        Err(HotRodError::Protocol(format!(
            "unexpected status {} for a versioned operation",
            status
        )))
    }
}
