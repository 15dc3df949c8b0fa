//! Typed operations: a request plus the function that reads its answer.

mod factory;
mod result;

pub use factory::OperationFactory;
pub use result::{IterationBatch, ServerStatistics, VersionedOutcome, WriteOutcome};

use bytes::Bytes;
use hotrod_core::protocol::{Request, Response};
use hotrod_core::Result;

type Decoder<T> = fn(Response) -> Result<T>;

/// A request ready for dispatch, and how to turn its response into `T`.
///
/// Built once per call and never mutated; the dispatcher assigns a fresh
/// message id to every attempt.
pub struct Operation<T> {
    name: &'static str,
    request: Request,
    decoder: Decoder<T>,
}

impl<T> Operation<T> {
    pub(crate) fn new(name: &'static str, request: Request, decoder: Decoder<T>) -> Self {
        Self {
            name,
            request,
            decoder,
        }
    }

    /// Returns the operation name used in logs and telemetry.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns the target cache.
    pub fn cache_name(&self) -> &str {
        &self.request.cache_name
    }

    /// Returns the key the operation is routed by, if any.
    pub fn routing_key(&self) -> Option<&Bytes> {
        self.request.body.key()
    }

    /// Reads the typed result from a response whose status is not an error.
    pub fn decode(&self, response: Response) -> Result<T> {
        (self.decoder)(response)
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
