//! # Consumer Endpoint and Trace Configuration
//!
//! The wire-level configuration a consumer sends with `EnableTracing`
//! (§3's `TraceConfig`) and the service-side record of a connected consumer.
//! The actual `EnableTracing`/`DisableTracing`/`ReadBuffers`/`FreeBuffers`
//! orchestration lives in `service::TracingService`, since it has to reach
//! across the producer registry and the buffer id allocator — this module
//! only holds the per-consumer record and the config types those calls take.
//!
//! Grounded on `original_source/src/tracing/core/service_impl.h`'s
//! `ConsumerEndpointImpl`.

use crate::ids::ConnectionId;
use crate::service::session::TracingSession;

/// One buffer spec in a `TraceConfig` (§3).
#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub size_bytes: usize,
    pub page_size: usize,
}

/// One data source entry in a `TraceConfig` (§3).
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub name: String,
    pub target_buffer_index: usize,
    pub opaque: Vec<u8>,
}

/// The configuration a consumer sends with `EnableTracing` (§3, §6).
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub data_sources: Vec<DataSourceConfig>,
    pub buffers: Vec<BufferSpec>,
    pub duration_ms: u64,
}

/// The service's record of one connected consumer: its connection and, once
/// `EnableTracing` succeeds, the session it owns.
pub struct ConsumerEndpoint {
    pub connection_id: ConnectionId,
    pub session: Option<TracingSession>,
}

impl ConsumerEndpoint {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            session: None,
        }
    }

    /// Whether this consumer already owns an enabled session (§4.C.2,
    /// §8.6: a second `EnableTracing` must be rejected with `AlreadyEnabled`).
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_consumer_has_no_session() {
        let consumer = ConsumerEndpoint::new(1);
        assert!(!consumer.has_session());
    }
}
