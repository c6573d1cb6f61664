//! # Producer Endpoint
//!
//! The service-side record of one connected producer (§3's "Producer
//! registration record"): its shared-memory region, the ABI view over it,
//! and the data sources it has advertised.
//!
//! Grounded on `original_source/src/tracing/core/service_impl.h`'s
//! `ProducerEndpointImpl` and its `RegisteredDataSource` member, narrowed to
//! the fields the core actually needs (the original also threads a raw
//! `Service*` back-pointer for IPC replies, which here is the caller's
//! `ConnectionId` instead — see `TracingService::register_producer`).

use crate::ids::{ConnectionId, DataSourceId, IdSequence, ProducerId};
use crate::shmem::{SharedMemoryAbi, SharedMemoryRegion};
use std::collections::HashMap;

/// `{name, ...opaque fields}` advertised by a producer (§3). The opaque
/// fields are left as a raw byte blob: the core never interprets data
/// source configuration beyond its name, which is all that's needed to
/// match it against a consumer's `TraceConfig`.
#[derive(Debug, Clone)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub opaque: Vec<u8>,
}

/// The service's view of one connected producer. Created on connect,
/// destroyed on disconnect; owns exactly one shared-memory region for its
/// lifetime (§3).
pub struct ProducerEndpoint {
    pub producer_id: ProducerId,
    pub connection_id: ConnectionId,
    pub shmem: SharedMemoryRegion,
    pub abi: SharedMemoryAbi,
    data_sources: HashMap<DataSourceId, DataSourceDescriptor>,
    next_data_source_id: IdSequence,
}

impl ProducerEndpoint {
    pub fn new(
        producer_id: ProducerId,
        connection_id: ConnectionId,
        shmem: SharedMemoryRegion,
        abi: SharedMemoryAbi,
    ) -> Self {
        Self {
            producer_id,
            connection_id,
            shmem,
            abi,
            data_sources: HashMap::new(),
            next_data_source_id: IdSequence::new(),
        }
    }

    /// Registers a newly-advertised data source, returning its assigned id
    /// (§4.C.1).
    pub fn register_data_source(&mut self, descriptor: DataSourceDescriptor) -> DataSourceId {
        let id = DataSourceId(self.next_data_source_id.next());
        self.data_sources.insert(id, descriptor);
        id
    }

    /// Removes a data source by id. A request for an id never registered
    /// (or already removed) is a no-op — programmer error, not fatal (§7).
    pub fn unregister_data_source(&mut self, id: DataSourceId) -> Option<DataSourceDescriptor> {
        self.data_sources.remove(&id)
    }

    pub fn data_source(&self, id: DataSourceId) -> Option<&DataSourceDescriptor> {
        self.data_sources.get(&id)
    }

    pub fn data_sources(&self) -> impl Iterator<Item = (&DataSourceId, &DataSourceDescriptor)> {
        self.data_sources.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::abi::PageLayout;

    fn fixture() -> ProducerEndpoint {
        let shmem = SharedMemoryRegion::create(
            &format!("/tracing-service-producer-endpoint-test-{}", std::process::id()),
            4096,
        )
        .unwrap();
        let abi = SharedMemoryAbi::new(shmem.as_ptr(), shmem.len(), 4096).unwrap();
        abi.init_page(0, PageLayout::OneChunk);
        ProducerEndpoint::new(ProducerId(1), 1, shmem, abi)
    }

    #[test]
    fn register_then_unregister_round_trips() {
        let mut endpoint = fixture();
        let id = endpoint.register_data_source(DataSourceDescriptor {
            name: "test".to_string(),
            opaque: Vec::new(),
        });
        assert_eq!(endpoint.data_source(id).unwrap().name, "test");

        let removed = endpoint.unregister_data_source(id);
        assert!(removed.is_some());
        assert!(endpoint.data_source(id).is_none());
    }

    #[test]
    fn unregistering_unknown_id_is_a_harmless_no_op() {
        let mut endpoint = fixture();
        assert!(endpoint.unregister_data_source(DataSourceId(999)).is_none());
    }
}
