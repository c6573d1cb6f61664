//! # Tracing Service
//!
//! The orchestrator: accepts producer/consumer connections through the IPC
//! fabric, provisions shared memory per producer, matches consumer trace
//! configs against registered data sources, owns per-session trace buffers,
//! copies committed producer chunks into session buffers, and serves
//! `ReadBuffers` (§2.C, §4.C).
//!
//! Grounded on `original_source/src/tracing/core/service_impl.h`'s
//! `ServiceImpl`, which owns exactly these same collections
//! (`producers_`, `data_sources_`, `consumers_`/sessions, `buffer_ids_`) on
//! a single thread; here each collection is a `tokio::sync::Mutex` rather
//! than bare fields only because the methods that touch it are `async fn`s
//! dispatched from `Service::dispatch` — the service is still run
//! exclusively from one loop thread (§5), so contention never happens.

pub mod consumer_endpoint;
pub mod ports;
pub mod producer_endpoint;
pub mod session;

use crate::ids::{
    BufferIdAllocator, ConnectionId, ConsumerId, DataSourceId, DataSourceInstanceId, IdSequence,
    ProducerId,
};
use crate::error::EnableTracingError;
use crate::shmem::{clamp_shmem_size, PageLayout, SharedMemoryAbi, SharedMemoryFactory};
use anyhow::Result;
use consumer_endpoint::{ConsumerEndpoint, TraceConfig};
use producer_endpoint::{DataSourceDescriptor, ProducerEndpoint};
use session::{SessionState, TraceBuffer, TracingSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A push notification the service sends a producer over its long-lived
/// `GetAsyncCommand` stream (§6, §10.F).
#[derive(Debug, Clone)]
pub enum ProducerCommand {
    StartDataSource {
        instance_id: DataSourceInstanceId,
        target_buffer_index: usize,
        config_name: String,
    },
    StopDataSource {
        instance_id: DataSourceInstanceId,
    },
}

/// Optional test hook invoked when a data source instance actually
/// starts/stops, so integration tests can synchronize on real events
/// instead of sleeping on wall-clock guesses (§10.F, grounded on
/// `original_source/service_impl.h`'s `ObserverForTesting`).
pub trait ServiceObserver: Send + Sync {
    fn on_data_source_instance_started(&self, _instance_id: DataSourceInstanceId) {}
    fn on_data_source_instance_stopped(&self, _instance_id: DataSourceInstanceId) {}
}

struct ProducerCommandChannel {
    sender: mpsc::Sender<ProducerCommand>,
}

pub struct TracingService {
    producers: Mutex<HashMap<ProducerId, ProducerEndpoint>>,
    producer_by_connection: Mutex<HashMap<ConnectionId, ProducerId>>,
    producer_ids: IdSequence,
    data_sources_by_name: Mutex<HashMap<String, Vec<(ProducerId, DataSourceId)>>>,
    producer_commands: Mutex<HashMap<ProducerId, ProducerCommandChannel>>,
    producer_command_receivers: Mutex<HashMap<ProducerId, mpsc::Receiver<ProducerCommand>>>,

    consumers: Mutex<HashMap<ConnectionId, ConsumerEndpoint>>,
    consumer_ids: IdSequence,
    buffer_ids: Mutex<BufferIdAllocator>,
    instance_ids: IdSequence,

    shmem_factory: Arc<dyn SharedMemoryFactory>,
    task_runner: Arc<dyn crate::task_runner::TaskRunner>,
    observer: Option<Arc<dyn ServiceObserver>>,
}

impl TracingService {
    pub fn new(
        shmem_factory: Arc<dyn SharedMemoryFactory>,
        task_runner: Arc<dyn crate::task_runner::TaskRunner>,
    ) -> Self {
        Self {
            producers: Mutex::new(HashMap::new()),
            producer_by_connection: Mutex::new(HashMap::new()),
            producer_ids: IdSequence::new(),
            data_sources_by_name: Mutex::new(HashMap::new()),
            producer_commands: Mutex::new(HashMap::new()),
            producer_command_receivers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            consumer_ids: IdSequence::new(),
            buffer_ids: Mutex::new(BufferIdAllocator::new()),
            instance_ids: IdSequence::new(),
            shmem_factory,
            task_runner,
            observer: None,
        }
    }

    /// Looks up the producer id bound to a connection, if any (used by the
    /// `ProducerPort` IPC handler, which only sees a bare `ConnectionId` per
    /// call).
    pub async fn producer_id_for_connection(&self, connection_id: ConnectionId) -> Option<ProducerId> {
        self.producer_by_connection.lock().await.get(&connection_id).copied()
    }

    /// Takes ownership of a producer's `GetAsyncCommand` receiver. Returns
    /// `None` if already taken or the producer is unknown — a producer must
    /// call `GetAsyncCommand` at most once per connection (§6, §10.F).
    pub async fn take_command_receiver(
        &self,
        producer_id: ProducerId,
    ) -> Option<mpsc::Receiver<ProducerCommand>> {
        self.producer_command_receivers.lock().await.remove(&producer_id)
    }

    pub fn with_observer(mut self, observer: Arc<dyn ServiceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    // ---- Producer endpoint lifecycle (§4.C) ----

    /// A producer has connected: provision its shared-memory region (§4.C.1)
    /// and register its `GetAsyncCommand` push channel. Returns the
    /// producer's id and the shared-memory region's OS name, which the
    /// caller (the `ProducerPort` IPC handler) returns to the producer so
    /// it can attach with `SharedMemoryRegion::open`.
    pub async fn connect_producer(
        &self,
        connection_id: ConnectionId,
        shmem_size_hint: Option<usize>,
    ) -> Result<(ProducerId, String)> {
        let producer_id = ProducerId(self.producer_ids.next());
        let size = clamp_shmem_size(shmem_size_hint);
        let shmem_name = format!("/tracing-service-producer-{}", producer_id.0);

        let region = self.shmem_factory.create_shared_memory(&shmem_name, size)?;
        let abi = SharedMemoryAbi::new(region.as_ptr(), region.len(), 4096)?;
        for page in 0..abi.num_pages() {
            abi.init_page(page, PageLayout::best_fit(4096, 256));
        }

        let endpoint = ProducerEndpoint::new(producer_id, connection_id, region, abi);
        self.producers.lock().await.insert(producer_id, endpoint);
        self.producer_by_connection
            .lock()
            .await
            .insert(connection_id, producer_id);

        let (tx, rx) = mpsc::channel(32);
        self.producer_commands
            .lock()
            .await
            .insert(producer_id, ProducerCommandChannel { sender: tx });
        self.producer_command_receivers.lock().await.insert(producer_id, rx);

        debug!(producer_id = producer_id.0, shmem_size = size, "producer connected");
        Ok((producer_id, shmem_name))
    }

    /// `RegisterDataSource` (§4.C.1): indexes the descriptor by name and, for
    /// every active session whose config names it, immediately starts it.
    pub async fn register_data_source(
        &self,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId> {
        let name = descriptor.name.clone();
        let data_source_id = {
            let mut producers = self.producers.lock().await;
            let endpoint = producers
                .get_mut(&producer_id)
                .ok_or_else(|| anyhow::anyhow!("unknown producer {producer_id}"))?;
            endpoint.register_data_source(descriptor)
        };
        self.data_sources_by_name
            .lock()
            .await
            .entry(name.clone())
            .or_default()
            .push((producer_id, data_source_id));

        self.start_matching_active_sessions(producer_id, &name).await;
        Ok(data_source_id)
    }

    /// `UnregisterDataSource` (§4.C.1). Unknown ids are a harmless no-op
    /// (§7, programmer errors).
    pub async fn unregister_data_source(&self, producer_id: ProducerId, id: DataSourceId) -> Result<()> {
        let mut producers = self.producers.lock().await;
        if let Some(endpoint) = producers.get_mut(&producer_id) {
            if let Some(descriptor) = endpoint.unregister_data_source(id) {
                let mut by_name = self.data_sources_by_name.lock().await;
                if let Some(entries) = by_name.get_mut(&descriptor.name) {
                    entries.retain(|(pid, did)| !(*pid == producer_id && *did == id));
                }
            }
        }
        Ok(())
    }

    /// `NotifySharedMemoryUpdate` (§4.C page-ready path): drains every
    /// `COMPLETE` chunk on each named page into the session buffer its
    /// chunk header names, then returns the chunk to `FREE`. Whole-page
    /// granularity isn't implied by the ABI call itself (the ABI already
    /// drains per chunk); §9's open question about whole-page copying is
    /// satisfied here by copying every drained chunk's bytes verbatim
    /// without attempting finer reassembly.
    pub async fn notify_shared_memory_update(&self, producer_id: ProducerId, changed_pages: Vec<u32>) {
        let producers = self.producers.lock().await;
        let Some(endpoint) = producers.get(&producer_id) else {
            return;
        };

        for page in changed_pages {
            let page = page as usize;
            if page >= endpoint.abi.num_pages() {
                warn!(producer_id = producer_id.0, page, "page out of bounds, dropping notification");
                continue;
            }
            let drained = match endpoint.abi.drain_complete_chunks(page) {
                Ok(drained) => drained,
                Err(err) => {
                    warn!(producer_id = producer_id.0, page, %err, "failed to drain page");
                    continue;
                }
            };
            for chunk in drained {
                let bytes = endpoint
                    .abi
                    .bytes(chunk.payload_offset, chunk.payload_len)
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                self.route_into_session_buffer(chunk.target_buffer, &bytes).await;
                endpoint.abi.release_to_free(page, chunk.chunk);
            }
        }
    }

    async fn route_into_session_buffer(&self, target_buffer: u32, bytes: &[u8]) {
        let mut consumers = self.consumers.lock().await;
        for consumer in consumers.values_mut() {
            if let Some(session) = consumer.session.as_mut() {
                // `target_buffer` is the 0-based position in the `TraceConfig`
                // that enabled this session, not a `BufferId` — translate
                // through the session's own allocation order (§4.C.2).
                if let Some(id) = session.buffer_id_for_index(target_buffer) {
                    if let Some(buffer) = session.buffers.get_mut(&id) {
                        buffer.write_page(bytes);
                    }
                }
            }
        }
    }

    /// Producer disconnected: cascades removal of its data sources and of
    /// every session instance bound to it, at most once per instance
    /// (§4.C.1, §8.6).
    pub async fn disconnect_producer(&self, connection_id: ConnectionId) {
        let producer_id = match self.producer_by_connection.lock().await.remove(&connection_id) {
            Some(id) => id,
            None => return,
        };
        self.producers.lock().await.remove(&producer_id);
        self.producer_commands.lock().await.remove(&producer_id);
        self.producer_command_receivers.lock().await.remove(&producer_id);

        let mut by_name = self.data_sources_by_name.lock().await;
        by_name.retain(|_, entries| {
            entries.retain(|(pid, _)| *pid != producer_id);
            !entries.is_empty()
        });
        drop(by_name);

        let mut consumers = self.consumers.lock().await;
        for consumer in consumers.values_mut() {
            if let Some(session) = consumer.session.as_mut() {
                for instance_id in session.remove_producer_instances(producer_id) {
                    if let Some(observer) = &self.observer {
                        observer.on_data_source_instance_stopped(instance_id);
                    }
                }
            }
        }
        debug!(producer_id = producer_id.0, "producer disconnected, cascaded cleanup");
    }

    // ---- Consumer endpoint lifecycle (§4.C) ----

    /// Registers `connection_id` as a consumer if it isn't already one.
    /// Idempotent: a `ConsumerPort` method handler can call this on every
    /// request without wiping an in-progress session.
    pub async fn connect_consumer(&self, connection_id: ConnectionId) {
        self.consumers
            .lock()
            .await
            .entry(connection_id)
            .or_insert_with(|| ConsumerEndpoint::new(connection_id));
    }

    /// `EnableTracing` (§4.C.2). Rejects a second session on the same
    /// consumer with `AlreadyEnabled` (§8.6). A nonzero `duration_ms`
    /// schedules an automatic `DisableTracing` via the task runner (§4.C.2,
    /// §10.D); `0` means "run until explicitly disabled."
    pub async fn enable_tracing(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        config: TraceConfig,
    ) -> Result<(), EnableTracingError> {
        {
            let consumers = self.consumers.lock().await;
            if consumers.get(&connection_id).map(|c| c.has_session()).unwrap_or(false) {
                return Err(EnableTracingError::AlreadyEnabled);
            }
        }

        let mut session = TracingSession::new();
        for spec in &config.buffers {
            let id = self.buffer_ids.lock().await.allocate();
            let buffer = TraceBuffer::new(spec.size_bytes, spec.page_size)
                .map_err(|err| EnableTracingError::InvalidBufferSpec(err.to_string()))?;
            session.buffers.insert(id, buffer);
            session.buffer_order.push(id);
        }

        for ds_config in &config.data_sources {
            self.start_data_source_config(&mut session, ds_config).await;
        }
        session.activate();

        self.consumers
            .lock()
            .await
            .get_mut(&connection_id)
            .ok_or_else(|| EnableTracingError::ResourceExhausted("consumer vanished".to_string()))?
            .session = Some(session);

        if config.duration_ms > 0 {
            let service = Arc::clone(self);
            self.task_runner.post_delayed_task(
                Box::pin(async move {
                    service.disable_tracing(connection_id).await;
                }),
                std::time::Duration::from_millis(config.duration_ms),
            );
        }

        Ok(())
    }

    async fn start_data_source_config(
        &self,
        session: &mut TracingSession,
        ds_config: &consumer_endpoint::DataSourceConfig,
    ) {
        let producers = self
            .data_sources_by_name
            .lock()
            .await
            .get(&ds_config.name)
            .cloned()
            .unwrap_or_default();

        for (producer_id, _data_source_id) in producers {
            let instance_id = DataSourceInstanceId(self.instance_ids.next());
            session.instances.push((producer_id, instance_id));
            self.push_command(
                producer_id,
                ProducerCommand::StartDataSource {
                    instance_id,
                    target_buffer_index: ds_config.target_buffer_index,
                    config_name: ds_config.name.clone(),
                },
            )
            .await;
            if let Some(observer) = &self.observer {
                observer.on_data_source_instance_started(instance_id);
            }
        }
    }

    /// Late producer registration (§8 scenario 2): a data source advertised
    /// after `EnableTracing` must still be started in every currently
    /// active session whose config names it.
    async fn start_matching_active_sessions(&self, producer_id: ProducerId, name: &str) {
        let mut consumers = self.consumers.lock().await;
        for consumer in consumers.values_mut() {
            let Some(session) = consumer.session.as_mut() else {
                continue;
            };
            if session.state != SessionState::Active {
                continue;
            }
            let instance_id = DataSourceInstanceId(self.instance_ids.next());
            session.instances.push((producer_id, instance_id));
            self.push_command(
                producer_id,
                ProducerCommand::StartDataSource {
                    instance_id,
                    target_buffer_index: 0,
                    config_name: name.to_string(),
                },
            )
            .await;
            if let Some(observer) = &self.observer {
                observer.on_data_source_instance_started(instance_id);
            }
        }
    }

    async fn push_command(&self, producer_id: ProducerId, command: ProducerCommand) {
        let commands = self.producer_commands.lock().await;
        if let Some(channel) = commands.get(&producer_id) {
            let _ = channel.sender.send(command).await;
        }
    }

    /// `DisableTracing` (§4.C.3): stops every instance; committed data is
    /// retained.
    pub async fn disable_tracing(&self, connection_id: ConnectionId) {
        let mut consumers = self.consumers.lock().await;
        let Some(consumer) = consumers.get_mut(&connection_id) else {
            return;
        };
        let Some(session) = consumer.session.as_mut() else {
            return;
        };
        if session.state == SessionState::Disabled {
            return;
        }
        for (producer_id, instance_id) in session.instances.clone() {
            self.push_command(producer_id, ProducerCommand::StopDataSource { instance_id })
                .await;
            if let Some(observer) = &self.observer {
                observer.on_data_source_instance_stopped(instance_id);
            }
        }
        session.disable();
    }

    /// `ReadBuffers` (§4.C.4): drains every buffer in session order without
    /// clearing it (§8.5).
    pub async fn read_buffers(&self, connection_id: ConnectionId) -> Vec<Vec<u8>> {
        let consumers = self.consumers.lock().await;
        let Some(consumer) = consumers.get(&connection_id) else {
            return Vec::new();
        };
        let Some(session) = consumer.session.as_ref() else {
            return Vec::new();
        };
        let mut pages = Vec::new();
        let mut buffer_ids: Vec<_> = session.buffers.keys().copied().collect();
        buffer_ids.sort();
        for id in buffer_ids {
            for page in session.buffers[&id].drain_order() {
                pages.push(page.to_vec());
            }
        }
        pages
    }

    /// `FreeBuffers` (§4.C.5): destroys the session's buffers and returns
    /// their ids to the pool.
    pub async fn free_buffers(&self, connection_id: ConnectionId) {
        let mut consumers = self.consumers.lock().await;
        let Some(consumer) = consumers.get_mut(&connection_id) else {
            return;
        };
        if let Some(session) = consumer.session.take() {
            let mut allocator = self.buffer_ids.lock().await;
            for id in session.buffers.keys() {
                allocator.free(*id);
            }
        }
    }

    pub async fn disconnect_consumer(&self, connection_id: ConnectionId) {
        self.disable_tracing(connection_id).await;
        self.free_buffers(connection_id).await;
        self.consumers.lock().await.remove(&connection_id);
        debug!(connection_id, "consumer disconnected");
    }

    pub fn next_consumer_id(&self) -> ConsumerId {
        ConsumerId(self.consumer_ids.next())
    }
}
