//! # Producer and Consumer Ports
//!
//! Wires the two well-known services named in §6 (`ProducerPort`,
//! `ConsumerPort`) onto `TracingService`: each is an `ipc::Service` whose
//! `dispatch` decodes a bincode-encoded argument struct, calls into the
//! orchestrator, and encodes the reply. This is the seam between the wire
//! protocol (`ipc::frame`) and the core's in-process API (`TracingService`),
//! matching how the teacher keeps its transport (`ipc::Message`) decoupled
//! from the benchmark logic that interprets it.

use crate::ids::{ConnectionId, DataSourceId, MethodId};
use crate::ipc::frame::MethodDescriptor;
use crate::ipc::service::{MethodReply, ReplySink, Service};
use crate::service::consumer_endpoint::{BufferSpec, DataSourceConfig, TraceConfig};
use crate::service::producer_endpoint::DataSourceDescriptor;
use crate::service::{ProducerCommand, TracingService};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const INITIALIZE_CONNECTION: MethodId = MethodId(1);
const REGISTER_DATA_SOURCE: MethodId = MethodId(2);
const UNREGISTER_DATA_SOURCE: MethodId = MethodId(3);
const NOTIFY_SHARED_MEMORY_UPDATE: MethodId = MethodId(4);
const GET_ASYNC_COMMAND: MethodId = MethodId(5);

const ENABLE_TRACING: MethodId = MethodId(1);
const DISABLE_TRACING: MethodId = MethodId(2);
const READ_BUFFERS: MethodId = MethodId(3);
const FREE_BUFFERS: MethodId = MethodId(4);

#[derive(Debug, Serialize, Deserialize)]
struct InitializeConnectionArgs {
    shmem_size_hint: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitializeConnectionReply {
    producer_id: u64,
    shmem_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterDataSourceArgs {
    name: String,
    opaque: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterDataSourceReply {
    data_source_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnregisterDataSourceArgs {
    data_source_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotifySharedMemoryUpdateArgs {
    changed_pages: Vec<u32>,
}

/// Wire encoding of [`ProducerCommand`], pushed over `GetAsyncCommand`'s
/// streamed replies (§10.F).
#[derive(Debug, Serialize, Deserialize)]
enum ProducerCommandWire {
    StartDataSource {
        instance_id: u64,
        target_buffer_index: usize,
        config_name: String,
    },
    StopDataSource {
        instance_id: u64,
    },
}

impl From<ProducerCommand> for ProducerCommandWire {
    fn from(command: ProducerCommand) -> Self {
        match command {
            ProducerCommand::StartDataSource {
                instance_id,
                target_buffer_index,
                config_name,
            } => ProducerCommandWire::StartDataSource {
                instance_id: instance_id.0,
                target_buffer_index,
                config_name,
            },
            ProducerCommand::StopDataSource { instance_id } => {
                ProducerCommandWire::StopDataSource {
                    instance_id: instance_id.0,
                }
            }
        }
    }
}

/// The producer-facing service (§6's `ProducerPort`): connection setup,
/// data source (un)registration, shared-memory page-ready notifications,
/// and the long-lived `GetAsyncCommand` push stream.
pub struct ProducerPortService {
    tracing: Arc<TracingService>,
}

impl ProducerPortService {
    pub fn new(tracing: Arc<TracingService>) -> Self {
        Self { tracing }
    }

    async fn producer_id_or_fail(&self, connection_id: ConnectionId, reply: &ReplySink) -> Option<crate::ids::ProducerId> {
        match self.tracing.producer_id_for_connection(connection_id).await {
            Some(id) => Some(id),
            None => {
                warn!(connection_id, "method called before InitializeConnection");
                let _ = reply.send(MethodReply::failure()).await;
                None
            }
        }
    }
}

#[async_trait]
impl Service for ProducerPortService {
    fn name(&self) -> &str {
        "ProducerPort"
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor { name: "InitializeConnection".to_string(), id: INITIALIZE_CONNECTION },
            MethodDescriptor { name: "RegisterDataSource".to_string(), id: REGISTER_DATA_SOURCE },
            MethodDescriptor { name: "UnregisterDataSource".to_string(), id: UNREGISTER_DATA_SOURCE },
            MethodDescriptor {
                name: "NotifySharedMemoryUpdate".to_string(),
                id: NOTIFY_SHARED_MEMORY_UPDATE,
            },
            MethodDescriptor { name: "GetAsyncCommand".to_string(), id: GET_ASYNC_COMMAND },
        ]
    }

    async fn dispatch(&self, method_id: MethodId, args: Vec<u8>, reply: ReplySink) -> Result<()> {
        match method_id {
            INITIALIZE_CONNECTION => {
                let args: InitializeConnectionArgs = bincode::deserialize(&args)?;
                match self
                    .tracing
                    .connect_producer(reply.connection_id(), args.shmem_size_hint)
                    .await
                {
                    Ok((producer_id, shmem_name)) => {
                        let payload = bincode::serialize(&InitializeConnectionReply {
                            producer_id: producer_id.0,
                            shmem_name,
                        })?;
                        reply.send(MethodReply::once(payload)).await
                    }
                    Err(err) => {
                        warn!(%err, "failed to initialize producer connection");
                        reply.send(MethodReply::failure()).await
                    }
                }
            }
            REGISTER_DATA_SOURCE => {
                let Some(producer_id) = self.producer_id_or_fail(reply.connection_id(), &reply).await else {
                    return Ok(());
                };
                let args: RegisterDataSourceArgs = bincode::deserialize(&args)?;
                let id = self
                    .tracing
                    .register_data_source(
                        producer_id,
                        DataSourceDescriptor { name: args.name, opaque: args.opaque },
                    )
                    .await?;
                let payload = bincode::serialize(&RegisterDataSourceReply { data_source_id: id.0 })?;
                reply.send(MethodReply::once(payload)).await
            }
            UNREGISTER_DATA_SOURCE => {
                let Some(producer_id) = self.producer_id_or_fail(reply.connection_id(), &reply).await else {
                    return Ok(());
                };
                let args: UnregisterDataSourceArgs = bincode::deserialize(&args)?;
                self.tracing
                    .unregister_data_source(producer_id, DataSourceId(args.data_source_id))
                    .await?;
                reply.send(MethodReply::once(Vec::new())).await
            }
            NOTIFY_SHARED_MEMORY_UPDATE => {
                let Some(producer_id) = self.producer_id_or_fail(reply.connection_id(), &reply).await else {
                    return Ok(());
                };
                let args: NotifySharedMemoryUpdateArgs = bincode::deserialize(&args)?;
                self.tracing
                    .notify_shared_memory_update(producer_id, args.changed_pages)
                    .await;
                reply.send(MethodReply::once(Vec::new())).await
            }
            GET_ASYNC_COMMAND => {
                let Some(producer_id) = self.producer_id_or_fail(reply.connection_id(), &reply).await else {
                    return Ok(());
                };
                let Some(mut commands) = self.tracing.take_command_receiver(producer_id).await else {
                    return reply.send(MethodReply::failure()).await;
                };
                while let Some(command) = commands.recv().await {
                    let payload = bincode::serialize(&ProducerCommandWire::from(command))?;
                    if reply.send(MethodReply::stream_item(payload)).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            other => {
                warn!(method_id = other.0, "ProducerPort received an unknown method id");
                reply.send(MethodReply::failure()).await
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferSpecWire {
    size_bytes: usize,
    page_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataSourceConfigWire {
    name: String,
    target_buffer_index: usize,
    opaque: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TraceConfigWire {
    data_sources: Vec<DataSourceConfigWire>,
    buffers: Vec<BufferSpecWire>,
    duration_ms: u64,
}

impl From<TraceConfigWire> for TraceConfig {
    fn from(wire: TraceConfigWire) -> Self {
        TraceConfig {
            data_sources: wire
                .data_sources
                .into_iter()
                .map(|d| DataSourceConfig {
                    name: d.name,
                    target_buffer_index: d.target_buffer_index,
                    opaque: d.opaque,
                })
                .collect(),
            buffers: wire
                .buffers
                .into_iter()
                .map(|b| BufferSpec { size_bytes: b.size_bytes, page_size: b.page_size })
                .collect(),
            duration_ms: wire.duration_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EnableTracingReply {
    success: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadBuffersReply {
    pages: Vec<Vec<u8>>,
}

/// The consumer-facing service (§6's `ConsumerPort`): `EnableTracing`,
/// `DisableTracing`, `ReadBuffers`, `FreeBuffers`.
pub struct ConsumerPortService {
    tracing: Arc<TracingService>,
}

impl ConsumerPortService {
    pub fn new(tracing: Arc<TracingService>) -> Self {
        Self { tracing }
    }
}

#[async_trait]
impl Service for ConsumerPortService {
    fn name(&self) -> &str {
        "ConsumerPort"
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor { name: "EnableTracing".to_string(), id: ENABLE_TRACING },
            MethodDescriptor { name: "DisableTracing".to_string(), id: DISABLE_TRACING },
            MethodDescriptor { name: "ReadBuffers".to_string(), id: READ_BUFFERS },
            MethodDescriptor { name: "FreeBuffers".to_string(), id: FREE_BUFFERS },
        ]
    }

    async fn dispatch(&self, method_id: MethodId, args: Vec<u8>, reply: ReplySink) -> Result<()> {
        // Every method implicitly registers the caller as a consumer on
        // first use; ConsumerPort has no separate "connect" call (§6).
        self.tracing.connect_consumer(reply.connection_id()).await;

        match method_id {
            ENABLE_TRACING => {
                let wire: TraceConfigWire = bincode::deserialize(&args)?;
                let result = self
                    .tracing
                    .enable_tracing(reply.connection_id(), wire.into())
                    .await;
                let payload = match result {
                    Ok(()) => EnableTracingReply { success: true, error: None },
                    Err(err) => EnableTracingReply { success: false, error: Some(err.to_string()) },
                };
                reply.send(MethodReply::once(bincode::serialize(&payload)?)).await
            }
            DISABLE_TRACING => {
                self.tracing.disable_tracing(reply.connection_id()).await;
                reply.send(MethodReply::once(Vec::new())).await
            }
            READ_BUFFERS => {
                let pages = self.tracing.read_buffers(reply.connection_id()).await;
                let payload = bincode::serialize(&ReadBuffersReply { pages })?;
                reply.send(MethodReply::once(payload)).await
            }
            FREE_BUFFERS => {
                self.tracing.free_buffers(reply.connection_id()).await;
                reply.send(MethodReply::once(Vec::new())).await
            }
            other => {
                warn!(method_id = other.0, "ConsumerPort received an unknown method id");
                reply.send(MethodReply::failure()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::DefaultSharedMemoryFactory;
    use crate::task_runner::TokioTaskRunner;

    fn tracing_service() -> Arc<TracingService> {
        Arc::new(TracingService::new(
            Arc::new(DefaultSharedMemoryFactory),
            Arc::new(TokioTaskRunner::new()),
        ))
    }

    #[test]
    fn producer_command_wire_preserves_instance_id() {
        let wire = ProducerCommandWire::from(ProducerCommand::StopDataSource {
            instance_id: crate::ids::DataSourceInstanceId(42),
        });
        match wire {
            ProducerCommandWire::StopDataSource { instance_id } => assert_eq!(instance_id, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn trace_config_wire_converts_field_for_field() {
        let wire = TraceConfigWire {
            data_sources: vec![DataSourceConfigWire {
                name: "test".to_string(),
                target_buffer_index: 0,
                opaque: vec![1, 2],
            }],
            buffers: vec![BufferSpecWire { size_bytes: 4096, page_size: 4096 }],
            duration_ms: 10,
        };
        let config: TraceConfig = wire.into();
        assert_eq!(config.data_sources[0].name, "test");
        assert_eq!(config.buffers[0].size_bytes, 4096);
    }

    #[tokio::test]
    async fn producer_port_exposes_its_method_table() {
        let svc = ProducerPortService::new(tracing_service());
        assert_eq!(svc.methods().len(), 5);
        assert_eq!(svc.name(), "ProducerPort");
    }

    #[tokio::test]
    async fn consumer_port_exposes_its_method_table() {
        let svc = ConsumerPortService::new(tracing_service());
        assert_eq!(svc.methods().len(), 4);
        assert_eq!(svc.name(), "ConsumerPort");
    }
}
