//! # Tracing Service Daemon - Main Entry Point
//!
//! Starts the two IPC hosts named in §6 (`ProducerPort`, `ConsumerPort`),
//! both backed by a single `TracingService` orchestrator, and runs them
//! forever on a single-threaded cooperative event loop (§5).
//!
//! ## Architecture Overview
//!
//! 1. **Initialize logging**: structured logging with `tracing`, mirroring
//!    the teacher's split between a detailed file/stderr layer and a clean
//!    colorized stdout status line.
//! 2. **Parse arguments**: daemon configuration via `cli::Args`.
//! 3. **Build the service**: a `TracingService` over the default shared
//!    memory factory and a `TokioTaskRunner`.
//! 4. **Bind both hosts**: `ProducerPort` and `ConsumerPort`, each wired to
//!    call back into the service's disconnect cascade when a connection
//!    drops.
//! 5. **Serve forever**: both accept loops run concurrently on the same
//!    current-thread runtime. Every connection handler, dispatched method
//!    call, and `TaskRunner` task is a plain `tokio::spawn`ed task, so none
//!    of it depends on a `LocalSet` being in scope.
//!
//! ## Concurrency Model
//!
//! Everything here runs on one OS thread (§5): `#[tokio::main(flavor =
//! "current_thread")]`, so the service's internal `Mutex`es are never
//! actually contended even though method dispatch and the duration timer run
//! as separate spawned tasks rather than inline in the read loop.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use tracing_service::cli::{Args, LogDestination};
use tracing_service::logging::ColorizedFormatter;
use tracing_service::service::ports::{ConsumerPortService, ProducerPortService};
use tracing_service::shmem::DefaultSharedMemoryFactory;
use tracing_service::task_runner::TokioTaskRunner;
use tracing_service::ipc::host::{Host, SocketName};
use tracing_service::TracingService;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    info!("starting tracing service daemon");

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let task_runner = Arc::new(TokioTaskRunner::new());
    let service = Arc::new(TracingService::new(
        Arc::new(DefaultSharedMemoryFactory),
        task_runner,
    ));

    let producer_host = Arc::new(Host::new(SocketName(args.producer_sock.clone())));
    producer_host
        .expose_service(Arc::new(ProducerPortService::new(service.clone())))
        .await;

    let consumer_host = Arc::new(Host::new(SocketName(args.consumer_sock.clone())));
    consumer_host
        .expose_service(Arc::new(ConsumerPortService::new(service.clone())))
        .await;

    let producer_disconnect = {
        let service = service.clone();
        let on_disconnect: tracing_service::ipc::host::DisconnectHandler =
            Arc::new(move |connection_id| {
                let service = service.clone();
                tokio::spawn(async move {
                    service.disconnect_producer(connection_id).await;
                });
            });
        on_disconnect
    };

    let consumer_disconnect = {
        let service = service.clone();
        let on_disconnect: tracing_service::ipc::host::DisconnectHandler =
            Arc::new(move |connection_id| {
                let service = service.clone();
                tokio::spawn(async move {
                    service.disconnect_consumer(connection_id).await;
                });
            });
        on_disconnect
    };

    info!(
        producer_sock = %args.producer_sock,
        consumer_sock = %args.consumer_sock,
        "IPC hosts bound"
    );

    let producer_serve = producer_host.serve(producer_disconnect);
    let consumer_serve = consumer_host.serve(consumer_disconnect);

    let result = tokio::try_join!(producer_serve, consumer_serve);
    if let Err(err) = &result {
        error!(%err, "an IPC host exited with an error");
    }
    result.map(|_| ())
}

/// Sets up the teacher's two-layer logging scheme: a detailed layer (file or
/// stderr, ANSI-free) plus an optional clean colorized stdout status line,
/// both filtered by `-v`/`-vv`. Returns the file-append guard (if any),
/// which must be kept alive for the process lifetime.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let (detailed_log_layer, guard) = match args.log_destination() {
        LogDestination::Stderr => (
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed(),
            None,
        ),
        LogDestination::File(path) => {
            let log_dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("tracing-serviced.log"));
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            (layer, Some(file_guard))
        }
    };

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    guard
}
