//! # Tracing Service
//!
//! A system-wide tracing daemon that coordinates trace producers and
//! consumers over a lock-free shared-memory ABI and a small IPC fabric.
//! Producers register data sources and write trace packets into
//! shared-memory chunks; consumers configure tracing sessions, and the
//! service copies committed chunks into per-session trace buffers for
//! draining.

pub mod cli;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod logging;
pub mod service;
pub mod shmem;
pub mod task_runner;

pub use error::{EnableTracingError, ProducerConnectError};
pub use service::{ProducerCommand, ServiceObserver, TracingService};
pub use task_runner::{TaskRunner, TokioTaskRunner};

/// The current version of the tracing service.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
