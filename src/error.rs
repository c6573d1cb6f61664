//! # Error Types
//!
//! Most fallible operations in this crate return `anyhow::Result`, matching the
//! teacher's blanket error-handling style: transport errors, decode failures, and
//! shared-memory mapping failures are all "this failed, here's why" conditions
//! that the caller logs and moves past (see §7's *Transport errors* category).
//!
//! A handful of operations sit on the protocol boundary and the *kind* of failure
//! is part of the contract a caller must branch on, not just a message to log.
//! Those use small `thiserror`-derived enums instead.

use thiserror::Error;

/// Failure outcomes for `ConsumerPort::EnableTracing`.
///
/// Per §4.C.2 and §8 scenario 6, a consumer that already owns a session must be
/// rejected with a specific, recognizable outcome rather than a generic error
/// string, since callers (and tests) need to assert on *which* precondition
/// failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnableTracingError {
    /// The consumer endpoint already owns an active or configured session.
    #[error("consumer already has an enabled tracing session")]
    AlreadyEnabled,

    /// No buffer spec in the trace config named a valid `(size_bytes, page_size)`
    /// pair (`size_bytes % page_size != 0`, or `page_size` isn't a power of two
    /// `>= 4 KiB`).
    #[error("invalid trace buffer spec: {0}")]
    InvalidBufferSpec(String),

    /// The process-wide buffer id space, or a shared-memory allocation needed to
    /// service the request, is exhausted.
    #[error("resource exhausted while enabling tracing: {0}")]
    ResourceExhausted(String),
}

/// Failure outcomes when a producer's connect-time negotiation is invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerConnectError {
    /// The producer's requested shared memory size hint could not be satisfied.
    #[error("shared memory size hint {requested} out of bounds [{min}, {max}]")]
    SizeHintOutOfBounds {
        requested: usize,
        min: usize,
        max: usize,
    },
}
