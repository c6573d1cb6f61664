//! # Identifier Types
//!
//! This module defines the process-scoped identifiers used throughout the tracing
//! service. Every identifier is a monotonically increasing, non-zero `u64`; a value
//! of zero always means "none" or "invalid" and is never handed out by an allocator.
//!
//! These are newtypes rather than bare `u64` so that a `ProducerId` can never be
//! passed where a `BufferId` is expected, matching the strong typing the rest of
//! the crate favors (see `ConnectionId` in the IPC layer for the same idea).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[derive(serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// The reserved "none/invalid" value.
            pub const NONE: Self = Self(0);

            /// Whether this id is the reserved invalid value.
            pub fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ProducerId, "Identifies a connected producer for the lifetime of its connection.");
id_type!(ConsumerId, "Identifies a connected consumer for the lifetime of its connection.");
id_type!(DataSourceId, "Identifies one `RegisterDataSource` call made by a producer.");
id_type!(
    DataSourceInstanceId,
    "Identifies one data source bound into a specific tracing session."
);
id_type!(BufferId, "Identifies a `TraceBuffer` owned by a tracing session.");
id_type!(RequestId, "Identifies one in-flight IPC request/reply exchange.");
id_type!(ServiceId, "Identifies a service exposed on an IPC host.");
id_type!(MethodId, "Identifies one method within a service's method table.");
id_type!(TracingSessionId, "Identifies a tracing session, one per enabled consumer.");

/// Identifies one accepted socket connection on an IPC host, for routing
/// replies back to the right writer task. Unlike the ids above this is a
/// bare `u64` rather than a newtype: it never crosses the wire and is purely
/// an in-process routing key, matching the teacher's `ipc::ConnectionId`.
pub type ConnectionId = u64;

/// A simple monotonic counter that produces the next id in sequence, starting at 1.
///
/// Used for identifiers that are never reused within the process lifetime
/// (`ProducerId`, `ConsumerId`, `DataSourceId`, `DataSourceInstanceId`, `RequestId`,
/// `ServiceId`). `BufferId`s are different: they must be recycled after
/// `FreeBuffers`, so they use `BufferIdAllocator` below instead.
pub struct IdSequence(AtomicU64);

impl IdSequence {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Returns the next non-zero id in the sequence.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Recycling allocator for `BufferId`s.
///
/// Mirrors the original service's `IdAllocator`: buffer ids are global across all
/// consumers (a producer can feed more than one session), and must be returned to
/// the free pool on `FreeBuffers` so they can be handed out again rather than
/// growing without bound over the daemon's lifetime.
#[derive(Debug, Default)]
pub struct BufferIdAllocator {
    /// `true` at index `i` means buffer id `i + 1` is currently in use.
    in_use: Vec<bool>,
}

impl BufferIdAllocator {
    pub fn new() -> Self {
        Self { in_use: Vec::new() }
    }

    /// Allocates the lowest-numbered free id.
    pub fn allocate(&mut self) -> BufferId {
        if let Some(slot) = self.in_use.iter().position(|used| !used) {
            self.in_use[slot] = true;
            return BufferId((slot + 1) as u64);
        }
        self.in_use.push(true);
        BufferId(self.in_use.len() as u64)
    }

    /// Returns an id to the free pool. A double-free or an id never allocated
    /// is ignored (programmer error, not fatal — see §7).
    pub fn free(&mut self, id: BufferId) {
        if id.0 == 0 {
            return;
        }
        let idx = (id.0 - 1) as usize;
        if let Some(slot) = self.in_use.get_mut(idx) {
            *slot = false;
        }
    }
}
