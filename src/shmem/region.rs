//! # Shared-Memory Region Provisioning
//!
//! Implements the `SharedMemory::Factory` collaborator interface named in §6:
//! something that, given a size, hands back a mappable region that two
//! processes (the producer and the service) can open independently.
//!
//! Grounded on the teacher's `src/ipc/shared_memory.rs`, which creates/opens a
//! named `shared_memory::Shmem` segment depending on whether the caller is the
//! creating side or the attaching side (`ShmemConf::new().create()` vs
//! `.open()`).

use anyhow::{Context, Result};
use shared_memory::{Shmem, ShmemConf};

/// An owned or attached shared-memory region.
///
/// The creating side (the service, per §4.C.1) constructs one with
/// `SharedMemoryRegion::create`; the attaching side (the producer, after
/// receiving the region's name in the `InitializeConnection` reply) attaches
/// with `SharedMemoryRegion::open`. Whichever side created the segment is
/// responsible for its teardown, mirroring the teacher's
/// `owns_socket_file`-style ownership split for its Unix socket.
pub struct SharedMemoryRegion {
    shmem: Shmem,
    owns: bool,
}

// SAFETY: `Shmem` itself is not `Send`/`Sync` because its raw pointer field
// isn't, but the pointer only ever aliases into the shared region, which is
// exactly the resource `SharedMemoryAbi` is built to coordinate access to via
// atomics. Same rationale as the teacher's
// `unsafe impl Send for SharedMemoryConnection`.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Creates a new named region of `size` bytes. `name` must be unique
    /// system-wide (typically derived from the owning `ProducerId`).
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .with_context(|| format!("failed to create shared memory segment {name:?}"))?;
        Ok(Self { shmem, owns: true })
    }

    /// Attaches to an existing region created by the other side.
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .with_context(|| format!("failed to open shared memory segment {name:?}"))?;
        Ok(Self { shmem, owns: false })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        self.shmem.get_os_id()
    }

    /// Whether this handle is the one that created (and thus owns teardown
    /// of) the underlying OS object.
    pub fn owns_segment(&self) -> bool {
        self.owns
    }
}

/// Lower and upper bounds enforced on a producer's requested shared-memory
/// size hint, per §4.C.1.
pub const MIN_SHMEM_SIZE: usize = 4 * 1024;
pub const MAX_SHMEM_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_SHMEM_SIZE: usize = 128 * 1024;

/// Clamps a producer-supplied size hint into `[MIN_SHMEM_SIZE, MAX_SHMEM_SIZE]`.
pub fn clamp_shmem_size(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_SHMEM_SIZE)
        .clamp(MIN_SHMEM_SIZE, MAX_SHMEM_SIZE)
}

/// The `SharedMemory::Factory` collaborator named in §6.a: something that
/// produces a fresh region given a name and a size. Abstracted so the
/// service depends on the interface rather than the `shared_memory` crate
/// directly, matching how the core is specified to depend only on the
/// interfaces in §6.
pub trait SharedMemoryFactory: Send + Sync {
    fn create_shared_memory(&self, name: &str, size: usize) -> anyhow::Result<SharedMemoryRegion>;
}

/// The reference factory: POSIX shared memory via the `shared_memory` crate.
#[derive(Debug, Default)]
pub struct DefaultSharedMemoryFactory;

impl SharedMemoryFactory for DefaultSharedMemoryFactory {
    fn create_shared_memory(&self, name: &str, size: usize) -> anyhow::Result<SharedMemoryRegion> {
        SharedMemoryRegion::create(name, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_applies_default_when_unset() {
        assert_eq!(clamp_shmem_size(None), DEFAULT_SHMEM_SIZE);
    }

    #[test]
    fn clamp_bounds_oversized_and_undersized_hints() {
        assert_eq!(clamp_shmem_size(Some(1)), MIN_SHMEM_SIZE);
        assert_eq!(clamp_shmem_size(Some(usize::MAX)), MAX_SHMEM_SIZE);
        assert_eq!(clamp_shmem_size(Some(1024 * 1024)), 1024 * 1024);
    }

    #[test]
    fn create_then_open_share_bytes() {
        let name = format!("/tracing-service-test-{}", std::process::id());
        let creator = SharedMemoryRegion::create(&name, MIN_SHMEM_SIZE).unwrap();
        assert!(creator.owns_segment());

        unsafe {
            *creator.as_ptr() = 0xAB;
        }

        let opener = SharedMemoryRegion::open(&name).unwrap();
        assert!(!opener.owns_segment());
        assert_eq!(opener.len(), MIN_SHMEM_SIZE);
        unsafe {
            assert_eq!(*opener.as_ptr(), 0xAB);
        }
    }
}
