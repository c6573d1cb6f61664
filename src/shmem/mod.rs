//! Shared-memory transport: the page/chunk ABI (`abi`) and the OS-level
//! region provisioning that backs it (`region`).

pub mod abi;
pub mod region;

pub use abi::{AcquiredChunk, ChunkState, DrainedChunk, PageLayout, SharedMemoryAbi};
pub use region::{
    clamp_shmem_size, DefaultSharedMemoryFactory, SharedMemoryFactory, SharedMemoryRegion,
    DEFAULT_SHMEM_SIZE, MAX_SHMEM_SIZE, MIN_SHMEM_SIZE,
};
