//! # Shared-Memory ABI
//!
//! This module implements the lock-free page/chunk protocol described in §4.B:
//! a producer and the service coordinate over a raw memory region with no
//! syscalls on the fast path, using a single compare-and-set per state
//! transition.
//!
//! ## Layout
//!
//! The region is `num_pages` pages of `page_size` bytes. Each page begins with
//! an 8-byte [`PageHeader`] (a layout tag plus a bit-packed chunk state array),
//! followed by `N` equally sized chunks where `N` is 1, 2, 4, 8, or 16 per
//! [`PageLayout`]. Each chunk begins with a [`ChunkHeader`] (writer id, chunk
//! id, target buffer, packet count — all producer-written and advisory, see
//! §4.B's trust note) followed by the writable payload.
//!
//! This mirrors the teacher's `SharedMemoryRingBuffer` in
//! `src/ipc/shared_memory.rs` (an atomics-over-raw-pointer header followed by a
//! data region) generalized from one flat ring to the paged/chunked ABI the
//! spec requires.

use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Minimum legal page size: 4 KiB, per §3's `TraceBuffer` invariant.
pub const MIN_PAGE_SIZE: usize = 4096;

/// How many chunks a page is divided into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageLayout {
    OneChunk = 0,
    TwoChunks = 1,
    FourChunks = 2,
    EightChunks = 3,
    SixteenChunks = 4,
}

impl PageLayout {
    pub fn num_chunks(self) -> usize {
        match self {
            PageLayout::OneChunk => 1,
            PageLayout::TwoChunks => 2,
            PageLayout::FourChunks => 4,
            PageLayout::EightChunks => 8,
            PageLayout::SixteenChunks => 16,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PageLayout::OneChunk),
            1 => Some(PageLayout::TwoChunks),
            2 => Some(PageLayout::FourChunks),
            3 => Some(PageLayout::EightChunks),
            4 => Some(PageLayout::SixteenChunks),
            _ => None,
        }
    }

    /// Picks the finest layout (most chunks) whose chunk body can still hold
    /// `min_chunk_payload` bytes within a page of `page_size` bytes.
    pub fn best_fit(page_size: usize, min_chunk_payload: usize) -> Self {
        for layout in [
            PageLayout::SixteenChunks,
            PageLayout::EightChunks,
            PageLayout::FourChunks,
            PageLayout::TwoChunks,
        ] {
            let chunk_size = (page_size - PageHeader::SIZE) / layout.num_chunks();
            if chunk_size >= ChunkHeader::SIZE + min_chunk_payload {
                return layout;
            }
        }
        PageLayout::OneChunk
    }
}

/// The lifecycle state of a single chunk, per §4.B's state machine.
///
/// `FREE -> BEING_WRITTEN -> COMPLETE -> BEING_READ -> FREE`. The producer
/// owns the first transition pair, the service owns the second; both use CAS
/// only on transitions they own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    Free = 0b00,
    BeingWritten = 0b01,
    Complete = 0b10,
    BeingRead = 0b11,
}

impl ChunkState {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => ChunkState::Free,
            0b01 => ChunkState::BeingWritten,
            0b10 => ChunkState::Complete,
            _ => ChunkState::BeingRead,
        }
    }
}

/// 8-byte page header: a layout tag plus up to 16 chunk states packed two
/// bits apiece into a single atomic word, so a CAS on one chunk's state never
/// races with a CAS on another chunk's state in the same word beyond the
/// ordinary compare-and-retry.
#[repr(C)]
struct PageHeader {
    layout: AtomicU8,
    _reserved: [u8; 3],
    chunk_states: AtomicU32,
}

impl PageHeader {
    const SIZE: usize = std::mem::size_of::<Self>();
}

/// 16-byte chunk header, producer-written. Every field here is advisory: the
/// service must never use these fields to compute memory bounds it reads,
/// only to decide where a *already bounds-checked* copy should land, per
/// §4.B's "malicious producer" invariant.
#[repr(C)]
struct ChunkHeader {
    writer_id: AtomicU32,
    chunk_id: AtomicU32,
    target_buffer: AtomicU32,
    packets_count: AtomicU32,
}

impl ChunkHeader {
    const SIZE: usize = std::mem::size_of::<Self>();
}

/// A chunk handed back to the producer by [`SharedMemoryAbi::acquire_chunk`].
/// Carries enough information for the producer to address its writable range
/// without re-deriving page/chunk math.
pub struct AcquiredChunk {
    pub page: usize,
    pub chunk: usize,
    /// Offset of the writable payload area from the start of the region.
    pub payload_offset: usize,
    pub payload_capacity: usize,
}

/// A chunk found `COMPLETE` by the service while draining a page.
pub struct DrainedChunk {
    pub chunk: usize,
    pub target_buffer: u32,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// View over a raw memory region implementing the page/chunk ABI.
///
/// This type does not own the memory; it borrows a `*mut u8` for its
/// lifetime. The producer-side and service-side each construct their own
/// `SharedMemoryAbi` over the same bytes (mapped independently, possibly in
/// different processes) — exactly as the original's `SharedMemoryABI` is a
/// thin view constructed on both sides of a `SharedMemory` region.
pub struct SharedMemoryAbi {
    base: *mut u8,
    size: usize,
    page_size: usize,
}

// SAFETY: all mutation goes through atomics at computed offsets; `base` is
// only ever used to derive those offsets. Matches the teacher's
// `unsafe impl Send for SharedMemoryConnection` rationale in
// `src/ipc/shared_memory.rs`.
unsafe impl Send for SharedMemoryAbi {}
unsafe impl Sync for SharedMemoryAbi {}

impl SharedMemoryAbi {
    /// Constructs a view over `size` bytes starting at `base`, divided into
    /// pages of `page_size` bytes.
    ///
    /// Per §3: `size % page_size == 0` and `page_size` must be a power of two
    /// `>= 4 KiB`.
    pub fn new(base: *mut u8, size: usize, page_size: usize) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            bail!(
                "page_size {} must be a power of two >= {}",
                page_size,
                MIN_PAGE_SIZE
            );
        }
        if size % page_size != 0 {
            bail!("region size {} is not a multiple of page_size {}", size, page_size);
        }
        if page_size <= PageHeader::SIZE + ChunkHeader::SIZE {
            bail!("page_size {} too small to hold a header and one chunk", page_size);
        }
        Ok(Self {
            base,
            size,
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.size / self.page_size
    }

    fn page_base(&self, page: usize) -> *mut u8 {
        debug_assert!(page < self.num_pages());
        unsafe { self.base.add(page * self.page_size) }
    }

    fn header(&self, page: usize) -> &PageHeader {
        unsafe { &*(self.page_base(page) as *const PageHeader) }
    }

    fn chunk_header(&self, page: usize, chunk: usize, layout: PageLayout) -> &ChunkHeader {
        let offset = PageHeader::SIZE + chunk * self.chunk_stride(layout);
        unsafe { &*(self.page_base(page).add(offset) as *const ChunkHeader) }
    }

    fn chunk_stride(&self, layout: PageLayout) -> usize {
        (self.page_size - PageHeader::SIZE) / layout.num_chunks()
    }

    /// Initializes a page's header: all chunks `FREE`, with the given chunk
    /// layout. Must be called once before any `acquire_chunk`/drain call
    /// touches the page — normally done by whichever side creates the region
    /// (the service, per §4.C.1) immediately after mapping it.
    pub fn init_page(&self, page: usize, layout: PageLayout) {
        let header = self.header(page);
        header.chunk_states.store(0, Ordering::Relaxed);
        header.layout.store(layout as u8, Ordering::Release);
    }

    fn page_layout(&self, page: usize) -> PageLayout {
        let raw = self.header(page).layout.load(Ordering::Acquire);
        PageLayout::from_u8(raw).unwrap_or(PageLayout::OneChunk)
    }

    fn chunk_state(&self, page: usize, chunk: usize) -> ChunkState {
        let bits = self.header(page).chunk_states.load(Ordering::Acquire);
        ChunkState::from_bits(bits >> (chunk * 2))
    }

    /// Attempts to CAS chunk `chunk` on `page` from `from` to `to`. Returns
    /// `true` on success. Loops only to retry spurious failures on bits
    /// belonging to *other* chunks in the same packed word; a failure because
    /// this chunk's own bits didn't match `from` is reported immediately.
    fn cas_chunk(&self, page: usize, chunk: usize, from: ChunkState, to: ChunkState) -> bool {
        let shift = chunk * 2;
        let mask: u32 = 0b11 << shift;
        let header = self.header(page);
        loop {
            let current = header.chunk_states.load(Ordering::Acquire);
            if ChunkState::from_bits(current >> shift) as u8 != from as u8 {
                return false;
            }
            let new = (current & !mask) | ((to as u32) << shift);
            match header.chunk_states.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    fn store_chunk(&self, page: usize, chunk: usize, to: ChunkState) {
        let shift = chunk * 2;
        let mask: u32 = 0b11 << shift;
        let header = self.header(page);
        loop {
            let current = header.chunk_states.load(Ordering::Acquire);
            let new = (current & !mask) | ((to as u32) << shift);
            if header
                .chunk_states
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Producer-side: find a `FREE` chunk reachable from `page_hint` within
    /// `num_pages` probes, CAS it to `BEING_WRITTEN`, and return its writable
    /// range. Returns `None` if no `FREE` chunk was found — the producer then
    /// drops the packet it was about to write, per §4.C's backpressure policy.
    pub fn acquire_chunk(&self, page_hint: usize, writer_id: u32) -> Option<AcquiredChunk> {
        let num_pages = self.num_pages();
        if num_pages == 0 {
            return None;
        }
        for probe in 0..num_pages {
            let page = (page_hint + probe) % num_pages;
            let layout = self.page_layout(page);
            let stride = self.chunk_stride(layout);
            for chunk in 0..layout.num_chunks() {
                if self.cas_chunk(page, chunk, ChunkState::Free, ChunkState::BeingWritten) {
                    let chunk_header = self.chunk_header(page, chunk, layout);
                    chunk_header.writer_id.store(writer_id, Ordering::Relaxed);
                    chunk_header.chunk_id.store(chunk as u32, Ordering::Relaxed);
                    chunk_header.target_buffer.store(0, Ordering::Relaxed);
                    chunk_header.packets_count.store(0, Ordering::Relaxed);
                    let chunk_offset = page * self.page_size
                        + PageHeader::SIZE
                        + chunk * stride
                        + ChunkHeader::SIZE;
                    return Some(AcquiredChunk {
                        page,
                        chunk,
                        payload_offset: chunk_offset,
                        payload_capacity: stride - ChunkHeader::SIZE,
                    });
                }
            }
        }
        None
    }

    /// Producer-side: records that `target_buffer` is the destination session
    /// buffer for this chunk's contents and increments `packets_count`.
    /// Called once per packet appended to the chunk (§4.B.2).
    pub fn extend_packet(&self, acquired: &AcquiredChunk, target_buffer: u32) {
        let layout = self.page_layout(acquired.page);
        let header = self.chunk_header(acquired.page, acquired.chunk, layout);
        header.target_buffer.store(target_buffer, Ordering::Relaxed);
        header.packets_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Producer-side: store-releases `COMPLETE`. After this call the producer
    /// must never touch the chunk again (§4.B).
    pub fn release_chunk(&self, acquired: &AcquiredChunk) {
        self.store_chunk(acquired.page, acquired.chunk, ChunkState::Complete);
    }

    /// Service-side: scans `page`'s chunks, CASing every `COMPLETE` chunk to
    /// `BEING_READ` and returning a [`DrainedChunk`] describing where its
    /// bytes live and which session buffer they target. `BEING_WRITTEN`
    /// chunks are left alone (§4.C page-ready path, step 3).
    ///
    /// The caller is responsible for copying the bytes out and then calling
    /// [`Self::release_to_free`] — this keeps the ABI ignorant of
    /// `TraceBuffer`, matching the layering in §4.B/§4.C.
    pub fn drain_complete_chunks(&self, page: usize) -> Result<Vec<DrainedChunk>> {
        if page >= self.num_pages() {
            bail!("page {} out of bounds (num_pages={})", page, self.num_pages());
        }
        let layout = self.page_layout(page);
        let stride = self.chunk_stride(layout);
        let mut drained = Vec::new();
        for chunk in 0..layout.num_chunks() {
            if self.chunk_state(page, chunk) != ChunkState::Complete {
                continue;
            }
            if !self.cas_chunk(page, chunk, ChunkState::Complete, ChunkState::BeingRead) {
                // Lost a race (shouldn't happen: service is the sole reader),
                // or the chunk moved on between the peek and the CAS.
                continue;
            }
            let header = self.chunk_header(page, chunk, layout);
            let target_buffer = header.target_buffer.load(Ordering::Relaxed);
            let chunk_offset = page * self.page_size + PageHeader::SIZE + chunk * stride;
            drained.push(DrainedChunk {
                chunk,
                target_buffer,
                payload_offset: chunk_offset + ChunkHeader::SIZE,
                payload_len: stride - ChunkHeader::SIZE,
            });
        }
        Ok(drained)
    }

    /// Service-side: returns a drained chunk to `FREE` once its bytes have
    /// been copied out.
    pub fn release_to_free(&self, page: usize, chunk: usize) {
        self.store_chunk(page, chunk, ChunkState::Free);
    }

    /// Borrows the raw bytes at `[offset, offset+len)`. Used by both the
    /// producer (to write payload) and the service (to read a drained
    /// chunk's payload) — bounds are always derived from `self.size`, never
    /// from producer-written fields, per §4.B's trust invariant.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.size {
            return Err(anyhow!(
                "range [{}, {}) out of bounds for region of size {}",
                offset,
                offset + len,
                self.size
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }

    /// Mutable counterpart of [`Self::bytes`], for the producer's write path.
    pub fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        if offset + len > self.size {
            return Err(anyhow!(
                "range [{}, {}) out of bounds for region of size {}",
                offset,
                offset + len,
                self.size
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_region(size: usize, page_size: usize) -> (Vec<u8>, SharedMemoryAbi) {
        let mut buf = vec![0u8; size];
        let abi = SharedMemoryAbi::new(buf.as_mut_ptr(), size, page_size).unwrap();
        (buf, abi)
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut buf = vec![0u8; 8192];
        assert!(SharedMemoryAbi::new(buf.as_mut_ptr(), 8192, 5000).is_err());
    }

    #[test]
    fn rejects_size_not_multiple_of_page_size() {
        let mut buf = vec![0u8; 9000];
        assert!(SharedMemoryAbi::new(buf.as_mut_ptr(), 9000, 4096).is_err());
    }

    #[test]
    fn acquire_write_release_drain_round_trip() {
        let (_buf, abi) = new_region(4096 * 2, 4096);
        abi.init_page(0, PageLayout::FourChunks);
        abi.init_page(1, PageLayout::FourChunks);

        let acquired = abi.acquire_chunk(0, 7).expect("chunk available");
        let payload = b"hello chunk";
        abi.bytes_mut(acquired.payload_offset, payload.len())
            .unwrap()
            .copy_from_slice(payload);
        abi.extend_packet(&acquired, 42);
        abi.release_chunk(&acquired);

        let drained = abi.drain_complete_chunks(acquired.page).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].target_buffer, 42);
        let bytes = abi
            .bytes(drained[0].payload_offset, payload.len())
            .unwrap();
        assert_eq!(bytes, payload);

        abi.release_to_free(acquired.page, drained[0].chunk);

        // Chunk is FREE again: acquiring from the same hint should find it.
        let reacquired = abi.acquire_chunk(0, 1).unwrap();
        assert_eq!(reacquired.page, acquired.page);
    }

    #[test]
    fn sixteen_chunks_can_all_be_being_written_simultaneously() {
        let (_buf, abi) = new_region(4096, 4096);
        abi.init_page(0, PageLayout::SixteenChunks);

        let mut acquired = Vec::new();
        for writer in 0..16u32 {
            let chunk = abi.acquire_chunk(0, writer).expect("chunk available");
            acquired.push(chunk);
        }
        // One more producer should find nothing FREE.
        assert!(abi.acquire_chunk(0, 99).is_none());

        // Distinct chunks, none aliasing.
        let mut chunk_ids: Vec<usize> = acquired.iter().map(|c| c.chunk).collect();
        chunk_ids.sort_unstable();
        chunk_ids.dedup();
        assert_eq!(chunk_ids.len(), 16);
    }

    #[test]
    fn acquire_returns_none_when_no_free_chunk_reachable() {
        let (_buf, abi) = new_region(4096, 4096);
        abi.init_page(0, PageLayout::OneChunk);
        let acquired = abi.acquire_chunk(0, 1).unwrap();
        assert!(abi.acquire_chunk(0, 2).is_none());
        // Releasing makes it available again.
        abi.release_chunk(&acquired);
        let drained = abi.drain_complete_chunks(0).unwrap();
        abi.release_to_free(0, drained[0].chunk);
        assert!(abi.acquire_chunk(0, 3).is_some());
    }

    #[test]
    fn being_written_chunks_are_left_alone_by_drain() {
        let (_buf, abi) = new_region(4096, 4096);
        abi.init_page(0, PageLayout::TwoChunks);
        let _a = abi.acquire_chunk(0, 1).unwrap();
        let b = abi.acquire_chunk(0, 2).unwrap();
        abi.release_chunk(&b);

        let drained = abi.drain_complete_chunks(0).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].chunk, b.chunk);
    }

    #[test]
    fn drain_out_of_bounds_page_errors() {
        let (_buf, abi) = new_region(4096, 4096);
        abi.init_page(0, PageLayout::OneChunk);
        assert!(abi.drain_complete_chunks(1).is_err());
    }

    #[test]
    fn repeated_drain_on_already_drained_page_is_idempotent() {
        let (_buf, abi) = new_region(4096, 4096);
        abi.init_page(0, PageLayout::OneChunk);
        let acquired = abi.acquire_chunk(0, 1).unwrap();
        abi.release_chunk(&acquired);
        let first = abi.drain_complete_chunks(0).unwrap();
        assert_eq!(first.len(), 1);
        abi.release_to_free(0, first[0].chunk);

        // Nothing new became COMPLETE; a second scan just finds nothing.
        let second = abi.drain_complete_chunks(0).unwrap();
        assert!(second.is_empty());
    }
}
