//! # Trace Buffers and Tracing Sessions
//!
//! `TraceBuffer` is the server-side ring a session drains producer chunks
//! into (§3, §4.C.4); `TracingSession` is the per-consumer state machine
//! that owns a set of buffers and the data-source instances feeding them.
//!
//! Grounded on `original_source/src/tracing/core/service_impl.h`'s nested
//! `TraceBuffer` and `TracingSession` structs, adapted from raw pointer
//! members to owned Rust collections.

use crate::ids::{BufferId, DataSourceInstanceId, ProducerId};
use anyhow::{bail, Result};
use std::collections::HashMap;

/// `size % page_size == 0`, `page_size` a power of two `>= 4 KiB` (§3).
fn validate_buffer_spec(size_bytes: usize, page_size: usize) -> Result<()> {
    if page_size < 4096 || !page_size.is_power_of_two() {
        bail!("page_size {page_size} must be a power of two >= 4096");
    }
    if size_bytes % page_size != 0 {
        bail!("size_bytes {size_bytes} is not a multiple of page_size {page_size}");
    }
    Ok(())
}

/// A server-side ring buffer over raw trace bytes, logically divided into
/// `num_pages` pages of `page_size` bytes with a single write cursor. Wrap
/// around overwrites the oldest page (§3).
pub struct TraceBuffer {
    page_size: usize,
    num_pages: usize,
    pages: Vec<Vec<u8>>,
    cur_page: usize,
    /// Set once at least `num_pages` pages have been written, i.e. the ring
    /// has wrapped at least once and every slot holds real (if possibly
    /// stale) data rather than an empty placeholder.
    wrapped: bool,
}

impl TraceBuffer {
    pub fn new(size_bytes: usize, page_size: usize) -> Result<Self> {
        validate_buffer_spec(size_bytes, page_size)?;
        let num_pages = size_bytes / page_size;
        Ok(Self {
            page_size,
            num_pages,
            pages: vec![Vec::new(); num_pages],
            cur_page: 0,
            wrapped: false,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Writes one page's worth of bytes at the current cursor, then
    /// advances it, wrapping to overwrite the oldest page (§3, §8.3).
    pub fn write_page(&mut self, bytes: &[u8]) {
        self.pages[self.cur_page] = bytes.to_vec();
        self.cur_page = (self.cur_page + 1) % self.num_pages;
        if self.cur_page == 0 {
            self.wrapped = true;
        }
    }

    /// Returns pages in the order they were written (oldest first), without
    /// clearing the buffer. `ReadBuffers` may be called repeatedly and
    /// returns the same bytes each time before `FreeBuffers` (§8.5).
    pub fn drain_order(&self) -> Vec<&[u8]> {
        if !self.wrapped {
            self.pages[..self.cur_page].iter().map(|p| p.as_slice()).collect()
        } else {
            let mut ordered = Vec::with_capacity(self.num_pages);
            for i in 0..self.num_pages {
                let idx = (self.cur_page + i) % self.num_pages;
                ordered.push(self.pages[idx].as_slice());
            }
            ordered
        }
    }
}

/// Lifecycle state of a `TracingSession` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Active,
    Disabled,
}

/// One session per enabled consumer: the buffers it owns, the data-source
/// instances feeding them, and its lifecycle state (§3, §4.C.2-5).
pub struct TracingSession {
    pub state: SessionState,
    pub buffers: HashMap<BufferId, TraceBuffer>,
    /// The `BufferId` allocated for each `TraceConfig.buffers` entry, in the
    /// same order the config listed them. A producer only ever learns a
    /// buffer's 0-based config position (`target_buffer_index` /
    /// `target_buffer`), never its process-wide `BufferId`, so this table is
    /// what translates one into the other on the drain path (§4.C.2).
    pub buffer_order: Vec<BufferId>,
    /// `(producer_id, data_source_instance_id)` pairs currently bound into
    /// this session, mirroring the original's `instances` multimap.
    pub instances: Vec<(ProducerId, DataSourceInstanceId)>,
}

impl TracingSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Configured,
            buffers: HashMap::new(),
            buffer_order: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Translates a 0-based config buffer index (as communicated to a
    /// producer, and echoed back in a drained chunk's `target_buffer`) into
    /// the session's actual `BufferId`, per the order buffers were declared
    /// in the enabling `TraceConfig`.
    pub fn buffer_id_for_index(&self, index: u32) -> Option<BufferId> {
        self.buffer_order.get(index as usize).copied()
    }

    pub fn activate(&mut self) {
        self.state = SessionState::Active;
    }

    pub fn disable(&mut self) {
        self.state = SessionState::Disabled;
    }

    /// Removes every instance belonging to `producer_id`, returning the
    /// removed instance ids so the caller can emit `StopDataSource` for
    /// each one (§4.C.1, §8.6).
    pub fn remove_producer_instances(&mut self, producer_id: ProducerId) -> Vec<DataSourceInstanceId> {
        let mut removed = Vec::new();
        self.instances.retain(|(pid, instance_id)| {
            if *pid == producer_id {
                removed.push(*instance_id);
                false
            } else {
                true
            }
        });
        removed
    }
}

impl Default for TracingSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_page_size_not_power_of_two() {
        assert!(TraceBuffer::new(4096 * 3, 4096 * 3).is_err());
    }

    #[test]
    fn rejects_size_not_multiple_of_page_size() {
        assert!(TraceBuffer::new(5000, 4096).is_err());
    }

    #[test]
    fn single_page_buffer_wraparound_simply_overwrites() {
        let mut buf = TraceBuffer::new(4096, 4096).unwrap();
        buf.write_page(&[1u8; 4096]);
        buf.write_page(&[2u8; 4096]);
        let pages = buf.drain_order();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0], &[2u8; 4096][..]);
    }

    #[test]
    fn drain_before_wrap_returns_only_written_pages_in_order() {
        let mut buf = TraceBuffer::new(4096 * 4, 4096).unwrap();
        buf.write_page(&[1u8; 4096]);
        buf.write_page(&[2u8; 4096]);
        let pages = buf.drain_order();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0][0], 1);
        assert_eq!(pages[1][0], 2);
    }

    #[test]
    fn drain_is_idempotent_before_free() {
        let mut buf = TraceBuffer::new(4096 * 2, 4096).unwrap();
        buf.write_page(&[7u8; 4096]);
        let first = buf.drain_order();
        let second = buf.drain_order();
        assert_eq!(first, second);
    }

    #[test]
    fn disconnecting_producer_removes_only_its_instances() {
        let mut session = TracingSession::new();
        session.instances.push((ProducerId(1), DataSourceInstanceId(1)));
        session.instances.push((ProducerId(2), DataSourceInstanceId(2)));
        session.instances.push((ProducerId(1), DataSourceInstanceId(3)));

        let removed = session.remove_producer_instances(ProducerId(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(session.instances, vec![(ProducerId(2), DataSourceInstanceId(2))]);
    }
}
