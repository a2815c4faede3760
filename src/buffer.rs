//! Per-type shared buffer pools.
//!
//! Each port type owns one contiguous shared segment partitioned into
//! fixed-size slots, one per port. Output ports hold a slot from the free
//! list; input ports carry offset zero and resolve their buffer through
//! their connections on the client side. The free list is guarded by its
//! own mutex, deliberately distinct from the graph lock: buffer churn must
//! not contend with sorting.

use crate::shm::{SharedSegment, ShmError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the primary audio type. Its first buffer slot is the
/// process-wide silent buffer.
pub const AUDIO_PORT_TYPE: &str = "32 bit float mono audio";

/// Name of the raw event type. No mixdown, so its input ports accept at
/// most one connection.
pub const EVENT_PORT_TYPE: &str = "8 bit raw event stream";

/// A built-in port type. The table is fixed at startup; types cannot be
/// registered dynamically.
pub struct BuiltinPortType {
    pub name: &'static str,
    /// One buffer is `scale_factor × period_frames × size_of::<f32>()`
    /// bytes when non-negative; `buffer_size` bytes otherwise.
    pub scale_factor: i32,
    pub buffer_size: u32,
    pub has_mixdown: bool,
}

pub const BUILTIN_PORT_TYPES: &[BuiltinPortType] = &[
    BuiltinPortType {
        name: AUDIO_PORT_TYPE,
        scale_factor: 1,
        buffer_size: 0,
        has_mixdown: true,
    },
    BuiltinPortType {
        name: EVENT_PORT_TYPE,
        scale_factor: -1,
        buffer_size: 2048,
        has_mixdown: false,
    },
];

/// Free-slot pool over one port type's shared segment.
pub struct BufferPool {
    type_id: u32,
    shm_name: String,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    segment: Option<SharedSegment>,
    free: VecDeque<u64>,
    one_buffer: usize,
    silent: Option<u64>,
}

impl BufferPool {
    pub fn new(type_id: u32, type_name: &str) -> Self {
        Self {
            type_id,
            shm_name: format!("/jck-[{type_name}]"),
            inner: Mutex::new(PoolInner {
                segment: None,
                free: VecDeque::new(),
                one_buffer: 0,
                silent: None,
            }),
        }
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    /// Resize the segment to `nports × one_buffer` bytes and rebuild the
    /// free list in ascending offset order. Any previous slot assignments
    /// (including the silent slot) are forgotten; the caller re-reserves
    /// and re-broadcasts. Returns the new segment size.
    pub fn resize(
        &self,
        shm_dir: &Path,
        nports: u32,
        one_buffer: usize,
    ) -> Result<u64, ShmError> {
        let size = nports as usize * one_buffer;
        let mut inner = self.inner.lock().unwrap();
        if inner.segment.is_none() {
            inner.segment = Some(SharedSegment::create(shm_dir, &self.shm_name, size)?);
        } else if let Some(seg) = inner.segment.as_mut() {
            seg.resize(size)?;
        }

        inner.one_buffer = one_buffer;
        inner.silent = None;
        inner.free.clear();
        let mut offset = 0u64;
        while (offset as usize) < size {
            inner.free.push_back(offset);
            offset += one_buffer as u64;
        }
        Ok(size as u64)
    }

    /// Reserve the lowest free slot as the zero-filled silent buffer.
    pub fn reserve_silent(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.free.pop_front()?;
        let one_buffer = inner.one_buffer;
        if let Some(seg) = inner.segment.as_ref() {
            seg.zero_range(offset as usize, one_buffer);
        }
        inner.silent = Some(offset);
        Some(offset)
    }

    pub fn silent_offset(&self) -> Option<u64> {
        self.inner.lock().unwrap().silent
    }

    /// Take the next free slot, lowest offset first.
    pub fn acquire(&self) -> Option<u64> {
        self.inner.lock().unwrap().free.pop_front()
    }

    /// Return a slot to the head of the free list.
    pub fn release(&self, offset: u64) {
        self.inner.lock().unwrap().free.push_front(offset);
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn one_buffer(&self) -> usize {
        self.inner.lock().unwrap().one_buffer
    }

    pub fn segment_size(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .segment
            .as_ref()
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    /// Raw pointer to a slot. Valid until the next resize; cycle-time
    /// callers hold the graph lock, under which no resize happens.
    pub fn slot_ptr(&self, offset: u64) -> Option<*mut u8> {
        let inner = self.inner.lock().unwrap();
        let seg = inner.segment.as_ref()?;
        if (offset as usize) < seg.len() {
            // SAFETY: bounds checked against the live mapping.
            Some(unsafe { seg.as_ptr().add(offset as usize) })
        } else {
            None
        }
    }

    /// Snapshot of the free list, used by diagnostics and tests.
    pub fn free_list(&self) -> Vec<u64> {
        self.inner.lock().unwrap().free.iter().copied().collect()
    }

    pub fn backing_path(&self, shm_dir: &Path) -> PathBuf {
        shm_dir.join(self.shm_name.trim_start_matches('/'))
    }

    pub fn destroy(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(seg) = inner.segment.as_ref() {
            seg.destroy();
        }
    }
}
