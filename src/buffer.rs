//! Opaque device-resident allocation handles (§3 "Buffer", §4.6 C7).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;

/// Identity handle for an entry in a [`BufferTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u32);

/// Device/allocator-specific knobs attached to a [`Buffer`] (image layout,
/// host-visibility, LRU opt-out, ...). Treated as an opaque, hashable key by
/// the memory planner's allocation-key bucketing (§4.5 step 2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferOptions {
    pub image: bool,
    /// The allocation must not be cached by the CPU (device-mapped memory).
    pub uncached: bool,
    /// The allocation must be directly readable/writable from the host.
    pub cpu_access: bool,
    pub host: bool,
    pub nolru: bool,
    /// Whether this buffer's device allocator can hand back an `offset()`
    /// view into a larger backing allocation (§4.6). When false, the memory
    /// planner's allocation key includes `size` so two candidates only ever
    /// share storage when they're exactly the same size (§4.5 step 2).
    pub suballoc: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            image: false,
            uncached: false,
            cpu_access: false,
            host: false,
            nolru: false,
            suballoc: false,
        }
    }
}

/// A device-resident allocation, or a view into another [`Buffer`] sharing
/// its storage at some byte `offset` (§3 "Buffer").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buffer {
    pub device: Arc<str>,
    pub size: usize,
    pub dtype: DType,
    pub options: BufferOptions,
    pub offset: usize,
    pub base: Option<BufferId>,
    /// Lazy references held by LazyBuffers/ScheduleItems, distinct from
    /// whether the backing allocation has actually been materialized yet
    /// (§3 "Buffer" lifecycle).
    pub refcount: u32,
    allocated: bool,
}

impl Buffer {
    pub fn new(device: impl Into<Arc<str>>, size: usize, dtype: DType, options: BufferOptions) -> Self {
        Buffer { device: device.into(), size, dtype, options, offset: 0, base: None, refcount: 0, allocated: false }
    }

    pub fn view_of(base: BufferId, backing: &Buffer, size: usize, offset: usize) -> Self {
        Buffer {
            device: backing.device.clone(),
            size,
            dtype: backing.dtype,
            options: backing.options.clone(),
            offset,
            base: Some(base),
            refcount: 0,
            allocated: false,
        }
    }

    pub fn nbytes(&self) -> usize {
        self.size * self.dtype.itemsize()
    }

    pub fn is_view(&self) -> bool {
        self.base.is_some()
    }

    pub fn mark_allocated(&mut self) {
        self.allocated = true;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// The bucket used by the memory planner's candidate grouping (§4.5 step
    /// 2): `(device, dtype, options)`, plus `size` when `options.suballoc` is
    /// false, since an allocator that can't hand back an offset view can
    /// only share a buffer with another candidate of the exact same size.
    pub fn alloc_key(&self) -> (Arc<str>, DType, BufferOptions, Option<usize>) {
        let size = if self.options.suballoc { None } else { Some(self.size) };
        (self.device.clone(), self.dtype, self.options.clone(), size)
    }
}

/// An arena of [`Buffer`]s, indexed by [`BufferId`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BufferTable {
    buffers: Vec<Buffer>,
}

impl BufferTable {
    pub fn new() -> Self {
        BufferTable { buffers: Vec::new() }
    }

    pub fn insert(&mut self, buf: Buffer) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(buf);
        id
    }

    pub fn get(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
