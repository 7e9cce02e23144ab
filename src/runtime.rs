//! The Runtime's consumer-side contract: `Allocator` and the hardware
//! command queue (§4.6, §1 "deliberately out of scope... interfaces only").
//!
//! Nothing in this module is executed by the scheduler itself; it exists so
//! that `ScheduleItem`s can be handed to an external executor that implements
//! these traits for a real device.

use std::collections::HashMap;

use crate::buffer::BufferOptions;

/// Capability set a device's allocator must provide (§4.6).
///
/// `Opaque` is whatever representation the allocator uses internally for a
/// live allocation (a raw pointer, a file descriptor, ...); the scheduler
/// never inspects it.
pub trait Allocator {
    type Opaque;

    /// Returns `None` on allocator exhaustion (OOM); `LruAllocator::alloc`
    /// treats this as a signal to drain its cache and retry once (§4.6).
    fn alloc(&mut self, size: usize, options: &BufferOptions) -> Option<Self::Opaque>;
    fn free(&mut self, ptr: Self::Opaque, size: usize, options: &BufferOptions);
    fn copyin(&mut self, dest: &Self::Opaque, src: &[u8]);
    fn copyout(&mut self, dest: &mut [u8], src: &Self::Opaque);

    /// Zero-copy host visibility, where supported.
    fn as_buffer(&self, _ptr: &Self::Opaque) -> Option<&[u8]> {
        None
    }
    /// A sub-allocation view `size` bytes wide at `offset` into `ptr`.
    fn offset(&mut self, _ptr: &Self::Opaque, _size: usize, _offset: usize) -> Option<Self::Opaque> {
        None
    }
    /// Device-to-device transfer; `None` means the pair must bounce through host.
    fn transfer(&mut self, _dest: &Self::Opaque, _src: &Self::Opaque, _size: usize) -> Option<()> {
        None
    }
}

/// Wraps an `Allocator` with the LRU-cache discipline of §4.6: `free` defers
/// to a per-`(size, options)` cache unless `options.nolru`; `alloc` pops from
/// the cache first, draining it once on exhaustion before retrying the
/// underlying allocator.
pub struct LruAllocator<A: Allocator> {
    inner: A,
    cache: HashMap<(usize, BufferOptions), Vec<A::Opaque>>,
}

impl<A: Allocator> LruAllocator<A> {
    pub fn new(inner: A) -> Self {
        LruAllocator { inner, cache: HashMap::new() }
    }

    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }

    fn cache_key(size: usize, options: &BufferOptions) -> (usize, BufferOptions) {
        (size, options.clone())
    }

    pub fn alloc(&mut self, size: usize, options: &BufferOptions) -> A::Opaque {
        let key = Self::cache_key(size, options);
        if let Some(slot) = self.cache.get_mut(&key) {
            if let Some(ptr) = slot.pop() {
                return ptr;
            }
        }
        if let Some(ptr) = self.inner.alloc(size, options) {
            return ptr;
        }
        self.drain();
        self.inner
            .alloc(size, options)
            .expect("allocator exhausted even after draining the LRU cache")
    }

    pub fn free(&mut self, ptr: A::Opaque, size: usize, options: &BufferOptions) {
        if options.nolru {
            self.inner.free(ptr, size, options);
            return;
        }
        self.cache.entry(Self::cache_key(size, options)).or_default().push(ptr);
    }

    /// Drains every cached allocation back to the underlying allocator; used
    /// once on an OOM retry per §4.6.
    pub fn drain(&mut self) {
        for ((size, options), ptrs) in self.cache.drain() {
            for ptr in ptrs {
                self.inner.free(ptr, size, &options);
            }
        }
    }
}

/// A monotonic 64-bit counter used for cross-queue ordering (§4.6 "Signals").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub u32);

/// One recorded command in a hardware command queue. Addressable by index
/// within a [`CommandQueue`] and patchable before submission.
pub enum HcqCommand {
    Signal { sig: SignalId, value: u64 },
    Wait { sig: SignalId, value: u64 },
    Timestamp { sig: SignalId },
    Exec { prg: String, args: Vec<usize>, global_size: [usize; 3], local_size: [usize; 3] },
    Copy { dest: usize, src: usize, nbytes: usize },
    MemoryBarrier,
}

/// A sequence of [`HcqCommand`]s submitted atomically to a device.
#[derive(Default)]
pub struct CommandQueue {
    commands: Vec<HcqCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue { commands: Vec::new() }
    }

    /// Appends a command, returning its index for later patching.
    pub fn push(&mut self, cmd: HcqCommand) -> usize {
        self.commands.push(cmd);
        self.commands.len() - 1
    }

    pub fn patch(&mut self, index: usize, cmd: HcqCommand) {
        self.commands[index] = cmd;
    }

    pub fn commands(&self) -> &[HcqCommand] {
        &self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAllocator {
        allocs: u32,
    }
    impl Allocator for CountingAllocator {
        type Opaque = u64;
        fn alloc(&mut self, _size: usize, _options: &BufferOptions) -> Option<u64> {
            self.allocs += 1;
            Some(self.allocs as u64)
        }
        fn free(&mut self, _ptr: u64, _size: usize, _options: &BufferOptions) {}
        fn copyin(&mut self, _dest: &u64, _src: &[u8]) {}
        fn copyout(&mut self, _dest: &mut [u8], _src: &u64) {}
    }

    /// Fails the first `alloc` call for a given size, then succeeds; used to
    /// prove `LruAllocator::alloc` drains its cache and retries on OOM.
    struct FlakyAllocator {
        allocs: u32,
        frees: u32,
        fail_next: bool,
    }
    impl Allocator for FlakyAllocator {
        type Opaque = u64;
        fn alloc(&mut self, _size: usize, _options: &BufferOptions) -> Option<u64> {
            if self.fail_next {
                self.fail_next = false;
                return None;
            }
            self.allocs += 1;
            Some(self.allocs as u64)
        }
        fn free(&mut self, _ptr: u64, _size: usize, _options: &BufferOptions) {
            self.frees += 1;
        }
        fn copyin(&mut self, _dest: &u64, _src: &[u8]) {}
        fn copyout(&mut self, _dest: &mut [u8], _src: &u64) {}
    }

    #[test]
    fn lru_reuses_freed_allocation_of_matching_key() {
        let mut lru = LruAllocator::new(CountingAllocator { allocs: 0 });
        let opts = BufferOptions::default();
        let p1 = lru.alloc(64, &opts);
        lru.free(p1, 64, &opts);
        let p2 = lru.alloc(64, &opts);
        assert_eq!(p1, p2);
        assert_eq!(lru.inner_mut().allocs, 1);
    }

    #[test]
    fn nolru_buffers_bypass_the_cache() {
        let mut lru = LruAllocator::new(CountingAllocator { allocs: 0 });
        let opts = BufferOptions { nolru: true, ..BufferOptions::default() };
        let p1 = lru.alloc(64, &opts);
        lru.free(p1, 64, &opts);
        let _ = lru.alloc(64, &opts);
        assert_eq!(lru.inner_mut().allocs, 2);
    }

    #[test]
    fn alloc_drains_the_cache_and_retries_once_on_exhaustion() {
        let mut lru = LruAllocator::new(FlakyAllocator { allocs: 0, frees: 0, fail_next: false });
        let opts = BufferOptions::default();
        // Prime the cache with a freed allocation of a *different* size, so
        // it can't simply be popped for the size-64 request below.
        let p0 = lru.alloc(32, &opts);
        lru.free(p0, 32, &opts);
        assert_eq!(lru.inner_mut().frees, 0);

        lru.inner_mut().fail_next = true;
        let _ = lru.alloc(64, &opts);

        // The first alloc(64) attempt failed, forcing a drain (freeing the
        // cached size-32 allocation) before the retry succeeded.
        assert_eq!(lru.inner_mut().frees, 1);
        assert_eq!(lru.inner_mut().allocs, 2); // the size-32 alloc, then the retried size-64 alloc
    }

    #[test]
    fn command_queue_patch_replaces_in_place() {
        let mut q = CommandQueue::new();
        let idx = q.push(HcqCommand::MemoryBarrier);
        q.patch(idx, HcqCommand::Signal { sig: SignalId(0), value: 1 });
        assert!(matches!(q.commands()[idx], HcqCommand::Signal { .. }));
    }
}
