//! Kernel heap: a [`MemPool`] over a reserved physical range.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;

use mem_pool::{BumpGrowth, MemPool, ALIGN};

use crate::sync::IrqSpinLock;

/// Global allocator backed by the shared first-fit pool.
///
/// Requests aligned beyond 8 bytes are over-allocated; the block pointer is
/// stored in the word just below the aligned address.
pub struct KernelHeap {
    pool: IrqSpinLock<Option<MemPool<BumpGrowth>>>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            pool: IrqSpinLock::new(None),
        }
    }

    /// Hands `[start, start + limit)` to the pool, starting with `initial` bytes.
    ///
    /// # Safety
    /// The range must be mapped, writable, and used by nothing else.
    pub unsafe fn init(&self, start: usize, limit: usize, initial: usize) -> bool {
        let mut slot = self.pool.lock();
        if slot.is_some() {
            log::warn!("heap: already initialised");
            return false;
        }
        *slot = MemPool::new(BumpGrowth::new(start, limit), initial);
        log::info!("heap: pool at {:#x}, limit {:#x}", start, limit);
        slot.is_some()
    }

    /// Sum of live user lengths.
    pub fn in_use(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, |pool| pool.total_length())
    }

    /// Walks every block and checks the running total.
    pub fn verify(&self) -> bool {
        self.pool
            .lock()
            .as_ref()
            .is_some_and(|pool| pool.checked_total_length().is_some())
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.pool.lock();
        let Some(pool) = guard.as_mut() else {
            return ptr::null_mut();
        };
        if layout.align() <= ALIGN {
            return pool
                .alloc(layout.size().max(1))
                .map_or(ptr::null_mut(), |p| p.as_ptr());
        }
        let padded = layout.size() + layout.align() + size_of::<usize>();
        let Some(raw) = pool.alloc(padded) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr();
        let base = raw as usize + size_of::<usize>();
        let aligned = (base + layout.align() - 1) & !(layout.align() - 1);
        let user = aligned as *mut u8;
        user.cast::<*mut u8>().sub(1).write(raw);
        user
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = self.pool.lock();
        let Some(pool) = guard.as_mut() else {
            return;
        };
        let raw = if layout.align() <= ALIGN {
            ptr
        } else {
            ptr.cast::<*mut u8>().sub(1).read()
        };
        pool.free(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn heap_over(arena: &mut [u64]) -> KernelHeap {
        let heap = KernelHeap::new();
        let start = arena.as_mut_ptr() as usize;
        let limit = arena.len() * size_of::<u64>();
        assert!(unsafe { heap.init(start, limit, 256) });
        heap
    }

    #[test]
    fn alloc_before_init_is_null() {
        let heap = KernelHeap::new();
        let layout = Layout::from_size_align(16, 8).expect("layout should succeed");
        assert!(unsafe { heap.alloc(layout) }.is_null());
    }

    #[test]
    fn second_init_is_rejected() {
        let mut arena = vec![0u64; 512];
        let heap = heap_over(&mut arena);
        assert!(!unsafe { heap.init(0, 0, 0) });
    }

    #[test]
    fn small_alignment_round_trips() {
        let mut arena = vec![0u64; 512];
        let heap = heap_over(&mut arena);
        let layout = Layout::from_size_align(24, 8).expect("layout should succeed");
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(heap.in_use(), 24);
        unsafe { heap.dealloc(p, layout) };
        assert_eq!(heap.in_use(), 0);
        assert!(heap.verify());
    }

    #[test]
    fn large_alignment_is_honoured() {
        let mut arena = vec![0u64; 1024];
        let heap = heap_over(&mut arena);
        let layout = Layout::from_size_align(100, 64).expect("layout should succeed");
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe {
            p.write_bytes(0x5A, 100);
            heap.dealloc(p, layout);
        }
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn pool_grows_until_range_exhausted() {
        let mut arena = vec![0u64; 256];
        let heap = heap_over(&mut arena);
        let layout = Layout::from_size_align(512, 8).expect("layout should succeed");
        let a = unsafe { heap.alloc(layout) };
        assert!(!a.is_null());
        let big = Layout::from_size_align(4096, 8).expect("layout should succeed");
        assert!(unsafe { heap.alloc(big) }.is_null());
        unsafe { heap.dealloc(a, layout) };
    }
}
