use kernel_core::config::PAGE_OFFSET;
use kernel_core::KernelHeap;

use crate::platform;

/// Bytes the pool starts with; it grows on demand up to the whole range.
const INITIAL_HEAP: usize = 64 * 1024;

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap::new();

/// Initializes the kernel heap allocator over the board's heap range.
pub fn init_heap() {
    let start = (PAGE_OFFSET + platform::HEAP_START) as usize;
    // SAFETY: the heap range is RAM reserved for this pool and mapped by
    // the linear map.
    let ok = unsafe { ALLOCATOR.init(start, platform::HEAP_SIZE as usize, INITIAL_HEAP) };
    if !ok {
        panic!("heap: pool setup failed");
    }
}

/// Bytes currently handed out.
pub fn heap_in_use() -> usize {
    ALLOCATOR.in_use()
}

/// Walks the heap and checks its bookkeeping.
pub fn heap_verify() -> bool {
    ALLOCATOR.verify()
}
