//! `sbrk` and `malloc` over the program break.

use core::ptr::{self, NonNull};

use mem_pool::{MemPool, PoolGrowth};

use crate::sys;

/// Bytes the first `malloc` pool spans.
pub const INITIAL_POOL: usize = 4096;

/// Something that can move the program break.
pub trait BreakSource {
    /// Requests break `addr` (`0` queries) and returns the break in effect.
    fn brk(&mut self, addr: usize) -> usize;
}

/// The kernel's `brk` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysBrk;

impl BreakSource for SysBrk {
    fn brk(&mut self, addr: usize) -> usize {
        sys::sys_brk(addr)
    }
}

/// Relative break adjustment on top of a [`BreakSource`].
#[derive(Debug, Default)]
pub struct Sbrk<B> {
    source: B,
}

impl<B: BreakSource> Sbrk<B> {
    pub const fn new(source: B) -> Self {
        Self { source }
    }

    pub fn current(&mut self) -> usize {
        self.source.brk(0)
    }

    /// Moves the break by `increment` and returns the previous break, or
    /// `None` when the kernel refused the move.
    pub fn adjust(&mut self, increment: isize) -> Option<usize> {
        let old = self.source.brk(0);
        if increment == 0 {
            return Some(old);
        }
        let wanted = old.checked_add_signed(increment)?;
        (self.source.brk(wanted) == wanted).then_some(old)
    }

    /// Sets the break to exactly `addr`.
    pub fn set(&mut self, addr: usize) -> Option<()> {
        if addr == 0 {
            return None;
        }
        (self.source.brk(addr) == addr).then_some(())
    }
}

impl<B: BreakSource> PoolGrowth for Sbrk<B> {
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>> {
        let increment = isize::try_from(increment).ok()?;
        let old = self.adjust(increment)?;
        NonNull::new(old as *mut u8)
    }
}

/// `malloc`/`free`/`calloc` over a pool grown with `sbrk`.
pub struct Malloc<B> {
    pool: MemPool<Sbrk<B>>,
}

impl<B: BreakSource> Malloc<B> {
    /// Claims the first pool span from the break.
    pub fn new(source: B) -> Option<Self> {
        let pool = MemPool::new(Sbrk::new(source), INITIAL_POOL)?;
        Some(Self { pool })
    }

    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        self.pool
            .alloc(size)
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    pub fn free(&mut self, ptr: *mut u8) {
        self.pool.free(ptr);
    }

    /// Zeroed storage for `count` elements of `size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            // SAFETY: `ptr` covers `total` freshly allocated bytes.
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Bytes currently handed out.
    pub fn total_length(&self) -> usize {
        self.pool.total_length()
    }

    /// Bytes the pool spans.
    pub fn span(&self) -> usize {
        self.pool.span()
    }

    /// Cross-checks the live total against a block walk.
    pub fn verify(&self) -> bool {
        self.pool.checked_total_length().is_some()
    }
}
