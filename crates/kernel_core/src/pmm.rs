//! Physical page allocator.
//!
//! Pages of the pool are tracked one bit each; a run of `2^order` pages is
//! handed out first-fit from the lowest address.

use alloc::vec::Vec;
use core::cell::Cell;

use hal::{PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};

use crate::sync::IrqSpinLock;

const WORD_BITS: usize = 64;

/// Bitmap allocator over a contiguous physical range.
#[derive(Debug)]
pub struct PageAllocator {
    base: PhysAddr,
    pages: usize,
    bitmap: Vec<u64>,
}

impl PageAllocator {
    /// Creates an allocator for `pages` pages starting at `base`.
    pub fn new(base: PhysAddr, pages: usize) -> Self {
        let words = pages.div_ceil(WORD_BITS);
        let mut bitmap = Vec::new();
        bitmap.resize(words, 0);
        Self {
            base,
            pages,
            bitmap,
        }
    }

    /// Allocates `2^order` contiguous pages, lowest address first.
    pub fn alloc(&mut self, order: u32) -> Option<PhysAddr> {
        let count = 1usize.checked_shl(order)?;
        if count > self.pages {
            return None;
        }
        let mut run = 0;
        for page in 0..self.pages {
            if self.is_used(page) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = page + 1 - count;
                (first..=page).for_each(|p| self.set(p, true));
                log::debug!("pmm: alloc order {} -> page {}", order, first);
                return Some(self.base + ((first as u64) << PAGE_SHIFT));
            }
        }
        None
    }

    /// Returns a run previously obtained from [`alloc`](Self::alloc).
    ///
    /// Freeing an address outside the pool, a misaligned address, or a page
    /// that is not allocated corrupts ownership and panics.
    pub fn free(&mut self, addr: PhysAddr, order: u32) {
        let count = 1usize << order;
        if addr < self.base || addr % PAGE_SIZE != 0 {
            log::error!("pmm: free of foreign address {:#x}", addr);
            panic!("pmm: invalid free");
        }
        let first = ((addr - self.base) >> PAGE_SHIFT) as usize;
        if first + count > self.pages {
            log::error!("pmm: free of foreign address {:#x}", addr);
            panic!("pmm: invalid free");
        }
        if let Some(page) = (first..first + count).find(|&p| !self.is_used(p)) {
            log::error!(
                "pmm: double free of page {:#x}",
                self.base + ((page as u64) << PAGE_SHIFT)
            );
            panic!("pmm: double free");
        }
        (first..first + count).for_each(|p| self.set(p, false));
    }

    /// Number of pages not currently allocated.
    pub fn free_pages(&self) -> usize {
        (0..self.pages).filter(|&p| !self.is_used(p)).count()
    }

    pub fn total_pages(&self) -> usize {
        self.pages
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Whether page `page` (index within the pool) is allocated.
    pub fn is_used(&self, page: usize) -> bool {
        self.bitmap[page / WORD_BITS] & (1 << (page % WORD_BITS)) != 0
    }

    /// Raw bitmap words, one bit per page.
    pub fn bitmap(&self) -> &[u64] {
        &self.bitmap
    }

    fn set(&mut self, page: usize, used: bool) {
        let bit = 1u64 << (page % WORD_BITS);
        if used {
            self.bitmap[page / WORD_BITS] |= bit;
        } else {
            self.bitmap[page / WORD_BITS] &= !bit;
        }
    }
}

/// Fixed offset between physical memory and its kernel virtual alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMap {
    offset: u64,
}

impl LinearMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Physical addresses are their own virtual addresses (MMU off, host tests).
    pub const fn identity() -> Self {
        Self { offset: 0 }
    }

    pub const fn to_virt(&self, pa: PhysAddr) -> VirtAddr {
        pa.wrapping_add(self.offset)
    }

    pub const fn to_phys(&self, va: VirtAddr) -> PhysAddr {
        va.wrapping_sub(self.offset)
    }
}

/// Smallest order whose run covers `size` bytes.
pub const fn order_for(size: u64) -> u32 {
    let pages = size.div_ceil(PAGE_SIZE);
    if pages <= 1 {
        0
    } else {
        u64::BITS - (pages - 1).leading_zeros()
    }
}

/// Source of contiguous physical page runs.
pub trait FrameSource {
    fn alloc_pages(&self, order: u32) -> Option<PhysAddr>;

    fn free_pages(&self, pa: PhysAddr, order: u32);

    /// Mapping through which the kernel touches the pages it hands out.
    fn linear(&self) -> LinearMap;

    /// Allocates a run and clears it through the linear map.
    fn alloc_zeroed(&self, order: u32) -> Option<PhysAddr> {
        let pa = self.alloc_pages(order)?;
        // SAFETY: the run was just allocated and is reachable via the linear map.
        unsafe {
            core::ptr::write_bytes(self.page_ptr(pa), 0, (PAGE_SIZE << order) as usize);
        }
        Some(pa)
    }

    /// Kernel pointer to the first byte of physical page `pa`.
    fn page_ptr(&self, pa: PhysAddr) -> *mut u8 {
        self.linear().to_virt(pa) as *mut u8
    }
}

impl<T: FrameSource + ?Sized> FrameSource for &T {
    fn alloc_pages(&self, order: u32) -> Option<PhysAddr> {
        (**self).alloc_pages(order)
    }

    fn free_pages(&self, pa: PhysAddr, order: u32) {
        (**self).free_pages(pa, order)
    }

    fn linear(&self) -> LinearMap {
        (**self).linear()
    }
}

/// The shared page pool: a locked [`PageAllocator`] plus its linear map.
pub struct PagePool {
    inner: IrqSpinLock<PageAllocator>,
    linear: LinearMap,
}

impl PagePool {
    pub fn new(base: PhysAddr, pages: usize, linear: LinearMap) -> Self {
        log::info!(
            "pmm: page pool {:#x}..{:#x} ({} pages)",
            base,
            base + ((pages as u64) << PAGE_SHIFT),
            pages
        );
        Self {
            inner: IrqSpinLock::new(PageAllocator::new(base, pages)),
            linear,
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_pages()
    }

    /// Runs `f` with the allocator locked.
    pub fn with<R>(&self, f: impl FnOnce(&PageAllocator) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl FrameSource for PagePool {
    fn alloc_pages(&self, order: u32) -> Option<PhysAddr> {
        self.inner.lock().alloc(order)
    }

    fn free_pages(&self, pa: PhysAddr, order: u32) {
        self.inner.lock().free(pa, order)
    }

    fn linear(&self) -> LinearMap {
        self.linear
    }
}

/// Boot-time bump allocator used before the page pool exists.
pub struct BumpFrames {
    next: Cell<PhysAddr>,
    end: PhysAddr,
    linear: LinearMap,
}

impl BumpFrames {
    pub const fn new(start: PhysAddr, end: PhysAddr, linear: LinearMap) -> Self {
        Self {
            next: Cell::new(start),
            end,
            linear,
        }
    }

    /// Next unused address.
    pub fn watermark(&self) -> PhysAddr {
        self.next.get()
    }
}

impl FrameSource for BumpFrames {
    fn alloc_pages(&self, order: u32) -> Option<PhysAddr> {
        let pa = hal::align_up(self.next.get(), PAGE_SIZE);
        let end = pa.checked_add(PAGE_SIZE << order)?;
        if end > self.end {
            return None;
        }
        self.next.set(end);
        Some(pa)
    }

    fn free_pages(&self, pa: PhysAddr, _order: u32) {
        log::warn!("pmm: boot frame {:#x} leaked", pa);
    }

    fn linear(&self) -> LinearMap {
        self.linear
    }
}
