//! First-fit block allocator with in-band headers.
//!
//! The pool is one contiguous span of memory carved into blocks. Every block
//! starts with a [`BlockHeader`] and ends with a [`BlockTail`] pointing back
//! at the header, so neighbours are reachable in both directions and freed
//! blocks coalesce with adjacent free blocks. When no block fits, the pool
//! asks its [`PoolGrowth`] for as many bytes as it already spans and retries.
//!
//! The same allocator backs the kernel heap (growth over a reserved physical
//! range) and the user-space `malloc` (growth through `brk`).

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Tag stored in every block header.
pub const MEM_BLK_MAGIC: u32 = 0xABCD_1234;

/// Alignment of every user pointer and block length.
pub const ALIGN: usize = 8;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    in_use: u32,
    blk_len: usize,
    user_start: *mut u8,
    user_len: usize,
}

#[repr(C)]
struct BlockTail {
    header: *mut BlockHeader,
}

/// Bytes taken by a block header.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes taken by a block tail.
pub const TAIL_SIZE: usize = size_of::<BlockTail>();

/// Smallest block the pool can hold.
pub const MIN_BLOCK: usize = HEADER_SIZE + TAIL_SIZE;

const _: () = assert!(HEADER_SIZE % ALIGN == 0);

/// Source of additional pool memory.
pub trait PoolGrowth {
    /// Extends the backing span by `increment` bytes and returns the start of
    /// the new bytes, or `None` once the backing is exhausted.
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>>;
}

/// Growth over a fixed, pre-reserved range.
#[derive(Debug)]
pub struct BumpGrowth {
    next: usize,
    end: usize,
}

impl BumpGrowth {
    /// Hands out `[start, start + limit)` front to back.
    pub const fn new(start: usize, limit: usize) -> Self {
        Self {
            next: start,
            end: start + limit,
        }
    }

    /// Bytes not yet handed out.
    pub const fn remaining(&self) -> usize {
        self.end - self.next
    }
}

impl PoolGrowth for BumpGrowth {
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>> {
        if increment > self.remaining() {
            return None;
        }
        let start = self.next;
        self.next += increment;
        NonNull::new(start as *mut u8)
    }
}

/// Snapshot of one block, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub len: usize,
    pub in_use: bool,
    pub user_len: usize,
}

/// A growable pool of headered blocks.
pub struct MemPool<G> {
    growth: G,
    start: *mut u8,
    end: *mut u8,
    total_length: usize,
}

// The pool exclusively owns the span it was given.
unsafe impl<G: Send> Send for MemPool<G> {}

const fn align_len(size: usize) -> Option<usize> {
    match size.checked_add(ALIGN - 1) {
        Some(v) => Some(v & !(ALIGN - 1)),
        None => None,
    }
}

impl<G: PoolGrowth> MemPool<G> {
    /// Creates a pool whose first free block spans `initial_len` bytes
    /// (at least one header and tail).
    pub fn new(mut growth: G, initial_len: usize) -> Option<Self> {
        let len = align_len(initial_len.max(MIN_BLOCK))?;
        let start = growth.sbrk(len)?.as_ptr();
        if start as usize % ALIGN != 0 {
            log::error!("mem_pool: unaligned pool start {:p}", start);
            return None;
        }
        unsafe { format_free(start, len) };
        Some(Self {
            growth,
            start,
            end: unsafe { start.add(len) },
            total_length: 0,
        })
    }

    /// Allocates `size` bytes, 8-byte aligned. `size == 0` yields `None`.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let aligned = align_len(size)?;
        let block = self.find_free(aligned)?;
        unsafe {
            self.mark(block, aligned);
            (*block).user_len = size;
            self.total_length += size;
            NonNull::new((*block).user_start)
        }
    }

    /// Releases a pointer returned by [`MemPool::alloc`].
    ///
    /// Null is ignored. A pointer whose block fails the magic or in-use check
    /// is reported and left alone. Returns true when a block was released.
    pub fn free(&mut self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let addr = ptr as usize;
        if addr < self.start as usize + HEADER_SIZE || addr >= self.end as usize {
            log::error!("invalid memory pointer to free: {:p}", ptr);
            return false;
        }
        let block = (addr - HEADER_SIZE) as *mut BlockHeader;
        unsafe {
            if (*block).magic != MEM_BLK_MAGIC {
                log::error!(
                    "block magic mismatch at {:p}: expected {:#x}, got {:#x}",
                    block,
                    MEM_BLK_MAGIC,
                    (*block).magic
                );
                log::error!("invalid memory pointer to free: {:p}", ptr);
                return false;
            }
            if (*block).in_use != 1 {
                log::error!("block at {:p} is not in use", block);
                log::error!("invalid memory pointer to free: {:p}", ptr);
                return false;
            }
            self.total_length -= (*block).user_len;
            (*block).in_use = 0;
            self.merge(block);
        }
        true
    }

    /// Returns the usable size of an allocated pointer.
    pub fn user_len(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        if addr < self.start as usize + HEADER_SIZE || addr >= self.end as usize {
            return None;
        }
        let block = (addr - HEADER_SIZE) as *const BlockHeader;
        unsafe {
            if (*block).magic == MEM_BLK_MAGIC && (*block).in_use == 1 {
                Some((*block).user_len)
            } else {
                None
            }
        }
    }

    /// Sum of the requested sizes of all live allocations.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Recomputes the live total by walking the pool; `None` if it disagrees
    /// with the running counter.
    pub fn checked_total_length(&self) -> Option<usize> {
        let walked: usize = self
            .blocks()
            .filter(|block| block.in_use)
            .map(|block| block.user_len)
            .sum();
        (walked == self.total_length).then_some(walked)
    }

    /// Current pool span in bytes.
    pub fn span(&self) -> usize {
        self.end as usize - self.start as usize
    }

    /// First byte of the pool.
    pub fn start(&self) -> *const u8 {
        self.start
    }

    /// Walks every block front to back.
    pub fn blocks(&self) -> Blocks<'_, G> {
        Blocks {
            pool: self,
            cursor: Some(self.start as *mut BlockHeader),
        }
    }

    fn find_free(&mut self, size: usize) -> Option<*mut BlockHeader> {
        loop {
            let mut cursor = Some(self.start as *mut BlockHeader);
            while let Some(block) = cursor {
                unsafe {
                    if (*block).in_use == 0 && (*block).blk_len - MIN_BLOCK >= size {
                        return Some(block);
                    }
                }
                cursor = self.next_block(block);
            }
            if !self.grow() {
                return None;
            }
        }
    }

    fn grow(&mut self) -> bool {
        let increment = self.span();
        let Some(fresh) = self.growth.sbrk(increment) else {
            log::debug!("mem_pool: growth of {} bytes refused", increment);
            return false;
        };
        if fresh.as_ptr() != self.end {
            log::error!(
                "mem_pool: growth returned {:p}, expected pool end {:p}",
                fresh,
                self.end
            );
            return false;
        }
        log::debug!("mem_pool: grew by {} bytes", increment);
        unsafe {
            self.end = self.end.add(increment);
            let block = format_free(fresh.as_ptr(), increment);
            self.merge(block);
        }
        true
    }

    unsafe fn mark(&mut self, block: *mut BlockHeader, size: usize) {
        if (*block).blk_len > MIN_BLOCK + size + MIN_BLOCK {
            let old_len = (*block).blk_len;
            let new_len = MIN_BLOCK + size;
            format_free(block as *mut u8, new_len);
            format_free((block as *mut u8).add(new_len), old_len - new_len);
        }
        (*block).in_use = 1;
        (*block).user_start = (block as *mut u8).add(HEADER_SIZE);
        (*block).user_len = size;
    }

    unsafe fn merge(&mut self, freed: *mut BlockHeader) {
        let mut first = freed;
        let mut cursor = Some(freed);
        while let Some(block) = cursor {
            if (*block).in_use != 0 {
                break;
            }
            first = block;
            cursor = self.prev_block(block);
        }

        let mut last = freed;
        let mut cursor = Some(freed);
        while let Some(block) = cursor {
            if (*block).in_use != 0 {
                break;
            }
            last = block;
            cursor = self.next_block(block);
        }

        let len = last as usize + (*last).blk_len - first as usize;
        format_free(first as *mut u8, len);
    }

    fn prev_block(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        let tail = (block as usize).checked_sub(TAIL_SIZE)?;
        if tail < self.start as usize {
            return None;
        }
        unsafe { Some((*(tail as *const BlockTail)).header) }
    }

    fn next_block(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        let next = block as usize + unsafe { (*block).blk_len };
        if next >= self.end as usize {
            None
        } else {
            Some(next as *mut BlockHeader)
        }
    }
}

unsafe fn format_free(at: *mut u8, len: usize) -> *mut BlockHeader {
    let header = at as *mut BlockHeader;
    header.write(BlockHeader {
        magic: MEM_BLK_MAGIC,
        in_use: 0,
        blk_len: len,
        user_start: ptr::null_mut(),
        user_len: 0,
    });
    let tail = at.add(len - TAIL_SIZE) as *mut BlockTail;
    tail.write(BlockTail { header });
    header
}

/// Iterator over the blocks of a pool.
pub struct Blocks<'a, G> {
    pool: &'a MemPool<G>,
    cursor: Option<*mut BlockHeader>,
}

impl<G: PoolGrowth> Iterator for Blocks<'_, G> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.cursor?;
        self.cursor = self.pool.next_block(block);
        unsafe {
            Some(BlockInfo {
                addr: block as usize,
                len: (*block).blk_len,
                in_use: (*block).in_use != 0,
                user_len: (*block).user_len,
            })
        }
    }
}
