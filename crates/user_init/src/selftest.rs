//! Checks the init program runs in forked children.

use hal::PAGE_SIZE;

use crate::heap::{BreakSource, Malloc, Sbrk};

/// Largest `sbrk` step tried by [`sbrk_cycle`].
pub const SBRK_SPAN: usize = PAGE_SIZE as usize * 20;
const SBRK_STEP: usize = 113;

/// Live blocks per [`malloc_round`].
pub const MALLOC_BLOCKS: usize = 32;
const MALLOC_MAX: usize = 2048;

/// Kernel text, as seen from user space.
pub const KERNEL_ADDR: usize = 0xFFFF_FFC0_4008_0000;

/// Grows the break by increasing steps, fills the new bytes and shrinks it
/// back. Returns the first increment whose round trip failed.
pub fn sbrk_cycle<B: BreakSource>(sbrk: &mut Sbrk<B>) -> Result<(), usize> {
    for increment in (0..SBRK_SPAN).step_by(SBRK_STEP) {
        let delta = increment as isize;
        let old = sbrk.adjust(delta).ok_or(increment)?;
        if sbrk.current() != old + increment {
            return Err(increment);
        }
        // SAFETY: `[old, old + increment)` lies below the break just set.
        unsafe { core::ptr::write_bytes(old as *mut u8, 0x5a, increment) };
        let grown = sbrk.adjust(-delta).ok_or(increment)?;
        if sbrk.current() != grown - increment {
            return Err(increment);
        }
    }
    Ok(())
}

/// Small deterministic generator for block sizes.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn below(&mut self, bound: usize) -> usize {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x % bound as u64) as usize
    }
}

/// Outcome of one stress round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    Passed,
    /// The heap ran out before every block was placed.
    Exhausted,
    Corrupted,
}

/// Allocates blocks of random sizes, tags each with its index, checks the
/// tags and frees everything again.
pub fn malloc_round<B: BreakSource>(heap: &mut Malloc<B>, rng: &mut XorShift) -> RoundResult {
    let mut blocks = [(core::ptr::null_mut::<u8>(), 0usize); MALLOC_BLOCKS];
    let mut placed = 0;
    for (index, slot) in blocks.iter_mut().enumerate() {
        let len = rng.below(MALLOC_MAX) + 1;
        let ptr = heap.malloc(len);
        if ptr.is_null() {
            break;
        }
        // SAFETY: `ptr` covers `len` freshly allocated bytes.
        unsafe { core::ptr::write_bytes(ptr, index as u8, len) };
        *slot = (ptr, len);
        placed += 1;
    }
    let intact = blocks[..placed].iter().enumerate().all(|(index, &(ptr, len))| {
        // SAFETY: the block is still allocated.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
        bytes.iter().all(|&b| b == index as u8)
    });
    for &(ptr, _) in blocks[..placed].iter().rev() {
        heap.free(ptr);
    }
    if !intact || !heap.verify() || heap.total_length() != 0 {
        RoundResult::Corrupted
    } else if placed < MALLOC_BLOCKS {
        RoundResult::Exhausted
    } else {
        RoundResult::Passed
    }
}

/// Recursive factorial; each level takes a stack frame.
#[inline(never)]
pub fn factorial(n: u64) -> u64 {
    if n == 0 {
        return 1;
    }
    core::hint::black_box(n).wrapping_mul(factorial(n - 1))
}

/// Shrinks the break below a touched range and touches it again. The
/// second access must fault.
pub fn sbrk_unmap<B: BreakSource>(sbrk: &mut Sbrk<B>) -> Option<usize> {
    let increment = 3 * PAGE_SIZE as usize;
    let old = sbrk.adjust(increment as isize)?;
    // SAFETY: the range was just added below the break.
    unsafe { core::ptr::write_bytes(old as *mut u8, 0x5a, increment) };
    sbrk.adjust(-(increment as isize))?;
    // SAFETY: deliberately touches pages that were just unmapped.
    unsafe { core::ptr::write_bytes(old as *mut u8, 0x5a, increment) };
    Some(old)
}

/// Loads from kernel memory. Must fault.
pub fn read_kernel() -> u64 {
    // SAFETY: deliberately invalid from EL0.
    unsafe { core::ptr::read_volatile(KERNEL_ADDR as *const u64) }
}

/// Branches into kernel text. Must fault.
pub fn exec_kernel() {
    // SAFETY: deliberately invalid from EL0.
    let target: extern "C" fn() = unsafe { core::mem::transmute(KERNEL_ADDR) };
    target();
}
