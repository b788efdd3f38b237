#![no_std]

//! AArch64 primitives behind the `hal` seams.

pub mod context;
pub mod exception;
pub mod mmu;
pub mod psci;

use core::arch::asm;

use hal::{Asid, Context, CpuOps, PagingOps, PagingRoot, TickSource, VirtAddr};

pub use exception::{install_vectors, set_irq_handler, set_sync_handler, TrapHandler};

/// The executing core, with ticks supplied by the platform timer.
pub struct Cpu<T> {
    ticks: T,
}

impl<T: TickSource> Cpu<T> {
    pub const fn new(ticks: T) -> Self {
        Self { ticks }
    }
}

impl<T> CpuOps for Cpu<T> {
    fn core_id(&self) -> usize {
        core_id()
    }

    unsafe fn switch_context(&self, prev: *mut Context, next: *const Context) {
        // SAFETY: forwarded from the caller.
        unsafe { context::cpu_switch_to(prev, next) }
    }

    fn thread_trampoline(&self) -> u64 {
        context::thread_trampoline as usize as u64
    }

    fn fork_trampoline(&self) -> u64 {
        context::fork_trampoline as usize as u64
    }
}

impl<T> PagingOps for Cpu<T> {
    fn switch_as(&self, root: PagingRoot, asid: Asid) {
        mmu::set_ttbr0(root, asid);
    }

    fn flush_page(&self, asid: Asid, va: VirtAddr) {
        mmu::flush_page(asid, va);
    }

    fn flush_asid(&self, asid: Asid) {
        mmu::flush_asid(asid);
    }
}

impl<T: TickSource> TickSource for Cpu<T> {
    fn ticks(&self) -> u64 {
        self.ticks.ticks()
    }
}

/// Affinity level 0 of MPIDR_EL1.
#[inline]
pub fn core_id() -> usize {
    let mpidr: u64;
    unsafe {
        asm!("mrs {0}, mpidr_el1", out(reg) mpidr, options(nomem, nostack, preserves_flags));
    }
    (mpidr & 0xFF) as usize
}

/// Current exception level.
pub fn current_el() -> u64 {
    let el: u64;
    unsafe {
        asm!("mrs {0}, CurrentEL", out(reg) el, options(nomem, nostack, preserves_flags));
    }
    (el >> 2) & 3
}

/// Waits for an interrupt.
#[inline]
pub fn wait_for_interrupt() {
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Busy-loop using `wfe`.
pub fn halt_loop() -> ! {
    loop {
        unsafe {
            asm!("wfe", options(nomem, nostack, preserves_flags));
        }
    }
}
