#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

pub mod irq;

/// Physical address type.
pub type PhysAddr = u64;

/// Virtual address type.
pub type VirtAddr = u64;

/// Root page table pointer for an address space.
pub type PagingRoot = PhysAddr;

/// Address space identifier installed alongside a page table root.
pub type Asid = u16;

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Common error codes used by kernel interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    InvalidArg,
    NoMem,
    NoPerm,
    NotFound,
    /// No free task slot.
    Again,
    NoSys,
    Fault,
    Interrupted,
}

impl Errno {
    /// Returns the conventional errno number.
    pub const fn code(self) -> isize {
        match self {
            Errno::NoPerm => 1,
            Errno::NotFound => 2,
            Errno::Interrupted => 4,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Fault => 14,
            Errno::InvalidArg => 22,
            Errno::NoSys => 38,
        }
    }

    /// Negative value handed back to user space in `x0`.
    pub const fn as_isize(self) -> isize {
        -self.code()
    }

    /// Inverse of [`Errno::code`].
    pub const fn from_code(code: isize) -> Option<Self> {
        match code {
            1 => Some(Errno::NoPerm),
            2 => Some(Errno::NotFound),
            4 => Some(Errno::Interrupted),
            11 => Some(Errno::Again),
            12 => Some(Errno::NoMem),
            14 => Some(Errno::Fault),
            22 => Some(Errno::InvalidArg),
            38 => Some(Errno::NoSys),
            _ => None,
        }
    }
}

bitflags! {
    /// Page table mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
        /// Strongly ordered device memory.
        const DEVICE = 1 << 4;
        /// Shared across address spaces (no nG bit).
        const GLOBAL = 1 << 5;
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Registers saved on exception entry, in the layout the vector code pushes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub orig_x0: u64,
    pub syscallno: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            orig_x0: 0,
            syscallno: 0,
        }
    }

    /// True when the exception was taken from EL0.
    pub const fn user_mode(&self) -> bool {
        self.pstate & 0xF == 0
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Callee-saved state swapped by a cooperative context switch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub sp: u64,
    pub pc: u64,
}

/// System call numbers shared by the kernel and user space.
pub mod syscall_nr {
    pub const FORK: u64 = 0;
    pub const BRK: u64 = 1;
    pub const EXIT: u64 = 2;
    pub const NANOSLEEP: u64 = 3;
    pub const PAUSE: u64 = 4;
    pub const READ: u64 = 5;
    pub const WRITE: u64 = 6;
    pub const MAX: u64 = 64;
}

/// `struct timespec` as passed to nanosleep.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// Architecture-specific address space operations.
pub trait PagingOps {
    /// Installs `root` as the user translation base, tagged with `asid`.
    fn switch_as(&self, root: PagingRoot, asid: Asid);

    /// Invalidates the cached translation of one page.
    fn flush_page(&self, asid: Asid, va: VirtAddr);

    /// Invalidates every cached translation tagged with `asid`.
    fn flush_asid(&self, asid: Asid);
}

/// Architecture-specific CPU operations used by the scheduler.
pub trait CpuOps {
    /// Index of the executing core.
    fn core_id(&self) -> usize;

    /// Saves the callee-saved registers into `prev` and resumes `next`.
    ///
    /// # Safety
    /// Both pointers must reference live contexts; `next` must describe a
    /// valid stack and resume address.
    unsafe fn switch_context(&self, prev: *mut Context, next: *const Context);

    /// Entry point of a new kernel thread (entry in x19, argument in x20).
    fn thread_trampoline(&self) -> u64;

    /// Entry point of a forked child (restores the trap frame at sp).
    fn fork_trampoline(&self) -> u64;
}

/// Monotonic tick counter driven by the platform timer.
pub trait TickSource {
    fn ticks(&self) -> u64;
}

/// Everything the scheduler needs from the machine.
pub trait Machine: CpuOps + PagingOps + TickSource {}

impl<T: CpuOps + PagingOps + TickSource> Machine for T {}
