#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod fault;
pub mod heap;
pub mod image;
pub mod mm;
pub mod mutex;
pub mod page_table;
pub mod pmm;
pub mod process;
pub mod protection;
pub mod scheduler;
pub mod smp;
pub mod softirq;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod tty;
pub mod wait;

#[cfg(test)]
mod testing;

pub use fault::{handle_user_fault, FaultOutcome, UserFault};
pub use hal::{Errno, PageFlags};
pub use heap::KernelHeap;
pub use image::{load_image, parse_image, ImageLayout};
pub use mm::{AddressSpace, Backing, PagesBlock, UserSpace, Vma, VmFlags};
pub use mutex::{SleepMutex, SleepMutexGuard};
pub use page_table::{KernelMap, KernelRegion, PageTable};
pub use pmm::{order_for, BumpFrames, FrameSource, LinearMap, PageAllocator, PagePool};
pub use process::{KernelStack, KernelStacks, Pid, Task, TaskRef, TaskState, ThreadEntry};
pub use protection::{is_user_address, validate_user_buffer, USER_VA_END};
pub use scheduler::{msecs_to_ticks, Scheduler, TaskInfo, UserEntry, UserImage, UserSegment};
pub use smp::{CpuState, CpuTopology, PerCpu};
pub use softirq::SoftIrq;
pub use sync::IrqSpinLock;
pub use syscall::{ConsoleSink, Syscall, Syscalls};
pub use timer::{TimerAction, TimerId, TimerList};
pub use tty::{LineBuffer, Tty};
pub use wait::{TaskControl, WaitQueue};
