//! Compile-time kernel configuration.

use hal::VirtAddr;

/// Number of schedulable task slots.
pub const MAX_TASKS: usize = 32;

/// Upper bound on cores the per-core tables are sized for.
pub const MAX_CPUS: usize = 4;

/// Kernel stack bytes per task slot.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Bytes kept for a task name, including padding.
pub const TASK_NAME_LEN: usize = 16;

/// Milliseconds per scheduler tick.
pub const TICK_MS: u64 = 10;

/// Ticks per second.
pub const HZ: u64 = 1000 / TICK_MS;

/// Highest address the program break may reach.
pub const MAX_BRK_ADDR: VirtAddr = 0x0C00_0000;

/// Base of the user stack VMA.
pub const USER_STACK_START: VirtAddr = 0x2000_0000;

/// Size of the user stack VMA.
pub const USER_STACK_SIZE: u64 = 0x80_0000;

/// User virtual base at which device pages are exposed.
pub const USER_DEVICE_MAP_START: VirtAddr = 0x1_0000_0000;

/// Virtual address bits translated by each half of the address space.
pub const VA_BITS: u32 = 39;

/// Base of the kernel linear map of physical memory.
pub const PAGE_OFFSET: VirtAddr = u64::MAX << (VA_BITS - 1);

/// Console input line buffer size.
pub const TTY_BUF_LEN: usize = 256;

/// Number of deferred-work vectors.
pub const MAX_SOFTIRQ: usize = 8;

/// Deferred-work vector running expired timers.
pub const SOFTIRQ_TIMER: usize = 0;
