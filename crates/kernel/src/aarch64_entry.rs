//! Boot path from the firmware hand-off to `kernel::entry`.
//!
//! Every core enters `_start` at its physical address with the MMU off.
//! Core 0 clears bss and builds the boot tables; the others reuse them.

use core::arch::global_asm;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use arch_aarch64 as arch;
use hal::{PageFlags, PAGE_SIZE};
use kernel_core::config::PAGE_OFFSET;
use kernel_core::{BumpFrames, KernelMap, KernelRegion, LinearMap};
use platform_qemu_aarch64_virt as platform;

const BOOT_STACK_SIZE: usize = 16 * 1024;
const BOOT_TABLE_PAGES: usize = 8;

#[repr(C, align(16))]
struct BootStacks([u8; BOOT_STACK_SIZE * platform::NUM_CPUS]);

#[repr(C, align(4096))]
struct BootTables([u8; PAGE_SIZE as usize * BOOT_TABLE_PAGES]);

static mut BOOT_STACKS: BootStacks = BootStacks([0; BOOT_STACK_SIZE * platform::NUM_CPUS]);
static mut BOOT_TABLES: BootTables = BootTables([0; PAGE_SIZE as usize * BOOT_TABLE_PAGES]);

/// Identity and linear roots, published by core 0 for the secondaries.
static BOOT_ROOTS: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];

global_asm!(
    r#"
    .section .text._start, "ax"
    .global _start
_start:
    msr daifset, #0xf
    mrs x19, mpidr_el1
    and x19, x19, #0xff

    mrs x1, CurrentEL
    lsr x1, x1, #2
    cmp x1, #2
    b.ne 1f

    mov x1, #(1 << 31)
    orr x1, x1, #(1 << 1)
    msr hcr_el2, x1
    mov x1, #3
    msr cnthctl_el2, x1
    msr cntvoff_el2, xzr
    mov x1, #0x3c5
    msr spsr_el2, x1
    adr x1, 1f
    msr elr_el2, x1
    eret

1:
    adrp x1, {stacks}
    add x1, x1, :lo12:{stacks}
    add x2, x19, #1
    ldr x3, ={stack_size}
    madd x1, x2, x3, x1
    mov sp, x1
    cbnz x19, 3f

    adrp x1, __bss_start
    add x1, x1, :lo12:__bss_start
    adrp x2, __bss_end
    add x2, x2, :lo12:__bss_end
2:
    cmp x1, x2
    b.hs 4f
    str xzr, [x1], #8
    b 2b
4:
    bl {early_map}
    b 5f
3:
    bl {secondary_mmu_on}
5:
    ldr x1, ={offset}
    add sp, sp, x1
    ldr x2, =6f
    br x2
6:
    mov x0, x19
    bl {entry}
    b .
    .ltorg
"#,
    stacks = sym BOOT_STACKS,
    stack_size = const BOOT_STACK_SIZE,
    early_map = sym early_map,
    secondary_mmu_on = sym secondary_mmu_on,
    offset = const PAGE_OFFSET,
    entry = sym aarch64_entry,
);

/// Low device window and the RAM the kernel runs from.
fn kernel_regions() -> [KernelRegion; 2] {
    [
        KernelRegion {
            base: platform::DEVICE_START,
            size: platform::DEVICE_SIZE,
            flags: PageFlags::READ | PageFlags::WRITE | PageFlags::DEVICE | PageFlags::GLOBAL,
        },
        KernelRegion {
            base: platform::RAM_START,
            size: platform::RAM_SIZE,
            flags: PageFlags::READ | PageFlags::WRITE | PageFlags::EXECUTE | PageFlags::GLOBAL,
        },
    ]
}

/// Builds the boot tables and turns the MMU on. Runs physical, core 0 only.
extern "C" fn early_map() {
    let base = addr_of_mut!(BOOT_TABLES) as u64;
    let frames = BumpFrames::new(
        base,
        base + PAGE_SIZE * BOOT_TABLE_PAGES as u64,
        LinearMap::identity(),
    );
    let regions = kernel_regions();
    let map = KernelMap::new(&regions);
    let (identity, linear) = match (map.build(&frames, 0), map.build(&frames, PAGE_OFFSET)) {
        (Ok(identity), Ok(linear)) => (identity.root(), linear.root()),
        _ => arch::halt_loop(),
    };
    BOOT_ROOTS[0].store(identity, Ordering::Release);
    BOOT_ROOTS[1].store(linear, Ordering::Release);
    // SAFETY: both trees map the RAM holding this code and the boot stacks.
    unsafe { arch::mmu::enable(identity, linear) }
}

/// Turns the MMU on with the tables core 0 built.
extern "C" fn secondary_mmu_on() {
    let identity = BOOT_ROOTS[0].load(Ordering::Acquire);
    let linear = BOOT_ROOTS[1].load(Ordering::Acquire);
    // SAFETY: see `early_map`.
    unsafe { arch::mmu::enable(identity, linear) }
}

extern "C" fn aarch64_entry(core: u64) -> ! {
    if core == 0 {
        kernel::entry()
    } else {
        kernel::smp::secondary_entry(core as usize)
    }
}
