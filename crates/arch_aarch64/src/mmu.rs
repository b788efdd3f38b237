//! Translation registers and TLB maintenance.

use core::arch::asm;

use hal::{Asid, PhysAddr, VirtAddr};

/// Attribute 0 device nGnRnE, 1 nGnRE, 2 GRE, 3 normal non-cacheable,
/// 4 normal write-back.
pub const MAIR_VALUE: u64 = 0x04 << 8 | 0x0C << 16 | 0x44 << 24 | 0xFF << 32;

const TCR_T0SZ: u64 = 64 - 39;
const TCR_T1SZ: u64 = (64 - 39) << 16;
const TCR_IRGN_WBWA: u64 = 1 << 8 | 1 << 24;
const TCR_ORGN_WBWA: u64 = 1 << 10 | 1 << 26;
const TCR_SHARED_INNER: u64 = 3 << 12 | 3 << 28;
const TCR_TG1_4K: u64 = 2 << 30;
const TCR_IPS_40BIT: u64 = 2 << 32;
const TCR_AS_16BIT: u64 = 1 << 36;

/// 39-bit halves, 4 KiB granule, 16-bit ASIDs taken from TTBR0.
pub const TCR_VALUE: u64 = TCR_T0SZ
    | TCR_T1SZ
    | TCR_IRGN_WBWA
    | TCR_ORGN_WBWA
    | TCR_SHARED_INNER
    | TCR_TG1_4K
    | TCR_IPS_40BIT
    | TCR_AS_16BIT;

const SCTLR_M: u64 = 1 << 0;
const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;

const ASID_SHIFT: u32 = 48;

/// TTBR value for `root` tagged with `asid`.
pub const fn ttbr(root: PhysAddr, asid: Asid) -> u64 {
    (asid as u64) << ASID_SHIFT | root
}

/// Programs the translation registers and turns the MMU on.
///
/// # Safety
/// Both tables must map the code executing this function and its stack.
pub unsafe fn enable(ttbr0: PhysAddr, ttbr1: PhysAddr) {
    unsafe {
        asm!(
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "msr ttbr0_el1, {ttbr0}",
            "msr ttbr1_el1, {ttbr1}",
            "isb",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            "mrs {tmp}, sctlr_el1",
            "orr {tmp}, {tmp}, {bits}",
            "msr sctlr_el1, {tmp}",
            "isb",
            mair = in(reg) MAIR_VALUE,
            tcr = in(reg) TCR_VALUE,
            ttbr0 = in(reg) ttbr0,
            ttbr1 = in(reg) ttbr1,
            bits = in(reg) SCTLR_M | SCTLR_C | SCTLR_I,
            tmp = out(reg) _,
            options(nostack)
        );
    }
}

/// Installs a user translation table.
pub fn set_ttbr0(root: PhysAddr, asid: Asid) {
    unsafe {
        asm!("msr ttbr0_el1, {0}", "isb", in(reg) ttbr(root, asid), options(nostack, preserves_flags));
    }
}

pub fn flush_page(asid: Asid, va: VirtAddr) {
    let operand = (asid as u64) << ASID_SHIFT | (va >> 12) & ((1 << 44) - 1);
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vae1is, {0}",
            "dsb ish",
            "isb",
            in(reg) operand,
            options(nostack, preserves_flags)
        );
    }
}

pub fn flush_asid(asid: Asid) {
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi aside1is, {0}",
            "dsb ish",
            "isb",
            in(reg) (asid as u64) << ASID_SHIFT,
            options(nostack, preserves_flags)
        );
    }
}

pub fn flush_all() {
    unsafe {
        asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack, preserves_flags));
    }
}
