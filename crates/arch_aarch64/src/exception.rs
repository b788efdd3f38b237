//! Exception vectors.
//!
//! Every taken exception pushes a [`TrapFrame`] on the kernel stack, calls
//! the registered Rust handler, and returns through `ret_from_exception`,
//! which forked children also use to reach user space for the first time.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicPtr, Ordering};

use hal::TrapFrame;

/// Handler for one exception kind. The flag tells whether the exception
/// was taken from EL0.
pub type TrapHandler = fn(&mut TrapFrame, bool);

static SYNC_HANDLER: AtomicPtr<()> = AtomicPtr::new(unhandled as *mut ());
static IRQ_HANDLER: AtomicPtr<()> = AtomicPtr::new(unhandled as *mut ());

pub fn set_sync_handler(handler: TrapHandler) {
    SYNC_HANDLER.store(handler as *mut (), Ordering::Release);
}

pub fn set_irq_handler(handler: TrapHandler) {
    IRQ_HANDLER.store(handler as *mut (), Ordering::Release);
}

fn load(slot: &AtomicPtr<()>) -> TrapHandler {
    let ptr = slot.load(Ordering::Acquire);
    // SAFETY: only `TrapHandler` values are ever stored.
    unsafe { core::mem::transmute::<*mut (), TrapHandler>(ptr) }
}

fn unhandled(frame: &mut TrapFrame, from_user: bool) {
    panic!(
        "unhandled exception: pc={:#x} pstate={:#x} user={}",
        frame.pc, frame.pstate, from_user
    );
}

#[no_mangle]
extern "C" fn el1_sync(frame: &mut TrapFrame) {
    load(&SYNC_HANDLER)(frame, false);
}

#[no_mangle]
extern "C" fn el1_irq(frame: &mut TrapFrame) {
    load(&IRQ_HANDLER)(frame, false);
}

#[no_mangle]
extern "C" fn el0_sync(frame: &mut TrapFrame) {
    load(&SYNC_HANDLER)(frame, true);
}

#[no_mangle]
extern "C" fn el0_irq(frame: &mut TrapFrame) {
    load(&IRQ_HANDLER)(frame, true);
}

#[no_mangle]
extern "C" fn bad_vector(frame: &mut TrapFrame) {
    panic!("unexpected exception vector: pc={:#x} pstate={:#x}", frame.pc, frame.pstate);
}

/// Saves the 288-byte frame and calls `$handler`; fits one 128-byte slot.
macro_rules! vector_entry {
    ($handler:literal) => {
        concat!(
            ".balign 128\n",
            "sub sp, sp, #288\n",
            "stp x0, x1, [sp, #0]\n",
            "stp x2, x3, [sp, #16]\n",
            "stp x4, x5, [sp, #32]\n",
            "stp x6, x7, [sp, #48]\n",
            "stp x8, x9, [sp, #64]\n",
            "stp x10, x11, [sp, #80]\n",
            "stp x12, x13, [sp, #96]\n",
            "stp x14, x15, [sp, #112]\n",
            "stp x16, x17, [sp, #128]\n",
            "stp x18, x19, [sp, #144]\n",
            "stp x20, x21, [sp, #160]\n",
            "stp x22, x23, [sp, #176]\n",
            "stp x24, x25, [sp, #192]\n",
            "stp x26, x27, [sp, #208]\n",
            "stp x28, x29, [sp, #224]\n",
            "str x30, [sp, #240]\n",
            "mrs x1, sp_el0\n",
            "mrs x2, elr_el1\n",
            "mrs x3, spsr_el1\n",
            "stp x1, x2, [sp, #248]\n",
            "stp x3, x0, [sp, #264]\n",
            "str x8, [sp, #280]\n",
            "mov x0, sp\n",
            "bl ", $handler, "\n",
            "b ret_from_exception\n",
        )
    };
}

global_asm!(
    ".section .text.vectors, \"ax\"",
    ".balign 2048",
    ".global exception_vectors",
    "exception_vectors:",
    // EL1 with SP_EL0
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    // EL1 with SP_EL1
    vector_entry!("el1_sync"),
    vector_entry!("el1_irq"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    // EL0, AArch64
    vector_entry!("el0_sync"),
    vector_entry!("el0_irq"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    // EL0, AArch32
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    vector_entry!("bad_vector"),
    "",
    ".global ret_from_exception",
    "ret_from_exception:",
    "ldp x1, x2, [sp, #248]",
    "ldr x3, [sp, #264]",
    "msr sp_el0, x1",
    "msr elr_el1, x2",
    "msr spsr_el1, x3",
    "ldp x0, x1, [sp, #0]",
    "ldp x2, x3, [sp, #16]",
    "ldp x4, x5, [sp, #32]",
    "ldp x6, x7, [sp, #48]",
    "ldp x8, x9, [sp, #64]",
    "ldp x10, x11, [sp, #80]",
    "ldp x12, x13, [sp, #96]",
    "ldp x14, x15, [sp, #112]",
    "ldp x16, x17, [sp, #128]",
    "ldp x18, x19, [sp, #144]",
    "ldp x20, x21, [sp, #160]",
    "ldp x22, x23, [sp, #176]",
    "ldp x24, x25, [sp, #192]",
    "ldp x26, x27, [sp, #208]",
    "ldp x28, x29, [sp, #224]",
    "ldr x30, [sp, #240]",
    "add sp, sp, #288",
    "eret",
);

extern "C" {
    static exception_vectors: u8;
}

/// Points VBAR_EL1 at the vector table.
pub fn install_vectors() {
    // SAFETY: only the address of the table is taken.
    let base = unsafe { core::ptr::addr_of!(exception_vectors) as u64 };
    unsafe {
        asm!("msr vbar_el1, {0}", "isb", in(reg) base, options(nostack, preserves_flags));
    }
}

/// Exception syndrome and fault address of the exception being handled.
pub fn syndrome() -> (u64, u64) {
    let (esr, far): (u64, u64);
    unsafe {
        asm!(
            "mrs {0}, esr_el1",
            "mrs {1}, far_el1",
            out(reg) esr,
            out(reg) far,
            options(nomem, nostack, preserves_flags)
        );
    }
    (esr, far)
}
