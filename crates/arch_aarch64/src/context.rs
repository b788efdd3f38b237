//! Context switch and task entry trampolines.
//!
//! The kernel provides two symbols used here:
//! `arch_schedule_tail()`, run first by every newly started task, and
//! `arch_thread_exit(ret: i64) -> !`, run when a kernel thread returns.

use core::arch::global_asm;

use hal::Context;

global_asm!(
    r#"
    .section .text.context, "ax"

    .global cpu_switch_to
cpu_switch_to:
    mov x10, sp
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x10, [x0, #80]
    str x30, [x0, #96]
    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x10, [x1, #80]
    ldr x30, [x1, #96]
    mov sp, x10
    ret

    .global thread_trampoline
thread_trampoline:
    bl arch_schedule_tail
    msr daifclr, #2
    mov x0, x20
    blr x19
    bl arch_thread_exit
1:  b 1b

    .global fork_trampoline
fork_trampoline:
    bl arch_schedule_tail
    b ret_from_exception

    .global enter_user
enter_user:
    msr elr_el1, x0
    msr sp_el0, x1
    msr spsr_el1, xzr
    mov x0, xzr
    mov x1, xzr
    mov x2, xzr
    mov x3, xzr
    mov x4, xzr
    mov x5, xzr
    mov x6, xzr
    mov x7, xzr
    mov x8, xzr
    mov x29, xzr
    mov x30, xzr
    eret
"#
);

extern "C" {
    /// Saves callee-saved registers into `prev` and resumes `next`.
    pub fn cpu_switch_to(prev: *mut Context, next: *const Context);
    /// First code of a kernel thread: entry in x19, argument in x20.
    pub fn thread_trampoline();
    /// First code of a forked child: the trap frame sits at sp.
    pub fn fork_trampoline();
    /// Drops to EL0 at `pc` with the user stack at `sp`.
    pub fn enter_user(pc: u64, sp: u64) -> !;
}
