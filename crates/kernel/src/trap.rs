//! Exception and interrupt glue between the vectors and the core.

use core::sync::atomic::{AtomicBool, Ordering};

use hal::TrapFrame;
use kernel_core::config::SOFTIRQ_TIMER;
use kernel_core::fault::{exception_class, EC_SVC64};
use kernel_core::{handle_user_fault, FaultOutcome, Syscalls};

use crate::console::{self, Console};
use crate::platform::gic::{self, Trigger};
use crate::platform::{self, timer};
use crate::{arch, scheduler, softirq, TTY};

/// Ctrl-Y: the next key is a console command.
const MAGIC_KEY: u8 = 0x19;

static MAGIC_ARMED: AtomicBool = AtomicBool::new(false);

/// Distributor setup plus the per-core part for the boot core.
pub fn init_boot_core() {
    arch::set_sync_handler(handle_sync);
    arch::set_irq_handler(handle_irq);
    gic::init_distributor();
    gic::enable_irq(platform::IRQ_UART, Trigger::Level, 0x1);
    init_core();
}

/// Per-core interrupt setup: banked timer interrupt and CPU interface.
pub fn init_core() {
    gic::enable_irq(platform::IRQ_TIMER, Trigger::Edge, 0);
    gic::init_cpu_interface();
}

fn handle_sync(frame: &mut TrapFrame, from_user: bool) {
    let (esr, far) = arch::exception::syndrome();
    if !from_user {
        panic!(
            "kernel exception: esr={:#x} far={:#x} pc={:#x}",
            esr, far, frame.pc
        );
    }
    let sched = scheduler();
    if exception_class(esr) == EC_SVC64 {
        hal::irq::enable();
        Syscalls::new(sched, &TTY, &Console).dispatch(frame);
        hal::irq::disable();
        return;
    }
    match handle_user_fault(sched, esr, far) {
        FaultOutcome::Resolved => {}
        FaultOutcome::Kill => sched.do_exit(-1),
    }
}

fn handle_irq(_frame: &mut TrapFrame, from_user: bool) {
    let core = arch::core_id();
    let irq = gic::acknowledge();
    if irq >= gic::SPURIOUS {
        return;
    }
    let mut preempt = false;
    match irq {
        platform::IRQ_TIMER => {
            timer::on_interrupt(core);
            softirq().raise(core, SOFTIRQ_TIMER);
            preempt = scheduler().on_tick(from_user);
        }
        platform::IRQ_UART => {
            while let Some(byte) = platform::uart_take_rx() {
                receive_byte(byte);
            }
        }
        other => log::warn!("irq: unexpected interrupt {}", other),
    }
    gic::end_of_interrupt(irq);
    softirq().run(core);
    if preempt {
        scheduler().schedule();
    }
}

fn receive_byte(byte: u8) {
    if MAGIC_ARMED.swap(false, Ordering::AcqRel) && run_magic_key(byte) {
        return;
    }
    if byte == MAGIC_KEY {
        MAGIC_ARMED.store(true, Ordering::Release);
        return;
    }
    TTY.receive(scheduler(), byte, console::write_bytes);
}

fn run_magic_key(byte: u8) -> bool {
    match byte {
        b'p' => scheduler().dump_tasks(),
        b'g' => log::info!(
            "tick={} heap in use={} pages free={}",
            timer::ticks(),
            crate::allocator::heap_in_use(),
            crate::pages().free_count()
        ),
        _ => return false,
    }
    true
}
