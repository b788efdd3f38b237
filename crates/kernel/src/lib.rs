#![no_std]

extern crate alloc;

use arch_aarch64 as arch;
use platform_qemu_aarch64_virt as platform;

pub mod allocator;
pub mod console;
pub mod init;
pub mod smp;
pub mod trap;

use hal::PAGE_SIZE;
use kernel_core::config::{HZ, PAGE_OFFSET, SOFTIRQ_TIMER};
use kernel_core::{KernelStacks, LinearMap, PagePool, Scheduler, SoftIrq, Tty};
use spin::Once;

/// The machine the scheduler drives.
pub type Machine = arch::Cpu<platform::timer::Ticks>;

pub type KernelScheduler = Scheduler<Machine, &'static PagePool>;

static PAGES: Once<PagePool> = Once::new();
static SCHEDULER: Once<KernelScheduler> = Once::new();
static SOFTIRQ: Once<SoftIrq> = Once::new();

/// Console input shared by every reader.
pub static TTY: Tty = Tty::new();

#[repr(C, align(16))]
struct TaskStacks([u8; KernelStacks::region_len()]);

static mut TASK_STACKS: TaskStacks = TaskStacks([0; KernelStacks::region_len()]);

pub fn pages() -> &'static PagePool {
    match PAGES.get() {
        Some(pages) => pages,
        None => panic!("page pool used before init"),
    }
}

pub fn scheduler() -> &'static KernelScheduler {
    match SCHEDULER.get() {
        Some(sched) => sched,
        None => panic!("scheduler used before init"),
    }
}

pub fn softirq() -> &'static SoftIrq {
    match SOFTIRQ.get() {
        Some(softirq) => softirq,
        None => panic!("softirq used before init"),
    }
}

/// Kernel entry on the boot core, running in the linear map.
pub fn entry() -> ! {
    platform::set_mmio_offset(PAGE_OFFSET);
    platform::init();
    console::init_logger();
    kprintln!("kernel: boot core up at EL{}", arch::current_el());
    arch::install_vectors();

    allocator::init_heap();
    let pages = PAGES.call_once(|| {
        let count = (platform::PAGE_POOL_SIZE / PAGE_SIZE) as usize;
        PagePool::new(platform::PAGE_POOL_START, count, LinearMap::new(PAGE_OFFSET))
    });
    let stacks = KernelStacks::new(core::ptr::addr_of!(TASK_STACKS) as usize);
    SCHEDULER.call_once(|| {
        Scheduler::new(
            arch::Cpu::new(platform::timer::Ticks),
            pages,
            platform::NUM_CPUS,
            stacks,
        )
    });
    let softirq = SOFTIRQ.call_once(SoftIrq::new);
    if let Err(err) = softirq.register(SOFTIRQ_TIMER, run_timer_softirq) {
        log::error!("kernel: timer softirq not registered: {:?}", err);
    }

    trap::init_boot_core();
    platform::timer::init(HZ);
    hal::irq::enable();

    smp::start_secondaries();
    init::spawn();
    idle_loop()
}

fn run_timer_softirq() {
    scheduler().run_timers();
}

/// Body of every core's idle task.
pub fn idle_loop() -> ! {
    let sched = scheduler();
    loop {
        sched.schedule();
        arch::wait_for_interrupt();
    }
}

/// First code of every new task.
#[no_mangle]
extern "C" fn arch_schedule_tail() {
    scheduler().finish_switch();
}

/// Return path of a kernel thread.
#[no_mangle]
extern "C" fn arch_thread_exit(ret: i64) -> ! {
    scheduler().do_exit(ret)
}
