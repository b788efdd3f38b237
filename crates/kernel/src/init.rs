//! The first kernel threads: housekeeping, self-tests, and the user init
//! process.

use alloc::vec::Vec;

use hal::PAGE_SIZE;
use kernel_core::config::HZ;
use kernel_core::{load_image, FrameSource, SleepMutex, ThreadEntry, TimerAction};

use crate::allocator::{heap_in_use, heap_verify};
use crate::platform::{self, timer};
use crate::{arch, pages, scheduler, smp};

/// Flat user init binary; empty when none was supplied at build time.
static USER_IMAGE: &[u8] = include_bytes!(env!("USER_INIT_IMAGE"));

static TEST_MUTEX: SleepMutex<u64> = SleepMutex::new(0);

const MUTEX_ROUNDS: u64 = 100;
const ALLOC_ROUNDS: usize = 10;
const ALLOC_BLOCKS: usize = 64;

pub fn spawn() {
    let threads: [(&str, ThreadEntry, u64); 6] = [
        ("kinit", kernel_init, 0),
        ("timer_test", timer_test, 0),
        ("mutex_a", mutex_test, 0),
        ("mutex_b", mutex_test, 1),
        ("alloc_test", alloc_test, 0),
        ("init", user_init, 0),
    ];
    let sched = scheduler();
    for (name, entry, arg) in threads {
        if let Err(err) = sched.kernel_thread(name, entry, arg) {
            log::error!("init: cannot start {}: {:?}", name, err);
        }
    }
}

extern "C" fn kernel_init(_arg: u64) -> i64 {
    let sched = scheduler();
    sched.msleep(100);
    log::info!("init: {} cores online", smp::cpu_online());
    loop {
        sched.msleep(1000);
        if !heap_verify() {
            log::error!("init: heap bookkeeping is inconsistent");
        }
    }
}

fn arm_periodic(count: usize) {
    let expires = timer::ticks() + HZ;
    if let Err(err) = scheduler()
        .timers()
        .add(expires, TimerAction::Call(periodic_tick, count))
    {
        log::warn!("timer: cannot rearm: {:?}", err);
    }
}

fn periodic_tick(count: usize) {
    log::debug!("timer: periodic #{} at tick {}", count, timer::ticks());
    arm_periodic(count + 1);
}

extern "C" fn timer_test(_arg: u64) -> i64 {
    arm_periodic(0);
    0
}

extern "C" fn mutex_test(id: u64) -> i64 {
    let sched = scheduler();
    for _ in 0..MUTEX_ROUNDS {
        {
            let mut count = TEST_MUTEX.lock(sched);
            *count += 1;
            log::debug!("mutex: thread {} holds count {}", id, *count);
            sched.msleep(10);
        }
        sched.msleep(10);
    }
    log::info!("mutex: thread {} done", id);
    0
}

/// Linear congruential generator for test sizes.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

fn heap_round(rng: &mut Lcg) -> bool {
    let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(ALLOC_BLOCKS);
    for index in 0..ALLOC_BLOCKS {
        let len = rng.next(4096) + 1;
        blocks.push(alloc::vec![index as u8; len]);
    }
    let intact = blocks
        .iter()
        .enumerate()
        .all(|(index, block)| block.iter().all(|&byte| byte == index as u8));
    let mut index = 0;
    blocks.retain(|_| {
        index += 1;
        index % 2 == 0
    });
    drop(blocks);
    intact && heap_verify()
}

fn page_round(rng: &mut Lcg) -> bool {
    let pool = pages();
    let before = pool.free_count();
    let mut runs = Vec::new();
    for _ in 0..16 {
        let order = rng.next(4) as u32;
        let Some(pa) = pool.alloc_pages(order) else {
            break;
        };
        // SAFETY: the run was just allocated and is mapped by the linear map.
        unsafe {
            core::ptr::write_bytes(pool.page_ptr(pa), order as u8 + 1, (PAGE_SIZE << order) as usize);
        }
        runs.push((pa, order));
    }
    let intact = runs.iter().all(|&(pa, order)| {
        let len = (PAGE_SIZE << order) as usize;
        // SAFETY: see above; the run is still owned here.
        let bytes = unsafe { core::slice::from_raw_parts(pool.page_ptr(pa), len) };
        bytes.iter().all(|&byte| byte == order as u8 + 1)
    });
    for (pa, order) in runs {
        pool.free_pages(pa, order);
    }
    intact && pool.free_count() == before
}

extern "C" fn alloc_test(_arg: u64) -> i64 {
    let baseline = heap_in_use();
    let mut rng = Lcg(0x2545_F491_4F6C_DD1D);
    for round in 0..ALLOC_ROUNDS {
        if !heap_round(&mut rng) || !page_round(&mut rng) {
            log::error!("alloc_test: round {} failed", round);
            return -1;
        }
        scheduler().msleep(10);
    }
    log::info!(
        "alloc_test: {} rounds ok, heap in use {} (baseline {})",
        ALLOC_ROUNDS,
        heap_in_use(),
        baseline
    );
    0
}

extern "C" fn user_init(_arg: u64) -> i64 {
    if USER_IMAGE.is_empty() {
        log::warn!("init: no user image linked in");
        return -1;
    }
    let sched = scheduler();
    let image = match load_image(sched.frames(), USER_IMAGE, Some(platform::UART_BASE)) {
        Ok(image) => image,
        Err(err) => {
            log::error!("init: bad user image: {:?}", err);
            return -1;
        }
    };
    match sched.setup_user_space(&image) {
        Ok(entry) => {
            log::info!("init: entering user space at {:#x}", entry.pc);
            hal::irq::disable();
            // SAFETY: the address space holding `entry` was just installed.
            unsafe { arch::context::enter_user(entry.pc, entry.sp) }
        }
        Err(err) => {
            log::error!("init: user space setup failed: {:?}", err);
            -1
        }
    }
}
