//! EL1 physical generic timer and the global tick count.

use core::sync::atomic::{AtomicU64, Ordering};

use hal::TickSource;

/// Counter frequency assumed when CNTFRQ_EL0 reads zero.
pub const FALLBACK_FREQ: u64 = 62_500_000;

static TICKS: AtomicU64 = AtomicU64::new(0);
static INTERVAL: AtomicU64 = AtomicU64::new(FALLBACK_FREQ / 100);

/// The global tick counter, advanced by core 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ticks;

impl TickSource for Ticks {
    fn ticks(&self) -> u64 {
        ticks()
    }
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Counter cycles per tick at `hz` ticks per second.
pub const fn interval_for(freq: u64, hz: u64) -> u64 {
    let freq = if freq == 0 { FALLBACK_FREQ } else { freq };
    freq / hz
}

/// Starts the calling core's timer at `hz` interrupts per second.
pub fn init(hz: u64) {
    let interval = interval_for(counter_frequency(), hz);
    INTERVAL.store(interval, Ordering::Relaxed);
    arm(interval);
}

/// Rearms the timer. Core 0 also advances the global tick.
pub fn on_interrupt(core: usize) -> u64 {
    arm(INTERVAL.load(Ordering::Relaxed));
    if core == 0 {
        TICKS.fetch_add(1, Ordering::AcqRel) + 1
    } else {
        TICKS.load(Ordering::Acquire)
    }
}

#[cfg(target_arch = "aarch64")]
fn counter_frequency() -> u64 {
    let freq: u64;
    unsafe {
        core::arch::asm!("mrs {0}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq
}

#[cfg(not(target_arch = "aarch64"))]
fn counter_frequency() -> u64 {
    0
}

#[cfg(target_arch = "aarch64")]
fn arm(interval: u64) {
    unsafe {
        core::arch::asm!(
            "msr cntp_tval_el0, {0}",
            "msr cntp_ctl_el0, {1}",
            in(reg) interval,
            in(reg) 1u64,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn arm(_interval: u64) {}
