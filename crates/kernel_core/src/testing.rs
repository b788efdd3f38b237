//! Host-side stand-ins for physical memory and the machine.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hal::{Asid, Context, CpuOps, PagingOps, PagingRoot, PhysAddr, TickSource, VirtAddr};
use spin::Mutex;

use crate::pmm::{LinearMap, PagePool};

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct Page([u8; 4096]);

/// Page-aligned host buffer managed by a [`PagePool`] with an identity map.
pub struct HostMemory {
    _pages: Vec<Page>,
    pub pool: PagePool,
}

impl HostMemory {
    pub fn new(pages: usize) -> Self {
        let mut backing = Vec::new();
        backing.resize(pages, Page([0; 4096]));
        let base = backing.as_mut_ptr() as PhysAddr;
        Self {
            _pages: backing,
            pool: PagePool::new(base, pages, LinearMap::identity()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    SwitchAs(PagingRoot, Asid),
    FlushPage(Asid, VirtAddr),
    FlushAsid(Asid),
    Switch { prev: usize, next: usize },
}

/// Machine that records what the scheduler asks of it.
pub struct MockMachine {
    pub core: AtomicUsize,
    pub ticks: AtomicU64,
    /// Ticks that pass during each context switch.
    pub ticks_per_switch: AtomicU64,
    pub events: Mutex<Vec<MachineEvent>>,
}

impl MockMachine {
    pub const THREAD_TRAMPOLINE: u64 = 0x1000;
    pub const FORK_TRAMPOLINE: u64 = 0x2000;

    pub fn new() -> Self {
        Self {
            core: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            ticks_per_switch: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_core(&self, core: usize) {
        self.core.store(core, Ordering::Relaxed);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CpuOps for MockMachine {
    fn core_id(&self) -> usize {
        self.core.load(Ordering::Relaxed)
    }

    unsafe fn switch_context(&self, prev: *mut Context, next: *const Context) {
        self.advance(self.ticks_per_switch.load(Ordering::Relaxed));
        self.events.lock().push(MachineEvent::Switch {
            prev: prev as usize,
            next: next as usize,
        });
    }

    fn thread_trampoline(&self) -> u64 {
        Self::THREAD_TRAMPOLINE
    }

    fn fork_trampoline(&self) -> u64 {
        Self::FORK_TRAMPOLINE
    }
}

impl PagingOps for MockMachine {
    fn switch_as(&self, root: PagingRoot, asid: Asid) {
        self.events.lock().push(MachineEvent::SwitchAs(root, asid));
    }

    fn flush_page(&self, asid: Asid, va: VirtAddr) {
        self.events.lock().push(MachineEvent::FlushPage(asid, va));
    }

    fn flush_asid(&self, asid: Asid) {
        self.events.lock().push(MachineEvent::FlushAsid(asid));
    }
}

impl TickSource for MockMachine {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
