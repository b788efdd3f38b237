//! Deferred work run on interrupt return.

use core::sync::atomic::{AtomicU32, Ordering};

use hal::Errno;

use crate::config::MAX_SOFTIRQ;
use crate::smp::PerCpu;
use crate::sync::IrqSpinLock;

pub type SoftIrqHandler = fn();

/// Per-core pending bits plus one handler table shared by all cores.
pub struct SoftIrq {
    handlers: IrqSpinLock<[Option<SoftIrqHandler>; MAX_SOFTIRQ]>,
    pending: PerCpu<AtomicU32>,
    nesting: PerCpu<AtomicU32>,
}

impl SoftIrq {
    pub fn new() -> Self {
        Self {
            handlers: IrqSpinLock::new([None; MAX_SOFTIRQ]),
            pending: PerCpu::new(|_| AtomicU32::new(0)),
            nesting: PerCpu::new(|_| AtomicU32::new(0)),
        }
    }

    pub fn register(&self, nr: usize, handler: SoftIrqHandler) -> Result<(), Errno> {
        let mut handlers = self.handlers.lock();
        let slot = handlers.get_mut(nr).ok_or_else(|| {
            log::error!("softirq: vector {} out of range", nr);
            Errno::InvalidArg
        })?;
        *slot = Some(handler);
        Ok(())
    }

    /// Marks vector `nr` pending on `core`.
    pub fn raise(&self, core: usize, nr: usize) {
        if nr >= MAX_SOFTIRQ {
            log::error!("softirq: raise of vector {} out of range", nr);
            return;
        }
        let _irq = IrqMask::new();
        self.pending.get(core).fetch_or(1 << nr, Ordering::AcqRel);
    }

    pub fn pending(&self, core: usize) -> u32 {
        self.pending.get(core).load(Ordering::Acquire)
    }

    /// Runs the handlers pending on `core`, lowest vector first. A nested call
    /// while this core is already running deferred work returns at once.
    pub fn run(&self, core: usize) -> usize {
        let nesting = self.nesting.get(core);
        if nesting.fetch_add(1, Ordering::AcqRel) != 0 {
            nesting.fetch_sub(1, Ordering::AcqRel);
            return 0;
        }
        let pending = {
            let _irq = IrqMask::new();
            self.pending.get(core).swap(0, Ordering::AcqRel)
        };
        let handlers = *self.handlers.lock();
        let mut ran = 0;
        for (nr, handler) in handlers.iter().enumerate() {
            if pending & (1 << nr) == 0 {
                continue;
            }
            match handler {
                Some(handler) => {
                    handler();
                    ran += 1;
                }
                None => log::warn!("softirq: vector {} has no handler", nr),
            }
        }
        nesting.fetch_sub(1, Ordering::AcqRel);
        ran
    }
}

impl Default for SoftIrq {
    fn default() -> Self {
        Self::new()
    }
}

struct IrqMask(u64);

impl IrqMask {
    fn new() -> Self {
        Self(hal::irq::save_and_disable())
    }
}

impl Drop for IrqMask {
    fn drop(&mut self) {
        hal::irq::restore(self.0);
    }
}
