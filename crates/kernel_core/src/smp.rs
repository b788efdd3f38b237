use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::MAX_CPUS;

/// CPU lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Offline,
    Online,
    Halted,
}

impl CpuState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CpuState::Online,
            2 => CpuState::Halted,
            _ => CpuState::Offline,
        }
    }

    const fn raw(self) -> u8 {
        match self {
            CpuState::Offline => 0,
            CpuState::Online => 1,
            CpuState::Halted => 2,
        }
    }
}

/// Errors from SMP topology operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    InvalidId,
}

/// Per-core lifecycle table, shared between cores.
#[derive(Debug)]
pub struct CpuTopology {
    total: usize,
    states: [AtomicU8; MAX_CPUS],
}

impl CpuTopology {
    /// Builds a topology with the boot core online.
    pub const fn new(count: usize) -> Self {
        let total = if count == 0 {
            1
        } else if count > MAX_CPUS {
            MAX_CPUS
        } else {
            count
        };
        Self {
            total,
            states: [
                AtomicU8::new(1),
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
            ],
        }
    }

    /// Returns total cores.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Returns the number of online cores.
    pub fn online(&self) -> usize {
        (0..self.total)
            .filter(|&id| self.state(id) == Some(CpuState::Online))
            .count()
    }

    /// Updates the state of a core.
    pub fn set_state(&self, id: usize, state: CpuState) -> Result<(), SmpError> {
        if id >= self.total {
            return Err(SmpError::InvalidId);
        }
        self.states[id].store(state.raw(), Ordering::Release);
        Ok(())
    }

    /// Returns the state of a core.
    pub fn state(&self, id: usize) -> Option<CpuState> {
        (id < self.total).then(|| CpuState::from_raw(self.states[id].load(Ordering::Acquire)))
    }
}

/// Core a task slot is pinned to.
pub const fn affinity(slot: usize, cores: usize) -> usize {
    slot % cores
}

/// Slots scheduled on `core`, in ascending order.
pub fn slots_for_core(core: usize, cores: usize, slots: usize) -> impl Iterator<Item = usize> {
    (core..slots).step_by(cores.max(1))
}

/// One value per core, indexed by core id.
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: [T; MAX_CPUS],
}

impl<T> PerCpu<T> {
    pub fn new(mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(|core| init(core)),
        }
    }

    /// Value owned by `core`. Panics on an out-of-range core id.
    pub fn get(&self, core: usize) -> &T {
        &self.slots[core]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_defaults_first_core_online() {
        let topo = CpuTopology::new(2);
        assert_eq!(topo.total(), 2);
        assert_eq!(topo.online(), 1);
        assert_eq!(topo.state(0), Some(CpuState::Online));
        assert_eq!(topo.state(1), Some(CpuState::Offline));
    }

    #[test]
    fn set_state_updates_core() {
        let topo = CpuTopology::new(1);
        topo.set_state(0, CpuState::Halted).expect("set_state should succeed");
        assert_eq!(topo.state(0), Some(CpuState::Halted));
        assert_eq!(topo.set_state(2, CpuState::Online), Err(SmpError::InvalidId));
    }

    #[test]
    fn topology_clamps_core_count() {
        assert_eq!(CpuTopology::new(0).total(), 1);
        assert_eq!(CpuTopology::new(64).total(), MAX_CPUS);
    }

    #[test]
    fn slots_are_partitioned_by_core() {
        let core0: Vec<usize> = slots_for_core(0, 4, 10).collect();
        let core3: Vec<usize> = slots_for_core(3, 4, 10).collect();
        assert_eq!(core0, vec![0, 4, 8]);
        assert_eq!(core3, vec![3, 7]);
        assert_eq!(affinity(7, 4), 3);
    }

    #[test]
    fn per_cpu_values_are_independent() {
        let counters = PerCpu::new(|core| core * 10);
        assert_eq!(*counters.get(2), 20);
        assert_eq!(counters.iter().count(), MAX_CPUS);
    }
}
