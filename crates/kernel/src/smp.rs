use kernel_core::config::{HZ, PAGE_OFFSET};
use kernel_core::smp::{CpuState, CpuTopology};

use crate::arch::psci;
use crate::platform::{self, timer};
use crate::{arch, trap};

static TOPOLOGY: CpuTopology = CpuTopology::new(platform::NUM_CPUS);

extern "C" {
    fn _start();
}

/// Powers on every secondary core at the physical entry point.
pub fn start_secondaries() {
    let (major, minor) = psci::version();
    log::info!("smp: PSCI {}.{}", major, minor);
    let entry = _start as usize as u64 - PAGE_OFFSET;
    for core in 1..TOPOLOGY.total() {
        if let Err(err) = psci::cpu_on(core as u64, entry, 0) {
            log::warn!("smp: core {} did not start: {:?}", core, err);
        }
    }
}

/// Kernel entry of a secondary core, running in the linear map.
pub fn secondary_entry(core: usize) -> ! {
    arch::install_vectors();
    trap::init_core();
    timer::init(HZ);
    if let Err(err) = TOPOLOGY.set_state(core, CpuState::Online) {
        log::warn!("smp: core {} not marked online: {:?}", core, err);
    }
    log::info!("smp: core {} online ({} of {})", core, TOPOLOGY.online(), TOPOLOGY.total());
    hal::irq::enable();
    crate::idle_loop()
}

/// Returns online CPUs.
pub fn cpu_online() -> usize {
    TOPOLOGY.online()
}
