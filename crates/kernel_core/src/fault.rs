//! Classification and resolution of aborts taken from user mode.

use hal::{Machine, VirtAddr};

use crate::pmm::FrameSource;
use crate::scheduler::Scheduler;

pub const EC_SVC64: u32 = 0x15;
pub const EC_IABT_LOW: u32 = 0x20;
pub const EC_DABT_LOW: u32 = 0x24;

/// Exception class field of an ESR value.
pub const fn exception_class(esr: u64) -> u32 {
    ((esr >> 26) & 0x3f) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Translation,
    AccessFlag,
    Permission,
    Other,
}

/// A decoded user abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserFault {
    pub addr: VirtAddr,
    pub kind: FaultKind,
    pub write: bool,
    pub instruction: bool,
}

impl UserFault {
    /// Decodes an instruction or data abort from EL0; `None` for anything else.
    pub fn decode(esr: u64, far: VirtAddr) -> Option<Self> {
        let ec = exception_class(esr);
        if ec != EC_IABT_LOW && ec != EC_DABT_LOW {
            return None;
        }
        let kind = match (esr & 0x3f) >> 2 {
            0b0001 => FaultKind::Translation,
            0b0010 => FaultKind::AccessFlag,
            0b0011 => FaultKind::Permission,
            _ => FaultKind::Other,
        };
        Some(Self {
            addr: far,
            kind,
            write: ec == EC_DABT_LOW && esr & (1 << 6) != 0,
            instruction: ec == EC_IABT_LOW,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is now mapped; retry the access.
    Resolved,
    /// The task must be terminated.
    Kill,
}

/// Handles a synchronous abort from user mode in the current task.
pub fn handle_user_fault<M: Machine, F: FrameSource>(sched: &Scheduler<M, F>, esr: u64, far: VirtAddr) -> FaultOutcome {
    let pid = sched.current_pid();
    let Some(fault) = UserFault::decode(esr, far) else {
        log::warn!("fault: pid {} unexpected exception esr {:#x}", pid, esr);
        return FaultOutcome::Kill;
    };
    if fault.kind != FaultKind::Translation {
        log::warn!("fault: pid {} {:?} fault at {:#x}", pid, fault.kind, fault.addr);
        return FaultOutcome::Kill;
    }
    match sched.user_fault(fault.addr) {
        Ok(_) => FaultOutcome::Resolved,
        Err(err) => {
            log::warn!("fault: pid {} bad access at {:#x}: {:?}", pid, fault.addr, err);
            FaultOutcome::Kill
        }
    }
}
