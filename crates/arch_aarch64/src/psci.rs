//! PSCI calls through the hypervisor conduit (QEMU `virt`).

use core::arch::asm;

const PSCI_VERSION: u64 = 0x8400_0000;
const PSCI_CPU_ON_64: u64 = 0xC400_0003;

/// PSCI return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciError {
    NotSupported,
    InvalidParams,
    Denied,
    AlreadyOn,
    OnPending,
    Other(i64),
}

impl PsciError {
    fn from_code(code: i64) -> Self {
        match code {
            -1 => Self::NotSupported,
            -2 => Self::InvalidParams,
            -3 => Self::Denied,
            -4 => Self::AlreadyOn,
            -5 => Self::OnPending,
            other => Self::Other(other),
        }
    }
}

fn call(function: u64, arg0: u64, arg1: u64, arg2: u64) -> i64 {
    let ret: u64;
    unsafe {
        asm!(
            "hvc #0",
            inout("x0") function => ret,
            in("x1") arg0,
            in("x2") arg1,
            in("x3") arg2,
            clobber_abi("C"),
            options(nomem, nostack)
        );
    }
    ret as i64
}

/// `(major, minor)` of the firmware interface.
pub fn version() -> (u16, u16) {
    let raw = call(PSCI_VERSION, 0, 0, 0) as u32;
    ((raw >> 16) as u16, raw as u16)
}

/// Starts core `target` at physical address `entry` with `context` in x0.
pub fn cpu_on(target: u64, entry: u64, context: u64) -> Result<(), PsciError> {
    match call(PSCI_CPU_ON_64, target, entry, context) {
        0 => Ok(()),
        code => Err(PsciError::from_code(code)),
    }
}
