//! Local interrupt masking.
//!
//! On bare-metal AArch64 these touch DAIF; on any other target (host tests)
//! they are no-ops so lock-protected code runs unchanged.

/// Masks IRQs on the local core and returns the previous DAIF value.
#[inline]
pub fn save_and_disable() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let daif: u64;
        unsafe {
            core::arch::asm!(
                "mrs {0}, daif",
                "msr daifset, #2",
                out(reg) daif,
                options(nomem, nostack, preserves_flags)
            );
        }
        daif
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        0
    }
}

/// Restores a DAIF value returned by [`save_and_disable`].
#[inline]
pub fn restore(daif: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr daif, {0}", in(reg) daif, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = daif;
}

/// Unmasks IRQs on the local core.
#[inline]
pub fn enable() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Masks IRQs on the local core.
#[inline]
pub fn disable() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
    }
}
