//! System call wrappers.
//!
//! The call number goes in `x8`, arguments in `x0..x2`, and the kernel
//! returns in `x0`. On anything but the bare-metal target the calls fail
//! with `NoSys`, which keeps the library testable on the host.

use hal::{syscall_nr, Errno, Timespec};

const NSEC_PER_SEC: i64 = 1_000_000_000;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn raw_syscall(nr: u64, a0: u64, a1: u64, a2: u64) -> i64 {
    let ret: i64;
    // SAFETY: the kernel only reads the argument registers and writes x0.
    unsafe {
        core::arch::asm!(
            "svc #0",
            inlateout("x0") a0 as i64 => ret,
            in("x1") a1,
            in("x2") a2,
            in("x8") nr,
            options(nostack)
        );
    }
    ret
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn raw_syscall(_nr: u64, _a0: u64, _a1: u64, _a2: u64) -> i64 {
    Errno::NoSys.as_isize() as i64
}

/// Maps a raw return value to a result. The kernel reports most failures
/// as a bare -1.
pub fn check(ret: i64) -> Result<u64, Errno> {
    match ret {
        r if r >= 0 => Ok(r as u64),
        -1 => Err(Errno::InvalidArg),
        r => Err(Errno::from_code(r.wrapping_neg() as isize).unwrap_or(Errno::InvalidArg)),
    }
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: u64 },
    Child,
}

pub fn fork() -> Result<Fork, Errno> {
    match check(raw_syscall(syscall_nr::FORK, 0, 0, 0))? {
        0 => Ok(Fork::Child),
        child => Ok(Fork::Parent { child }),
    }
}

/// Asks for a program break of `addr` and returns the one in effect.
/// `0` only queries.
pub fn sys_brk(addr: usize) -> usize {
    raw_syscall(syscall_nr::BRK, addr as u64, 0, 0) as usize
}

pub fn exit(status: i64) -> ! {
    raw_syscall(syscall_nr::EXIT, status as u64, 0, 0);
    // The kernel never returns from exit; spin if it somehow did.
    loop {
        core::hint::spin_loop();
    }
}

pub fn nanosleep(req: &Timespec, rem: &mut Timespec) -> Result<(), Errno> {
    if req.tv_sec < 0 || req.tv_nsec < 0 || req.tv_nsec >= NSEC_PER_SEC {
        return Err(Errno::InvalidArg);
    }
    let ret = raw_syscall(
        syscall_nr::NANOSLEEP,
        req as *const Timespec as u64,
        rem as *mut Timespec as u64,
        0,
    );
    check(ret).map(|_| ())
}

/// Sleeps for `seconds`; returns the seconds left when interrupted.
pub fn sleep(seconds: u32) -> u32 {
    let req = Timespec {
        tv_sec: seconds as i64,
        tv_nsec: 0,
    };
    let mut rem = Timespec::default();
    match nanosleep(&req, &mut rem) {
        Ok(()) => 0,
        Err(_) => rem.tv_sec as u32 + u32::from(rem.tv_nsec != 0),
    }
}

/// Sleeps until woken. Always reports failure, as the kernel does.
pub fn pause() -> Result<(), Errno> {
    check(raw_syscall(syscall_nr::PAUSE, 0, 0, 0)).map(|_| ())
}

/// Reads one console line into `buf`.
pub fn read(fd: u32, buf: &mut [u8]) -> Result<usize, Errno> {
    let ret = raw_syscall(
        syscall_nr::READ,
        fd as u64,
        buf.as_mut_ptr() as u64,
        buf.len() as u64,
    );
    check(ret).map(|n| n as usize)
}

pub fn write(fd: u32, buf: &[u8]) -> Result<usize, Errno> {
    let ret = raw_syscall(
        syscall_nr::WRITE,
        fd as u64,
        buf.as_ptr() as u64,
        buf.len() as u64,
    );
    check(ret).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_kernel_return_values() {
        assert_eq!(check(7), Ok(7));
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(-1), Err(Errno::InvalidArg));
        assert_eq!(check(-38), Err(Errno::NoSys));
        assert_eq!(check(-999), Err(Errno::InvalidArg));
    }

    #[test]
    fn nanosleep_rejects_bad_requests_before_the_kernel() {
        let mut rem = Timespec::default();
        let negative = Timespec {
            tv_sec: -1,
            tv_nsec: 0,
        };
        let overflow = Timespec {
            tv_sec: 0,
            tv_nsec: NSEC_PER_SEC,
        };
        assert_eq!(nanosleep(&negative, &mut rem), Err(Errno::InvalidArg));
        assert_eq!(nanosleep(&overflow, &mut rem), Err(Errno::InvalidArg));
    }

    #[test]
    fn calls_fail_with_nosys_off_target() {
        assert_eq!(fork(), Err(Errno::NoSys));
        assert_eq!(write(1, b"hi"), Err(Errno::NoSys));
    }
}
