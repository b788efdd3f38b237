//! System call dispatch.
//!
//! The number arrives in `x8`, arguments in `x0..x2`, and the result goes
//! back in `x0`. Unknown numbers return `-ENOSYS`; every other failure
//! returns -1.

use hal::{syscall_nr, Errno, Machine, TrapFrame, Timespec, VirtAddr};

use crate::config::{HZ, TICK_MS, TTY_BUF_LEN};
use crate::pmm::FrameSource;
use crate::process::{TaskRef, TaskState};
use crate::scheduler::Scheduler;
use crate::tty::Tty;

/// Supported system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork,
    Brk,
    Exit,
    Nanosleep,
    Pause,
    Read,
    Write,
}

impl Syscall {
    pub const fn from_number(nr: u64) -> Option<Self> {
        match nr {
            syscall_nr::FORK => Some(Syscall::Fork),
            syscall_nr::BRK => Some(Syscall::Brk),
            syscall_nr::EXIT => Some(Syscall::Exit),
            syscall_nr::NANOSLEEP => Some(Syscall::Nanosleep),
            syscall_nr::PAUSE => Some(Syscall::Pause),
            syscall_nr::READ => Some(Syscall::Read),
            syscall_nr::WRITE => Some(Syscall::Write),
            _ => None,
        }
    }
}

/// Output side of the console.
pub trait ConsoleSink {
    fn write_bytes(&self, bytes: &[u8]);
}

const STDIN: u64 = 0;
const STDOUT: u64 = 1;
const FAILED: isize = -1;
const NSEC_PER_SEC: i64 = 1_000_000_000;
const TIMESPEC_LEN: usize = core::mem::size_of::<Timespec>();

/// Everything a system call can reach.
pub struct Syscalls<'a, M: Machine, F: FrameSource, C: ConsoleSink> {
    sched: &'a Scheduler<M, F>,
    tty: &'a Tty,
    console: &'a C,
}

impl<'a, M: Machine, F: FrameSource, C: ConsoleSink> Syscalls<'a, M, F, C> {
    pub fn new(sched: &'a Scheduler<M, F>, tty: &'a Tty, console: &'a C) -> Self {
        Self {
            sched,
            tty,
            console,
        }
    }

    /// Decodes the call in `frame` and stores its result in `x0`.
    pub fn dispatch(&self, frame: &mut TrapFrame) {
        let nr = frame.regs[8];
        frame.syscallno = nr;
        frame.orig_x0 = frame.regs[0];
        let ret = self.invoke(nr, frame);
        frame.regs[0] = ret as u64;
    }

    pub fn invoke(&self, nr: u64, frame: &TrapFrame) -> isize {
        let [a0, a1, a2] = [frame.regs[0], frame.regs[1], frame.regs[2]];
        let Some(call) = Syscall::from_number(nr) else {
            log::debug!("syscall: unknown number {}", nr);
            return Errno::NoSys.as_isize();
        };
        match call {
            Syscall::Fork => self.sys_fork(frame),
            Syscall::Brk => self.sys_brk(a0),
            Syscall::Exit => self.sched.do_exit(a0 as i64),
            Syscall::Nanosleep => self.sys_nanosleep(a0, a1),
            Syscall::Pause => self.sys_pause(),
            Syscall::Read => self.sys_read(a0, a1, a2 as usize),
            Syscall::Write => self.sys_write(a0, a1, a2 as usize),
        }
    }

    fn sys_fork(&self, frame: &TrapFrame) -> isize {
        self.sched.fork(frame).map_or(FAILED, |pid| pid as isize)
    }

    fn sys_brk(&self, addr: VirtAddr) -> isize {
        let task = self.sched.current_task();
        self.sched.brk(task, addr).map_or(FAILED, |brk| brk as isize)
    }

    fn sys_nanosleep(&self, req: VirtAddr, rem: VirtAddr) -> isize {
        let task = self.sched.current_task();
        let mut raw = [0u8; TIMESPEC_LEN];
        if self.copy_in(task, &mut raw, req).is_err() {
            return FAILED;
        }
        let Some(ticks) = timespec_to_ticks(&timespec_from_bytes(&raw)) else {
            return FAILED;
        };
        let end = self.sched.machine().ticks().saturating_add(ticks);
        loop {
            let now = self.sched.machine().ticks();
            if now >= end {
                break;
            }
            self.sched.schedule_timeout(end - now);
        }
        if rem != 0 && self.copy_out(task, rem, &[0u8; TIMESPEC_LEN]).is_err() {
            return FAILED;
        }
        0
    }

    fn sys_pause(&self) -> isize {
        let task = self.sched.current_task();
        self.sched.set_state(task, TaskState::Sleeping);
        self.sched.schedule();
        FAILED
    }

    fn sys_read(&self, fd: u64, buf: VirtAddr, count: usize) -> isize {
        if fd != STDIN {
            return FAILED;
        }
        let task = self.sched.current_task();
        let mut line = [0u8; TTY_BUF_LEN];
        let limit = count.min(TTY_BUF_LEN);
        let Ok(len) = self.tty.read_line(self.sched, &mut line[..limit]) else {
            return FAILED;
        };
        match self.copy_out(task, buf, &line[..len]) {
            Ok(()) => len as isize,
            Err(_) => FAILED,
        }
    }

    fn sys_write(&self, fd: u64, buf: VirtAddr, count: usize) -> isize {
        if fd != STDOUT {
            return FAILED;
        }
        let task = self.sched.current_task();
        let mut chunk = [0u8; TTY_BUF_LEN];
        let mut done = 0;
        while done < count {
            let len = (count - done).min(chunk.len());
            if self.copy_in(task, &mut chunk[..len], buf + done as u64).is_err() {
                return FAILED;
            }
            self.console.write_bytes(&chunk[..len]);
            done += len;
        }
        count as isize
    }

    fn copy_in(&self, task: TaskRef, dst: &mut [u8], src: VirtAddr) -> Result<(), Errno> {
        self.sched
            .with_space(task, |space, frames| space.copy_from_user(frames, dst, src))?
    }

    fn copy_out(&self, task: TaskRef, dst: VirtAddr, src: &[u8]) -> Result<(), Errno> {
        self.sched
            .with_space(task, |space, frames| space.copy_to_user(frames, dst, src))?
    }
}

fn timespec_from_bytes(raw: &[u8; TIMESPEC_LEN]) -> Timespec {
    let mut sec = [0u8; 8];
    let mut nsec = [0u8; 8];
    sec.copy_from_slice(&raw[..8]);
    nsec.copy_from_slice(&raw[8..]);
    Timespec {
        tv_sec: i64::from_ne_bytes(sec),
        tv_nsec: i64::from_ne_bytes(nsec),
    }
}

/// Ticks to sleep for `ts`, rounding partial ticks up. `None` for a
/// negative or zero duration.
pub fn timespec_to_ticks(ts: &Timespec) -> Option<u64> {
    if ts.tv_sec < 0 || !(0..NSEC_PER_SEC).contains(&ts.tv_nsec) {
        return None;
    }
    let hz = HZ as i64;
    let round = (TICK_MS as i64) * 1_000_000 - 1;
    let ticks = ts
        .tv_sec
        .checked_mul(hz)?
        .checked_add((ts.tv_nsec + round) * hz / NSEC_PER_SEC)?;
    (ticks > 0).then_some(ticks as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_STACK_START;
    use crate::pmm::PagePool;
    use crate::process::KernelStacks;
    use crate::scheduler::{UserImage, UserSegment};
    use crate::testing::{HostMemory, MockMachine};
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::Ordering;
    use hal::TickSource;
    use spin::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<u8>>);

    impl ConsoleSink for Capture {
        fn write_bytes(&self, bytes: &[u8]) {
            self.0.lock().extend_from_slice(bytes);
        }
    }

    extern "C" fn init(_arg: u64) -> i64 {
        0
    }

    struct World {
        _stacks: Vec<u8>,
        mem: HostMemory,
        base: usize,
    }

    impl World {
        fn new() -> Self {
            let mut stacks = vec![0u8; KernelStacks::region_len() + 16];
            let base = hal::align_up(stacks.as_mut_ptr() as u64, 16) as usize;
            Self {
                _stacks: stacks,
                mem: HostMemory::new(64),
                base,
            }
        }

        fn boot(&self) -> Scheduler<MockMachine, &PagePool> {
            let sched = Scheduler::new(MockMachine::new(), &self.mem.pool, 1, KernelStacks::new(self.base));
            sched.kernel_thread("init", init, 0).expect("thread should start");
            sched.run_as(TaskRef(0));
            let text = self.mem.pool.alloc_zeroed(0).expect("alloc should succeed");
            let empty = UserSegment { start: 0, end: 0, load: 0 };
            let image = UserImage {
                text: UserSegment { start: 0x40_0000, end: 0x40_1000, load: text },
                rodata: empty,
                data: empty,
                bss: UserSegment { start: 0x40_1000, end: 0x40_1000, load: 0 },
                entry: 0x40_0000,
                device: None,
            };
            sched.setup_user_space(&image).expect("setup should succeed");
            sched
        }
    }

    fn call(sys: &Syscalls<'_, MockMachine, &PagePool, Capture>, nr: u64, args: [u64; 3]) -> isize {
        let mut frame = TrapFrame::zeroed();
        frame.regs[..3].copy_from_slice(&args);
        frame.regs[8] = nr;
        sys.dispatch(&mut frame);
        assert_eq!(frame.syscallno, nr);
        frame.regs[0] as isize
    }

    #[test]
    fn numbers_decode() {
        assert_eq!(Syscall::from_number(0), Some(Syscall::Fork));
        assert_eq!(Syscall::from_number(6), Some(Syscall::Write));
        assert_eq!(Syscall::from_number(7), None);
    }

    #[test]
    fn nanosleep_tick_rounding() {
        let ts = |tv_sec, tv_nsec| Timespec { tv_sec, tv_nsec };
        assert_eq!(timespec_to_ticks(&ts(0, 0)), None);
        assert_eq!(timespec_to_ticks(&ts(0, 1)), Some(1));
        assert_eq!(timespec_to_ticks(&ts(0, 10_000_000)), Some(1));
        assert_eq!(timespec_to_ticks(&ts(0, 10_000_001)), Some(2));
        assert_eq!(timespec_to_ticks(&ts(2, 0)), Some(2 * HZ));
        assert_eq!(timespec_to_ticks(&ts(-1, 0)), None);
        assert_eq!(timespec_to_ticks(&ts(0, NSEC_PER_SEC)), None);
    }

    #[test]
    fn unknown_number_is_enosys() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        assert_eq!(call(&sys, 42, [0; 3]), -38);
    }

    #[test]
    fn write_copies_user_bytes_to_console() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        sched
            .with_space(sched.current_task(), |space, frames| space.copy_to_user(frames, USER_STACK_START, b"hello"))
            .expect("space should exist")
            .expect("copy should succeed");
        assert_eq!(call(&sys, syscall_nr::WRITE, [1, USER_STACK_START, 5]), 5);
        assert_eq!(&console.0.lock()[..], b"hello");
        assert_eq!(call(&sys, syscall_nr::WRITE, [2, USER_STACK_START, 5]), -1);
        assert_eq!(call(&sys, syscall_nr::WRITE, [1, 0x3000_0000, 5]), -1);
    }

    #[test]
    fn read_returns_buffered_line() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        for &b in b"ls\r" {
            tty.receive(&sched, b, |out| console.write_bytes(out));
        }
        assert_eq!(call(&sys, syscall_nr::READ, [0, USER_STACK_START, 2]), -1);
        assert_eq!(call(&sys, syscall_nr::READ, [0, USER_STACK_START, 64]), 3);
        let mut buf = [0u8; 3];
        sched
            .with_space(sched.current_task(), |space, frames| space.copy_from_user(frames, &mut buf, USER_STACK_START))
            .expect("space should exist")
            .expect("copy should succeed");
        assert_eq!(&buf, b"ls\n");
        assert_eq!(call(&sys, syscall_nr::READ, [1, USER_STACK_START, 64]), -1);
    }

    #[test]
    fn brk_queries_and_grows() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        assert_eq!(call(&sys, syscall_nr::BRK, [0; 3]), 0x40_2000);
        assert_eq!(call(&sys, syscall_nr::BRK, [0x40_3800, 0, 0]), 0x40_3800);
        assert_eq!(call(&sys, syscall_nr::BRK, [0x10, 0, 0]), 0x40_3800);
    }

    #[test]
    fn fork_returns_child_pid() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        assert_eq!(call(&sys, syscall_nr::FORK, [0; 3]), 2);
        assert_eq!(sched.tasks().iter().filter(|t| t.has_user_space).count(), 2);
    }

    #[test]
    fn pause_sleeps_and_fails() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        assert_eq!(call(&sys, syscall_nr::PAUSE, [0; 3]), -1);
        assert_eq!(sched.task(TaskRef(0)).state, TaskState::Sleeping);
    }

    #[test]
    fn nanosleep_waits_and_clears_remainder() {
        let world = World::new();
        let sched = world.boot();
        let tty = Tty::new();
        let console = Capture::default();
        let sys = Syscalls::new(&sched, &tty, &console);
        sched.machine().ticks_per_switch.store(1, Ordering::Relaxed);
        let mut raw = [0u8; TIMESPEC_LEN];
        raw[8..].copy_from_slice(&25_000_000i64.to_ne_bytes());
        raw[..8].copy_from_slice(&0x7i64.to_ne_bytes());
        let req = USER_STACK_START;
        let rem = USER_STACK_START + 0x100;
        sched
            .with_space(sched.current_task(), |space, frames| {
                space.copy_to_user(frames, req, &raw)?;
                space.copy_to_user(frames, rem, &[0xff; TIMESPEC_LEN])
            })
            .expect("space should exist")
            .expect("copy should succeed");

        let start = sched.machine().ticks();
        assert_eq!(call(&sys, syscall_nr::NANOSLEEP, [req, rem, 0]), 0);
        assert!(sched.machine().ticks() >= start + 7 * HZ + 3);

        let mut out = [0xffu8; TIMESPEC_LEN];
        sched
            .with_space(sched.current_task(), |space, frames| space.copy_from_user(frames, &mut out, rem))
            .expect("space should exist")
            .expect("copy should succeed");
        assert_eq!(out, [0u8; TIMESPEC_LEN]);

        let zero = [0u8; TIMESPEC_LEN];
        sched
            .with_space(sched.current_task(), |space, frames| space.copy_to_user(frames, req, &zero))
            .expect("space should exist")
            .expect("copy should succeed");
        assert_eq!(call(&sys, syscall_nr::NANOSLEEP, [req, 0, 0]), -1);
    }
}
