//! Per-core scheduler over a fixed task table.
//!
//! Slot `n` runs pid `n + 1` with ASID `n + 1` and is pinned to core
//! `n % cores`. Each core picks, among its runnable slots, the one with the
//! least accumulated run time and falls back to its idle task (pid 0).

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;
use hal::{align_down, align_up, Asid, Context, Errno, Machine, PhysAddr, TrapFrame, VirtAddr, PAGE_SIZE};

use crate::config::{MAX_CPUS, MAX_TASKS, TICK_MS, USER_DEVICE_MAP_START, USER_STACK_SIZE, USER_STACK_START};
use crate::mm::{Backing, UserSpace, VmFlags};
use crate::pmm::FrameSource;
use crate::process::{KernelStacks, Pid, Task, TaskRef, TaskState, ThreadEntry};
use crate::smp::{affinity, slots_for_core, PerCpu};
use crate::sync::IrqSpinLock;
use crate::timer::{TimerAction, TimerList};
use crate::wait::TaskControl;

const TABLE_LEN: usize = MAX_TASKS + MAX_CPUS;
const NO_TASK: usize = usize::MAX;

/// One loadable section of the user init image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSegment {
    pub start: VirtAddr,
    pub end: VirtAddr,
    /// Physical address the section was loaded at.
    pub load: PhysAddr,
}

impl UserSegment {
    /// Page-rounded range of the section, clipped to begin at `floor` when
    /// its first page is already covered by the previous section.
    fn page_range(&self, floor: VirtAddr) -> Option<(VirtAddr, VirtAddr, PhysAddr)> {
        let first = align_down(self.start, PAGE_SIZE);
        let start = first.max(floor);
        let end = align_up(self.end, PAGE_SIZE);
        let load = align_down(self.load, PAGE_SIZE) + (start - first);
        (start < end).then_some((start, end, load))
    }
}

/// Where the sections of the user init program live.
#[derive(Debug, Clone, Copy)]
pub struct UserImage {
    pub text: UserSegment,
    pub rodata: UserSegment,
    pub data: UserSegment,
    pub bss: UserSegment,
    pub entry: VirtAddr,
    /// Physical page of the console device exposed to user space.
    pub device: Option<PhysAddr>,
}

/// Initial user register state after [`Scheduler::setup_user_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub pc: VirtAddr,
    pub sp: VirtAddr,
}

/// Snapshot of one task for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub slot: TaskRef,
    pub pid: Pid,
    pub state: TaskState,
    pub utime: u64,
    pub stime: u64,
    pub has_user_space: bool,
}

pub struct Scheduler<M: Machine, F: FrameSource> {
    machine: M,
    frames: F,
    cores: usize,
    stacks: KernelStacks,
    table: IrqSpinLock<[Task; TABLE_LEN]>,
    contexts: [UnsafeCell<Context>; TABLE_LEN],
    spaces: [IrqSpinLock<Option<UserSpace>>; MAX_TASKS],
    current: PerCpu<AtomicUsize>,
    switching_from: PerCpu<AtomicUsize>,
    timers: TimerList,
}

// Contexts are only touched by the core that owns the slot, with the slot
// either current there or not running anywhere.
unsafe impl<M: Machine + Sync, F: FrameSource + Sync> Sync for Scheduler<M, F> {}

impl<M: Machine, F: FrameSource> Scheduler<M, F> {
    /// Creates the table with one running idle task per core.
    pub fn new(machine: M, frames: F, cores: usize, stacks: KernelStacks) -> Self {
        let cores = cores.clamp(1, MAX_CPUS);
        let mut table = [Task::EMPTY; TABLE_LEN];
        for (core, idle) in table[MAX_TASKS..].iter_mut().enumerate() {
            idle.in_use = core < cores;
            idle.state = TaskState::Running;
            idle.set_name("swapper");
        }
        Self {
            machine,
            frames,
            cores,
            stacks,
            table: IrqSpinLock::new(table),
            contexts: core::array::from_fn(|_| UnsafeCell::new(Context::default())),
            spaces: core::array::from_fn(|_| IrqSpinLock::new(None)),
            current: PerCpu::new(|core| AtomicUsize::new(TaskRef::idle(core).slot())),
            switching_from: PerCpu::new(|_| AtomicUsize::new(NO_TASK)),
            timers: TimerList::new(),
        }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn timers(&self) -> &TimerList {
        &self.timers
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    fn core(&self) -> usize {
        self.machine.core_id()
    }

    pub fn current_task(&self) -> TaskRef {
        TaskRef(self.current.get(self.core()).load(Ordering::Acquire))
    }

    pub fn current_pid(&self) -> Pid {
        self.current_task().pid()
    }

    /// Maps a pid to its slot; pid 0 is this core's idle task.
    pub fn pid_to_task(&self, pid: Pid) -> Option<TaskRef> {
        if pid == 0 {
            return Some(TaskRef::idle(self.core()));
        }
        let task = TaskRef::for_pid(pid)?;
        let table = self.table.lock();
        (table[task.slot()].in_use && table[task.slot()].pid == pid).then_some(task)
    }

    pub fn task(&self, task: TaskRef) -> Task {
        self.table.lock()[task.slot()]
    }

    pub fn set_state(&self, task: TaskRef, state: TaskState) {
        self.table.lock()[task.slot()].state = state;
    }

    /// Picks the next task of this core and switches to it.
    pub fn schedule(&self) {
        let daif = hal::irq::save_and_disable();
        self.switch_next();
        hal::irq::restore(daif);
    }

    fn switch_next(&self) {
        let core = self.core();
        let prev = self.current.get(core).load(Ordering::Acquire);
        let (next, root) = {
            let table = self.table.lock();
            let next = slots_for_core(core, self.cores, MAX_TASKS)
                .filter(|&slot| table[slot].is_runnable())
                .min_by_key(|&slot| (table[slot].runtime(), slot))
                .unwrap_or(TaskRef::idle(core).slot());
            (next, table[next].root)
        };
        if next == prev {
            return;
        }
        self.switching_from.get(core).store(prev, Ordering::Release);
        self.current.get(core).store(next, Ordering::Release);
        if let Some(root) = root {
            self.machine.switch_as(root, TaskRef(next).pid() as Asid);
        }
        // SAFETY: `prev` is current on this core and `next` is runnable only
        // here; neither context is touched elsewhere during the switch.
        unsafe {
            self.machine
                .switch_context(self.contexts[prev].get(), self.contexts[next].get());
        }
        self.current.get(core).store(prev, Ordering::Release);
        self.finish_switch();
    }

    /// Completes a switch on the resumed side. New threads and forked
    /// children call this before anything else.
    pub fn finish_switch(&self) {
        self.switching_from
            .get(self.core())
            .store(NO_TASK, Ordering::Release);
    }

    /// Makes `task` current on this core without switching to it.
    #[cfg(test)]
    pub(crate) fn run_as(&self, task: TaskRef) {
        self.current.get(self.core()).store(task.slot(), Ordering::Release);
    }

    /// Sleeps for up to `ticks`; returns the ticks still left when woken.
    pub fn schedule_timeout(&self, ticks: u64) -> u64 {
        let me = self.current_task();
        let expires = self.machine.ticks().saturating_add(ticks);
        self.set_state(me, TaskState::Sleeping);
        let timer = match self.timers.add(expires, TimerAction::Wake(me)) {
            Ok(timer) => timer,
            Err(err) => {
                log::warn!("sched: no timer for {:?}: {:?}", me, err);
                self.set_state(me, TaskState::Running);
                return ticks;
            }
        };
        self.schedule();
        self.timers.del(timer);
        expires.saturating_sub(self.machine.ticks())
    }

    /// Sleeps for at least `ms` milliseconds.
    pub fn msleep(&self, ms: u64) {
        let mut left = msecs_to_ticks(ms);
        while left > 0 {
            left = self.schedule_timeout(left);
        }
    }

    /// Runs timers due at the current tick.
    pub fn run_timers(&self) -> usize {
        self.timers
            .run_expired(self.machine.ticks(), |task| self.set_state(task, TaskState::Running))
    }

    /// Charges one tick to the current task. Returns whether the interrupted
    /// context should be preempted.
    pub fn on_tick(&self, from_user: bool) -> bool {
        let task = self.current_task();
        let mut table = self.table.lock();
        let entry = &mut table[task.slot()];
        if from_user {
            entry.utime += 1;
        } else {
            entry.stime += 1;
        }
        from_user || task.is_idle()
    }

    /// Starts a kernel thread running `entry(arg)`.
    pub fn kernel_thread(&self, name: &str, entry: ThreadEntry, arg: u64) -> Result<Pid, Errno> {
        let task = self.acquire_slot()?;
        let stack = self.stacks.for_slot(task.slot());
        let context = Context {
            x19: entry as usize as u64,
            x20: arg,
            sp: stack.top as u64,
            pc: self.machine.thread_trampoline(),
            ..Context::default()
        };
        // SAFETY: the slot was just claimed and is not running anywhere.
        unsafe { *self.contexts[task.slot()].get() = context };
        {
            let mut table = self.table.lock();
            let entry = &mut table[task.slot()];
            entry.set_name(name);
            entry.kstack = Some(stack);
            entry.state = TaskState::Running;
        }
        log::debug!("sched: thread {} pid {} on core {}", name, task.pid(), affinity(task.slot(), self.cores));
        Ok(task.pid())
    }

    /// Turns the calling kernel thread into the user init process.
    pub fn setup_user_space(&self, image: &UserImage) -> Result<UserEntry, Errno> {
        let me = self.current_task();
        if me.is_idle() {
            return Err(Errno::InvalidArg);
        }
        let mut space = UserSpace::new(&self.frames)?;
        if let Err(err) = build_init_space(&mut space, image, &self.frames) {
            space.release(&self.frames);
            return Err(err);
        }
        let root = space.root();
        *self.spaces[me.slot()].lock() = Some(space);
        self.table.lock()[me.slot()].root = Some(root);
        self.machine.switch_as(root, me.pid() as Asid);
        Ok(UserEntry {
            pc: image.entry,
            sp: USER_STACK_START + USER_STACK_SIZE,
        })
    }

    /// Duplicates the calling process. The child resumes from `frame` with
    /// a return value of 0.
    pub fn fork(&self, frame: &TrapFrame) -> Result<Pid, Errno> {
        let parent = self.current_task();
        if parent.is_idle() {
            return Err(Errno::InvalidArg);
        }
        let child = self.acquire_slot()?;
        match self.fork_into(parent, child, frame) {
            Ok(()) => {
                log::debug!("sched: pid {} forked pid {}", parent.pid(), child.pid());
                Ok(child.pid())
            }
            Err(err) => {
                log::warn!("sched: fork of pid {} failed: {:?}", parent.pid(), err);
                self.free_slot(child);
                Err(err)
            }
        }
    }

    fn fork_into(&self, parent: TaskRef, child: TaskRef, frame: &TrapFrame) -> Result<(), Errno> {
        let space = {
            let guard = self.spaces[parent.slot()].lock();
            guard.as_ref().ok_or(Errno::InvalidArg)?.duplicate(&self.frames)?
        };
        let root = space.root();
        *self.spaces[child.slot()].lock() = Some(space);

        let stack = self.stacks.for_slot(child.slot());
        let frame_addr = stack.top - size_of::<TrapFrame>();
        let mut child_frame = *frame;
        child_frame.regs[0] = 0;
        // SAFETY: the child's kernel stack is unused until it first runs.
        unsafe {
            (frame_addr as *mut TrapFrame).write(child_frame);
            *self.contexts[child.slot()].get() = Context {
                sp: frame_addr as u64,
                pc: self.machine.fork_trampoline(),
                ..Context::default()
            };
        }

        let mut table = self.table.lock();
        let name = table[parent.slot()];
        let entry = &mut table[child.slot()];
        entry.set_name(name.name());
        entry.root = Some(root);
        entry.kstack = Some(stack);
        entry.state = TaskState::Running;
        Ok(())
    }

    /// Releases the caller's user space and marks it stopped. The slot is
    /// reclaimed later by the slot search.
    pub fn exit_current(&self, status: i64) {
        let me = self.current_task();
        if me.is_idle() {
            log::error!("sched: idle task cannot exit");
            return;
        }
        log::info!("sched: pid {} exited with {}", me.pid(), status);
        if let Some(space) = self.spaces[me.slot()].lock().take() {
            space.release(&self.frames);
        }
        let mut table = self.table.lock();
        table[me.slot()].root = None;
        table[me.slot()].state = TaskState::Stopped;
    }

    /// Exits the caller and never returns.
    pub fn do_exit(&self, status: i64) -> ! {
        self.exit_current(status);
        loop {
            self.schedule();
        }
    }

    /// Claims a free slot, reclaiming stopped ones on the way.
    pub fn acquire_slot(&self) -> Result<TaskRef, Errno> {
        let mut table = self.table.lock();
        for slot in 0..MAX_TASKS {
            let task = TaskRef(slot);
            if table[slot].in_use && table[slot].state == TaskState::Stopped && !self.is_active(task) {
                log::info!("sched: reclaim pid {}", task.pid());
                self.machine.flush_asid(task.pid() as Asid);
                table[slot] = Task::EMPTY;
            }
            if !table[slot].in_use {
                table[slot] = Task::claimed(task.pid());
                return Ok(task);
            }
        }
        log::warn!("sched: no free task slot");
        Err(Errno::Again)
    }

    /// Returns a slot that never ran to the free pool.
    pub fn free_slot(&self, task: TaskRef) {
        if task.is_idle() {
            return;
        }
        if let Some(space) = self.spaces[task.slot()].lock().take() {
            space.release(&self.frames);
        }
        self.machine.flush_asid(task.pid() as Asid);
        self.table.lock()[task.slot()] = Task::EMPTY;
    }

    fn is_active(&self, task: TaskRef) -> bool {
        self.current
            .iter()
            .chain(self.switching_from.iter())
            .any(|slot| slot.load(Ordering::Acquire) == task.slot())
    }

    /// Runs `f` on the user space of `task`.
    pub fn with_space<R>(&self, task: TaskRef, f: impl FnOnce(&mut UserSpace, &F) -> R) -> Result<R, Errno> {
        if task.is_idle() {
            return Err(Errno::Fault);
        }
        let mut guard = self.spaces[task.slot()].lock();
        let space = guard.as_mut().ok_or(Errno::Fault)?;
        Ok(f(space, &self.frames))
    }

    /// Resolves a user fault at `addr` in the current task.
    pub fn user_fault(&self, addr: VirtAddr) -> Result<PhysAddr, Errno> {
        self.with_space(self.current_task(), |space, frames| space.fault_in(frames, addr))?
    }

    /// Moves the program break of `task`.
    pub fn brk(&self, task: TaskRef, addr: VirtAddr) -> Result<VirtAddr, Errno> {
        let asid = task.pid() as Asid;
        self.with_space(task, |space, frames| space.set_brk(frames, &self.machine, asid, addr))
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        let table = self.table.lock();
        table
            .iter()
            .enumerate()
            .filter(|(_, task)| task.in_use)
            .map(|(slot, task)| TaskInfo {
                slot: TaskRef(slot),
                pid: task.pid,
                state: task.state,
                utime: task.utime,
                stime: task.stime,
                has_user_space: task.root.is_some(),
            })
            .collect()
    }

    /// Logs one line per live task.
    pub fn dump_tasks(&self) {
        let table = self.table.lock();
        for task in table.iter().filter(|task| task.in_use) {
            log::info!(
                "pid {:>2} {:<16} {:?} utime {} stime {}",
                task.pid,
                task.name(),
                task.state,
                task.utime,
                task.stime
            );
        }
    }
}

impl<M: Machine, F: FrameSource> TaskControl for Scheduler<M, F> {
    fn current_task(&self) -> TaskRef {
        Scheduler::current_task(self)
    }

    fn set_state(&self, task: TaskRef, state: TaskState) {
        Scheduler::set_state(self, task, state)
    }

    fn schedule(&self) {
        Scheduler::schedule(self)
    }
}

/// Ticks covering at least `ms` milliseconds.
pub const fn msecs_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(TICK_MS)
}

fn build_init_space<F: FrameSource>(space: &mut UserSpace, image: &UserImage, frames: &F) -> Result<(), Errno> {
    let sections = [
        (image.text, VmFlags::READ | VmFlags::EXEC | VmFlags::SHARED),
        (image.rodata, VmFlags::READ | VmFlags::SHARED),
        (image.data, VmFlags::READ | VmFlags::WRITE),
        (image.bss, VmFlags::READ | VmFlags::WRITE),
    ];
    let mut floor = 0;
    for (segment, flags) in sections {
        if let Some((start, end, load)) = segment.page_range(floor) {
            space.mm.create_vma(start, end, flags, Backing::Linear(load))?;
            floor = end;
        }
    }
    space.mm.create_vma(
        USER_STACK_START,
        USER_STACK_START + USER_STACK_SIZE,
        VmFlags::READ | VmFlags::WRITE,
        Backing::Blocks,
    )?;
    if let Some(device) = image.device {
        let page = align_down(device, PAGE_SIZE);
        space.mm.create_vma(
            USER_DEVICE_MAP_START + page,
            USER_DEVICE_MAP_START + page + PAGE_SIZE,
            VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED | VmFlags::IO,
            Backing::Linear(page),
        )?;
    }
    space.mm.start_brk = align_up(image.bss.end.max(image.data.end), PAGE_SIZE);
    space.mm.brk = space.mm.start_brk + PAGE_SIZE;
    space.populate(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostMemory, MachineEvent, MockMachine};
    use alloc::vec;

    extern "C" fn worker(_arg: u64) -> i64 {
        0
    }

    struct Fixture {
        _stacks: Vec<u8>,
        mem: HostMemory,
        stacks: KernelStacks,
    }

    impl Fixture {
        fn new(pages: usize) -> Self {
            let mut region = vec![0u8; KernelStacks::region_len() + 16];
            let base = align_up(region.as_mut_ptr() as u64, 16) as usize;
            Self {
                _stacks: region,
                mem: HostMemory::new(pages),
                stacks: KernelStacks::new(base),
            }
        }

        fn scheduler(&self, cores: usize) -> Scheduler<MockMachine, &crate::pmm::PagePool> {
            Scheduler::new(MockMachine::new(), &self.mem.pool, cores, self.stacks)
        }
    }

    #[test]
    fn idle_runs_when_nothing_is_runnable() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        assert_eq!(sched.current_task(), TaskRef::idle(0));
        sched.schedule();
        assert!(sched.machine().events().is_empty());
        assert_eq!(sched.current_pid(), 0);
    }

    #[test]
    fn kernel_thread_gets_trampoline_context() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        let pid = sched.kernel_thread("worker", worker, 9).expect("thread should start");
        assert_eq!(pid, 1);
        let ctx = unsafe { *sched.contexts[0].get() };
        assert_eq!(ctx.pc, MockMachine::THREAD_TRAMPOLINE);
        assert_eq!(ctx.x19, worker as usize as u64);
        assert_eq!(ctx.x20, 9);
        assert_eq!(ctx.sp as usize, fx.stacks.for_slot(0).top);
        let task = sched.task(TaskRef(0));
        assert_eq!(task.name(), "worker");
        assert_eq!(task.state, TaskState::Running);
    }

    #[test]
    fn least_runtime_wins_with_ties_to_lowest_slot() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        for _ in 0..3 {
            sched.kernel_thread("w", worker, 0).expect("thread should start");
        }
        {
            let mut table = sched.table.lock();
            table[0].utime = 5;
            table[1].stime = 2;
            table[2].utime = 2;
        }
        sched.schedule();
        assert_eq!(
            sched.machine().events().last(),
            Some(&MachineEvent::Switch {
                prev: sched.contexts[TaskRef::idle(0).slot()].get() as usize,
                next: sched.contexts[1].get() as usize,
            })
        );
        assert_eq!(sched.current_task(), TaskRef::idle(0));
    }

    #[test]
    fn ticks_move_the_choice_only_once_runtimes_equalize() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        sched.kernel_thread("a", worker, 0).expect("thread should start");
        sched.kernel_thread("b", worker, 0).expect("thread should start");
        sched.table.lock()[1].stime = 4;

        let mut picks = Vec::new();
        for _ in 0..8 {
            sched.run_as(TaskRef::idle(0));
            sched.schedule();
            let next = match sched.machine().events().last() {
                Some(&MachineEvent::Switch { next, .. }) => next,
                other => panic!("expected a switch, got {:?}", other),
            };
            let slot = (0..2)
                .find(|&slot| sched.contexts[slot].get() as usize == next)
                .expect("switch should target a worker");
            picks.push(slot);
            sched.run_as(TaskRef(slot));
            assert!(!sched.on_tick(false));
        }
        assert_eq!(picks, vec![0, 0, 0, 0, 0, 1, 0, 1]);
        let table = sched.table.lock();
        assert_eq!((table[0].runtime(), table[1].runtime()), (6, 6));
    }

    #[test]
    fn slots_are_pinned_to_cores() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(2);
        sched.kernel_thread("a", worker, 0).expect("thread should start");
        sched.kernel_thread("b", worker, 0).expect("thread should start");
        sched.machine().set_core(1);
        sched.schedule();
        assert_eq!(
            sched.machine().events(),
            [MachineEvent::Switch {
                prev: sched.contexts[TaskRef::idle(1).slot()].get() as usize,
                next: sched.contexts[1].get() as usize,
            }]
        );
    }

    #[test]
    fn tick_accounting_and_preemption() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        assert!(sched.on_tick(false));
        sched.kernel_thread("w", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        assert!(!sched.on_tick(false));
        assert!(sched.on_tick(true));
        let task = sched.task(TaskRef(0));
        assert_eq!((task.utime, task.stime), (1, 1));
    }

    #[test]
    fn schedule_timeout_sleeps_until_timer_fires() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        sched.kernel_thread("sleeper", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        let left = sched.schedule_timeout(5);
        assert_eq!(left, 5);
        assert_eq!(sched.task(TaskRef(0)).state, TaskState::Sleeping);
        assert_eq!(sched.timers().pending(), 0);

        sched.set_state(TaskRef(0), TaskState::Sleeping);
        sched.timers().add(3, TimerAction::Wake(TaskRef(0))).expect("add should succeed");
        sched.machine().advance(3);
        assert_eq!(sched.run_timers(), 1);
        assert_eq!(sched.task(TaskRef(0)).state, TaskState::Running);
    }

    #[test]
    fn msecs_round_up_to_ticks() {
        assert_eq!(msecs_to_ticks(0), 0);
        assert_eq!(msecs_to_ticks(1), 1);
        assert_eq!(msecs_to_ticks(10), 1);
        assert_eq!(msecs_to_ticks(25), 3);
    }

    #[test]
    fn slots_exhaust_then_stopped_ones_are_reclaimed() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        for _ in 0..MAX_TASKS {
            sched.kernel_thread("w", worker, 0).expect("thread should start");
        }
        assert_eq!(sched.kernel_thread("x", worker, 0), Err(Errno::Again));

        sched.run_as(TaskRef(4));
        sched.exit_current(0);
        sched.run_as(TaskRef::idle(0));
        sched.switching_from.get(0).store(4, Ordering::SeqCst);
        assert_eq!(sched.kernel_thread("x", worker, 0), Err(Errno::Again));

        sched.finish_switch();
        assert_eq!(sched.kernel_thread("x", worker, 0), Ok(5));
        assert!(sched.machine().events().contains(&MachineEvent::FlushAsid(5)));
    }

    #[test]
    fn pid_lookup() {
        let fx = Fixture::new(4);
        let sched = fx.scheduler(1);
        sched.kernel_thread("w", worker, 0).expect("thread should start");
        assert_eq!(sched.pid_to_task(1), Some(TaskRef(0)));
        assert_eq!(sched.pid_to_task(2), None);
        assert_eq!(sched.pid_to_task(0), Some(TaskRef::idle(0)));
        assert_eq!(sched.tasks().len(), 2);
    }

    fn init_image(fx: &Fixture) -> UserImage {
        let text = fx.mem.pool.alloc_zeroed(1).expect("alloc should succeed");
        let data = fx.mem.pool.alloc_zeroed(0).expect("alloc should succeed");
        UserImage {
            text: UserSegment { start: 0x40_0000, end: 0x40_1800, load: text },
            rodata: UserSegment { start: 0x40_2000, end: 0x40_2000, load: text },
            data: UserSegment { start: 0x40_3000, end: 0x40_3100, load: data },
            bss: UserSegment { start: 0x40_3100, end: 0x40_3200, load: data + 0x100 },
            entry: 0x40_0000,
            device: Some(0x0900_0000),
        }
    }

    #[test]
    fn setup_user_space_builds_init_layout() {
        let fx = Fixture::new(32);
        let sched = fx.scheduler(1);
        sched.kernel_thread("init", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        let image = init_image(&fx);
        let entry = sched.setup_user_space(&image).expect("setup should succeed");
        assert_eq!(entry, UserEntry { pc: 0x40_0000, sp: USER_STACK_START + USER_STACK_SIZE });

        let root = sched.task(TaskRef(0)).root.expect("root should be set");
        assert!(sched.machine().events().contains(&MachineEvent::SwitchAs(root, 1)));
        let linear = fx.mem.pool.linear();
        sched
            .with_space(TaskRef(0), |space, _| {
                assert_eq!(space.table().translate(linear, 0x40_1000), Some(image.text.load + PAGE_SIZE));
                assert_eq!(space.mm.start_brk, 0x40_4000);
                assert_eq!(space.mm.brk, 0x40_5000);
                let uart = space.mm.find_vma(USER_DEVICE_MAP_START + 0x0900_0000).expect("uart vma");
                assert!(uart.flags.contains(VmFlags::IO | VmFlags::SHARED));
                assert!(space.mm.find_vma(USER_STACK_START).is_some());
            })
            .expect("space should exist");
    }

    #[test]
    fn fork_copies_space_and_builds_child_frame() {
        let fx = Fixture::new(64);
        let sched = fx.scheduler(1);
        sched.kernel_thread("init", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        sched.setup_user_space(&init_image(&fx)).expect("setup should succeed");
        sched
            .with_space(TaskRef(0), |space, frames| space.copy_to_user(frames, USER_STACK_START, b"stack"))
            .expect("space should exist")
            .expect("copy should succeed");

        let mut frame = TrapFrame::zeroed();
        frame.regs[0] = 0x77;
        frame.regs[1] = 0x88;
        frame.pc = 0x40_0100;
        let child = sched.fork(&frame).expect("fork should succeed");
        assert_eq!(child, 2);

        let child_task = sched.task(TaskRef(1));
        assert_eq!(child_task.state, TaskState::Running);
        assert_eq!(child_task.name(), "init");
        let ctx = unsafe { *sched.contexts[1].get() };
        assert_eq!(ctx.pc, MockMachine::FORK_TRAMPOLINE);
        assert_eq!(ctx.sp as usize, fx.stacks.for_slot(1).top - size_of::<TrapFrame>());
        let saved = unsafe { *(ctx.sp as *const TrapFrame) };
        assert_eq!(saved.regs[0], 0);
        assert_eq!(saved.regs[1], 0x88);
        assert_eq!(saved.pc, 0x40_0100);

        let linear = fx.mem.pool.linear();
        let parent_page = sched
            .with_space(TaskRef(0), |space, _| space.table().translate(linear, USER_STACK_START))
            .expect("space should exist");
        let child_page = sched
            .with_space(TaskRef(1), |space, _| space.table().translate(linear, USER_STACK_START))
            .expect("space should exist");
        assert!(child_page.is_some());
        assert_ne!(parent_page, child_page);
        let mut buf = [0u8; 5];
        sched
            .with_space(TaskRef(1), |space, frames| space.copy_from_user(frames, &mut buf, USER_STACK_START))
            .expect("space should exist")
            .expect("copy should succeed");
        assert_eq!(&buf, b"stack");

        let text_of = |task| {
            sched
                .with_space(task, |space, _| space.table().translate(linear, 0x40_0000))
                .expect("space should exist")
        };
        assert!(text_of(TaskRef(0)).is_some());
        assert_eq!(text_of(TaskRef(0)), text_of(TaskRef(1)));
        let data_of = |task| {
            sched
                .with_space(task, |space, _| space.table().translate(linear, 0x40_3000))
                .expect("space should exist")
        };
        assert_ne!(data_of(TaskRef(0)), data_of(TaskRef(1)));
    }

    #[test]
    fn fork_failure_releases_slot_and_pages() {
        let fx = Fixture::new(24);
        let sched = fx.scheduler(1);
        sched.kernel_thread("init", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        sched.setup_user_space(&init_image(&fx)).expect("setup should succeed");
        let mut hogs = Vec::new();
        while fx.mem.pool.free_count() > 3 {
            hogs.push(fx.mem.pool.alloc_pages(0).expect("alloc should succeed"));
        }
        let free = fx.mem.pool.free_count();
        assert_eq!(sched.fork(&TrapFrame::zeroed()), Err(Errno::NoMem));
        assert_eq!(fx.mem.pool.free_count(), free);
        assert!(!sched.task(TaskRef(1)).in_use);
    }

    #[test]
    fn exit_releases_user_space() {
        let fx = Fixture::new(32);
        let sched = fx.scheduler(1);
        let before = fx.mem.pool.free_count();
        sched.kernel_thread("init", worker, 0).expect("thread should start");
        sched.run_as(TaskRef(0));
        let image = init_image(&fx);
        let image_pages = before - fx.mem.pool.free_count();
        sched.setup_user_space(&image).expect("setup should succeed");
        sched.exit_current(3);
        let task = sched.task(TaskRef(0));
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(task.root, None);
        assert_eq!(fx.mem.pool.free_count(), before - image_pages);
        assert_eq!(sched.with_space(TaskRef(0), |_, _| ()), Err(Errno::Fault));
    }
}
