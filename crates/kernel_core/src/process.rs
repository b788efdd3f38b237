use hal::PhysAddr;

use crate::config::{KERNEL_STACK_SIZE, MAX_TASKS, TASK_NAME_LEN};

/// Process identifier. Slot `n` runs pid `n + 1`; pid 0 is the idle task.
pub type Pid = u32;

/// Entry point of a kernel thread, called with its argument.
pub type ThreadEntry = extern "C" fn(u64) -> i64;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initializing,
    Running,
    Sleeping,
    Stopped,
}

/// Index into the task table. Slots `MAX_TASKS..` hold the per-core idle tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef(pub usize);

impl TaskRef {
    pub const fn idle(core: usize) -> Self {
        Self(MAX_TASKS + core)
    }

    pub const fn for_pid(pid: Pid) -> Option<Self> {
        if pid == 0 || pid as usize > MAX_TASKS {
            None
        } else {
            Some(Self(pid as usize - 1))
        }
    }

    pub const fn is_idle(self) -> bool {
        self.0 >= MAX_TASKS
    }

    pub const fn slot(self) -> usize {
        self.0
    }

    pub const fn pid(self) -> Pid {
        if self.is_idle() {
            0
        } else {
            self.0 as Pid + 1
        }
    }
}

/// Kernel stack metadata for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: usize,
    pub top: usize,
}

/// One contiguous region carved into per-slot kernel stacks.
#[derive(Debug, Clone, Copy)]
pub struct KernelStacks {
    base: usize,
    size: usize,
}

impl KernelStacks {
    /// `region` must span `MAX_TASKS * KERNEL_STACK_SIZE` bytes.
    pub const fn new(region: usize) -> Self {
        Self {
            base: region,
            size: KERNEL_STACK_SIZE,
        }
    }

    pub const fn region_len() -> usize {
        MAX_TASKS * KERNEL_STACK_SIZE
    }

    pub const fn for_slot(&self, slot: usize) -> KernelStack {
        let base = self.base + slot * self.size;
        KernelStack {
            base,
            top: base + self.size,
        }
    }
}

/// Task control block.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    pub in_use: bool,
    name: [u8; TASK_NAME_LEN],
    name_len: usize,
    /// Root of the user page table, if the task has a user space.
    pub root: Option<PhysAddr>,
    pub utime: u64,
    pub stime: u64,
    pub kstack: Option<KernelStack>,
}

impl Task {
    pub const EMPTY: Task = Task {
        pid: 0,
        state: TaskState::Initializing,
        in_use: false,
        name: [0; TASK_NAME_LEN],
        name_len: 0,
        root: None,
        utime: 0,
        stime: 0,
        kstack: None,
    };

    /// A freshly claimed slot for `pid`, not yet runnable.
    pub const fn claimed(pid: Pid) -> Task {
        let mut task = Task::EMPTY;
        task.pid = pid;
        task.in_use = true;
        task
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    /// Stores `name`, truncated to the name buffer.
    pub fn set_name(&mut self, name: &str) {
        let mut len = name.len().min(TASK_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name = [0; TASK_NAME_LEN];
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.name_len = len;
    }

    /// Accumulated run time in ticks.
    pub fn runtime(&self) -> u64 {
        self.utime + self.stime
    }

    pub fn is_runnable(&self) -> bool {
        self.in_use && self.state == TaskState::Running
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_and_pids_correspond() {
        assert_eq!(TaskRef(0).pid(), 1);
        assert_eq!(TaskRef(31).pid(), 32);
        assert_eq!(TaskRef::idle(2).pid(), 0);
        assert!(TaskRef::idle(0).is_idle());
        assert_eq!(TaskRef::for_pid(5), Some(TaskRef(4)));
        assert_eq!(TaskRef::for_pid(0), None);
        assert_eq!(TaskRef::for_pid(33), None);
    }

    #[test]
    fn task_name_is_truncated() {
        let mut task = Task::EMPTY;
        task.set_name("a-very-long-task-name");
        assert_eq!(task.name(), "a-very-long-task");
        task.set_name("init");
        assert_eq!(task.name(), "init");
    }

    #[test]
    fn claimed_slot_starts_initializing_without_name() {
        let task = Task::claimed(7);
        assert_eq!(task.pid, 7);
        assert!(task.in_use);
        assert_eq!(task.state, TaskState::Initializing);
        assert_eq!(task.name(), "");
        assert!(task.root.is_none());
    }

    #[test]
    fn kernel_stacks_do_not_overlap() {
        let stacks = KernelStacks::new(0x10_0000);
        let a = stacks.for_slot(0);
        let b = stacks.for_slot(1);
        assert_eq!(a.top, b.base);
        assert_eq!(b.top - b.base, KERNEL_STACK_SIZE);
    }
}
