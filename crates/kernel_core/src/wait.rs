//! Wait queues and the scheduler surface they need.

use alloc::collections::VecDeque;

use hal::Errno;

use crate::process::{TaskRef, TaskState};
use crate::sync::IrqSpinLock;

/// The part of the scheduler blocking primitives use.
pub trait TaskControl {
    fn current_task(&self) -> TaskRef;

    fn set_state(&self, task: TaskRef, state: TaskState);

    /// Gives up the CPU; returns once the caller runs again.
    fn schedule(&self);
}

/// Tasks waiting for an event.
#[derive(Default)]
pub struct WaitQueue {
    waiters: IrqSpinLock<VecDeque<TaskRef>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinLock::new(VecDeque::new()),
        }
    }

    pub fn add(&self, task: TaskRef) -> Result<(), Errno> {
        let mut waiters = self.waiters.lock();
        push_unique(&mut waiters, task)
    }

    pub fn remove(&self, task: TaskRef) {
        self.waiters.lock().retain(|&waiter| waiter != task);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Makes every waiter runnable and empties the queue.
    pub fn wake_all<C: TaskControl + ?Sized>(&self, ctl: &C) -> usize {
        let mut waiters = self.waiters.lock();
        let woken = waiters.len();
        for task in waiters.drain(..) {
            ctl.set_state(task, TaskState::Running);
        }
        woken
    }

    /// Sleeps until `ready` holds. `ready` is evaluated with the queue locked,
    /// so a waker that updates state before calling [`wake_all`](Self::wake_all)
    /// is never missed.
    pub fn wait_until<C, R>(&self, ctl: &C, mut ready: impl FnMut() -> Option<R>) -> Result<R, Errno>
    where
        C: TaskControl + ?Sized,
    {
        let me = ctl.current_task();
        loop {
            {
                let mut waiters = self.waiters.lock();
                if let Some(value) = ready() {
                    waiters.retain(|&waiter| waiter != me);
                    return Ok(value);
                }
                push_unique(&mut waiters, me)?;
                ctl.set_state(me, TaskState::Sleeping);
            }
            ctl.schedule();
        }
    }
}

fn push_unique(waiters: &mut VecDeque<TaskRef>, task: TaskRef) -> Result<(), Errno> {
    if !waiters.contains(&task) {
        waiters.try_reserve(1).map_err(|_| Errno::NoMem)?;
        waiters.push_back(task);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    use super::TaskControl;
    use crate::process::{TaskRef, TaskState};

    /// Records state changes and counts calls to `schedule`.
    pub struct FakeTasks {
        pub current: Cell<TaskRef>,
        pub states: RefCell<Vec<(TaskRef, TaskState)>>,
        pub schedules: Cell<usize>,
    }

    impl FakeTasks {
        pub fn new(current: TaskRef) -> Self {
            Self {
                current: Cell::new(current),
                states: RefCell::new(Vec::new()),
                schedules: Cell::new(0),
            }
        }

        pub fn last_state(&self, task: TaskRef) -> Option<TaskState> {
            self.states
                .borrow()
                .iter()
                .rev()
                .find(|(t, _)| *t == task)
                .map(|(_, state)| *state)
        }
    }

    impl TaskControl for FakeTasks {
        fn current_task(&self) -> TaskRef {
            self.current.get()
        }

        fn set_state(&self, task: TaskRef, state: TaskState) {
            self.states.borrow_mut().push((task, state));
        }

        fn schedule(&self) {
            self.schedules.set(self.schedules.get() + 1);
        }
    }
}
