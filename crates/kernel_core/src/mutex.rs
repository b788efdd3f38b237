//! Mutex whose contenders sleep instead of spinning.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::process::{TaskRef, TaskState};
use crate::sync::IrqSpinLock;
use crate::wait::TaskControl;

struct LockState {
    owner: Option<TaskRef>,
    waiters: VecDeque<TaskRef>,
}

/// Sleeping mutex. Waiters are woken first come, first served; idle tasks
/// never queue and retry by yielding instead.
pub struct SleepMutex<T> {
    state: IrqSpinLock<LockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SleepMutex<T> {}
unsafe impl<T: Send> Sync for SleepMutex<T> {}

impl<T> SleepMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: IrqSpinLock::new(LockState {
                owner: None,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock<'a, C: TaskControl + ?Sized>(&'a self, ctl: &'a C) -> SleepMutexGuard<'a, T, C> {
        let me = ctl.current_task();
        while !self.acquire_or_wait(ctl, me) {
            ctl.schedule();
        }
        SleepMutexGuard { mutex: self, ctl }
    }

    /// Takes the lock for `me`, or queues `me` and marks it sleeping.
    fn acquire_or_wait<C: TaskControl + ?Sized>(&self, ctl: &C, me: TaskRef) -> bool {
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(me);
            state.waiters.retain(|&waiter| waiter != me);
            return true;
        }
        if me.is_idle() {
            return false;
        }
        if !state.waiters.contains(&me) {
            if state.waiters.try_reserve(1).is_err() {
                log::warn!("mutex: no memory to queue {:?}", me);
                return false;
            }
            state.waiters.push_back(me);
        }
        ctl.set_state(me, TaskState::Sleeping);
        false
    }

    pub fn try_lock<'a, C: TaskControl + ?Sized>(&'a self, ctl: &'a C) -> Option<SleepMutexGuard<'a, T, C>> {
        let mut state = self.state.lock();
        if state.owner.is_some() {
            return None;
        }
        state.owner = Some(ctl.current_task());
        Some(SleepMutexGuard { mutex: self, ctl })
    }

    pub fn owner(&self) -> Option<TaskRef> {
        self.state.lock().owner
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn unlock<C: TaskControl + ?Sized>(&self, ctl: &C) {
        let mut state = self.state.lock();
        state.owner = None;
        if let Some(next) = state.waiters.pop_front() {
            ctl.set_state(next, TaskState::Running);
        }
    }
}

/// Holds a [`SleepMutex`]; unlocks on drop.
pub struct SleepMutexGuard<'a, T, C: TaskControl + ?Sized> {
    mutex: &'a SleepMutex<T>,
    ctl: &'a C,
}

impl<T, C: TaskControl + ?Sized> Deref for SleepMutexGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves ownership of the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, C: TaskControl + ?Sized> DerefMut for SleepMutexGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `deref`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, C: TaskControl + ?Sized> Drop for SleepMutexGuard<'_, T, C> {
    fn drop(&mut self) {
        self.mutex.unlock(self.ctl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::fake::FakeTasks;

    #[test]
    fn uncontended_lock_and_unlock() {
        let ctl = FakeTasks::new(TaskRef(0));
        let mutex = SleepMutex::new(1u32);
        {
            let mut guard = mutex.lock(&ctl);
            *guard += 1;
            assert_eq!(mutex.owner(), Some(TaskRef(0)));
        }
        assert_eq!(mutex.owner(), None);
        assert_eq!(*mutex.lock(&ctl), 2);
        assert_eq!(ctl.schedules.get(), 0);
    }

    #[test]
    fn contenders_sleep_and_are_woken_in_order() {
        let owner = FakeTasks::new(TaskRef(0));
        let waiter = FakeTasks::new(TaskRef(1));
        let mutex = SleepMutex::new(());
        let guard = mutex.try_lock(&owner).expect("try_lock should succeed");

        assert!(mutex.try_lock(&waiter).is_none());
        assert!(!mutex.acquire_or_wait(&waiter, TaskRef(1)));
        assert!(!mutex.acquire_or_wait(&waiter, TaskRef(2)));
        assert!(!mutex.acquire_or_wait(&waiter, TaskRef(1)));
        assert_eq!(mutex.waiters(), 2);
        assert_eq!(waiter.last_state(TaskRef(1)), Some(TaskState::Sleeping));

        drop(guard);
        assert_eq!(owner.last_state(TaskRef(1)), Some(TaskState::Running));
        assert_eq!(owner.last_state(TaskRef(2)), None);
        assert_eq!(mutex.waiters(), 1);

        assert!(mutex.acquire_or_wait(&waiter, TaskRef(1)));
        assert_eq!(mutex.owner(), Some(TaskRef(1)));
        assert_eq!(mutex.waiters(), 1);
    }

    #[test]
    fn idle_task_never_queues() {
        let owner = FakeTasks::new(TaskRef(0));
        let idle = FakeTasks::new(TaskRef::idle(0));
        let mutex = SleepMutex::new(());
        let _guard = mutex.try_lock(&owner).expect("try_lock should succeed");
        assert!(!mutex.acquire_or_wait(&idle, TaskRef::idle(0)));
        assert_eq!(mutex.waiters(), 0);
        assert_eq!(idle.last_state(TaskRef::idle(0)), None);
    }
}
