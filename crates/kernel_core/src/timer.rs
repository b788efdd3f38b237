//! One-shot timers keyed by absolute tick.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hal::Errno;

use crate::process::TaskRef;
use crate::sync::IrqSpinLock;

/// Handle returned by [`TimerList::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What happens when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Make a sleeping task runnable.
    Wake(TaskRef),
    /// Call a function with its data word.
    Call(fn(usize), usize),
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    expires: u64,
    action: TimerAction,
}

/// Pending timers of the whole system.
pub struct TimerList {
    timers: IrqSpinLock<Vec<Timer>>,
    next_id: AtomicU64,
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            timers: IrqSpinLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Arms a timer firing once the tick counter reaches `expires`.
    pub fn add(&self, expires: u64, action: TimerAction) -> Result<TimerId, Errno> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut timers = self.timers.lock();
        timers.try_reserve(1).map_err(|_| Errno::NoMem)?;
        timers.push(Timer {
            id,
            expires,
            action,
        });
        Ok(id)
    }

    /// Disarms a timer. Returns false if it already fired or never existed.
    pub fn del(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock();
        match timers.iter().position(|timer| timer.id == id) {
            Some(index) => {
                timers.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Moves a pending timer to a new expiry.
    pub fn modify(&self, id: TimerId, expires: u64) -> bool {
        let mut timers = self.timers.lock();
        match timers.iter_mut().find(|timer| timer.id == id) {
            Some(timer) => {
                timer.expires = expires;
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Removes every timer due at `now` and runs it with the list unlocked,
    /// earliest first. Returns how many fired.
    pub fn run_expired(&self, now: u64, mut wake: impl FnMut(TaskRef)) -> usize {
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            let mut index = 0;
            while index < timers.len() {
                if timers[index].expires <= now {
                    due.push(timers.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }
        due.sort_unstable_by_key(|timer| (timer.expires, timer.id));
        for timer in &due {
            match timer.action {
                TimerAction::Wake(task) => wake(task),
                TimerAction::Call(func, data) => func(data),
            }
        }
        due.len()
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}
