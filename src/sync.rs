// Scheduler-integrated blocking primitives. Both the mutex and the counting
// semaphore keep FIFO wait queues of task ids and do all their bookkeeping
// inside irq critical sections, which is the kernel's only lock.

use crate::irq;
use crate::task;
use crate::task::{TaskId, TaskQueue, TaskState};
use core::cell::UnsafeCell;

struct MutexInner {
    locked: bool,
    owner: Option<TaskId>,
    waiters: TaskQueue,
}

/// Blocking, non-recursive, owner-tracked mutex.
pub(crate) struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

// Single CPU; all access happens with interrupts disabled.
unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    pub(crate) const fn new() -> Mutex {
        Mutex {
            inner: UnsafeCell::new(MutexInner {
                locked: false,
                owner: None,
                waiters: TaskQueue::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) {
        let state = irq::enter_protection();
        let inner = unsafe { &mut *self.inner.get() };

        if !inner.locked {
            inner.locked = true;
            inner.owner = task::task_current();
        } else {
            // Contention is only possible once tasking is up.
            let curr = task::task_current().expect("mutex contended before tasking");
            debug_assert_ne!(inner.owner, Some(curr), "mutex relock by owner");
            inner.waiters.push(curr);
            task::task_set_block(curr);
            task::task_set_state(curr, TaskState::Waiting);
            task::task_dispatch();
        }

        irq::leave_protection(state);
    }

    /// Hand the lock to the first waiter, or release it.
    pub(crate) fn unlock(&self) {
        let state = irq::enter_protection();
        let inner = unsafe { &mut *self.inner.get() };

        debug_assert!(inner.locked, "unlock of unlocked mutex");
        debug_assert_eq!(inner.owner, task::task_current(), "unlock by non-owner");

        match inner.waiters.pop() {
            Some(next) => {
                inner.owner = Some(next);
                task::task_set_ready(next);
                task::task_dispatch();
            }
            None => {
                inner.locked = false;
                inner.owner = None;
            }
        }

        irq::leave_protection(state);
    }
}

struct SemInner {
    count: u32,
    waiters: TaskQueue,
}

/// Counting semaphore; used both for blocking waits and as the IRQ
/// completion rendezvous of the disk driver.
pub(crate) struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub(crate) const fn new(count: u32) -> Semaphore {
        Semaphore {
            inner: UnsafeCell::new(SemInner {
                count,
                waiters: TaskQueue::new(),
            }),
        }
    }

    pub(crate) fn wait(&self) {
        let state = irq::enter_protection();
        let inner = unsafe { &mut *self.inner.get() };

        if inner.count > 0 {
            inner.count -= 1;
        } else {
            match task::task_current() {
                Some(curr) => {
                    inner.waiters.push(curr);
                    task::task_set_block(curr);
                    task::task_set_state(curr, TaskState::Waiting);
                    task::task_dispatch();
                }
                // Nothing to suspend during boot; callers poll the device
                // instead (see disk_read / disk_write).
                None => {}
            }
        }

        irq::leave_protection(state);
    }

    pub(crate) fn notify(&self) {
        let state = irq::enter_protection();
        let inner = unsafe { &mut *self.inner.get() };

        match inner.waiters.pop() {
            Some(next) => {
                task::task_set_ready(next);
                task::task_dispatch();
            }
            None => inner.count += 1,
        }

        irq::leave_protection(state);
    }

    #[allow(dead_code)]
    pub(crate) fn count(&self) -> u32 {
        let state = irq::enter_protection();
        let count = unsafe { &*self.inner.get() }.count;
        irq::leave_protection(state);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_counts_without_waiters() {
        let sem = Semaphore::new(2);
        sem.wait();
        assert_eq!(sem.count(), 1);
        sem.wait();
        assert_eq!(sem.count(), 0);
        sem.notify();
        sem.notify();
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn boot_time_wait_on_empty_semaphore_does_not_hang() {
        let sem = Semaphore::new(0);
        sem.wait();
        assert_eq!(sem.count(), 0);
    }
}
