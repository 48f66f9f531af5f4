use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU16, Ordering};

use crate::cpu;

/// Mutex that disables interrupts while held.
///
/// Uses a **ticket lock** internally for FIFO fairness: each acquirer takes a
/// monotonically-increasing ticket and spins until `now_serving` matches.
/// This guarantees that CPUs acquire the lock in the order they requested it,
/// eliminating starvation under SMP contention.
///
/// The NDP stack uses this in two roles: a structural mutex around channel
/// create/destroy/start/stop/subscribe, and a short-hold pointer lock around
/// SDP/SHP flushes and HDP/HHP refreshes.
pub struct IrqMutex<T> {
    /// Monotonically-increasing ticket counter. Wraps at `u16::MAX` —
    /// equality checks handle wrap-around correctly.
    next_ticket: AtomicU16,
    /// The ticket currently being served. Incremented on unlock; a waiter
    /// spins until `now_serving == my_ticket`.
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex provides exclusive access through ticket-lock acquisition
// with interrupts disabled, making it safe to share across contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: Default> Default for IrqMutex<T> {
    #[inline]
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> IrqMutex<T> {
    /// Check if the lock is currently held (or has waiters).
    #[inline]
    pub fn is_locked(&self) -> bool {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next != serving
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Spin until our ticket is being served. The read of `now_serving`
        // is Acquire so that all writes made by the previous holder are
        // visible once we observe our ticket being served.
        //
        // Proportional backoff: the further away our ticket is from
        // now_serving, the more PAUSE iterations we issue per check.
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = cpu::save_flags_cli();

        // Succeed only if the lock is currently free (next_ticket ==
        // now_serving). CAS next_ticket forward by 1; if someone else
        // grabbed a ticket in the meantime the CAS fails and we bail out
        // without waiting.
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
            })
        } else {
            cpu::restore_flags(saved_flags);
            None
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Advance now_serving to hand the lock to the next waiter in FIFO
        // order. Release ordering makes our writes visible to the next
        // acquirer.
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

// =============================================================================
// IrqRwLock - Reader-Writer Lock with IRQ disable
// =============================================================================

/// A writer-preferring reader-writer lock that disables interrupts while
/// held. The device FDT snapshot is the main user: many readers (binding
/// lookups, char-device reads), rare writers (window publication).
pub struct IrqRwLock<T> {
    /// State: 0 = unlocked, -1 = write-locked, >0 = number of readers.
    state: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for IrqRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for IrqRwLock<T> {}

pub struct IrqRwLockReadGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

pub struct IrqRwLockWriteGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

impl<T> IrqRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicI32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> IrqRwLockReadGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state >= 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return IrqRwLockReadGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }

    pub fn write(&self) -> IrqRwLockWriteGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqRwLockWriteGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }
}

impl<'a, T> Deref for IrqRwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

impl<'a, T> Deref for IrqRwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}
