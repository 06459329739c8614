//! The begin/end bracket.
//!
//! [`Exclusive<T>`] is a mutex whose critical section may span two separate
//! FFI calls: `call_begin` enters it and `call_end` leaves it, with module
//! code running in between. Rust code uses the scoped [`Bracket`]; the
//! trampolines use the raw [`Exclusive::enter`] / [`Exclusive::leave`] pair.
//!
//! The lock remembers which thread holds it. A thread entering a bracket it
//! already holds gets [`HandoffError::Reentrant`] instead of deadlocking, and
//! only the holding thread may leave.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::error::HandoffError;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

const NOBODY: u64 = 0;

pub struct Exclusive<T> {
    raw: RawMutex,
    holder: AtomicU64,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Exclusive<T> {}
unsafe impl<T: Send> Sync for Exclusive<T> {}

impl<T> Exclusive<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::INIT,
            holder: AtomicU64::new(NOBODY),
            value: UnsafeCell::new(value),
        }
    }

    /// Open a bracket, blocking until no other thread holds one.
    pub fn begin(&self) -> Result<Bracket<'_, T>, HandoffError> {
        self.acquire()?;
        Ok(Bracket {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Run `f` inside a bracket.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, HandoffError> {
        let mut bracket = self.begin()?;
        Ok(f(&mut bracket))
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == thread_token()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Open a bracket without a guard.
    ///
    /// # Safety
    ///
    /// The pointer is valid until the matching [`leave`](Self::leave) on
    /// this thread, and must not be used afterwards.
    pub(crate) unsafe fn enter(&self) -> Result<*mut T, HandoffError> {
        self.acquire()?;
        Ok(self.value.get())
    }

    /// The protected value, if this thread holds the bracket.
    pub(crate) fn held(&self) -> Option<*mut T> {
        self.is_held_by_current_thread().then(|| self.value.get())
    }

    /// Close a bracket opened with [`enter`](Self::enter).
    ///
    /// # Safety
    ///
    /// No pointer obtained from `enter` or `held` may be used afterwards.
    pub(crate) unsafe fn leave(&self) -> Result<(), HandoffError> {
        if !self.is_held_by_current_thread() {
            return Err(HandoffError::NotHeld);
        }
        self.release();
        Ok(())
    }

    fn acquire(&self) -> Result<(), HandoffError> {
        let me = thread_token();
        // Only this thread ever stores `me`, so a relaxed load is enough to
        // see our own earlier store.
        if self.holder.load(Ordering::Relaxed) == me {
            return Err(HandoffError::Reentrant);
        }
        self.raw.lock();
        self.holder.store(me, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn release(&self) {
        self.holder.store(NOBODY, Ordering::Relaxed);
        self.raw.unlock();
    }
}

impl<T: Default> Default for Exclusive<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for Exclusive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exclusive")
            .field("held", &(self.holder.load(Ordering::Relaxed) != NOBODY))
            .finish_non_exhaustive()
    }
}

/// An open bracket. Closing happens on drop.
pub struct Bracket<'a, T> {
    lock: &'a Exclusive<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for Bracket<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for Bracket<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for Bracket<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.release() };
    }
}
