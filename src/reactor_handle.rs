//! A `Rc<RefCell<T>>` that can be captured into a `Send` closure and queued
//! cross-thread via `EventBase::safe_call`, even though nothing in it is
//! actually safe to touch off its owning reactor's thread.
//!
//! This resolves the Design Notes' call for "Arc<RefCell<...>>-style single-
//! thread interior mutability with a runtime-checked ownership discipline":
//! a literal `Arc<RefCell<T>>` does not solve the problem (`RefCell` is
//! never `Sync`, so `Arc<RefCell<T>>` is never `Send` either) - the actual
//! need is a value that crosses threads only "in transit" inside a queued
//! closure, and is dereferenced only after it arrives back on its owning
//! reactor's thread. `Rc<RefCell<T>>` plus an `unsafe impl Send`, guarded in
//! debug builds by an owning-thread assertion on every access, gives
//! exactly that: a panic at the point of misuse in debug builds, and a bare
//! `Rc<RefCell<T>>` with no runtime cost in release builds.
//!
//! The owning thread binds lazily, on first `borrow`/`borrow_mut`, rather
//! than at construction. This covers two distinct callers with one
//! mechanism: a handle built and first used on the same thread (`TcpConn`,
//! created and driven entirely by its reactor) and a handle built on one
//! thread but handed wholesale to a freshly spawned one before any use
//! (`MultiBase` constructing each reactor up front, then giving each to its
//! own worker thread) - in both cases the first real access is the only
//! legitimate owner, and every access after that must agree with it.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

#[cfg(debug_assertions)]
use std::thread::ThreadId;

pub struct ReactorHandle<T> {
    inner: Rc<RefCell<T>>,
    #[cfg(debug_assertions)]
    owner: Rc<Cell<Option<ThreadId>>>,
}

impl<T> ReactorHandle<T> {
    pub fn new(value: T) -> ReactorHandle<T> {
        ReactorHandle {
            inner: Rc::new(RefCell::new(value)),
            #[cfg(debug_assertions)]
            owner: Rc::new(Cell::new(None)),
        }
    }

    #[inline]
    #[cfg(debug_assertions)]
    fn assert_owning_thread(&self) {
        let current = std::thread::current().id();
        match self.owner.get() {
            Some(owner) => assert_eq!(current, owner, "ReactorHandle accessed from a thread other than its owning reactor's"),
            None => self.owner.set(Some(current)),
        }
    }

    #[inline]
    #[cfg(not(debug_assertions))]
    fn assert_owning_thread(&self) {}

    pub fn borrow(&self) -> Ref<'_, T> {
        self.assert_owning_thread();
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.assert_owning_thread();
        self.inner.borrow_mut()
    }

    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &ReactorHandle<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for ReactorHandle<T> {
    fn clone(&self) -> Self {
        ReactorHandle {
            inner: self.inner.clone(),
            #[cfg(debug_assertions)]
            owner: self.owner.clone(),
        }
    }
}

// SAFETY: a `ReactorHandle` is only ever dereferenced (via `borrow`/
// `borrow_mut`) on the thread that created it - debug builds enforce this
// with a runtime assertion. Moving the handle itself to another thread
// (e.g. inside a closure queued through `safe_call`, to be run back on the
// owning reactor) never touches the `RefCell`, so no actual data race can
// occur despite `RefCell<T>` not being `Sync`.
unsafe impl<T> Send for ReactorHandle<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage() {
        let a = ReactorHandle::new(5);
        let b = a.clone();
        *a.borrow_mut() = 9;
        assert_eq!(*b.borrow(), 9);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "owning reactor")]
    fn cross_thread_access_panics_in_debug() {
        let handle = ReactorHandle::new(1);
        let _ = handle.borrow(); // binds the owner to this thread
        let other = handle.clone();
        std::thread::spawn(move || {
            let _ = other.borrow();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unused_handle_binds_owner_on_first_use_by_whoever_that_is() {
        let handle = ReactorHandle::new(1);
        std::thread::spawn(move || {
            assert_eq!(*handle.borrow(), 1);
        })
        .join()
        .unwrap();
    }
}
