use colored::*;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use super::trace::Traced;
use crate::debug::LOG_OBJECT;

/// Holds a pointer to a collector-owned object. Copying a `Gc` copies the
/// pointer only; the GC remains the sole owner of the allocation.
pub struct Gc<T: ?Sized> {
    ptr: NonNull<Traced<T>>,
}

impl<T: fmt::Debug> Gc<T> {
    /// Creates a new `Gc<T>` pointer, called by the GC itself.
    pub(super) fn new(ptr: &mut Traced<T>) -> Self {
        let s = Self {
            ptr: NonNull::from(ptr),
        };
        if LOG_OBJECT {
            println!(
                "{}\tGc::new() ({}) ({:?})",
                "[OBJECT]".purple(),
                std::any::type_name::<T>(),
                s.ptr.as_ptr(),
            );
        }
        s
    }
}

impl<T: ?Sized> Gc<T> {
    /// Returns a reference to the inner type `T`.
    pub fn as_ref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }

    /// Returns a mutable reference to the inner type `T`.
    pub fn as_mut(&mut self) -> &mut T {
        unsafe { &mut self.ptr.as_mut().data }
    }

    /// Identity comparison: do both handles refer to the same allocation?
    pub fn ptr_eq(a: &Gc<T>, b: &Gc<T>) -> bool {
        std::ptr::eq(a.ptr.as_ptr(), b.ptr.as_ptr())
    }

    pub(super) fn marked(&self) -> bool {
        unsafe { self.ptr.as_ref().marked() }
    }

    pub(super) fn set_mark(&self, val: bool) {
        unsafe {
            self.ptr.as_ref().set_mark(val);
        }
    }
}

impl<T: ?Sized> Copy for Gc<T> {}

impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl<T: ?Sized> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc {{ ptr: {:?} }}", self.ptr.as_ptr())
    }
}
