//! A copyable cell whose accesses are serialized by a critical section
//!
//! Targets without CAS (e.g. thumbv6m) cannot use the crossbeam cell, so every access here goes
//! through `critical_section::with`. The sections are short: a copy in, a copy out, and whatever
//! closure the caller passes to [`AtomicCell::fetch_update`].

use core::{
    cell::Cell,
    ops::{Add, Sub},
};
use critical_section::Mutex;

/// A value which can be read and replaced from any context, including interrupt handlers
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Send + Copy> AtomicCell<T> {
    /// Create a new cell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Read a copy of the current value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }

    /// Replace the current value, returning the previous one
    pub fn swap(&self, value: T) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).replace(value))
    }

    /// Atomically read-modify-write the value
    ///
    /// `f` is called with the current value. If it returns `Some`, the new value is stored and
    /// the old value is returned in `Ok`. If it returns `None`, the cell is left untouched and the
    /// current value is returned in `Err`.
    pub fn fetch_update(&self, mut f: impl FnMut(T) -> Option<T>) -> Result<T, T> {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            match f(old_value) {
                Some(new_value) => {
                    cell.set(new_value);
                    Ok(old_value)
                }
                None => Err(old_value),
            }
        })
    }
}

impl<T: Copy + Add<Output = T>> AtomicCell<T> {
    /// Add to the value, returning the previous value
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            cell.set(old_value + value);
            old_value
        })
    }
}

impl<T: Copy + Sub<Output = T>> AtomicCell<T> {
    /// Subtract from the value, returning the previous value
    pub fn fetch_sub(&self, value: T) -> T {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            cell.set(old_value - value);
            old_value
        })
    }
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
