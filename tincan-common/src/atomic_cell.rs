//! Storage cell for object values
//!
//! Object values are read by the node during `step` and by the application from any context.
//! Targets without compare-and-swap (e.g. thumbv6m) have no atomics wider than a word, so every
//! access takes a critical section instead.

use core::cell::Cell;
use critical_section::Mutex;

/// A `Copy` value shared between contexts, accessed only inside a critical section
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

    /// Read the current value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_store() {
        let cell = AtomicCell::new(([0u8; 4], 0usize));
        cell.store(([1, 2, 3, 0], 3));
        assert_eq!(([1, 2, 3, 0], 3), cell.load());
        assert_eq!(0u16, AtomicCell::<u16>::default().load());
    }
}
