//! A common Mutex interface, used to guard the [`crate::mount::Filesystem`]
//! hub.
//!
//! Nothing here implements poisoning recovery! If you panic while holding
//! one of these locks, the data behind it is handed to the next caller as-is
//! (we just clear the poison flag) — we are single-writer by contract
//! (`spec.md` §5), so the only purpose of this lock is to make "serialize
//! externally" enforceable in-process, not to offer real multi-writer
//! concurrency.

pub(crate) trait MutexInterface<T> {
    fn new(inner: T) -> Self;

    /// Runs `func` with exclusive access to the inner value.
    fn locked<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R;

    /// Exclusive access proven statically by `&mut self`; never blocks.
    fn get_mut(&mut self) -> &mut T;
}

pub mod from_std {
    use super::MutexInterface;

    pub use std::sync::Mutex;

    impl<T> MutexInterface<T> for Mutex<T> {
        fn new(inner: T) -> Self {
            Mutex::new(inner)
        }

        #[inline]
        fn locked<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            let mut inner = self.lock().unwrap_or_else(|p| p.into_inner());
            func(&mut *inner)
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.get_mut().unwrap_or_else(|p| p.into_inner())
        }
    }
}

pub use from_std::Mutex;
