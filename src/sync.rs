use std::sync::PoisonError;

/// A `std::sync::Mutex` that recovers the guard from poisoning instead of
/// propagating it.
pub(crate) struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

pub(crate) type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Mutex<T> {
        Mutex {
            inner: std::sync::Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
