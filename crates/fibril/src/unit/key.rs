//! Work-unit-specific data

use super::Unit;
use crate::error::{Error, Result};
use crate::local;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Key of a per-unit value of type `T`
///
/// Each unit holds its own value for a key, like thread-local storage scoped
/// to the unit. Values are dropped when the unit terminates.
pub struct Key<T> {
    id: u64,
    freed: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            freed: self.freed.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Key<T> {
    /// Create a new key
    pub fn new() -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            freed: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    fn check(&self) -> Result<u64> {
        if self.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidKey);
        }
        Ok(self.id)
    }

    /// Set the calling unit's value
    pub fn set(&self, value: T) -> Result<()> {
        self.check()?;
        current()?.set_specific(self, value)
    }

    /// Copy of the calling unit's value
    pub fn get(&self) -> Result<Option<T>>
    where
        T: Clone,
    {
        self.check()?;
        current()?.get_specific(self)
    }

    /// Remove and return the calling unit's value
    pub fn take(&self) -> Result<Option<T>> {
        self.check()?;
        current()?.take_specific(self)
    }

    /// Run `f` on the calling unit's value
    ///
    /// `f` must not access any key of the calling unit.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> Result<R> {
        let id = self.check()?;
        let unit = current()?;
        let specific = unit.inner.specific.lock();
        Ok(f(specific.get(&id).and_then(|v| v.downcast_ref::<T>())))
    }

    /// Free the key; every clone becomes invalid
    ///
    /// Values already stored under the key stay with their units until they
    /// terminate.
    pub fn free(self) -> Result<()> {
        self.check()?;
        self.freed.store(true, Ordering::Release);
        Ok(())
    }
}

impl<T: Send + 'static> Default for Key<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn current() -> Result<Unit> {
    local::current_unit().ok_or(Error::InvalidUnit)
}

impl Unit {
    /// Set this unit's value for `key`
    pub fn set_specific<T: Send + 'static>(&self, key: &Key<T>, value: T) -> Result<()> {
        let id = key.check()?;
        self.check()?;
        let old = self
            .inner
            .specific
            .lock()
            .insert(id, Box::new(value) as Box<dyn Any + Send>);
        drop(old);
        Ok(())
    }

    /// Copy of this unit's value for `key`
    pub fn get_specific<T: Clone + Send + 'static>(&self, key: &Key<T>) -> Result<Option<T>> {
        let id = key.check()?;
        self.check()?;
        let specific = self.inner.specific.lock();
        Ok(specific.get(&id).and_then(|v| v.downcast_ref::<T>()).cloned())
    }

    /// Remove and return this unit's value for `key`
    pub fn take_specific<T: Send + 'static>(&self, key: &Key<T>) -> Result<Option<T>> {
        let id = key.check()?;
        self.check()?;
        let value = self.inner.specific.lock().remove(&id);
        Ok(value.and_then(|v| v.downcast::<T>().ok()).map(|v| *v))
    }
}
