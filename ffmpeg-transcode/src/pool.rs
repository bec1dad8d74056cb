//! Recycling pool for frame handles.
//!
//! Decoders and converters obtain their output frames here instead of
//! allocating a fresh `AVFrame` per picture. A handle goes back to its pool
//! when the last owner drops it, so a frame is never shared between two
//! consumers while it is being refilled.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Same as `AV_NUM_DATA_POINTERS`: enough idle frames to cover the codec's
/// reference window without growing unbounded.
pub const DEFAULT_POOL_SIZE: usize = 8;

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    alloc: fn() -> T,
}

pub struct FramePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for FramePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FramePool<T> {
    /// `capacity` caps how many idle objects are kept, not how many can be
    /// handed out.
    pub fn new(capacity: usize, alloc: fn() -> T) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                alloc,
            }),
        }
    }

    pub fn obtain(&self) -> Pooled<T> {
        let recycled = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let item = recycled.unwrap_or_else(self.inner.alloc);
        Pooled {
            item: ManuallyDrop::new(item),
            pool: Arc::downgrade(&self.inner),
        }
    }

    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// An object borrowed from a [`FramePool`]; returns itself on drop.
pub struct Pooled<T> {
    item: ManuallyDrop<T>,
    pool: Weak<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Wraps an object that belongs to no pool; it is simply dropped.
    pub fn detached(item: T) -> Self {
        Self {
            item: ManuallyDrop::new(item),
            pool: Weak::new(),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: `item` is never touched again after this point.
        let item = unsafe { ManuallyDrop::take(&mut self.item) };
        if let Some(pool) = self.pool.upgrade() {
            let mut idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < pool.capacity {
                idle.push(item);
            }
        }
    }
}
