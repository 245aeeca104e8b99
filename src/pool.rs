//! Shared resource pools
//!
//! Typed free-lists for scratch resources used while executing tasks.
//! Resources are checked out through a `Pooled` guard which returns the
//! instance on drop, so every exit path (including `?` and panics) gives
//! it back.

use crate::config::PoolConfig;
use crate::merge::Patcher;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Free-list of one resource kind
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    create: fn() -> T,
    reset: fn(&mut T),
    max_idle: usize,
    created: AtomicUsize,
    in_use: AtomicUsize,
}

impl<T> Pool<T> {
    pub fn new(create: fn() -> T, reset: fn(&mut T), max_idle: usize) -> Self {
        Pool {
            free: Mutex::new(Vec::new()),
            create,
            reset,
            max_idle,
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Check out an instance, creating one if the free-list is empty
    pub fn acquire(&self) -> Pooled<'_, T> {
        let item = match self.free.lock().pop() {
            Some(item) => item,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.create)()
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Pooled { pool: self, item: Some(item) }
    }

    fn release(&self, mut item: T) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        (self.reset)(&mut item);
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(item);
        }
    }

    /// Number of instances currently checked out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of instances created over the pool lifetime
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// Guard returning its instance to the pool on drop
pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

/// Pools shared by all requests of a hub
pub struct SharedPools {
    /// Serialization buffers
    pub buffers: Pool<Vec<u8>>,
    /// Merge patch appliers
    pub patchers: Pool<Patcher>,
}

impl SharedPools {
    pub fn new(config: &PoolConfig) -> Self {
        SharedPools {
            buffers: Pool::new(Vec::new, Vec::clear, config.max_idle),
            patchers: Pool::new(Patcher::default, Patcher::reset, config.max_idle),
        }
    }

    /// Total instances checked out across all pools
    pub fn in_use(&self) -> usize {
        self.buffers.in_use() + self.patchers.in_use()
    }
}

impl Default for SharedPools {
    fn default() -> Self {
        SharedPools::new(&PoolConfig::default())
    }
}
