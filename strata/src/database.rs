//! The explicitly-constructed engine context: one catalog plus one buffer
//! pool, handed to every operation instead of living in process-wide
//! statics. Tests rebuild the buffer pool with a chosen capacity through
//! `reset_buffer_pool`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::buffer_pool::{BufferPool, DEFAULT_PAGES};
use crate::catalog::Catalog;
use crate::lock_manager::DEFAULT_LOCK_TIMEOUT;

pub struct Database {
    catalog: Catalog,
    buffer_pool: RwLock<Arc<BufferPool>>,
}

impl Database {
    pub fn new() -> Self {
        Database::with_buffer_pool(DEFAULT_PAGES, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_buffer_pool(capacity: usize, lock_timeout: Duration) -> Self {
        Database {
            catalog: Catalog::new(),
            buffer_pool: RwLock::new(Arc::new(BufferPool::new(capacity, lock_timeout))),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.buffer_pool.read().unwrap())
    }

    /// Replaces the buffer pool (and with it the lock manager) with a fresh
    /// one of the given capacity. Only meaningful between transactions.
    pub fn reset_buffer_pool(&self, capacity: usize) -> Arc<BufferPool> {
        self.reset_buffer_pool_with(capacity, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn reset_buffer_pool_with(
        &self,
        capacity: usize,
        lock_timeout: Duration,
    ) -> Arc<BufferPool> {
        let fresh = Arc::new(BufferPool::new(capacity, lock_timeout));
        *self.buffer_pool.write().unwrap() = Arc::clone(&fresh);
        fresh
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}
