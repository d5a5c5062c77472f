//! The buffer pool: the sole gateway to pages, a bounded cache with LRU
//! eviction over clean pages, and the place where page locks are taken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::lock_manager::LockManager;
use crate::page::PageRef;
use crate::tuple::Tuple;
use crate::types::{PageId, Permissions, TransactionId};

/// Default number of pages the pool caches.
pub const DEFAULT_PAGES: usize = 50;

struct CacheSlot {
    page: PageRef,
    last_used: u64,
}

#[derive(Default)]
struct Cache {
    slots: HashMap<PageId, CacheSlot>,
    tick: u64,
}

impl Cache {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Caches up to `capacity` pages and checks lock ownership before handing
/// any of them out. An uncommitted (dirty) page is never evicted, and
/// therefore never reaches disk before its transaction commits.
pub struct BufferPool {
    capacity: usize,
    lock_manager: LockManager,
    cache: Mutex<Cache>,
}

impl BufferPool {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        BufferPool {
            capacity,
            lock_manager: LockManager::new(lock_timeout),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Retrieves a page with the requested permissions. The lock is taken
    /// first and may block; a timed-out wait surfaces as
    /// `TransactionAborted`. On a miss the page is read through its owning
    /// file and cached, evicting the least recently used clean page when
    /// the pool is full.
    pub fn get_page(
        &self,
        db: &Database,
        tid: TransactionId,
        pid: PageId,
        perm: Permissions,
    ) -> DbResult<PageRef> {
        match perm {
            Permissions::ReadOnly => self.lock_manager.acquire_read(pid, tid)?,
            Permissions::ReadWrite => self.lock_manager.acquire_write(pid, tid)?,
        }

        {
            let mut cache = self.cache.lock().unwrap();
            let tick = cache.touch();
            if let Some(slot) = cache.slots.get_mut(&pid) {
                slot.last_used = tick;
                return Ok(Arc::clone(&slot.page));
            }
        }

        let file = db.catalog().database_file(pid.table_id)?;
        let page = Arc::new(RwLock::new(file.read_page(pid)?));

        let mut cache = self.cache.lock().unwrap();
        // another reader may have installed the page while we read it
        let tick = cache.touch();
        if let Some(slot) = cache.slots.get_mut(&pid) {
            slot.last_used = tick;
            return Ok(Arc::clone(&slot.page));
        }
        self.install(&mut cache, pid, Arc::clone(&page))?;
        Ok(page)
    }

    fn install(&self, cache: &mut Cache, pid: PageId, page: PageRef) -> DbResult<()> {
        let tick = cache.touch();
        if let Some(slot) = cache.slots.get_mut(&pid) {
            slot.page = page;
            slot.last_used = tick;
            return Ok(());
        }
        if cache.slots.len() >= self.capacity {
            self.evict(cache)?;
        }
        cache.slots.insert(
            pid,
            CacheSlot {
                page,
                last_used: tick,
            },
        );
        Ok(())
    }

    /// Drops the least recently used clean page. Dirty pages are off limits:
    /// with no undo log, writing uncommitted data would be unrecoverable.
    fn evict(&self, cache: &mut Cache) -> DbResult<()> {
        let victim = cache
            .slots
            .iter()
            .filter(|(_, slot)| slot.page.read().unwrap().dirtier().is_none())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(pid, _)| *pid);
        match victim {
            Some(pid) => {
                crate::strata_debug_log!("[BufferPool::evict] Evicting page {}", pid.page_no);
                cache.slots.remove(&pid);
                Ok(())
            }
            None => Err(DbError::db("no evictable page")),
        }
    }

    /// Inserts a tuple through the owning file, stamping every dirtied page
    /// and installing it in the cache so future requests see the update.
    pub fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        table_id: u32,
        t: Tuple,
    ) -> DbResult<()> {
        let file = db.catalog().database_file(table_id)?;
        let dirtied = file.insert_tuple(db, tid, t)?;
        self.install_dirtied(tid, dirtied)
    }

    /// Deletes a tuple through the file owning it, stamping every dirtied
    /// page and installing it in the cache.
    pub fn delete_tuple(&self, db: &Database, tid: TransactionId, t: &Tuple) -> DbResult<()> {
        let rid = t
            .record_id()
            .ok_or_else(|| DbError::db("tuple has no record id"))?;
        let file = db.catalog().database_file(rid.page_id.table_id)?;
        let dirtied = file.delete_tuple(db, tid, t)?;
        self.install_dirtied(tid, dirtied)
    }

    fn install_dirtied(&self, tid: TransactionId, dirtied: Vec<PageRef>) -> DbResult<()> {
        for page in &dirtied {
            page.write().unwrap().mark_dirty(Some(tid));
        }
        let mut cache = self.cache.lock().unwrap();
        for page in dirtied {
            let pid = page.read().unwrap().id();
            self.install(&mut cache, pid, page)?;
        }
        Ok(())
    }

    /// Commits or aborts a transaction. Commit flushes the transaction's
    /// dirty pages before any lock is released; abort discards them so the
    /// next read refetches the clean on-disk version.
    pub fn transaction_complete(
        &self,
        db: &Database,
        tid: TransactionId,
        commit: bool,
    ) -> DbResult<()> {
        crate::strata_debug_log!(
            "[BufferPool::transaction_complete] tx {} {}",
            tid.id(),
            if commit { "commit" } else { "abort" }
        );
        let pids = self.lock_manager.pages_locked_by(tid);
        if commit {
            for pid in &pids {
                self.flush_page(db, *pid)?;
            }
        } else {
            // drop every page the transaction touched, not just the stamped
            // ones: an operation cut short by a lock timeout may have
            // mutated pages it never got to stamp
            let mut cache = self.cache.lock().unwrap();
            for pid in &pids {
                cache.slots.remove(pid);
            }
        }
        self.lock_manager.release_all(tid);
        Ok(())
    }

    /// Writes the page through its file if it is cached and dirty.
    pub fn flush_page(&self, db: &Database, pid: PageId) -> DbResult<()> {
        let page = {
            let cache = self.cache.lock().unwrap();
            match cache.slots.get(&pid) {
                Some(slot) => Arc::clone(&slot.page),
                None => return Ok(()),
            }
        };
        let mut guard = page.write().unwrap();
        if guard.dirtier().is_some() {
            guard.mark_dirty(None);
            let file = db.catalog().database_file(pid.table_id)?;
            file.write_page(&guard)?;
        }
        Ok(())
    }

    /// Flushes every dirty page in the cache. Breaks NO-STEAL if called
    /// while transactions are in flight; meant for shutdown and tests.
    pub fn flush_all_pages(&self, db: &Database) -> DbResult<()> {
        let pids: Vec<PageId> = {
            let cache = self.cache.lock().unwrap();
            cache.slots.keys().copied().collect()
        };
        for pid in pids {
            self.flush_page(db, pid)?;
        }
        Ok(())
    }

    /// Removes a page from the cache without writing it back. Used when a
    /// freed page's slot is about to be reused and on abort.
    pub fn discard_page(&self, pid: PageId) {
        self.cache.lock().unwrap().slots.remove(&pid);
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_manager.holds(pid, tid)
    }

    pub fn lock_mode(&self, tid: TransactionId, pid: PageId) -> Option<Permissions> {
        self.lock_manager.mode(pid, tid)
    }

    #[cfg(test)]
    pub(crate) fn cached_page_count(&self) -> usize {
        self.cache.lock().unwrap().slots.len()
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, pid: PageId) -> bool {
        self.cache.lock().unwrap().slots.contains_key(&pid)
    }
}
