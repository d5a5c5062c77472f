//! Page-granularity lock manager with timeout-based deadlock resolution.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DbError, DbResult};
use crate::types::{PageId, Permissions, TransactionId};

/// How long an acquisition waits before it fails with
/// `DbError::TransactionAborted`.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound of the random extra added to every wait deadline, so two
/// transactions waiting on each other do not both time out in lockstep.
const TIMEOUT_JITTER_MS: u64 = 50;

#[derive(Debug, Default)]
struct PageLock {
    readers: HashSet<TransactionId>,
    writer: Option<TransactionId>,
}

impl PageLock {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn held_by(&self, tid: TransactionId) -> bool {
        self.writer == Some(tid) || self.readers.contains(&tid)
    }
}

/// Grants shared and exclusive page locks to transactions. Waiters block on
/// a condition variable; a waiter whose deadline expires gives up with
/// `TransactionAborted`, which the owning transaction resolves by rolling
/// back. An acquisition that times out leaves no trace in the lock table.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<HashMap<PageId, PageLock>>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        LockManager {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    fn deadline(&self) -> Instant {
        let jitter = rand::thread_rng().gen_range(0..=TIMEOUT_JITTER_MS);
        Instant::now() + self.timeout + Duration::from_millis(jitter)
    }

    /// Acquires a shared lock. Granted immediately if `tid` already holds
    /// any lock on the page or no transaction holds the write lock.
    pub fn acquire_read(&self, pid: PageId, tid: TransactionId) -> DbResult<()> {
        let deadline = self.deadline();
        let mut table = self.table.lock().unwrap();
        loop {
            let lock = table.entry(pid).or_default();
            if lock.held_by(tid) {
                return Ok(());
            }
            if lock.writer.is_none() {
                lock.readers.insert(tid);
                return Ok(());
            }
            table = self.wait(table, deadline, pid, tid)?;
        }
    }

    /// Acquires the exclusive lock. A sole reader is upgraded in place; a
    /// reader sharing the page waits like any other writer until it is the
    /// only remaining holder.
    pub fn acquire_write(&self, pid: PageId, tid: TransactionId) -> DbResult<()> {
        let deadline = self.deadline();
        let mut table = self.table.lock().unwrap();
        loop {
            let lock = table.entry(pid).or_default();
            if lock.writer == Some(tid) {
                return Ok(());
            }
            let sole_reader = lock.readers.len() == 1 && lock.readers.contains(&tid);
            if lock.writer.is_none() && (lock.readers.is_empty() || sole_reader) {
                lock.readers.remove(&tid);
                lock.writer = Some(tid);
                return Ok(());
            }
            table = self.wait(table, deadline, pid, tid)?;
        }
    }

    fn wait<'a>(
        &self,
        table: std::sync::MutexGuard<'a, HashMap<PageId, PageLock>>,
        deadline: Instant,
        pid: PageId,
        tid: TransactionId,
    ) -> DbResult<std::sync::MutexGuard<'a, HashMap<PageId, PageLock>>> {
        let now = Instant::now();
        if now >= deadline {
            crate::strata_debug_log!(
                "[LockManager] tx {} timed out waiting on page {} of table {}",
                tid.id(),
                pid.page_no,
                pid.table_id
            );
            return Err(DbError::TransactionAborted);
        }
        let (table, _) = self.released.wait_timeout(table, deadline - now).unwrap();
        Ok(table)
    }

    /// Drops whatever lock `tid` holds on the page.
    pub fn release(&self, pid: PageId, tid: TransactionId) {
        let mut table = self.table.lock().unwrap();
        if let Some(lock) = table.get_mut(&pid) {
            lock.readers.remove(&tid);
            if lock.writer == Some(tid) {
                lock.writer = None;
            }
            if lock.is_free() {
                table.remove(&pid);
            }
        }
        self.released.notify_all();
    }

    /// Drops every page lock held by `tid`.
    pub fn release_all(&self, tid: TransactionId) {
        let mut table = self.table.lock().unwrap();
        table.retain(|_, lock| {
            lock.readers.remove(&tid);
            if lock.writer == Some(tid) {
                lock.writer = None;
            }
            !lock.is_free()
        });
        self.released.notify_all();
    }

    pub fn holds(&self, pid: PageId, tid: TransactionId) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|lock| lock.held_by(tid))
    }

    /// The mode `tid` holds on the page, if any.
    pub fn mode(&self, pid: PageId, tid: TransactionId) -> Option<Permissions> {
        let table = self.table.lock().unwrap();
        let lock = table.get(&pid)?;
        if lock.writer == Some(tid) {
            Some(Permissions::ReadWrite)
        } else if lock.readers.contains(&tid) {
            Some(Permissions::ReadOnly)
        } else {
            None
        }
    }

    /// Every page on which `tid` holds any lock.
    pub fn pages_locked_by(&self, tid: TransactionId) -> Vec<PageId> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, lock)| lock.held_by(tid))
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageCategory;
    use std::sync::Arc;
    use std::thread;

    fn page(no: usize) -> PageId {
        PageId::new(1, no, PageCategory::Leaf)
    }

    fn quick() -> LockManager {
        LockManager::new(Duration::from_millis(50))
    }

    #[test]
    fn readers_share_a_page() {
        let lm = quick();
        let (t1, t2) = (TransactionId::new(), TransactionId::new());
        lm.acquire_read(page(1), t1).unwrap();
        lm.acquire_read(page(1), t2).unwrap();
        assert_eq!(lm.mode(page(1), t1), Some(Permissions::ReadOnly));
        assert_eq!(lm.mode(page(1), t2), Some(Permissions::ReadOnly));
    }

    #[test]
    fn writer_excludes_other_transactions() {
        let lm = quick();
        let (t1, t2) = (TransactionId::new(), TransactionId::new());
        lm.acquire_write(page(1), t1).unwrap();
        assert!(matches!(
            lm.acquire_read(page(1), t2),
            Err(DbError::TransactionAborted)
        ));
        assert!(matches!(
            lm.acquire_write(page(1), t2),
            Err(DbError::TransactionAborted)
        ));
        // the holder reacquires both modes freely
        lm.acquire_read(page(1), t1).unwrap();
        lm.acquire_write(page(1), t1).unwrap();
    }

    #[test]
    fn sole_reader_upgrades_in_place() {
        let lm = quick();
        let tid = TransactionId::new();
        lm.acquire_read(page(1), tid).unwrap();
        lm.acquire_write(page(1), tid).unwrap();
        assert_eq!(lm.mode(page(1), tid), Some(Permissions::ReadWrite));
    }

    #[test]
    fn shared_reader_cannot_upgrade_until_alone() {
        let lm = quick();
        let (t1, t2) = (TransactionId::new(), TransactionId::new());
        lm.acquire_read(page(1), t1).unwrap();
        lm.acquire_read(page(1), t2).unwrap();
        assert!(matches!(
            lm.acquire_write(page(1), t1),
            Err(DbError::TransactionAborted)
        ));
        lm.release(page(1), t2);
        lm.acquire_write(page(1), t1).unwrap();
    }

    #[test]
    fn release_wakes_a_waiting_writer() {
        let lm = Arc::new(LockManager::new(Duration::from_secs(5)));
        let (t1, t2) = (TransactionId::new(), TransactionId::new());
        lm.acquire_write(page(1), t1).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || lm2.acquire_write(page(1), t2));
        thread::sleep(Duration::from_millis(30));
        lm.release(page(1), t1);
        waiter.join().unwrap().unwrap();
        assert_eq!(lm.mode(page(1), t2), Some(Permissions::ReadWrite));
    }

    #[test]
    fn release_all_clears_every_page() {
        let lm = quick();
        let tid = TransactionId::new();
        lm.acquire_read(page(1), tid).unwrap();
        lm.acquire_write(page(2), tid).unwrap();
        let mut pages = lm.pages_locked_by(tid);
        pages.sort_by_key(|p| p.page_no);
        assert_eq!(pages, vec![page(1), page(2)]);

        lm.release_all(tid);
        assert!(lm.pages_locked_by(tid).is_empty());
        assert!(!lm.holds(page(1), tid));
        assert!(!lm.holds(page(2), tid));
    }

    #[test]
    fn timed_out_waiter_leaves_no_trace() {
        let lm = quick();
        let (t1, t2) = (TransactionId::new(), TransactionId::new());
        lm.acquire_write(page(1), t1).unwrap();
        assert!(lm.acquire_read(page(1), t2).is_err());
        assert!(!lm.holds(page(1), t2));
        lm.release_all(t1);
        lm.acquire_write(page(1), t2).unwrap();
    }
}
