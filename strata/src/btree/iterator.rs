//! Sorted iteration over a B+tree file, with and without a key predicate.
//!
//! Both iterators walk the leaf level through the right-sibling chain,
//! re-acquiring each leaf read-only through the buffer pool and snapshotting
//! its tuples while the read lock is held.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::btree::{BTreeFile, DirtyPages};
use crate::database::Database;
use crate::error::DbResult;
use crate::page::PageRef;
use crate::tuple::{IndexPredicate, Op, Tuple};
use crate::types::{PageId, Permissions, TransactionId};

/// Yields every tuple of the file in key order.
pub struct BTreeFileIterator<'d> {
    file: Arc<BTreeFile>,
    db: &'d Database,
    tid: TransactionId,
    buffered: VecDeque<Tuple>,
    next_leaf: Option<PageId>,
}

impl<'d> BTreeFileIterator<'d> {
    pub(crate) fn new(
        file: Arc<BTreeFile>,
        db: &'d Database,
        tid: TransactionId,
    ) -> DbResult<Self> {
        let mut iter = BTreeFileIterator {
            file,
            db,
            tid,
            buffered: VecDeque::new(),
            next_leaf: None,
        };
        if let Some(leaf) = seed_leaf(&iter.file, db, tid, None)? {
            iter.load_leaf(&leaf)?;
        }
        Ok(iter)
    }

    fn load_leaf(&mut self, leaf: &PageRef) -> DbResult<()> {
        let guard = leaf.read().unwrap();
        let leaf = guard.as_leaf()?;
        self.buffered = leaf.tuples().iter().cloned().collect();
        self.next_leaf = leaf.right_sibling_id();
        Ok(())
    }

    fn advance(&mut self) -> DbResult<Option<Tuple>> {
        loop {
            if let Some(tuple) = self.buffered.pop_front() {
                return Ok(Some(tuple));
            }
            let Some(next) = self.next_leaf.take() else {
                return Ok(None);
            };
            let page = self
                .db
                .buffer_pool()
                .get_page(self.db, self.tid, next, Permissions::ReadOnly)?;
            self.load_leaf(&page)?;
        }
    }
}

impl Iterator for BTreeFileIterator<'_> {
    type Item = DbResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Yields the tuples whose key satisfies an index predicate, in key order,
/// stopping as soon as no later tuple can satisfy it.
pub struct BTreeSearchIterator<'d> {
    file: Arc<BTreeFile>,
    db: &'d Database,
    tid: TransactionId,
    predicate: IndexPredicate,
    buffered: VecDeque<Tuple>,
    next_leaf: Option<PageId>,
    done: bool,
}

impl<'d> BTreeSearchIterator<'d> {
    pub(crate) fn new(
        file: Arc<BTreeFile>,
        db: &'d Database,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> DbResult<Self> {
        // equality and greater-than scans can seed at the key's own leaf;
        // less-than scans must start from the left-most leaf
        let seed_key = match predicate.op {
            Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => Some(&predicate.field),
            _ => None,
        };
        let seeded = seed_leaf(&file, db, tid, seed_key)?;
        let mut iter = BTreeSearchIterator {
            file,
            db,
            tid,
            predicate,
            buffered: VecDeque::new(),
            next_leaf: None,
            done: false,
        };
        if let Some(leaf) = seeded {
            iter.load_leaf(&leaf)?;
        }
        Ok(iter)
    }

    fn load_leaf(&mut self, leaf: &PageRef) -> DbResult<()> {
        let guard = leaf.read().unwrap();
        let leaf = guard.as_leaf()?;
        self.buffered = leaf.tuples().iter().cloned().collect();
        self.next_leaf = leaf.right_sibling_id();
        Ok(())
    }

    fn advance(&mut self) -> DbResult<Option<Tuple>> {
        if self.done {
            return Ok(None);
        }
        loop {
            while let Some(tuple) = self.buffered.pop_front() {
                let key = tuple.field(self.file.key_field());
                if key.compare(self.predicate.op, &self.predicate.field) {
                    return Ok(Some(tuple));
                }
                match self.predicate.op {
                    // an upper-bounded scan is over once the bound is passed
                    Op::LessThan | Op::LessThanOrEq => {
                        self.done = true;
                        return Ok(None);
                    }
                    Op::Equals if key.compare(Op::GreaterThan, &self.predicate.field) => {
                        self.done = true;
                        return Ok(None);
                    }
                    _ => {}
                }
            }
            let Some(next) = self.next_leaf.take() else {
                self.done = true;
                return Ok(None);
            };
            let page = self
                .db
                .buffer_pool()
                .get_page(self.db, self.tid, next, Permissions::ReadOnly)?;
            self.load_leaf(&page)?;
        }
    }
}

impl Iterator for BTreeSearchIterator<'_> {
    type Item = DbResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Locates the starting leaf of a scan, or `None` on an empty tree.
fn seed_leaf(
    file: &Arc<BTreeFile>,
    db: &Database,
    tid: TransactionId,
    key: Option<&crate::tuple::Field>,
) -> DbResult<Option<PageRef>> {
    let mut scratch = DirtyPages::new();
    let root_ptr = file.get_root_ptr_page(db, tid, &mut scratch)?;
    let root_id = root_ptr.read().unwrap().as_root_ptr()?.root_id();
    let Some(root_id) = root_id else {
        return Ok(None);
    };
    let leaf = file.find_leaf(db, tid, &mut scratch, root_id, Permissions::ReadOnly, key)?;
    Ok(Some(leaf))
}
