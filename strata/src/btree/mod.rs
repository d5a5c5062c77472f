//! The B+tree file: an ordered, disk-backed mapping from one indexed key
//! field to tuples.
//!
//! On disk the file starts with a small root-pointer page followed by
//! full-sized data pages numbered from 1. Every page fetch goes through the
//! buffer pool, and every operation threads a local dirty map of the pages
//! it has touched with write intent, so updates made early in a descent are
//! visible to the later steps of the same operation.

pub mod iterator;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::catalog::DbFile;
use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::page::{
    BTreePage, Entry, HeaderPage, InternalPage, LeafPage, PageRef, RootPtrPage,
    ROOT_PTR_PAGE_SIZE,
};
use crate::tuple::{Field, IndexPredicate, Tuple, TupleDesc};
use crate::types::{PageCategory, PageId, Permissions, RecordId, TransactionId};
use crate::DEFAULT_PAGE_SIZE;

pub use iterator::{BTreeFileIterator, BTreeSearchIterator};

/// The pages one top-level operation has touched with write intent, keyed by
/// page id. Checked before the buffer pool so the operation sees its own
/// in-flight updates.
pub type DirtyPages = HashMap<PageId, PageRef>;

/// A B+tree backed by a single file on disk.
pub struct BTreeFile {
    path: PathBuf,
    file: Mutex<File>,
    table_id: u32,
    key_field: usize,
    td: TupleDesc,
    page_size: usize,
}

impl BTreeFile {
    pub fn open(path: impl AsRef<Path>, key_field: usize, td: TupleDesc) -> DbResult<Arc<Self>> {
        Self::open_with_page_size(path, key_field, td, DEFAULT_PAGE_SIZE)
    }

    /// Opens a B+tree file with an explicit page size. Small page sizes give
    /// tests small fan-outs; the page size must match across opens of the
    /// same file.
    pub fn open_with_page_size(
        path: impl AsRef<Path>,
        key_field: usize,
        td: TupleDesc,
        page_size: usize,
    ) -> DbResult<Arc<Self>> {
        if key_field >= td.num_fields() {
            return Err(DbError::db("key field index out of range"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let path = path.as_ref().canonicalize()?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.hash(&mut hasher);
        let table_id = hasher.finish() as u32;
        crate::strata_debug_log!(
            "[BTreeFile::open] table {} at {:?}, page size {}",
            table_id,
            path,
            page_size
        );
        Ok(Arc::new(BTreeFile {
            path,
            file: Mutex::new(file),
            table_id,
            key_field,
            td,
            page_size,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn root_ptr_pid(&self) -> PageId {
        PageId::root_ptr(self.table_id)
    }

    fn page_offset(&self, page_no: usize) -> u64 {
        (ROOT_PTR_PAGE_SIZE + (page_no - 1) * self.page_size) as u64
    }

    /// Capacity of one leaf page under this file's schema.
    pub fn leaf_capacity(&self) -> usize {
        LeafPage::max_tuples(self.page_size, self.td.tuple_size())
    }

    /// Capacity of one internal page under this file's key type.
    pub fn internal_capacity(&self) -> usize {
        InternalPage::max_entries(self.page_size, self.td.field_type(self.key_field).size())
    }

    fn blank_page(&self, pid: PageId) -> BTreePage {
        match pid.category {
            PageCategory::RootPtr => BTreePage::RootPtr(RootPtrPage::new(pid)),
            PageCategory::Internal => BTreePage::Internal(InternalPage::blank(
                pid,
                self.td.field_type(self.key_field),
                self.page_size,
            )),
            PageCategory::Leaf => BTreePage::Leaf(LeafPage::blank(
                pid,
                self.td.clone(),
                self.key_field,
                self.page_size,
            )),
            PageCategory::Header => BTreePage::Header(HeaderPage::new(pid, self.page_size)),
        }
    }

    fn parse_page(&self, pid: PageId, data: &[u8]) -> DbResult<BTreePage> {
        match pid.category {
            PageCategory::RootPtr => Ok(BTreePage::RootPtr(RootPtrPage::parse(pid, data)?)),
            PageCategory::Internal => Ok(BTreePage::Internal(InternalPage::parse(
                pid,
                data,
                self.td.field_type(self.key_field),
                self.page_size,
            )?)),
            PageCategory::Leaf => Ok(BTreePage::Leaf(LeafPage::parse(
                pid,
                data,
                self.td.clone(),
                self.key_field,
                self.page_size,
            )?)),
            PageCategory::Header => {
                Ok(BTreePage::Header(HeaderPage::parse(pid, data, self.page_size)?))
            }
        }
    }

    /// Fetches a page for this operation: the local dirty map takes
    /// precedence over the buffer pool, and pages fetched read-write join
    /// the dirty map.
    fn get_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        pid: PageId,
        perm: Permissions,
    ) -> DbResult<PageRef> {
        if let Some(page) = dirty.get(&pid) {
            return Ok(Arc::clone(page));
        }
        let page = db.buffer_pool().get_page(db, tid, pid, perm)?;
        if perm == Permissions::ReadWrite {
            dirty.insert(pid, Arc::clone(&page));
        }
        Ok(page)
    }

    /// Read-locks the root-pointer page, creating the file skeleton (the
    /// root pointer plus one blank data page) on first touch.
    fn get_root_ptr_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
    ) -> DbResult<PageRef> {
        {
            let mut file = self.file.lock().unwrap();
            if file.metadata()?.len() == 0 {
                crate::strata_debug_log!(
                    "[BTreeFile::get_root_ptr_page] Bootstrapping table {}",
                    self.table_id
                );
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&vec![0u8; ROOT_PTR_PAGE_SIZE])?;
                file.write_all(&vec![0u8; self.page_size])?;
            }
        }
        self.get_page(db, tid, dirty, self.root_ptr_pid(), Permissions::ReadOnly)
    }

    /// Descends to the left-most leaf that may contain `key`, read-locking
    /// internal ancestors and taking the requested mode on the leaf itself.
    /// A `None` key descends left-most, which seeds a full forward scan.
    pub(crate) fn find_leaf(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        pid: PageId,
        perm: Permissions,
        key: Option<&Field>,
    ) -> DbResult<PageRef> {
        let perm_here = if pid.category == PageCategory::Leaf {
            perm
        } else {
            Permissions::ReadOnly
        };
        let page = self.get_page(db, tid, dirty, pid, perm_here)?;
        let next = {
            let guard = page.read().unwrap();
            match &*guard {
                BTreePage::Leaf(_) => return Ok(Arc::clone(&page)),
                BTreePage::Internal(internal) => {
                    if internal.num_entries() == 0 {
                        return Err(DbError::Db(format!(
                            "internal page {:?} has no entries",
                            pid
                        )));
                    }
                    match key {
                        None => internal.children()[0],
                        Some(key) => {
                            let pos = internal.keys().partition_point(|sep| sep < key);
                            internal.children()[pos]
                        }
                    }
                }
                other => {
                    return Err(DbError::Db(format!(
                        "search descended into {:?}",
                        other.id()
                    )))
                }
            }
        };
        self.find_leaf(db, tid, dirty, next, perm, key)
    }

    /// Splits a full leaf, copying the right page's first key up into the
    /// parent, and returns the half into which a tuple keyed `key` belongs.
    fn split_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        key: &Field,
    ) -> DbResult<PageRef> {
        let new_ref = self.get_empty_page(db, tid, dirty, PageCategory::Leaf)?;
        let new_pid = new_ref.read().unwrap().id();

        let (left_pid, parent_pid, old_right_pid, moved) = {
            let mut guard = page.write().unwrap();
            let leaf = guard.as_leaf_mut()?;
            let moved = leaf.split_off_upper_half();
            (
                leaf.id(),
                leaf.parent_id(),
                leaf.right_sibling_id(),
                moved,
            )
        };
        crate::strata_debug_log!(
            "[BTreeFile::split_leaf_page] {} -> {} ({} tuples moved)",
            left_pid.page_no,
            new_pid.page_no,
            moved.len()
        );

        let mid_key = {
            let mut guard = new_ref.write().unwrap();
            let right = guard.as_leaf_mut()?;
            for tuple in moved {
                right.insert_tuple(tuple)?;
            }
            right.set_left_sibling_id(Some(left_pid));
            right.set_right_sibling_id(old_right_pid);
            right
                .first_key()
                .cloned()
                .ok_or_else(|| DbError::db("split produced an empty right leaf"))?
        };
        if let Some(old_right) = old_right_pid {
            let sibling = self.get_page(db, tid, dirty, old_right, Permissions::ReadWrite)?;
            sibling
                .write()
                .unwrap()
                .as_leaf_mut()?
                .set_left_sibling_id(Some(new_pid));
        }
        page.write()
            .unwrap()
            .as_leaf_mut()?
            .set_right_sibling_id(Some(new_pid));

        let parent_ref = self.get_parent_with_empty_slots(db, tid, dirty, parent_pid, &mid_key)?;
        parent_ref
            .write()
            .unwrap()
            .as_internal_mut()?
            .insert_entry(Entry::new(mid_key.clone(), left_pid, new_pid))?;
        self.update_parent_pointers(db, tid, dirty, &parent_ref)?;

        if key <= &mid_key {
            Ok(Arc::clone(page))
        } else {
            Ok(new_ref)
        }
    }

    /// Splits a full internal page, pushing the middle key up into the
    /// parent, and returns the half into which an entry keyed `key` belongs.
    fn split_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        key: &Field,
    ) -> DbResult<PageRef> {
        let new_ref = self.get_empty_page(db, tid, dirty, PageCategory::Internal)?;
        let new_pid = new_ref.read().unwrap().id();

        let (left_pid, parent_pid, mid_key) = {
            let mut left_guard = page.write().unwrap();
            let left = left_guard.as_internal_mut()?;
            let mut right_guard = new_ref.write().unwrap();
            let right = right_guard.as_internal_mut()?;

            // move the upper entries one at a time, rightmost first, so each
            // inserted entry anchors on the right page's current left edge
            let move_count = left.num_entries() / 2 + 1;
            for _ in 0..move_count {
                let idx = left.num_entries() - 1;
                let entry = left.entry(idx);
                left.delete_key_and_right_child(idx);
                right.insert_entry(entry)?;
            }
            // the right page's first key moves up rather than staying: drop
            // it with its left child, which remains the left page's rightmost
            let (mid_key, _) = right.delete_key_and_left_child(0);
            (left.id(), left.parent_id(), mid_key)
        };
        crate::strata_debug_log!(
            "[BTreeFile::split_internal_page] {} -> {}",
            left_pid.page_no,
            new_pid.page_no
        );
        self.update_parent_pointers(db, tid, dirty, &new_ref)?;

        let parent_ref = self.get_parent_with_empty_slots(db, tid, dirty, parent_pid, &mid_key)?;
        parent_ref
            .write()
            .unwrap()
            .as_internal_mut()?
            .insert_entry(Entry::new(mid_key.clone(), left_pid, new_pid))?;
        self.update_parent_pointers(db, tid, dirty, &parent_ref)?;

        if key <= &mid_key {
            Ok(Arc::clone(page))
        } else {
            Ok(new_ref)
        }
    }

    /// Write-locks the parent and guarantees it has an empty slot: creates a
    /// new internal root when the parent is the root pointer, splits a full
    /// parent recursively otherwise.
    fn get_parent_with_empty_slots(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        parent_id: PageId,
        key: &Field,
    ) -> DbResult<PageRef> {
        let parent_ref = if parent_id.category == PageCategory::RootPtr {
            let new_root = self.get_empty_page(db, tid, dirty, PageCategory::Internal)?;
            let new_root_pid = new_root.read().unwrap().id();
            crate::strata_debug_log!(
                "[BTreeFile::get_parent_with_empty_slots] New internal root {}",
                new_root_pid.page_no
            );
            let root_ptr =
                self.get_page(db, tid, dirty, self.root_ptr_pid(), Permissions::ReadWrite)?;
            let prev_root_pid = {
                let mut guard = root_ptr.write().unwrap();
                let root_ptr = guard.as_root_ptr_mut()?;
                let prev = root_ptr
                    .root_id()
                    .ok_or_else(|| DbError::db("root pointer names no root"))?;
                root_ptr.set_root_id(Some(new_root_pid));
                prev
            };
            let prev_root = self.get_page(db, tid, dirty, prev_root_pid, Permissions::ReadWrite)?;
            prev_root.write().unwrap().set_parent_id(new_root_pid)?;
            new_root
        } else {
            self.get_page(db, tid, dirty, parent_id, Permissions::ReadWrite)?
        };

        let full = parent_ref.read().unwrap().as_internal()?.num_empty_slots() == 0;
        if full {
            self.split_internal_page(db, tid, dirty, &parent_ref, key)
        } else {
            Ok(parent_ref)
        }
    }

    /// Points `child`'s parent pointer at `pid`, dirtying the child only if
    /// the pointer actually changes.
    fn update_parent_pointer(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        pid: PageId,
        child: PageId,
    ) -> DbResult<()> {
        let page = self.get_page(db, tid, dirty, child, Permissions::ReadOnly)?;
        let current = page.read().unwrap().parent_id()?;
        if current != pid {
            let page = self.get_page(db, tid, dirty, child, Permissions::ReadWrite)?;
            page.write().unwrap().set_parent_id(pid)?;
        }
        Ok(())
    }

    /// Re-points every child of the given internal page at it.
    fn update_parent_pointers(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
    ) -> DbResult<()> {
        let (pid, children) = {
            let guard = page.read().unwrap();
            let internal = guard.as_internal()?;
            (internal.id(), internal.children().to_vec())
        };
        for child in children {
            self.update_parent_pointer(db, tid, dirty, pid, child)?;
        }
        Ok(())
    }

    fn insert_tuple_inner(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        tuple: Tuple,
    ) -> DbResult<()> {
        let root_ptr = self.get_root_ptr_page(db, tid, dirty)?;
        let mut root_id = root_ptr.read().unwrap().as_root_ptr()?.root_id();

        if root_id.is_none() {
            // first insert ever: the blank bootstrap page becomes the root leaf
            let leaf_pid = PageId::new(self.table_id, self.num_pages_inner()?, PageCategory::Leaf);
            let root_ptr =
                self.get_page(db, tid, dirty, self.root_ptr_pid(), Permissions::ReadWrite)?;
            root_ptr
                .write()
                .unwrap()
                .as_root_ptr_mut()?
                .set_root_id(Some(leaf_pid));
            root_id = Some(leaf_pid);
        }
        let root_id = root_id.ok_or_else(|| DbError::db("root pointer names no root"))?;

        let key = tuple.field(self.key_field).clone();
        let leaf = self.find_leaf(db, tid, dirty, root_id, Permissions::ReadWrite, Some(&key))?;
        let full = leaf.read().unwrap().as_leaf()?.num_empty_slots() == 0;
        let leaf = if full {
            self.split_leaf_page(db, tid, dirty, &leaf, &key)?
        } else {
            leaf
        };
        leaf.write().unwrap().as_leaf_mut()?.insert_tuple(tuple)?;
        Ok(())
    }

    fn delete_tuple_inner(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        tuple: &Tuple,
    ) -> DbResult<()> {
        let rid = tuple
            .record_id()
            .ok_or_else(|| DbError::db("tuple has no record id"))?;
        let leaf_pid = PageId::new(self.table_id, rid.page_id.page_no, PageCategory::Leaf);
        let page = self.get_page(db, tid, dirty, leaf_pid, Permissions::ReadWrite)?;
        let below_minimum = {
            let mut guard = page.write().unwrap();
            let leaf = guard.as_leaf_mut()?;
            // the slot may have been reassigned since the caller read the
            // tuple; deleting someone else's tuple would corrupt the table
            let occupant_matches = leaf.tuples().get(rid.slot).is_some_and(|t| t == tuple);
            if !occupant_matches {
                return Err(DbError::Db(format!(
                    "tuple at {:?} does not exist",
                    rid
                )));
            }
            leaf.delete_tuple(rid)?;
            let max_empty = leaf.capacity() - leaf.capacity() / 2;
            leaf.num_empty_slots() > max_empty
        };
        if below_minimum {
            self.handle_min_occupancy_page(db, tid, dirty, &page)?;
        }
        Ok(())
    }

    /// Rebalances a non-root page that dropped below half occupancy, by
    /// stealing from or merging with a sibling under the same parent. The
    /// left sibling is preferred when both exist.
    fn handle_min_occupancy_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
    ) -> DbResult<()> {
        let (pid, parent_pid) = {
            let guard = page.read().unwrap();
            (guard.id(), guard.parent_id()?)
        };
        if parent_pid.category == PageCategory::RootPtr {
            // the root may be arbitrarily empty
            return Ok(());
        }
        let parent_ref = self.get_page(db, tid, dirty, parent_pid, Permissions::ReadWrite)?;
        let (left_entry, right_entry) = {
            let guard = parent_ref.read().unwrap();
            let parent = guard.as_internal()?;
            let mut left = None;
            let mut right = None;
            for i in 0..parent.num_entries() {
                if parent.children()[i] == pid {
                    right = Some(i);
                    break;
                }
                if parent.children()[i + 1] == pid {
                    left = Some(i);
                }
            }
            (left, right)
        };
        match pid.category {
            PageCategory::Leaf => {
                self.handle_min_occupancy_leaf(db, tid, dirty, page, &parent_ref, left_entry, right_entry)
            }
            PageCategory::Internal => self.handle_min_occupancy_internal(
                db, tid, dirty, page, &parent_ref, left_entry, right_entry,
            ),
            _ => Err(DbError::Db(format!("page {:?} cannot underflow", pid))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_min_occupancy_leaf(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        parent_ref: &PageRef,
        left_entry: Option<usize>,
        right_entry: Option<usize>,
    ) -> DbResult<()> {
        if let Some(i) = left_entry {
            let sibling_pid = parent_ref.read().unwrap().as_internal()?.children()[i];
            let sibling = self.get_page(db, tid, dirty, sibling_pid, Permissions::ReadWrite)?;
            let at_minimum = {
                let guard = sibling.read().unwrap();
                let leaf = guard.as_leaf()?;
                leaf.num_empty_slots() >= leaf.capacity() - leaf.capacity() / 2
            };
            if at_minimum {
                self.merge_leaf_pages(db, tid, dirty, &sibling, page, parent_ref, i)
            } else {
                self.steal_from_leaf_page(page, &sibling, parent_ref, i, false)
            }
        } else if let Some(i) = right_entry {
            let sibling_pid = parent_ref.read().unwrap().as_internal()?.children()[i + 1];
            let sibling = self.get_page(db, tid, dirty, sibling_pid, Permissions::ReadWrite)?;
            let at_minimum = {
                let guard = sibling.read().unwrap();
                let leaf = guard.as_leaf()?;
                leaf.num_empty_slots() >= leaf.capacity() - leaf.capacity() / 2
            };
            if at_minimum {
                self.merge_leaf_pages(db, tid, dirty, page, &sibling, parent_ref, i)
            } else {
                self.steal_from_leaf_page(page, &sibling, parent_ref, i, true)
            }
        } else {
            Ok(())
        }
    }

    /// Evens out tuples between a deficient leaf and a sibling with slack,
    /// then points the parent's separator at the first key of the right page.
    fn steal_from_leaf_page(
        &self,
        page: &PageRef,
        sibling: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
        is_right_sibling: bool,
    ) -> DbResult<()> {
        let separator = {
            let mut page_guard = page.write().unwrap();
            let leaf = page_guard.as_leaf_mut()?;
            let mut sibling_guard = sibling.write().unwrap();
            let sib = sibling_guard.as_leaf_mut()?;

            let move_count = (sib.num_tuples() - leaf.num_tuples()) / 2;
            for _ in 0..move_count {
                let slot = if is_right_sibling { 0 } else { sib.num_tuples() - 1 };
                let tuple = sib.delete_tuple(RecordId::new(sib.id(), slot))?;
                leaf.insert_tuple(tuple)?;
            }
            let first_of_right = if is_right_sibling {
                sib.first_key()
            } else {
                leaf.first_key()
            };
            first_of_right
                .cloned()
                .ok_or_else(|| DbError::db("redistribution emptied a leaf"))?
        };
        parent_ref
            .write()
            .unwrap()
            .as_internal_mut()?
            .set_key(entry_idx, separator);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_min_occupancy_internal(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        parent_ref: &PageRef,
        left_entry: Option<usize>,
        right_entry: Option<usize>,
    ) -> DbResult<()> {
        if let Some(i) = left_entry {
            let sibling_pid = parent_ref.read().unwrap().as_internal()?.children()[i];
            let sibling = self.get_page(db, tid, dirty, sibling_pid, Permissions::ReadWrite)?;
            let at_minimum = {
                let guard = sibling.read().unwrap();
                let internal = guard.as_internal()?;
                internal.num_empty_slots() >= internal.capacity() - internal.capacity() / 2
            };
            if at_minimum {
                self.merge_internal_pages(db, tid, dirty, &sibling, page, parent_ref, i)
            } else {
                self.steal_from_left_internal_page(db, tid, dirty, page, &sibling, parent_ref, i)
            }
        } else if let Some(i) = right_entry {
            let sibling_pid = parent_ref.read().unwrap().as_internal()?.children()[i + 1];
            let sibling = self.get_page(db, tid, dirty, sibling_pid, Permissions::ReadWrite)?;
            let at_minimum = {
                let guard = sibling.read().unwrap();
                let internal = guard.as_internal()?;
                internal.num_empty_slots() >= internal.capacity() - internal.capacity() / 2
            };
            if at_minimum {
                self.merge_internal_pages(db, tid, dirty, page, &sibling, parent_ref, i)
            } else {
                self.steal_from_right_internal_page(db, tid, dirty, page, &sibling, parent_ref, i)
            }
        } else {
            Ok(())
        }
    }

    /// Rotates entries through the parent separator: the separator descends
    /// onto the deficient page's left end and the left sibling's rightmost
    /// key ascends to replace it, one entry per step until even.
    #[allow(clippy::too_many_arguments)]
    fn steal_from_left_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        left_sibling: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
    ) -> DbResult<()> {
        {
            let mut page_guard = page.write().unwrap();
            let target = page_guard.as_internal_mut()?;
            let mut sibling_guard = left_sibling.write().unwrap();
            let sibling = sibling_guard.as_internal_mut()?;
            let mut parent_guard = parent_ref.write().unwrap();
            let parent = parent_guard.as_internal_mut()?;

            let move_count = (sibling.num_entries() - target.num_entries()) / 2;
            for _ in 0..move_count {
                let last = sibling.num_entries() - 1;
                let (up_key, moved_child) = sibling.delete_key_and_right_child(last);
                let down_key = parent.key_at(entry_idx).clone();
                let old_leftmost = target.children()[0];
                target.insert_entry(Entry::new(down_key, moved_child, old_leftmost))?;
                parent.set_key(entry_idx, up_key);
            }
        }
        self.update_parent_pointers(db, tid, dirty, page)
    }

    /// Mirror image of the left steal: the separator descends onto the
    /// deficient page's right end and the right sibling's leftmost key
    /// ascends.
    #[allow(clippy::too_many_arguments)]
    fn steal_from_right_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageRef,
        right_sibling: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
    ) -> DbResult<()> {
        {
            let mut page_guard = page.write().unwrap();
            let target = page_guard.as_internal_mut()?;
            let mut sibling_guard = right_sibling.write().unwrap();
            let sibling = sibling_guard.as_internal_mut()?;
            let mut parent_guard = parent_ref.write().unwrap();
            let parent = parent_guard.as_internal_mut()?;

            let move_count = (sibling.num_entries() - target.num_entries()) / 2;
            for _ in 0..move_count {
                let (up_key, moved_child) = sibling.delete_key_and_left_child(0);
                let down_key = parent.key_at(entry_idx).clone();
                let old_rightmost = *target
                    .children()
                    .last()
                    .ok_or_else(|| DbError::db("internal page has no children"))?;
                target.insert_entry(Entry::new(down_key, old_rightmost, moved_child))?;
                parent.set_key(entry_idx, up_key);
            }
        }
        self.update_parent_pointers(db, tid, dirty, page)
    }

    /// Fuses two adjacent leaves into the left one, bridges the sibling
    /// chain over the vanished page, frees it, and deletes the parent's
    /// separator.
    #[allow(clippy::too_many_arguments)]
    fn merge_leaf_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        left: &PageRef,
        right: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
    ) -> DbResult<()> {
        let (left_pid, right_pid, bridged) = {
            let mut left_guard = left.write().unwrap();
            let left_leaf = left_guard.as_leaf_mut()?;
            let mut right_guard = right.write().unwrap();
            let right_leaf = right_guard.as_leaf_mut()?;

            while right_leaf.num_tuples() > 0 {
                let tuple = right_leaf.delete_tuple(RecordId::new(right_leaf.id(), 0))?;
                left_leaf.insert_tuple(tuple)?;
            }
            let bridged = right_leaf.right_sibling_id();
            left_leaf.set_right_sibling_id(bridged);
            (left_leaf.id(), right_leaf.id(), bridged)
        };
        crate::strata_debug_log!(
            "[BTreeFile::merge_leaf_pages] {} <- {}",
            left_pid.page_no,
            right_pid.page_no
        );
        if let Some(next) = bridged {
            let next_ref = self.get_page(db, tid, dirty, next, Permissions::ReadWrite)?;
            next_ref
                .write()
                .unwrap()
                .as_leaf_mut()?
                .set_left_sibling_id(Some(left_pid));
        }

        self.set_empty_page(db, tid, dirty, right_pid.page_no)?;
        dirty.remove(&right_pid);
        db.buffer_pool().discard_page(right_pid);

        let parent_pid = parent_ref.read().unwrap().id();
        self.update_parent_pointer(db, tid, dirty, parent_pid, left_pid)?;
        self.delete_parent_entry(db, tid, dirty, left, parent_ref, entry_idx)
    }

    /// Fuses two adjacent internal pages into the left one, pulling the
    /// parent separator down between their contents, frees the right page,
    /// and deletes the parent's separator.
    #[allow(clippy::too_many_arguments)]
    fn merge_internal_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        left: &PageRef,
        right: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
    ) -> DbResult<()> {
        let (left_pid, right_pid) = {
            let mut left_guard = left.write().unwrap();
            let left_page = left_guard.as_internal_mut()?;
            let mut right_guard = right.write().unwrap();
            let right_page = right_guard.as_internal_mut()?;
            let parent_guard = parent_ref.read().unwrap();
            let parent = parent_guard.as_internal()?;

            let down_key = parent.key_at(entry_idx).clone();
            let left_edge = *left_page
                .children()
                .last()
                .ok_or_else(|| DbError::db("merge into an internal page with no children"))?;
            let right_edge = *right_page
                .children()
                .first()
                .ok_or_else(|| DbError::db("merge from an internal page with no children"))?;
            left_page.insert_entry(Entry::new(down_key, left_edge, right_edge))?;

            while right_page.num_entries() > 0 {
                let entry = right_page.entry(0);
                right_page.delete_key_and_left_child(0);
                left_page.insert_entry(entry)?;
            }
            (left_page.id(), right_page.id())
        };
        crate::strata_debug_log!(
            "[BTreeFile::merge_internal_pages] {} <- {}",
            left_pid.page_no,
            right_pid.page_no
        );
        self.update_parent_pointers(db, tid, dirty, left)?;

        self.set_empty_page(db, tid, dirty, right_pid.page_no)?;
        dirty.remove(&right_pid);
        db.buffer_pool().discard_page(right_pid);

        self.delete_parent_entry(db, tid, dirty, left, parent_ref, entry_idx)
    }

    /// Deletes a separator (key plus right child) from a parent. An emptied
    /// parent must be the root and collapses onto the surviving child; a
    /// parent below half occupancy rebalances recursively.
    fn delete_parent_entry(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        surviving_child: &PageRef,
        parent_ref: &PageRef,
        entry_idx: usize,
    ) -> DbResult<()> {
        let (parent_pid, grandparent, now_empty, below_minimum) = {
            let mut guard = parent_ref.write().unwrap();
            let parent = guard.as_internal_mut()?;
            parent.delete_key_and_right_child(entry_idx);
            let max_empty = parent.capacity() - parent.capacity() / 2;
            (
                parent.id(),
                parent.parent_id(),
                parent.num_entries() == 0,
                parent.num_empty_slots() > max_empty,
            )
        };

        if now_empty {
            if grandparent.category != PageCategory::RootPtr {
                return Err(DbError::db("attempting to delete a non-root node"));
            }
            crate::strata_debug_log!(
                "[BTreeFile::delete_parent_entry] Root {} collapses",
                parent_pid.page_no
            );
            let child_pid = surviving_child.read().unwrap().id();
            let root_ptr =
                self.get_page(db, tid, dirty, self.root_ptr_pid(), Permissions::ReadWrite)?;
            surviving_child
                .write()
                .unwrap()
                .set_parent_id(self.root_ptr_pid())?;
            root_ptr
                .write()
                .unwrap()
                .as_root_ptr_mut()?
                .set_root_id(Some(child_pid));

            self.set_empty_page(db, tid, dirty, parent_pid.page_no)?;
            dirty.remove(&parent_pid);
            db.buffer_pool().discard_page(parent_pid);
            Ok(())
        } else if below_minimum {
            self.handle_min_occupancy_page(db, tid, dirty, parent_ref)
        } else {
            Ok(())
        }
    }

    /// The page number of the first free page: the first clear header bit,
    /// or a fresh page appended to the file when no header has one.
    fn get_empty_page_no(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
    ) -> DbResult<usize> {
        let root_ptr = self.get_root_ptr_page(db, tid, dirty)?;
        let mut header_id = root_ptr.read().unwrap().as_root_ptr()?.header_id();
        let slots = HeaderPage::slots_per_page(self.page_size);

        let mut header_count = 0;
        while let Some(hid) = header_id {
            let header = self.get_page(db, tid, dirty, hid, Permissions::ReadOnly)?;
            let (empty_slot, next) = {
                let guard = header.read().unwrap();
                let header = guard.as_header()?;
                (header.first_empty_slot(), header.next_id())
            };
            if let Some(slot) = empty_slot {
                let header = self.get_page(db, tid, dirty, hid, Permissions::ReadWrite)?;
                header.write().unwrap().as_header_mut()?.mark_slot(slot, true);
                let page_no = header_count * slots + slot + 1;
                crate::strata_debug_log!(
                    "[BTreeFile::get_empty_page_no] Reusing page {}",
                    page_no
                );
                return Ok(page_no);
            }
            header_id = next;
            header_count += 1;
        }

        // no header page has a free slot: grow the file by one page; the new
        // page is immediately live, so no header bit changes
        let mut file = self.file.lock().unwrap();
        let len = file.metadata()?.len() as usize;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&vec![0u8; self.page_size])?;
        let page_no = (len - ROOT_PTR_PAGE_SIZE) / self.page_size + 1;
        crate::strata_debug_log!("[BTreeFile::get_empty_page_no] Appending page {}", page_no);
        Ok(page_no)
    }

    /// Claims a free page as `category`: zero-wipes its on-disk slot,
    /// drops any stale cached copy, and returns it write-locked.
    fn get_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        category: PageCategory,
    ) -> DbResult<PageRef> {
        let page_no = self.get_empty_page_no(db, tid, dirty)?;
        let pid = PageId::new(self.table_id, page_no, category);
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(self.page_offset(page_no)))?;
            file.write_all(&vec![0u8; self.page_size])?;
        }
        db.buffer_pool().discard_page(pid);
        dirty.remove(&pid);
        self.get_page(db, tid, dirty, pid, Permissions::ReadWrite)
    }

    /// Returns a page to the free list by clearing its header bit, creating
    /// or extending the header chain until the covering page exists.
    fn set_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page_no: usize,
    ) -> DbResult<()> {
        let root_ptr = self.get_root_ptr_page(db, tid, dirty)?;
        let mut header_id = root_ptr.read().unwrap().as_root_ptr()?.header_id();
        let slots = HeaderPage::slots_per_page(self.page_size);

        if header_id.is_none() {
            let root_ptr =
                self.get_page(db, tid, dirty, self.root_ptr_pid(), Permissions::ReadWrite)?;
            let header = self.get_empty_page(db, tid, dirty, PageCategory::Header)?;
            let hid = header.read().unwrap().id();
            header.write().unwrap().as_header_mut()?.init();
            root_ptr
                .write()
                .unwrap()
                .as_root_ptr_mut()?
                .set_header_id(Some(hid));
            header_id = Some(hid);
        }

        // walk to the header covering page_no, remembering the chain tail
        let mut header_count = 0;
        let mut tail = None;
        let mut current = header_id;
        while let Some(hid) = current {
            if (header_count + 1) * slots >= page_no {
                break;
            }
            let header = self.get_page(db, tid, dirty, hid, Permissions::ReadOnly)?;
            tail = Some(hid);
            current = header.read().unwrap().as_header()?.next_id();
            header_count += 1;
        }

        // extend the chain until a header covers page_no
        while (header_count + 1) * slots < page_no {
            let tail_pid =
                tail.ok_or_else(|| DbError::db("header chain has no tail to extend"))?;
            let tail_ref = self.get_page(db, tid, dirty, tail_pid, Permissions::ReadWrite)?;
            let header = self.get_empty_page(db, tid, dirty, PageCategory::Header)?;
            let hid = header.read().unwrap().id();
            {
                let mut guard = header.write().unwrap();
                let header = guard.as_header_mut()?;
                header.init();
                header.set_prev_id(Some(tail_pid));
            }
            tail_ref
                .write()
                .unwrap()
                .as_header_mut()?
                .set_next_id(Some(hid));
            header_count += 1;
            tail = Some(hid);
            current = Some(hid);
        }

        let hid = current.ok_or_else(|| DbError::db("no header page covers the freed page"))?;
        let header = self.get_page(db, tid, dirty, hid, Permissions::ReadWrite)?;
        let slot = page_no - header_count * slots - 1;
        header.write().unwrap().as_header_mut()?.mark_slot(slot, false);
        crate::strata_debug_log!("[BTreeFile::set_empty_page] Freed page {}", page_no);
        Ok(())
    }

    fn num_pages_inner(&self) -> DbResult<usize> {
        let file = self.file.lock().unwrap();
        let len = file.metadata()?.len() as usize;
        Ok(len.saturating_sub(ROOT_PTR_PAGE_SIZE) / self.page_size)
    }

    /// All tuples in key order, following the leaf sibling chain.
    pub fn iterator<'d>(
        self: &Arc<Self>,
        db: &'d Database,
        tid: TransactionId,
    ) -> DbResult<BTreeFileIterator<'d>> {
        BTreeFileIterator::new(Arc::clone(self), db, tid)
    }

    /// Tuples whose key satisfies the predicate, in key order, seeded at the
    /// first leaf that can satisfy it.
    pub fn index_iterator<'d>(
        self: &Arc<Self>,
        db: &'d Database,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> DbResult<BTreeSearchIterator<'d>> {
        BTreeSearchIterator::new(Arc::clone(self), db, tid, predicate)
    }
}

impl DbFile for BTreeFile {
    fn id(&self) -> u32 {
        self.table_id
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.td
    }

    fn read_page(&self, pid: PageId) -> DbResult<BTreePage> {
        if pid.table_id != self.table_id {
            return Err(DbError::Db(format!(
                "page {:?} does not belong to table {}",
                pid, self.table_id
            )));
        }
        let mut file = self.file.lock().unwrap();
        let len = file.metadata()?.len() as usize;

        if pid.category == PageCategory::RootPtr {
            if len < ROOT_PTR_PAGE_SIZE {
                return Err(DbError::db("read past end of file"));
            }
            let mut buf = vec![0u8; ROOT_PTR_PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            return self.parse_page(pid, &buf);
        }

        let offset = self.page_offset(pid.page_no) as usize;
        if pid.page_no == 0 || offset + self.page_size > len {
            return Err(DbError::Db(format!(
                "read past end of file: page {} of table {}",
                pid.page_no, self.table_id
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut buf)?;
        self.parse_page(pid, &buf)
    }

    fn write_page(&self, page: &BTreePage) -> DbResult<()> {
        let pid = page.id();
        let data = page.serialize();
        let mut file = self.file.lock().unwrap();
        let offset = if pid.category == PageCategory::RootPtr {
            0
        } else {
            self.page_offset(pid.page_no)
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        Ok(())
    }

    fn num_pages(&self) -> DbResult<usize> {
        self.num_pages_inner()
    }

    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: Tuple,
    ) -> DbResult<Vec<PageRef>> {
        let mut dirty = DirtyPages::new();
        self.insert_tuple_inner(db, tid, &mut dirty, t)?;
        Ok(dirty.into_values().collect())
    }

    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: &Tuple,
    ) -> DbResult<Vec<PageRef>> {
        let mut dirty = DirtyPages::new();
        self.delete_tuple_inner(db, tid, &mut dirty, t)?;
        Ok(dirty.into_values().collect())
    }
}
