//! Shared helpers for the integration suites: engine setup around a temp
//! file, per-operation transactions, and a structural consistency check run
//! after mutations.

#![allow(dead_code)]

use std::sync::Arc;

use strata::btree::BTreeFile;
use strata::catalog::DbFile;
use strata::tuple::{Field, FieldType, IndexPredicate, Op, Tuple, TupleDesc};
use strata::{BTreePage, Database, PageCategory, PageId, Permissions, TransactionId};
use tempfile::TempDir;

/// Page size at which both the leaf and the internal fan-out are exactly 4
/// under the two-int-column schema.
pub const TINY_PAGE: usize = 48;

/// Page size at which both fan-outs are 5 under the two-int-column schema,
/// so splits land exactly on the odd-capacity rounding edge.
pub const ODD_PAGE: usize = 56;

/// A roomier page for volume tests: 14 tuples per leaf, 14 entries per
/// internal page.
pub const SMALL_PAGE: usize = 128;

pub struct TestDb {
    pub db: Arc<Database>,
    pub file: Arc<BTreeFile>,
    _dir: TempDir,
}

pub fn setup(page_size: usize) -> TestDb {
    setup_with(page_size, Database::new())
}

pub fn setup_with(page_size: usize, db: Database) -> TestDb {
    let dir = tempfile::tempdir().expect("tempdir");
    let td = TupleDesc::new(vec![FieldType::Int, FieldType::Int]);
    let file = BTreeFile::open_with_page_size(dir.path().join("table.dat"), 0, td, page_size)
        .expect("open table file");
    db.catalog().add_table(Arc::clone(&file) as Arc<dyn DbFile>);
    TestDb {
        db: Arc::new(db),
        file,
        _dir: dir,
    }
}

pub fn int_tuple(key: i32) -> Tuple {
    Tuple::new(vec![Field::Int(key), Field::Int(key * 10)])
}

/// Inserts each key in its own committed transaction.
pub fn insert_keys(db: &Database, file: &Arc<BTreeFile>, keys: impl IntoIterator<Item = i32>) {
    for key in keys {
        let tid = TransactionId::new();
        db.buffer_pool()
            .insert_tuple(db, tid, file.table_id(), int_tuple(key))
            .unwrap_or_else(|e| panic!("insert {} failed: {}", key, e));
        db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    }
}

/// Locates one tuple with the given key and deletes it in its own committed
/// transaction.
pub fn delete_key(db: &Database, file: &Arc<BTreeFile>, key: i32) {
    let tid = TransactionId::new();
    let target = file
        .index_iterator(db, tid, IndexPredicate::new(Op::Equals, Field::Int(key)))
        .unwrap()
        .next()
        .unwrap_or_else(|| panic!("key {} not found", key))
        .unwrap();
    db.buffer_pool()
        .delete_tuple(db, tid, &target)
        .unwrap_or_else(|e| panic!("delete {} failed: {}", key, e));
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
}

fn int_key(tuple: &Tuple) -> i32 {
    match tuple.field(0) {
        Field::Int(v) => *v,
        other => panic!("unexpected key {:?}", other),
    }
}

/// All keys in traversal order, under a committed read transaction.
pub fn scan_keys(db: &Database, file: &Arc<BTreeFile>) -> Vec<i32> {
    let tid = TransactionId::new();
    let keys = file
        .iterator(db, tid)
        .unwrap()
        .map(|r| int_key(&r.unwrap()))
        .collect();
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    keys
}

/// Collects the keys a predicate scan yields, in order.
pub fn predicate_keys(db: &Database, file: &Arc<BTreeFile>, op: Op, bound: i32) -> Vec<i32> {
    let tid = TransactionId::new();
    let keys = file
        .index_iterator(db, tid, IndexPredicate::new(op, Field::Int(bound)))
        .unwrap()
        .map(|r| int_key(&r.unwrap()))
        .collect();
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    keys
}

fn snapshot(db: &Database, tid: TransactionId, pid: PageId) -> BTreePage {
    let page = db
        .buffer_pool()
        .get_page(db, tid, pid, Permissions::ReadOnly)
        .unwrap_or_else(|e| panic!("fetch {:?} failed: {}", pid, e));
    let guard = page.read().unwrap();
    guard.clone()
}

/// Reads a structural snapshot of a page for shape assertions.
pub fn page_snapshot(db: &Database, pid: PageId) -> BTreePage {
    let tid = TransactionId::new();
    let page = snapshot(db, tid, pid);
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    page
}

/// Shape and content of the tree gathered by one consistency sweep.
pub struct TreeReport {
    pub root: Option<PageId>,
    pub height: usize,
    pub leaves: Vec<PageId>,
    pub tuple_count: usize,
    pub reachable: Vec<PageId>,
}

/// Walks the whole tree and asserts the structural invariants: key order,
/// minimum occupancy off the root, parent pointers, separator bounds,
/// sibling linkage, and free-list consistency. Panics on any violation.
pub fn check_tree(db: &Database, file: &Arc<BTreeFile>) -> TreeReport {
    let tid = TransactionId::new();
    let report = check_tree_in(db, file, tid);
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    report
}

fn check_tree_in(db: &Database, file: &Arc<BTreeFile>, tid: TransactionId) -> TreeReport {
    let root_ptr_pid = file.root_ptr_pid();
    let root_ptr = snapshot(db, tid, root_ptr_pid);
    let root_ptr = root_ptr.as_root_ptr().unwrap();

    let mut report = TreeReport {
        root: root_ptr.root_id(),
        height: 0,
        leaves: Vec::new(),
        tuple_count: 0,
        reachable: Vec::new(),
    };

    if let Some(root) = root_ptr.root_id() {
        check_subtree(db, file, tid, root, root_ptr_pid, None, None, 1, &mut report);
    }

    // sibling linkage must mirror the traversal order exactly
    let mut previous: Option<PageId> = None;
    for (i, leaf_pid) in report.leaves.iter().enumerate() {
        let page = snapshot(db, tid, *leaf_pid);
        let leaf = page.as_leaf().unwrap();
        assert_eq!(
            leaf.left_sibling_id(),
            previous,
            "left sibling of leaf {} is wrong",
            leaf_pid.page_no
        );
        let expected_right = report.leaves.get(i + 1).copied();
        assert_eq!(
            leaf.right_sibling_id(),
            expected_right,
            "right sibling of leaf {} is wrong",
            leaf_pid.page_no
        );
        previous = Some(*leaf_pid);
    }

    check_free_list(db, file, tid, &mut report);
    report
}

#[allow(clippy::too_many_arguments)]
fn check_subtree(
    db: &Database,
    file: &Arc<BTreeFile>,
    tid: TransactionId,
    pid: PageId,
    expected_parent: PageId,
    lower: Option<&Field>,
    upper: Option<&Field>,
    depth: usize,
    report: &mut TreeReport,
) {
    report.height = report.height.max(depth);
    report.reachable.push(pid);
    let is_root = expected_parent.category == PageCategory::RootPtr;
    let page = snapshot(db, tid, pid);

    match &page {
        BTreePage::Leaf(leaf) => {
            assert_eq!(
                leaf.parent_id(),
                expected_parent,
                "parent of leaf {} is wrong",
                pid.page_no
            );
            if !is_root {
                // an upper-half split moves floor(capacity / 2) tuples into
                // the new right leaf, so at odd capacities that leaf starts
                // one short of the ceiling; floor(capacity / 2) is the
                // steady-state floor
                assert!(
                    leaf.num_tuples() >= leaf.capacity() / 2,
                    "leaf {} below minimum occupancy: {}/{}",
                    pid.page_no,
                    leaf.num_tuples(),
                    leaf.capacity()
                );
            }
            let mut last: Option<&Field> = None;
            for tuple in leaf.tuples() {
                let key = tuple.field(file.key_field());
                if let Some(last) = last {
                    assert!(last <= key, "leaf {} out of order", pid.page_no);
                }
                if let Some(lower) = lower {
                    assert!(key >= lower, "leaf {} violates lower bound", pid.page_no);
                }
                if let Some(upper) = upper {
                    assert!(key < upper, "leaf {} violates upper bound", pid.page_no);
                }
                last = Some(key);
            }
            report.tuple_count += leaf.num_tuples();
            report.leaves.push(pid);
        }
        BTreePage::Internal(internal) => {
            assert_eq!(
                internal.parent_id(),
                expected_parent,
                "parent of internal {} is wrong",
                pid.page_no
            );
            assert!(internal.num_entries() > 0, "internal {} is empty", pid.page_no);
            if !is_root {
                // a push-up split leaves the smaller half with
                // floor((capacity - 1) / 2) entries, the steady-state floor
                assert!(
                    internal.num_entries() >= (internal.capacity() - 1) / 2,
                    "internal {} below minimum occupancy: {}/{}",
                    pid.page_no,
                    internal.num_entries(),
                    internal.capacity()
                );
            }
            let keys = internal.keys().to_vec();
            for window in keys.windows(2) {
                assert!(window[0] <= window[1], "internal {} out of order", pid.page_no);
            }
            if let (Some(lower), Some(first)) = (lower, keys.first()) {
                assert!(first >= lower, "internal {} violates lower bound", pid.page_no);
            }
            if let (Some(upper), Some(last)) = (upper, keys.last()) {
                assert!(last < upper, "internal {} violates upper bound", pid.page_no);
            }
            let children = internal.children().to_vec();
            for (i, child) in children.iter().enumerate() {
                let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                let child_upper = if i == keys.len() { upper } else { Some(&keys[i]) };
                check_subtree(
                    db,
                    file,
                    tid,
                    *child,
                    pid,
                    child_lower,
                    child_upper,
                    depth + 1,
                    report,
                );
            }
        }
        other => panic!("unexpected page in tree: {:?}", other.id()),
    }
}

/// Checks the header bitmap against the set of reachable pages: a reachable
/// page is never marked free, and a free page is never reachable.
fn check_free_list(
    db: &Database,
    file: &Arc<BTreeFile>,
    tid: TransactionId,
    report: &mut TreeReport,
) {
    let root_ptr = snapshot(db, tid, file.root_ptr_pid());
    let mut header_id = root_ptr.as_root_ptr().unwrap().header_id();

    let mut free_pages = Vec::new();
    let mut base = 0usize;
    while let Some(hid) = header_id {
        report.reachable.push(hid);
        let page = snapshot(db, tid, hid);
        let header = page.as_header().unwrap();
        for slot in 0..header.num_slots() {
            if !header.slot_used(slot) {
                free_pages.push(base + slot + 1);
            }
        }
        base += header.num_slots();
        header_id = header.next_id();
    }

    let num_pages = file.num_pages().unwrap();
    let reachable: std::collections::HashSet<usize> =
        report.reachable.iter().map(|p| p.page_no).collect();
    for free in free_pages.iter().filter(|p| **p <= num_pages) {
        assert!(
            !reachable.contains(free),
            "page {} is both free and reachable",
            free
        );
    }
    for page_no in reachable {
        if page_no > 0 && page_no <= base {
            assert!(
                !free_pages.contains(&page_no),
                "reachable page {} is marked free",
                page_no
            );
        }
    }
}

/// The page numbers currently on the free list.
pub fn free_page_numbers(db: &Database, file: &Arc<BTreeFile>) -> Vec<usize> {
    let tid = TransactionId::new();
    let root_ptr = snapshot(db, tid, file.root_ptr_pid());
    let mut header_id = root_ptr.as_root_ptr().unwrap().header_id();
    let mut free = Vec::new();
    let mut base = 0usize;
    while let Some(hid) = header_id {
        let page = snapshot(db, tid, hid);
        let header = page.as_header().unwrap();
        for slot in 0..header.num_slots() {
            if !header.slot_used(slot) {
                free.push(base + slot + 1);
            }
        }
        base += header.num_slots();
        header_id = header.next_id();
    }
    db.buffer_pool().transaction_complete(db, tid, true).unwrap();
    free
}
