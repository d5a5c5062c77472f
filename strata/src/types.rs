use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DbError, DbResult};

/// The role a page plays in the B+tree file. The category is carried inside
/// the page id, so a fetched page can be dispatched without inspecting its
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageCategory {
    RootPtr = 0,
    Internal = 1,
    Leaf = 2,
    Header = 3,
}

impl PageCategory {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> DbResult<Self> {
        match b {
            0 => Ok(PageCategory::RootPtr),
            1 => Ok(PageCategory::Internal),
            2 => Ok(PageCategory::Leaf),
            3 => Ok(PageCategory::Header),
            other => Err(DbError::Db(format!("invalid page category byte {}", other))),
        }
    }
}

/// Identifies a page: owning table, page number within the file, and the
/// page's category. Page 0 of every file is its root-pointer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: u32,
    pub page_no: usize,
    pub category: PageCategory,
}

impl PageId {
    pub fn new(table_id: u32, page_no: usize, category: PageCategory) -> Self {
        PageId {
            table_id,
            page_no,
            category,
        }
    }

    /// The id of a table's root-pointer page.
    pub fn root_ptr(table_id: u32) -> Self {
        PageId::new(table_id, 0, PageCategory::RootPtr)
    }
}

/// Identifies a tuple by the leaf page holding it and its slot on that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        RecordId { page_id, slot }
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque, totally-ordered transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::new()
    }
}

/// The lock mode a caller requests on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_byte_round_trip() {
        for cat in [
            PageCategory::RootPtr,
            PageCategory::Internal,
            PageCategory::Leaf,
            PageCategory::Header,
        ] {
            assert_eq!(PageCategory::from_byte(cat.to_byte()).unwrap(), cat);
        }
        assert!(PageCategory::from_byte(9).is_err());
    }

    #[test]
    fn transaction_ids_are_unique_and_ordered() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn page_id_equality_includes_category() {
        let leaf = PageId::new(1, 3, PageCategory::Leaf);
        let internal = PageId::new(1, 3, PageCategory::Internal);
        assert_ne!(leaf, internal);
    }
}
