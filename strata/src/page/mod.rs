//! In-memory page structures and their fixed-width on-disk layouts.
//!
//! Every page of a B+tree file is one of four kinds, and the kind is encoded
//! in the page id itself, so a fetched page is dispatched by matching on the
//! tag after the read. Pages are shared between the buffer pool and callers
//! as `Arc<RwLock<BTreePage>>`; all cross-page references are stored as
//! plain `PageId` values and resolved through the buffer pool.

pub mod header;
pub mod internal;
pub mod leaf;
pub mod root_ptr;

use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut};

use crate::error::{DbError, DbResult};
use crate::types::{PageCategory, PageId, TransactionId};

pub use header::HeaderPage;
pub use internal::{Entry, InternalPage};
pub use leaf::LeafPage;
pub use root_ptr::{RootPtrPage, ROOT_PTR_PAGE_SIZE};

/// A page as shared between the buffer pool cache and callers. Content is
/// mutated only while the owning transaction holds the page-level write
/// lock; the `RwLock` provides the interior mutability and thread safety.
pub type PageRef = Arc<RwLock<BTreePage>>;

/// A page of a B+tree file.
#[derive(Debug, Clone)]
pub enum BTreePage {
    RootPtr(RootPtrPage),
    Internal(InternalPage),
    Leaf(LeafPage),
    Header(HeaderPage),
}

impl BTreePage {
    pub fn id(&self) -> PageId {
        match self {
            BTreePage::RootPtr(p) => p.id(),
            BTreePage::Internal(p) => p.id(),
            BTreePage::Leaf(p) => p.id(),
            BTreePage::Header(p) => p.id(),
        }
    }

    /// The transaction that last dirtied this page, if it is dirty.
    pub fn dirtier(&self) -> Option<TransactionId> {
        match self {
            BTreePage::RootPtr(p) => p.dirtier(),
            BTreePage::Internal(p) => p.dirtier(),
            BTreePage::Leaf(p) => p.dirtier(),
            BTreePage::Header(p) => p.dirtier(),
        }
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        match self {
            BTreePage::RootPtr(p) => p.mark_dirty(tid),
            BTreePage::Internal(p) => p.mark_dirty(tid),
            BTreePage::Leaf(p) => p.mark_dirty(tid),
            BTreePage::Header(p) => p.mark_dirty(tid),
        }
    }

    /// The parent pointer shared by internal and leaf pages.
    pub fn parent_id(&self) -> DbResult<PageId> {
        match self {
            BTreePage::Internal(p) => Ok(p.parent_id()),
            BTreePage::Leaf(p) => Ok(p.parent_id()),
            other => Err(DbError::Db(format!(
                "page {:?} has no parent pointer",
                other.id()
            ))),
        }
    }

    pub fn set_parent_id(&mut self, parent: PageId) -> DbResult<()> {
        match self {
            BTreePage::Internal(p) => {
                p.set_parent_id(parent);
                Ok(())
            }
            BTreePage::Leaf(p) => {
                p.set_parent_id(parent);
                Ok(())
            }
            other => Err(DbError::Db(format!(
                "page {:?} has no parent pointer",
                other.id()
            ))),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            BTreePage::RootPtr(p) => p.serialize(),
            BTreePage::Internal(p) => p.serialize(),
            BTreePage::Leaf(p) => p.serialize(),
            BTreePage::Header(p) => p.serialize(),
        }
    }

    pub fn as_root_ptr(&self) -> DbResult<&RootPtrPage> {
        match self {
            BTreePage::RootPtr(p) => Ok(p),
            other => Err(expected("root pointer", other)),
        }
    }

    pub fn as_root_ptr_mut(&mut self) -> DbResult<&mut RootPtrPage> {
        match self {
            BTreePage::RootPtr(p) => Ok(p),
            other => Err(expected("root pointer", other)),
        }
    }

    pub fn as_internal(&self) -> DbResult<&InternalPage> {
        match self {
            BTreePage::Internal(p) => Ok(p),
            other => Err(expected("internal", other)),
        }
    }

    pub fn as_internal_mut(&mut self) -> DbResult<&mut InternalPage> {
        match self {
            BTreePage::Internal(p) => Ok(p),
            other => Err(expected("internal", other)),
        }
    }

    pub fn as_leaf(&self) -> DbResult<&LeafPage> {
        match self {
            BTreePage::Leaf(p) => Ok(p),
            other => Err(expected("leaf", other)),
        }
    }

    pub fn as_leaf_mut(&mut self) -> DbResult<&mut LeafPage> {
        match self {
            BTreePage::Leaf(p) => Ok(p),
            other => Err(expected("leaf", other)),
        }
    }

    pub fn as_header(&self) -> DbResult<&HeaderPage> {
        match self {
            BTreePage::Header(p) => Ok(p),
            other => Err(expected("header", other)),
        }
    }

    pub fn as_header_mut(&mut self) -> DbResult<&mut HeaderPage> {
        match self {
            BTreePage::Header(p) => Ok(p),
            other => Err(expected("header", other)),
        }
    }
}

fn expected(kind: &str, got: &BTreePage) -> DbError {
    DbError::Db(format!("expected a {} page, found {:?}", kind, got.id()))
}

/// Writes a page reference as a page number plus category byte; page number
/// zero encodes "none".
pub(crate) fn put_page_ref(buf: &mut impl BufMut, pid: Option<PageId>) {
    match pid {
        Some(pid) => {
            buf.put_u32(pid.page_no as u32);
            buf.put_u8(pid.category.to_byte());
        }
        None => {
            buf.put_u32(0);
            buf.put_u8(0);
        }
    }
}

pub(crate) fn get_page_ref(buf: &mut impl Buf, table_id: u32) -> DbResult<Option<PageId>> {
    let page_no = buf.get_u32() as usize;
    let cat = buf.get_u8();
    if page_no == 0 {
        return Ok(None);
    }
    Ok(Some(PageId::new(
        table_id,
        page_no,
        PageCategory::from_byte(cat)?,
    )))
}
