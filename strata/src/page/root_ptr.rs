use bytes::BytesMut;

use crate::error::DbResult;
use crate::page::{get_page_ref, put_page_ref};
use crate::types::{PageId, TransactionId};

/// Serialized size of the root-pointer page. It is the only page in a file
/// that is not full-sized: data pages start right after it.
pub const ROOT_PTR_PAGE_SIZE: usize = 10;

/// The first page of every B+tree file: points at the current root page
/// (internal or leaf, absent while the tree is empty) and at the first
/// header page of the free list (absent until a page is first freed).
#[derive(Debug, Clone)]
pub struct RootPtrPage {
    id: PageId,
    root: Option<PageId>,
    header: Option<PageId>,
    dirty: Option<TransactionId>,
}

impl RootPtrPage {
    pub fn new(id: PageId) -> Self {
        RootPtrPage {
            id,
            root: None,
            header: None,
            dirty: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn root_id(&self) -> Option<PageId> {
        self.root
    }

    pub fn set_root_id(&mut self, root: Option<PageId>) {
        self.root = root;
    }

    pub fn header_id(&self) -> Option<PageId> {
        self.header
    }

    pub fn set_header_id(&mut self, header: Option<PageId>) {
        self.header = header;
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirty = tid;
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(ROOT_PTR_PAGE_SIZE);
        put_page_ref(&mut buf, self.root);
        put_page_ref(&mut buf, self.header);
        buf.to_vec()
    }

    pub fn parse(id: PageId, data: &[u8]) -> DbResult<Self> {
        let mut buf = data;
        let root = get_page_ref(&mut buf, id.table_id)?;
        let header = get_page_ref(&mut buf, id.table_id)?;
        Ok(RootPtrPage {
            id,
            root,
            header,
            dirty: None,
        })
    }
}
