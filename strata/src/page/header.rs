use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DbError, DbResult};
use crate::types::{PageCategory, PageId, TransactionId};

/// Bytes of a header page taken by the next/previous chain pointers.
const HEADER_OVERHEAD: usize = 8;

/// A page of the free list: a bitmap describing the allocation state of a
/// contiguous range of data pages, chained to further header pages. Bit `i`
/// of the header page at chain position `h` covers data page number
/// `h * slots_per_page + i + 1`; a set bit means the page is in use.
#[derive(Debug, Clone)]
pub struct HeaderPage {
    id: PageId,
    next: Option<PageId>,
    prev: Option<PageId>,
    bitmap: Vec<u8>,
    dirty: Option<TransactionId>,
}

impl HeaderPage {
    /// The number of data pages one header page accounts for.
    pub fn slots_per_page(page_size: usize) -> usize {
        (page_size - HEADER_OVERHEAD) * 8
    }

    pub fn new(id: PageId, page_size: usize) -> Self {
        HeaderPage {
            id,
            next: None,
            prev: None,
            bitmap: vec![0; page_size - HEADER_OVERHEAD],
            dirty: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn num_slots(&self) -> usize {
        self.bitmap.len() * 8
    }

    pub fn next_id(&self) -> Option<PageId> {
        self.next
    }

    pub fn set_next_id(&mut self, next: Option<PageId>) {
        self.next = next;
    }

    pub fn prev_id(&self) -> Option<PageId> {
        self.prev
    }

    pub fn set_prev_id(&mut self, prev: Option<PageId>) {
        self.prev = prev;
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirty = tid;
    }

    /// Marks every slot used. A freshly created header page covers a region
    /// of live pages, so it starts fully occupied and individual slots are
    /// cleared as pages are freed.
    pub fn init(&mut self) {
        self.bitmap.fill(0xff);
    }

    pub fn slot_used(&self, slot: usize) -> bool {
        self.bitmap[slot / 8] & (1 << (slot % 8)) != 0
    }

    pub fn mark_slot(&mut self, slot: usize, used: bool) {
        if used {
            self.bitmap[slot / 8] |= 1 << (slot % 8);
        } else {
            self.bitmap[slot / 8] &= !(1 << (slot % 8));
        }
    }

    /// The first free slot on this page, if any.
    pub fn first_empty_slot(&self) -> Option<usize> {
        for (i, byte) in self.bitmap.iter().enumerate() {
            if *byte != 0xff {
                return Some(i * 8 + byte.trailing_ones() as usize);
            }
        }
        None
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_OVERHEAD + self.bitmap.len());
        buf.put_u32(self.next.map_or(0, |p| p.page_no as u32));
        buf.put_u32(self.prev.map_or(0, |p| p.page_no as u32));
        buf.put_slice(&self.bitmap);
        buf.to_vec()
    }

    pub fn parse(id: PageId, data: &[u8], page_size: usize) -> DbResult<Self> {
        if data.len() < page_size {
            return Err(DbError::Db(format!(
                "short header page: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let next_no = buf.get_u32() as usize;
        let prev_no = buf.get_u32() as usize;
        let chain = |no: usize| {
            (no != 0).then(|| PageId::new(id.table_id, no, PageCategory::Header))
        };
        let bitmap = buf[..page_size - HEADER_OVERHEAD].to_vec();
        Ok(HeaderPage {
            id,
            next: chain(next_no),
            prev: chain(prev_no),
            bitmap,
            dirty: None,
        })
    }
}
