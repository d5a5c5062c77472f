use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DbError, DbResult};
use crate::page::{get_page_ref, put_page_ref};
use crate::tuple::{Field, Tuple, TupleDesc};
use crate::types::{PageCategory, PageId, RecordId, TransactionId};

/// Fixed bytes before the slot bitmap: parent pointer (number + category)
/// and the two sibling page numbers.
const LEAF_HEADER_BYTES: usize = 13;

/// A leaf page: a run of tuples sorted on the indexed key field, linked to
/// its siblings so the leaf level forms a doubly-linked list in key order.
/// Tuples occupy a compact prefix of the slots; shifting an occupied slot
/// restamps the record id of the tuple that moved.
#[derive(Debug, Clone)]
pub struct LeafPage {
    id: PageId,
    parent: PageId,
    left_sibling: Option<PageId>,
    right_sibling: Option<PageId>,
    tuples: Vec<Tuple>,
    td: TupleDesc,
    key_field: usize,
    max_tuples: usize,
    page_size: usize,
    dirty: Option<TransactionId>,
}

impl LeafPage {
    /// The number of tuple slots a leaf offers: each occupied slot costs the
    /// tuple width plus one bitmap bit.
    pub fn max_tuples(page_size: usize, tuple_size: usize) -> usize {
        let usable = page_size - LEAF_HEADER_BYTES;
        let mut m: usize = 0;
        while (m + 1).div_ceil(8) + (m + 1) * tuple_size <= usable {
            m += 1;
        }
        m
    }

    pub fn blank(id: PageId, td: TupleDesc, key_field: usize, page_size: usize) -> Self {
        let max_tuples = Self::max_tuples(page_size, td.tuple_size());
        LeafPage {
            id,
            parent: PageId::root_ptr(id.table_id),
            left_sibling: None,
            right_sibling: None,
            tuples: Vec::with_capacity(max_tuples),
            td,
            key_field,
            max_tuples,
            page_size,
            dirty: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn parent_id(&self) -> PageId {
        self.parent
    }

    pub fn set_parent_id(&mut self, parent: PageId) {
        self.parent = parent;
    }

    pub fn left_sibling_id(&self) -> Option<PageId> {
        self.left_sibling
    }

    pub fn set_left_sibling_id(&mut self, id: Option<PageId>) {
        self.left_sibling = id;
    }

    pub fn right_sibling_id(&self) -> Option<PageId> {
        self.right_sibling
    }

    pub fn set_right_sibling_id(&mut self, id: Option<PageId>) {
        self.right_sibling = id;
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirty = tid;
    }

    pub fn capacity(&self) -> usize {
        self.max_tuples
    }

    pub fn num_tuples(&self) -> usize {
        self.tuples.len()
    }

    pub fn num_empty_slots(&self) -> usize {
        self.max_tuples - self.tuples.len()
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn key_of<'a>(&self, tuple: &'a Tuple) -> &'a Field {
        tuple.field(self.key_field)
    }

    pub fn first_key(&self) -> Option<&Field> {
        self.tuples.first().map(|t| t.field(self.key_field))
    }

    pub fn last_key(&self) -> Option<&Field> {
        self.tuples.last().map(|t| t.field(self.key_field))
    }

    /// Inserts a tuple, keeping the page sorted on the key field. Equal keys
    /// land after their duplicates.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> DbResult<RecordId> {
        if self.tuples.len() >= self.max_tuples {
            return Err(DbError::Db(format!("leaf page {:?} is full", self.id)));
        }
        if !tuple.matches_schema(&self.td) {
            return Err(DbError::db("tuple does not match the table schema"));
        }
        let key = tuple.field(self.key_field).clone();
        let pos = self
            .tuples
            .partition_point(|t| t.field(self.key_field) <= &key);
        tuple.set_record_id(Some(RecordId::new(self.id, pos)));
        self.tuples.insert(pos, tuple);
        self.restamp_slots(pos + 1);
        Ok(RecordId::new(self.id, pos))
    }

    /// Removes the tuple occupying the given record's slot. The record must
    /// name this page and an occupied slot.
    pub fn delete_tuple(&mut self, rid: RecordId) -> DbResult<Tuple> {
        if rid.page_id != self.id || rid.slot >= self.tuples.len() {
            return Err(DbError::Db(format!(
                "tuple {:?} does not exist on page {:?}",
                rid, self.id
            )));
        }
        let mut removed = self.tuples.remove(rid.slot);
        removed.set_record_id(None);
        self.restamp_slots(rid.slot);
        Ok(removed)
    }

    /// Detaches the upper half of the tuples (the larger ceil-half stays put
    /// for an even count; the moved run preserves order).
    pub fn split_off_upper_half(&mut self) -> Vec<Tuple> {
        let move_count = self.tuples.len() / 2;
        let mut moved = self.tuples.split_off(self.tuples.len() - move_count);
        for t in &mut moved {
            t.set_record_id(None);
        }
        moved
    }

    fn restamp_slots(&mut self, from: usize) {
        for i in from..self.tuples.len() {
            self.tuples[i].set_record_id(Some(RecordId::new(self.id, i)));
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.page_size);
        put_page_ref(&mut buf, Some(self.parent));
        buf.put_u32(self.left_sibling.map_or(0, |p| p.page_no as u32));
        buf.put_u32(self.right_sibling.map_or(0, |p| p.page_no as u32));

        let bitmap_len = self.max_tuples.div_ceil(8);
        let mut bitmap = vec![0u8; bitmap_len];
        for slot in 0..self.tuples.len() {
            bitmap[slot / 8] |= 1 << (slot % 8);
        }
        buf.put_slice(&bitmap);

        for tuple in &self.tuples {
            tuple.serialize(&mut buf);
        }
        buf.put_bytes(0, self.page_size - buf.len());
        buf.to_vec()
    }

    pub fn parse(
        id: PageId,
        data: &[u8],
        td: TupleDesc,
        key_field: usize,
        page_size: usize,
    ) -> DbResult<Self> {
        if data.len() < page_size {
            return Err(DbError::Db(format!("short leaf page: {} bytes", data.len())));
        }
        let tuple_size = td.tuple_size();
        let max_tuples = Self::max_tuples(page_size, tuple_size);
        let mut buf = data;

        let parent = get_page_ref(&mut buf, id.table_id)?
            .unwrap_or_else(|| PageId::root_ptr(id.table_id));
        if !matches!(
            parent.category,
            PageCategory::RootPtr | PageCategory::Internal
        ) {
            return Err(DbError::Db(format!(
                "leaf page {:?} has parent of category {:?}",
                id, parent.category
            )));
        }
        let sibling = |no: usize| (no != 0).then(|| PageId::new(id.table_id, no, PageCategory::Leaf));
        let left_sibling = sibling(buf.get_u32() as usize);
        let right_sibling = sibling(buf.get_u32() as usize);

        let bitmap_len = max_tuples.div_ceil(8);
        let bitmap = buf[..bitmap_len].to_vec();
        buf.advance(bitmap_len);

        let mut tuples = Vec::new();
        for slot in 0..max_tuples {
            if bitmap[slot / 8] & (1 << (slot % 8)) != 0 {
                let mut tuple = Tuple::parse(&td, &mut buf)?;
                tuple.set_record_id(Some(RecordId::new(id, tuples.len())));
                tuples.push(tuple);
            } else {
                buf.advance(tuple_size);
            }
        }

        Ok(LeafPage {
            id,
            parent,
            left_sibling,
            right_sibling,
            tuples,
            td,
            key_field,
            max_tuples,
            page_size,
            dirty: None,
        })
    }
}
