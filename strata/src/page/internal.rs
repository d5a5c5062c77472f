use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DbError, DbResult};
use crate::page::{get_page_ref, put_page_ref};
use crate::tuple::{Field, FieldType};
use crate::types::{PageCategory, PageId, TransactionId};

/// Parent pointer (number + category) before the bitmap, plus the category
/// byte shared by all child pointers after them.
const INTERNAL_FIXED_BYTES: usize = 6;

/// One separator entry of an internal page: adjacent entries share a child,
/// so the page stores one more child pointer than keys and an entry is a
/// view over `(keys[i], children[i], children[i + 1])`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Field,
    pub left_child: PageId,
    pub right_child: PageId,
}

impl Entry {
    pub fn new(key: Field, left_child: PageId, right_child: PageId) -> Self {
        Entry {
            key,
            left_child,
            right_child,
        }
    }
}

/// An internal page: a non-decreasing run of separator keys over an aligned
/// run of child pointers, all children of one category.
#[derive(Debug, Clone)]
pub struct InternalPage {
    id: PageId,
    parent: PageId,
    keys: Vec<Field>,
    children: Vec<PageId>,
    key_type: FieldType,
    max_entries: usize,
    page_size: usize,
    dirty: Option<TransactionId>,
}

impl InternalPage {
    /// The number of separator entries a page offers: each entry costs the
    /// key width, one child pointer, and one bitmap bit, on top of one extra
    /// child pointer and bitmap bit for the leftmost child.
    pub fn max_entries(page_size: usize, key_size: usize) -> usize {
        let mut m = 0;
        let fits = |m: usize| {
            INTERNAL_FIXED_BYTES + (m + 2).div_ceil(8) + (m + 1) * key_size + (m + 2) * 4
                <= page_size
        };
        while fits(m) {
            m += 1;
        }
        m
    }

    pub fn blank(id: PageId, key_type: FieldType, page_size: usize) -> Self {
        let max_entries = Self::max_entries(page_size, key_type.size());
        InternalPage {
            id,
            parent: PageId::root_ptr(id.table_id),
            keys: Vec::new(),
            children: Vec::new(),
            key_type,
            max_entries,
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

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirty = tid;
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn num_entries(&self) -> usize {
        self.keys.len()
    }

    pub fn num_empty_slots(&self) -> usize {
        self.max_entries - self.keys.len()
    }

    pub fn keys(&self) -> &[Field] {
        &self.keys
    }

    pub fn children(&self) -> &[PageId] {
        &self.children
    }

    pub fn key_at(&self, i: usize) -> &Field {
        &self.keys[i]
    }

    pub fn set_key(&mut self, i: usize, key: Field) {
        self.keys[i] = key;
    }

    pub fn entry(&self, i: usize) -> Entry {
        Entry::new(self.keys[i].clone(), self.children[i], self.children[i + 1])
    }

    pub fn entries(&self) -> Vec<Entry> {
        (0..self.keys.len()).map(|i| self.entry(i)).collect()
    }

    /// Inserts an entry next to the existing child pointer it shares. The
    /// first entry of an empty page installs both of its children; after
    /// that an entry must name one child already on the page, which anchors
    /// its position.
    pub fn insert_entry(&mut self, entry: Entry) -> DbResult<()> {
        if self.keys.len() >= self.max_entries {
            return Err(DbError::Db(format!("internal page {:?} is full", self.id)));
        }
        if entry.key.field_type() != self.key_type {
            return Err(DbError::db("entry key does not match the index key type"));
        }
        if self.children.is_empty() {
            self.keys.push(entry.key);
            self.children.push(entry.left_child);
            self.children.push(entry.right_child);
            return Ok(());
        }
        if entry.left_child.category != self.children[0].category {
            return Err(DbError::db("entry children do not match the page's child category"));
        }
        if let Some(i) = self.children.iter().position(|c| *c == entry.left_child) {
            self.keys.insert(i, entry.key);
            self.children.insert(i + 1, entry.right_child);
            Ok(())
        } else if let Some(i) = self.children.iter().position(|c| *c == entry.right_child) {
            self.keys.insert(i, entry.key);
            self.children.insert(i, entry.left_child);
            Ok(())
        } else {
            Err(DbError::Db(format!(
                "entry does not align with any child of page {:?}",
                self.id
            )))
        }
    }

    /// Removes key `i` together with the child on its right.
    pub fn delete_key_and_right_child(&mut self, i: usize) -> (Field, PageId) {
        let key = self.keys.remove(i);
        let child = self.children.remove(i + 1);
        (key, child)
    }

    /// Removes key `i` together with the child on its left.
    pub fn delete_key_and_left_child(&mut self, i: usize) -> (Field, PageId) {
        let key = self.keys.remove(i);
        let child = self.children.remove(i);
        (key, child)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.page_size);
        put_page_ref(&mut buf, Some(self.parent));

        let bitmap_len = (self.max_entries + 1).div_ceil(8);
        let mut bitmap = vec![0u8; bitmap_len];
        for slot in 0..self.children.len() {
            bitmap[slot / 8] |= 1 << (slot % 8);
        }
        buf.put_slice(&bitmap);

        for key in &self.keys {
            key.serialize(&mut buf);
        }
        let key_size = self.key_type.size();
        buf.put_bytes(0, (self.max_entries - self.keys.len()) * key_size);

        for child in &self.children {
            buf.put_u32(child.page_no as u32);
        }
        buf.put_bytes(0, (self.max_entries + 1 - self.children.len()) * 4);
        buf.put_u8(self.children.first().map_or(0, |c| c.category.to_byte()));

        buf.put_bytes(0, self.page_size - buf.len());
        buf.to_vec()
    }

    pub fn parse(
        id: PageId,
        data: &[u8],
        key_type: FieldType,
        page_size: usize,
    ) -> DbResult<Self> {
        if data.len() < page_size {
            return Err(DbError::Db(format!(
                "short internal page: {} bytes",
                data.len()
            )));
        }
        let key_size = key_type.size();
        let max_entries = Self::max_entries(page_size, key_size);
        let mut buf = data;

        let parent = get_page_ref(&mut buf, id.table_id)?
            .unwrap_or_else(|| PageId::root_ptr(id.table_id));
        if !matches!(
            parent.category,
            PageCategory::RootPtr | PageCategory::Internal
        ) {
            return Err(DbError::Db(format!(
                "internal page {:?} has parent of category {:?}",
                id, parent.category
            )));
        }

        let bitmap_len = (max_entries + 1).div_ceil(8);
        let bitmap = buf[..bitmap_len].to_vec();
        buf.advance(bitmap_len);
        let occupied = |slot: usize| bitmap[slot / 8] & (1 << (slot % 8)) != 0;
        let num_children = (0..max_entries + 1).filter(|s| occupied(*s)).count();
        let num_keys = num_children.saturating_sub(1);

        let mut keys = Vec::with_capacity(num_keys);
        for i in 0..max_entries {
            if i < num_keys {
                keys.push(Field::parse(key_type, &mut buf)?);
            } else {
                buf.advance(key_size);
            }
        }

        let mut child_nos = Vec::with_capacity(num_children);
        for i in 0..max_entries + 1 {
            let no = buf.get_u32() as usize;
            if i < num_children {
                child_nos.push(no);
            }
        }
        let category_byte = buf.get_u8();
        let children = if num_children == 0 {
            Vec::new()
        } else {
            let child_category = PageCategory::from_byte(category_byte)?;
            if !matches!(child_category, PageCategory::Internal | PageCategory::Leaf) {
                return Err(DbError::Db(format!(
                    "internal page {:?} has children of category {:?}",
                    id, child_category
                )));
            }
            child_nos
                .into_iter()
                .map(|no| PageId::new(id.table_id, no, child_category))
                .collect()
        };

        Ok(InternalPage {
            id,
            parent,
            keys,
            children,
            key_type,
            max_entries,
            page_size,
            dirty: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 128;

    fn internal() -> InternalPage {
        InternalPage::blank(
            PageId::new(1, 3, PageCategory::Internal),
            FieldType::Int,
            PAGE_SIZE,
        )
    }

    fn leaf_id(no: usize) -> PageId {
        PageId::new(1, no, PageCategory::Leaf)
    }

    #[test]
    fn first_entry_installs_both_children() {
        let mut page = internal();
        page.insert_entry(Entry::new(Field::Int(10), leaf_id(4), leaf_id(5)))
            .unwrap();
        assert_eq!(page.num_entries(), 1);
        assert_eq!(page.children(), &[leaf_id(4), leaf_id(5)]);
    }

    #[test]
    fn entries_anchor_on_shared_children() {
        let mut page = internal();
        page.insert_entry(Entry::new(Field::Int(10), leaf_id(4), leaf_id(5)))
            .unwrap();
        // splitting the right child appends on its anchor
        page.insert_entry(Entry::new(Field::Int(20), leaf_id(5), leaf_id(6)))
            .unwrap();
        // an entry whose right child is the current leftmost goes to the front
        page.insert_entry(Entry::new(Field::Int(5), leaf_id(9), leaf_id(4)))
            .unwrap();
        assert_eq!(
            page.keys(),
            &[Field::Int(5), Field::Int(10), Field::Int(20)]
        );
        assert_eq!(
            page.children(),
            &[leaf_id(9), leaf_id(4), leaf_id(5), leaf_id(6)]
        );
    }

    #[test]
    fn misaligned_entry_is_rejected() {
        let mut page = internal();
        page.insert_entry(Entry::new(Field::Int(10), leaf_id(4), leaf_id(5)))
            .unwrap();
        let err = page
            .insert_entry(Entry::new(Field::Int(30), leaf_id(70), leaf_id(71)))
            .unwrap_err();
        assert!(err.to_string().contains("align"));
    }

    #[test]
    fn delete_left_and_right_children() {
        let mut page = internal();
        page.insert_entry(Entry::new(Field::Int(10), leaf_id(4), leaf_id(5)))
            .unwrap();
        page.insert_entry(Entry::new(Field::Int(20), leaf_id(5), leaf_id(6)))
            .unwrap();

        let (key, child) = page.delete_key_and_right_child(1);
        assert_eq!(key, Field::Int(20));
        assert_eq!(child, leaf_id(6));
        assert_eq!(page.children(), &[leaf_id(4), leaf_id(5)]);

        let (key, child) = page.delete_key_and_left_child(0);
        assert_eq!(key, Field::Int(10));
        assert_eq!(child, leaf_id(4));
        assert_eq!(page.children(), &[leaf_id(5)]);
        assert_eq!(page.num_entries(), 0);
    }

    #[test]
    fn round_trip_preserves_entries() {
        let mut page = internal();
        page.set_parent_id(PageId::new(1, 8, PageCategory::Internal));
        page.insert_entry(Entry::new(Field::Int(10), leaf_id(4), leaf_id(5)))
            .unwrap();
        page.insert_entry(Entry::new(Field::Int(20), leaf_id(5), leaf_id(6)))
            .unwrap();

        let bytes = page.serialize();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let parsed = InternalPage::parse(page.id(), &bytes, FieldType::Int, PAGE_SIZE).unwrap();
        assert_eq!(parsed.keys(), page.keys());
        assert_eq!(parsed.children(), page.children());
        assert_eq!(parsed.parent_id(), PageId::new(1, 8, PageCategory::Internal));
    }

    #[test]
    fn capacity_accounts_for_the_extra_child() {
        // 6 fixed bytes + bitmap + m keys of 4 bytes + (m + 1) children of 4
        // bytes must fit the page
        let m = InternalPage::max_entries(PAGE_SIZE, 4);
        assert!(INTERNAL_FIXED_BYTES + (m + 1).div_ceil(8) + m * 4 + (m + 1) * 4 <= PAGE_SIZE);
        assert!(INTERNAL_FIXED_BYTES + (m + 2).div_ceil(8) + (m + 1) * 4 + (m + 2) * 4 > PAGE_SIZE);
    }
}
