//! The tuple, field, and predicate model consumed by the B+tree.

use bytes::{Buf, BufMut};
use std::cmp::Ordering;

use crate::error::{DbError, DbResult};
use crate::types::RecordId;

/// Serialized payload width of a text field, excluding the length prefix.
pub const TEXT_LEN: usize = 128;

/// The type of a single tuple field. Every type has a fixed serialized width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Text,
}

impl FieldType {
    /// The number of bytes a field of this type occupies on a page.
    pub fn size(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Text => 4 + TEXT_LEN,
        }
    }
}

/// A typed field value. Fields of the same type are totally ordered; the
/// derived cross-type order exists only so `Field` can live in ordered
/// collections.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Int(i32),
    Text(String),
}

/// Comparison operators supported by field predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEq,
    GreaterThan,
    GreaterThanOrEq,
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Text(_) => FieldType::Text,
        }
    }

    /// Evaluates `self op other`.
    pub fn compare(&self, op: Op, other: &Field) -> bool {
        let ord = self.cmp(other);
        match op {
            Op::Equals => ord == Ordering::Equal,
            Op::NotEquals => ord != Ordering::Equal,
            Op::LessThan => ord == Ordering::Less,
            Op::LessThanOrEq => ord != Ordering::Greater,
            Op::GreaterThan => ord == Ordering::Greater,
            Op::GreaterThanOrEq => ord != Ordering::Less,
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Field::Int(v) => buf.put_i32(*v),
            Field::Text(s) => {
                let raw = s.as_bytes();
                let len = raw.len().min(TEXT_LEN);
                buf.put_u32(len as u32);
                buf.put_slice(&raw[..len]);
                buf.put_bytes(0, TEXT_LEN - len);
            }
        }
    }

    pub fn parse(ftype: FieldType, buf: &mut impl Buf) -> DbResult<Field> {
        match ftype {
            FieldType::Int => Ok(Field::Int(buf.get_i32())),
            FieldType::Text => {
                let len = buf.get_u32() as usize;
                if len > TEXT_LEN {
                    return Err(DbError::Db(format!("text field length {} out of range", len)));
                }
                let mut raw = vec![0u8; TEXT_LEN];
                buf.copy_to_slice(&mut raw);
                raw.truncate(len);
                String::from_utf8(raw)
                    .map(Field::Text)
                    .map_err(|_| DbError::db("text field is not valid utf-8"))
            }
        }
    }
}

/// The schema of a tuple: an ordered list of field types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    types: Vec<FieldType>,
}

impl TupleDesc {
    pub fn new(types: Vec<FieldType>) -> Self {
        TupleDesc { types }
    }

    pub fn num_fields(&self) -> usize {
        self.types.len()
    }

    pub fn field_type(&self, i: usize) -> FieldType {
        self.types[i]
    }

    /// The fixed serialized width of one tuple under this schema.
    pub fn tuple_size(&self) -> usize {
        self.types.iter().map(|t| t.size()).sum()
    }
}

/// A fixed-schema vector of fields, stamped with the record id of the slot
/// it occupies once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    fields: Vec<Field>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(fields: Vec<Field>) -> Self {
        Tuple {
            fields,
            record_id: None,
        }
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    pub fn matches_schema(&self, td: &TupleDesc) -> bool {
        self.fields.len() == td.num_fields()
            && self
                .fields
                .iter()
                .enumerate()
                .all(|(i, f)| f.field_type() == td.field_type(i))
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        for field in &self.fields {
            field.serialize(buf);
        }
    }

    pub fn parse(td: &TupleDesc, buf: &mut impl Buf) -> DbResult<Tuple> {
        let mut fields = Vec::with_capacity(td.num_fields());
        for i in 0..td.num_fields() {
            fields.push(Field::parse(td.field_type(i), buf)?);
        }
        Ok(Tuple::new(fields))
    }
}

/// A search condition on the indexed key field: `key op bound`.
#[derive(Debug, Clone)]
pub struct IndexPredicate {
    pub op: Op,
    pub field: Field,
}

impl IndexPredicate {
    pub fn new(op: Op, field: Field) -> Self {
        IndexPredicate { op, field }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn int_fields_compare() {
        let three = Field::Int(3);
        let five = Field::Int(5);
        assert!(three.compare(Op::LessThan, &five));
        assert!(three.compare(Op::LessThanOrEq, &five));
        assert!(five.compare(Op::GreaterThan, &three));
        assert!(three.compare(Op::NotEquals, &five));
        assert!(three.compare(Op::Equals, &Field::Int(3)));
        assert!(!three.compare(Op::GreaterThanOrEq, &five));
    }

    #[test]
    fn text_fields_compare_lexicographically() {
        let a = Field::Text("apple".to_string());
        let b = Field::Text("banana".to_string());
        assert!(a.compare(Op::LessThan, &b));
        assert!(b.compare(Op::GreaterThanOrEq, &a));
    }

    #[test]
    fn field_serialization_round_trips() {
        let td = TupleDesc::new(vec![FieldType::Int, FieldType::Text]);
        let tuple = Tuple::new(vec![Field::Int(-42), Field::Text("hello".to_string())]);
        let mut buf = BytesMut::new();
        tuple.serialize(&mut buf);
        assert_eq!(buf.len(), td.tuple_size());

        let parsed = Tuple::parse(&td, &mut buf.freeze()).unwrap();
        assert_eq!(parsed.field(0), &Field::Int(-42));
        assert_eq!(parsed.field(1), &Field::Text("hello".to_string()));
    }

    #[test]
    fn overlong_text_is_truncated_to_capacity() {
        let long = "x".repeat(TEXT_LEN + 50);
        let mut buf = BytesMut::new();
        Field::Text(long).serialize(&mut buf);
        assert_eq!(buf.len(), FieldType::Text.size());

        let parsed = Field::parse(FieldType::Text, &mut buf.freeze()).unwrap();
        assert_eq!(parsed, Field::Text("x".repeat(TEXT_LEN)));
    }
}
