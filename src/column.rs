use std::cmp::Ordering;
use std::convert::TryInto;

use crate::config::IX_MAX_COL_LEN;
use crate::error::{StorageError, StorageResult};

/// Tag of a single column's storage type, used to dispatch the comparator
/// without a vtable (the descriptor list is small and looked up on every
/// key comparison in the hot path of a tree descent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    String,
    DateTime,
}

impl ColumnType {
    /// Fixed on-disk width of this column type, or `None` for `String`
    /// whose width is carried per-descriptor instead (it's fixed-length
    /// *per index*, just not fixed-length *per type*).
    fn fixed_len(self) -> Option<usize> {
        match self {
            ColumnType::Int => Some(4),
            ColumnType::Float => Some(8),
            ColumnType::DateTime => Some(8),
            ColumnType::String => None,
        }
    }
}

/// One column of a composite index key: its type and its fixed encoded
/// length (for `String` columns, the padded/truncated width chosen when the
/// index was created).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub col_type: ColumnType,
    pub len: usize,
}

impl ColumnDescriptor {
    pub fn new(col_type: ColumnType, len: usize) -> StorageResult<Self> {
        if let Some(fixed) = col_type.fixed_len() {
            if len != fixed {
                return Err(StorageError::InvalidColLength {
                    expected: fixed,
                    got: len,
                });
            }
        }
        if len > IX_MAX_COL_LEN {
            return Err(StorageError::InvalidColLength {
                expected: IX_MAX_COL_LEN,
                got: len,
            });
        }
        Ok(ColumnDescriptor { col_type, len })
    }

    pub fn int() -> Self {
        ColumnDescriptor::new(ColumnType::Int, 4).unwrap()
    }

    pub fn float() -> Self {
        ColumnDescriptor::new(ColumnType::Float, 8).unwrap()
    }

    pub fn datetime() -> Self {
        ColumnDescriptor::new(ColumnType::DateTime, 8).unwrap()
    }

    pub fn string(len: usize) -> StorageResult<Self> {
        ColumnDescriptor::new(ColumnType::String, len)
    }
}

/// Total encoded width of a composite key built from `cols`.
pub fn key_length(cols: &[ColumnDescriptor]) -> usize {
    cols.iter().map(|c| c.len).sum()
}

fn compare_one(a: &[u8], b: &[u8], col: ColumnDescriptor) -> Ordering {
    match col.col_type {
        ColumnType::Int => {
            let x = i32::from_be_bytes([a[0], a[1], a[2], a[3]]);
            let y = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
            x.cmp(&y)
        }
        ColumnType::Float => {
            let x = f64::from_be_bytes(a[0..8].try_into().unwrap());
            let y = f64::from_be_bytes(b[0..8].try_into().unwrap());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        ColumnType::DateTime => {
            let x = i64::from_be_bytes(a[0..8].try_into().unwrap());
            let y = i64::from_be_bytes(b[0..8].try_into().unwrap());
            x.cmp(&y)
        }
        ColumnType::String => a.cmp(b),
    }
}

/// Compares two encoded composite keys column by column, short-circuiting
/// on the first non-equal column. Mirrors `ix_compare`'s per-column
/// dispatch over the index's column-type list.
pub fn compare_key(a: &[u8], b: &[u8], cols: &[ColumnDescriptor]) -> Ordering {
    let mut offset = 0;
    for col in cols {
        let (a_part, b_part) = (&a[offset..offset + col.len], &b[offset..offset + col.len]);
        match compare_one(a_part, b_part, *col) {
            Ordering::Equal => {}
            other => return other,
        }
        offset += col.len;
    }
    Ordering::Equal
}

pub fn encode_int(v: i32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn decode_int(buf: &[u8]) -> i32 {
    i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_ints() {
        let cols = [ColumnDescriptor::int()];
        let a = encode_int(3);
        let b = encode_int(5);
        assert_eq!(compare_key(&a, &b, &cols), Ordering::Less);
        assert_eq!(compare_key(&b, &a, &cols), Ordering::Greater);
        assert_eq!(compare_key(&a, &a, &cols), Ordering::Equal);
    }

    #[test]
    fn compares_composite_keys_left_to_right() {
        let cols = [ColumnDescriptor::int(), ColumnDescriptor::int()];
        let mut a = encode_int(1);
        a.extend(encode_int(9));
        let mut b = encode_int(1);
        b.extend(encode_int(2));
        assert_eq!(compare_key(&a, &b, &cols), Ordering::Greater);
    }

    #[test]
    fn rejects_mismatched_fixed_length() {
        assert!(ColumnDescriptor::new(ColumnType::Int, 8).is_err());
    }
}
