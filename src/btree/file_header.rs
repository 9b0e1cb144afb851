use std::convert::TryInto;

use crate::column::{ColumnDescriptor, ColumnType};
use crate::config::PAGE_SIZE;
use crate::error::{StorageError, StorageResult};

const MAGIC: u32 = 0x5844_4258; // "IXDX" shifted into a u32

/// Lives in page 0 of every index file (the "file header page" of spec §6):
/// column types/lengths the index was built over and the current root page
/// number. Mirrors `IxFileHdr`'s `serialize`/`deserialize` byte layout.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexFileHeader {
    pub root_page_no: i32,
    pub cols: Vec<ColumnDescriptor>,
}

fn type_tag(t: ColumnType) -> u8 {
    match t {
        ColumnType::Int => 0,
        ColumnType::Float => 1,
        ColumnType::String => 2,
        ColumnType::DateTime => 3,
    }
}

fn tag_type(tag: u8) -> StorageResult<ColumnType> {
    match tag {
        0 => Ok(ColumnType::Int),
        1 => Ok(ColumnType::Float),
        2 => Ok(ColumnType::String),
        3 => Ok(ColumnType::DateTime),
        _ => Err(StorageError::internal(format!("bad column type tag {}", tag))),
    }
}

impl IndexFileHeader {
    pub fn new(cols: Vec<ColumnDescriptor>) -> Self {
        IndexFileHeader {
            root_page_no: 1,
            cols,
        }
    }

    pub fn key_len(&self) -> usize {
        crate::column::key_length(&self.cols)
    }

    pub fn serialize(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.root_page_no.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.cols.len() as u32).to_be_bytes());
        let mut off = 12;
        for col in &self.cols {
            buf[off] = type_tag(col.col_type);
            buf[off + 1..off + 5].copy_from_slice(&(col.len as u32).to_be_bytes());
            off += 5;
        }
        buf
    }

    pub fn deserialize(buf: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(StorageError::internal("index file header has bad magic"));
        }
        let root_page_no = i32::from_be_bytes(buf[4..8].try_into().unwrap());
        let col_count = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        let mut off = 12;
        let mut cols = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let tag = buf[off];
            let len = u32::from_be_bytes(buf[off + 1..off + 5].try_into().unwrap()) as usize;
            cols.push(ColumnDescriptor::new(tag_type(tag)?, len)?);
            off += 5;
        }
        Ok(IndexFileHeader { root_page_no, cols })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let hdr = IndexFileHeader::new(vec![ColumnDescriptor::int(), ColumnDescriptor::string(16).unwrap()]);
        let bytes = hdr.serialize();
        let back = IndexFileHeader::deserialize(&bytes).unwrap();
        assert_eq!(hdr, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; PAGE_SIZE];
        assert!(IndexFileHeader::deserialize(&buf).is_err());
    }
}
