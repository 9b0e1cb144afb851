//! On-disk SSTable: a run of `Block`s, a meta section describing where each
//! one starts and what key range it covers, and a bloom filter over every
//! key in the file. Layout, informed by the C++ `sstable.h` sketch:
//!
//! ```text
//! [ data blocks, back to back, each `Block::encode()`d (each ends in its
//!   own content hash)                                                  ]
//! [ meta section: num_blocks:u32, key_len:u32, BlockMeta*, hash:u32     ]
//! [ bloom filter: BloomFilter::encode()                                 ]
//! [ footer: meta_offset:u32, bloom_offset:u32                           ]
//! ```
//!
//! The footer is the only fixed-offset anchor (last 8 bytes of the file);
//! everything else is found by following it backwards.

use std::convert::TryInto;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::column::{compare_key, ColumnDescriptor};
use crate::error::{StorageError, StorageResult};
use crate::rid::Rid;

use super::block::{content_hash, Block, BlockBuilder};
use super::bloom::BloomFilter;

const FOOTER_LEN: usize = 8;

#[derive(Debug, Clone)]
struct BlockMeta {
    offset: u32,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

pub struct SSTable {
    path: PathBuf,
    sst_id: u64,
    level: usize,
    key_len: usize,
    cols: Vec<ColumnDescriptor>,
    meta: Vec<BlockMeta>,
    block_section_end: u32,
    bloom: BloomFilter,
}

impl SSTable {
    pub fn sst_id(&self) -> u64 {
        self.sst_id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn first_key(&self) -> &[u8] {
        &self.meta[0].first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.meta[self.meta.len() - 1].last_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_block(&self, idx: usize) -> StorageResult<Block> {
        let start = self.meta[idx].offset as u64;
        let end = if idx + 1 < self.meta.len() {
            self.meta[idx + 1].offset as u64
        } else {
            self.block_section_end as u64
        };
        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Block::decode(&buf, self.key_len)
    }

    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        if compare_key(key, self.first_key(), &self.cols) == std::cmp::Ordering::Less
            || compare_key(key, self.last_key(), &self.cols) == std::cmp::Ordering::Greater
        {
            return Ok(None);
        }
        let idx = self
            .meta
            .partition_point(|m| compare_key(&m.last_key, key, &self.cols) == std::cmp::Ordering::Less);
        if idx >= self.meta.len() {
            return Ok(None);
        }
        let block = self.read_block(idx)?;
        Ok(block.get(key, &self.cols))
    }

    pub fn iter(&self) -> StorageResult<SstIterator> {
        Ok(SstIterator {
            sst: self,
            block_idx: 0,
            cur_block: None,
            cur_pos: 0,
        })
    }

    pub fn delete_file(&self) -> StorageResult<()> {
        fs::remove_file(&self.path).map_err(StorageError::from)
    }

    pub fn open<P: AsRef<Path>>(path: P, sst_id: u64, level: usize, cols: Vec<ColumnDescriptor>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let key_len = crate::column::key_length(&cols);
        let mut file = fs::File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN as u64 {
            return Err(StorageError::internal("sstable file too short"));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer)?;
        let meta_offset = u32::from_be_bytes(footer[0..4].try_into().unwrap());
        let bloom_offset = u32::from_be_bytes(footer[4..8].try_into().unwrap());

        file.seek(SeekFrom::Start(meta_offset as u64))?;
        let mut meta_buf = vec![0u8; (bloom_offset - meta_offset) as usize];
        file.read_exact(&mut meta_buf)?;
        if meta_buf.len() < 4 {
            return Err(StorageError::internal("sstable meta section too short"));
        }
        let (meta_body, hash_bytes) = meta_buf.split_at(meta_buf.len() - 4);
        let stored_hash = u32::from_be_bytes(hash_bytes.try_into().unwrap());
        if content_hash(meta_body) != stored_hash {
            return Err(StorageError::internal("sstable meta section hash mismatch"));
        }

        let num_blocks = u32::from_be_bytes(meta_body[0..4].try_into().unwrap()) as usize;
        let footer_key_len = u32::from_be_bytes(meta_body[4..8].try_into().unwrap()) as usize;
        if footer_key_len != key_len {
            return Err(StorageError::internal("sstable key length mismatch"));
        }
        let mut meta = Vec::with_capacity(num_blocks);
        let mut off = 8;
        for _ in 0..num_blocks {
            let block_offset = u32::from_be_bytes(meta_body[off..off + 4].try_into().unwrap());
            off += 4;
            let first_key = meta_body[off..off + key_len].to_vec();
            off += key_len;
            let last_key = meta_body[off..off + key_len].to_vec();
            off += key_len;
            meta.push(BlockMeta {
                offset: block_offset,
                first_key,
                last_key,
            });
        }

        file.seek(SeekFrom::Start(bloom_offset as u64))?;
        let mut bloom_buf = vec![0u8; (file_len - FOOTER_LEN as u64 - bloom_offset as u64) as usize];
        file.read_exact(&mut bloom_buf)?;
        let bloom = BloomFilter::decode(&bloom_buf);

        Ok(SSTable {
            path,
            sst_id,
            level,
            key_len,
            cols,
            meta,
            block_section_end: meta_offset,
            bloom,
        })
    }
}

/// Incrementally fills one `Block` at a time via `add`; `finish_block`
/// flushes the running block into the file buffer and starts a new one.
/// `build` writes the finished file and returns a handle onto it.
pub struct SSTBuilder {
    cols: Vec<ColumnDescriptor>,
    key_len: usize,
    block_size: usize,
    data: Vec<u8>,
    meta: Vec<BlockMeta>,
    current: BlockBuilder,
    current_first_key: Option<Vec<u8>>,
    current_last_key: Vec<u8>,
    bloom_keys: Vec<Vec<u8>>,
}

impl SSTBuilder {
    pub fn new(cols: Vec<ColumnDescriptor>, block_size: usize) -> Self {
        let key_len = crate::column::key_length(&cols);
        SSTBuilder {
            cols,
            key_len,
            block_size,
            data: Vec::new(),
            meta: Vec::new(),
            current: BlockBuilder::new(key_len, block_size),
            current_first_key: None,
            current_last_key: Vec::new(),
            bloom_keys: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.current.is_empty()
    }

    /// Running size estimate used to decide when to stop accumulating and
    /// cut a new sstable file during compaction.
    pub fn approx_len(&self) -> usize {
        self.data.len() + self.current.estimated_size()
    }

    pub fn add(&mut self, key: &[u8], rid: Rid) {
        assert_eq!(key.len(), self.key_len, "key length mismatch in sstable builder");
        if self.current_first_key.is_none() {
            self.current_first_key = Some(key.to_vec());
        }
        self.current_last_key = key.to_vec();
        self.bloom_keys.push(key.to_vec());
        let has_room = self.current.add(key, rid);
        if !has_room {
            self.finish_block();
        }
    }

    fn finish_block(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let finished = std::mem::replace(&mut self.current, BlockBuilder::new(self.key_len, self.block_size));
        let offset = self.data.len() as u32;
        let block = finished.build();
        self.data.extend_from_slice(&block.encode());
        self.meta.push(BlockMeta {
            offset,
            first_key: self.current_first_key.take().unwrap(),
            last_key: self.current_last_key.clone(),
        });
    }

    pub fn build<P: AsRef<Path>>(mut self, path: P, sst_id: u64, level: usize, bloom_fp_rate: f64) -> StorageResult<SSTable> {
        self.finish_block();
        if self.meta.is_empty() {
            return Err(StorageError::internal("cannot build an sstable with no entries"));
        }

        let block_section_end = self.data.len() as u32;

        let mut meta_section = Vec::new();
        meta_section.extend_from_slice(&(self.meta.len() as u32).to_be_bytes());
        meta_section.extend_from_slice(&(self.key_len as u32).to_be_bytes());
        for m in &self.meta {
            meta_section.extend_from_slice(&m.offset.to_be_bytes());
            meta_section.extend_from_slice(&m.first_key);
            meta_section.extend_from_slice(&m.last_key);
        }
        meta_section.extend_from_slice(&content_hash(&meta_section).to_be_bytes());

        let mut bloom = BloomFilter::new(self.bloom_keys.len().max(1), bloom_fp_rate);
        for k in &self.bloom_keys {
            bloom.add(k);
        }
        let bloom_section = bloom.encode();

        let meta_offset = block_section_end;
        let bloom_offset = meta_offset + meta_section.len() as u32;

        let mut out = self.data;
        out.extend_from_slice(&meta_section);
        out.extend_from_slice(&bloom_section);
        out.extend_from_slice(&meta_offset.to_be_bytes());
        out.extend_from_slice(&bloom_offset.to_be_bytes());

        let path = path.as_ref();
        let mut file = fs::File::create(path)?;
        file.write_all(&out)?;
        file.flush()?;

        SSTable::open(path, sst_id, level, self.cols)
    }
}

pub struct SstIterator<'a> {
    sst: &'a SSTable,
    block_idx: usize,
    cur_block: Option<Block>,
    cur_pos: usize,
}

impl<'a> Iterator for SstIterator<'a> {
    type Item = StorageResult<(Vec<u8>, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cur_block.is_none() {
                if self.block_idx >= self.sst.meta.len() {
                    return None;
                }
                match self.sst.read_block(self.block_idx) {
                    Ok(b) => {
                        self.cur_block = Some(b);
                        self.cur_pos = 0;
                        self.block_idx += 1;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let block = self.cur_block.as_ref().unwrap();
            if self.cur_pos < block.num_entries() {
                let item = (block.key_at(self.cur_pos).to_vec(), block.rid_at(self.cur_pos));
                self.cur_pos += 1;
                return Some(Ok(item));
            }
            self.cur_block = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnDescriptor;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "storage_core_sstable_{}_{:?}_{}",
            name,
            std::thread::current().id(),
            std::process::id()
        ));
        p
    }

    #[test]
    fn build_then_open_round_trips_all_entries() {
        let cols = vec![ColumnDescriptor::int()];
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);

        let mut builder = SSTBuilder::new(cols.clone(), 256);
        for i in 0..300i32 {
            builder.add(&i.to_be_bytes(), Rid::new(i, 0));
        }
        let sst = builder.build(&path, 1, 0, 0.01).unwrap();
        assert!(sst.meta.len() > 1, "expected multiple blocks given the small block size");

        for i in 0..300i32 {
            assert_eq!(sst.get(&i.to_be_bytes()).unwrap(), Some(Rid::new(i, 0)));
        }
        assert_eq!(sst.get(&999i32.to_be_bytes()).unwrap(), None);

        let reopened = SSTable::open(&path, 1, 0, cols).unwrap();
        assert_eq!(reopened.get(&150i32.to_be_bytes()).unwrap(), Some(Rid::new(150, 0)));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopen_rejects_a_tampered_block() {
        let cols = vec![ColumnDescriptor::int()];
        let path = temp_path("tamper");
        let _ = fs::remove_file(&path);

        let mut builder = SSTBuilder::new(cols.clone(), 4096);
        for i in 0..20i32 {
            builder.add(&i.to_be_bytes(), Rid::new(i, 0));
        }
        builder.build(&path, 3, 0, 0.01).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let reopened = SSTable::open(&path, 3, 0, cols).unwrap();
        assert!(reopened.get(&0i32.to_be_bytes()).is_err());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn iterator_covers_every_entry_in_order() {
        let cols = vec![ColumnDescriptor::int()];
        let path = temp_path("iter");
        let _ = fs::remove_file(&path);

        let mut builder = SSTBuilder::new(cols.clone(), 128);
        for i in 0..50i32 {
            builder.add(&i.to_be_bytes(), Rid::new(i, 0));
        }
        let sst = builder.build(&path, 2, 0, 0.01).unwrap();
        let got: Vec<i32> = sst
            .iter()
            .unwrap()
            .map(|r| i32::from_be_bytes(r.unwrap().0.try_into().unwrap()))
            .collect();
        assert_eq!(got, (0..50).collect::<Vec<_>>());

        fs::remove_file(&path).unwrap();
    }
}
