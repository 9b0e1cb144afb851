use std::collections::{hash_map::DefaultHasher, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;

use log::{debug, warn};

use crate::config::{BUFFER_POOL_SIZE, PAGE_SIZE};
use crate::disk::DiskManager;
use crate::error::{StorageError, StorageResult};
use crate::page_id::PageId;
use crate::types::{HandyRwLock, Pod};

use super::frame::{Frame, FrameId};
use super::replacer::{LruReplacer, Replacer};

const PAGE_TABLE_SHARDS: usize = 16;

fn shard_of(page_id: &PageId) -> usize {
    let mut h = DefaultHasher::new();
    page_id.hash(&mut h);
    (h.finish() as usize) & (PAGE_TABLE_SHARDS - 1)
}

/// Fixed-size pool of page frames with pin-count tracking and pluggable
/// victim selection. A page is evictable only once its pin count reaches
/// zero; `fetch_page`/`new_page` return [`StorageError::BufferPoolExhausted`]
/// rather than blocking when every frame is pinned, matching the spec's "no
/// pinned frame is ever a victim" invariant.
pub struct BufferPool {
    frames: Vec<Pod<Frame>>,
    page_table: Vec<Mutex<HashMap<PageId, FrameId>>>,
    free_list: Mutex<VecDeque<FrameId>>,
    replacer: Box<dyn Replacer>,
    disk: Arc<DiskManager>,
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self::with_capacity(disk, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(disk: Arc<DiskManager>, capacity: usize) -> Self {
        let frames = (0..capacity)
            .map(|_| crate::types::new_pod(Frame::new()))
            .collect();
        let page_table = (0..PAGE_TABLE_SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let free_list = Mutex::new((0..capacity as FrameId).collect());
        BufferPool {
            frames,
            page_table,
            free_list,
            replacer: Box::new(LruReplacer::new()),
            disk,
        }
    }

    pub fn with_replacer(disk: Arc<DiskManager>, capacity: usize, replacer: Box<dyn Replacer>) -> Self {
        let frames = (0..capacity)
            .map(|_| crate::types::new_pod(Frame::new()))
            .collect();
        let page_table = (0..PAGE_TABLE_SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let free_list = Mutex::new((0..capacity as FrameId).collect());
        BufferPool {
            frames,
            page_table,
            free_list,
            replacer,
            disk,
        }
    }

    fn find_victim(&self) -> Option<FrameId> {
        if let Some(frame_id) = self.free_list.lock().unwrap().pop_front() {
            return Some(frame_id);
        }
        self.replacer.victim()
    }

    /// Evicts whatever `frame_id` is currently holding (writing it back if
    /// dirty) so it can be repurposed for a new page. Caller already holds
    /// the frame's write latch.
    fn evict_into(&self, frame_id: FrameId, frame: &mut Frame) -> StorageResult<()> {
        if frame.page_id.is_valid() {
            if frame.is_dirty {
                self.disk
                    .write_page(frame.page_id.fd, frame.page_id.page_no, &frame.data)?;
            }
            let shard = &self.page_table[shard_of(&frame.page_id)];
            shard.lock().unwrap().remove(&frame.page_id);
        }
        frame.reset();
        let _ = frame_id;
        Ok(())
    }

    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<Pod<Frame>> {
        let shard = &self.page_table[shard_of(&page_id)];
        {
            let table = shard.lock().unwrap();
            if let Some(&frame_id) = table.get(&page_id) {
                let pod = self.frames[frame_id as usize].clone();
                {
                    let mut frame = pod.wl();
                    frame.pin_count += 1;
                }
                self.replacer.pin(frame_id);
                return Ok(pod);
            }
        }

        let frame_id = self
            .find_victim()
            .ok_or(StorageError::BufferPoolExhausted)?;
        let pod = self.frames[frame_id as usize].clone();
        {
            let mut frame = pod.wl();
            if frame.pin_count > 0 {
                return Err(StorageError::BufferPoolExhausted);
            }
            self.evict_into(frame_id, &mut frame)?;
            self.disk
                .read_page(page_id.fd, page_id.page_no, &mut frame.data)?;
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
        }
        shard.lock().unwrap().insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        debug!("fetched page {} into frame {}", page_id, frame_id);
        Ok(pod)
    }

    pub fn new_page(&self, fd: i32) -> StorageResult<(PageId, Pod<Frame>)> {
        let frame_id = self
            .find_victim()
            .ok_or(StorageError::BufferPoolExhausted)?;
        let pod = self.frames[frame_id as usize].clone();
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);
        {
            let mut frame = pod.wl();
            if frame.pin_count > 0 {
                return Err(StorageError::BufferPoolExhausted);
            }
            self.evict_into(frame_id, &mut frame)?;
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = true;
        }
        self.page_table[shard_of(&page_id)]
            .lock()
            .unwrap()
            .insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        debug!("allocated page {} into frame {}", page_id, frame_id);
        Ok((page_id, pod))
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> StorageResult<()> {
        let frame_id = *self.page_table[shard_of(&page_id)]
            .lock()
            .unwrap()
            .get(&page_id)
            .ok_or(StorageError::FileNotOpen(page_id.to_string()))?;
        let pod = self.frames[frame_id as usize].clone();
        let mut frame = pod.wl();
        if frame.pin_count == 0 {
            return Err(StorageError::internal(format!(
                "unpin on already-unpinned page {}",
                page_id
            )));
        }
        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        Ok(())
    }

    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let frame_id = *self.page_table[shard_of(&page_id)]
            .lock()
            .unwrap()
            .get(&page_id)
            .ok_or(StorageError::FileNotOpen(page_id.to_string()))?;
        let pod = self.frames[frame_id as usize].clone();
        let mut frame = pod.wl();
        self.disk
            .write_page(frame.page_id.fd, frame.page_id.page_no, &frame.data)?;
        frame.is_dirty = false;
        Ok(())
    }

    pub fn flush_all_pages(&self, fd: i32) -> StorageResult<()> {
        for pod in &self.frames {
            let mut frame = pod.wl();
            if frame.page_id.fd == fd && frame.page_id.is_valid() && frame.is_dirty {
                self.disk
                    .write_page(frame.page_id.fd, frame.page_id.page_no, &frame.data)?;
                frame.is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let shard = &self.page_table[shard_of(&page_id)];
        let frame_id = match shard.lock().unwrap().get(&page_id).copied() {
            Some(f) => f,
            None => return Ok(true),
        };
        let pod = self.frames[frame_id as usize].clone();
        let mut frame = pod.wl();
        if frame.pin_count > 0 {
            return Ok(false);
        }
        if frame.is_dirty {
            self.disk
                .write_page(frame.page_id.fd, frame.page_id.page_no, &frame.data)?;
        }
        self.disk.deallocate_page(page_id.fd, page_id.page_no)?;
        shard.lock().unwrap().remove(&page_id);
        frame.reset();
        drop(frame);
        self.replacer.pin(frame_id); // ensure not left dangling in replacer
        self.free_list.lock().unwrap().push_back(frame_id);
        Ok(true)
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().unwrap().len() + self.replacer.size()
    }
}
