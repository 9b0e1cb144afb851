use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicI32, Ordering as AtomicOrdering},
    sync::{Mutex, RwLock},
};

use log::debug;

use crate::{
    config::PAGE_SIZE,
    error::{StorageError, StorageResult},
};

struct OpenFile {
    handle: Mutex<File>,
    next_page_no: AtomicI32,
    log_handle: Mutex<File>,
}

/// Owns every open file's handle and hands out fixed-size page reads/writes
/// plus an append-only log per file, the way the C++ `DiskManager` does.
/// Page numbers for a given fd are allocated monotonically and never
/// reused, even across `deallocate_page`, keeping stale `PageId`s in flight
/// elsewhere detectably wrong instead of silently aliased.
pub struct DiskManager {
    files: RwLock<HashMap<i32, OpenFile>>,
    paths: RwLock<HashMap<i32, PathBuf>>,
    next_fd: AtomicI32,
}

impl DiskManager {
    pub fn new() -> Self {
        DiskManager {
            files: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            next_fd: AtomicI32::new(1),
        }
    }

    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> StorageResult<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StorageError::FileExists(path.display().to_string()));
        }
        File::create(path)?;
        Ok(())
    }

    pub fn destroy_file<P: AsRef<Path>>(&self, path: P) -> StorageResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> StorageResult<i32> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let handle = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = handle.metadata()?.len();
        let next_page_no = (file_len / PAGE_SIZE as u64) as i32;

        let log_path = log_path_for(path);
        let log_handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .append(false)
            .open(&log_path)?;

        let fd = self.next_fd.fetch_add(1, AtomicOrdering::SeqCst);
        debug!("opened {} as fd {}", path.display(), fd);
        self.files.write().unwrap().insert(
            fd,
            OpenFile {
                handle: Mutex::new(handle),
                next_page_no: AtomicI32::new(next_page_no),
                log_handle: Mutex::new(log_handle),
            },
        );
        self.paths.write().unwrap().insert(fd, path.to_path_buf());
        Ok(fd)
    }

    pub fn close_file(&self, fd: i32) -> StorageResult<()> {
        let removed = self.files.write().unwrap().remove(&fd);
        self.paths.write().unwrap().remove(&fd);
        match removed {
            Some(_) => Ok(()),
            None => Err(StorageError::FileNotOpen(fd.to_string())),
        }
    }

    pub fn allocate_page(&self, fd: i32) -> StorageResult<i32> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let page_no = f.next_page_no.fetch_add(1, AtomicOrdering::SeqCst);
        let mut handle = f.handle.lock().unwrap();
        handle.set_len((page_no as u64 + 1) * PAGE_SIZE as u64)?;
        Ok(page_no)
    }

    /// Returns the buffer pool's view of "no victim needed to grow the
    /// file"; deallocation itself is a no-op on disk (the freed page number
    /// is never reused), matching the spec's note that reuse is a future
    /// extension, not a correctness requirement today.
    pub fn deallocate_page(&self, _fd: i32, _page_no: i32) -> StorageResult<()> {
        Ok(())
    }

    pub fn read_page(&self, fd: i32, page_no: i32, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let mut handle = f.handle.lock().unwrap();
        handle.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        handle.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&self, fd: i32, page_no: i32, buf: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let mut handle = f.handle.lock().unwrap();
        handle.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        handle.write_all(buf)?;
        handle.flush()?;
        Ok(())
    }

    /// Appends a record to the fd's companion `.log` file and returns the
    /// byte offset it was written at, for later `read_log`. Out of scope's
    /// transaction manager is the only intended caller; this crate itself
    /// never appends anything.
    pub fn append_log(&self, fd: i32, record: &[u8]) -> StorageResult<u64> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let mut handle = f.log_handle.lock().unwrap();
        let offset = handle.seek(SeekFrom::End(0))?;
        handle.write_all(&(record.len() as u32).to_be_bytes())?;
        handle.write_all(record)?;
        handle.flush()?;
        Ok(offset)
    }

    pub fn read_log(&self, fd: i32, offset: u64) -> StorageResult<Vec<u8>> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let mut handle = f.log_handle.lock().unwrap();
        handle.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        handle.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut record = vec![0u8; len];
        handle.read_exact(&mut record)?;
        Ok(record)
    }

    pub fn rotate_log(&self, fd: i32) -> StorageResult<()> {
        let path = self
            .paths
            .read()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let files = self.files.read().unwrap();
        let f = files.get(&fd).unwrap();
        let mut handle = f.log_handle.lock().unwrap();
        *handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path_for(&path))?;
        Ok(())
    }

    pub fn file_size(&self, fd: i32) -> StorageResult<u64> {
        let files = self.files.read().unwrap();
        let f = files
            .get(&fd)
            .ok_or_else(|| StorageError::FileNotOpen(fd.to_string()))?;
        let size = f.handle.lock().unwrap().metadata()?.len();
        Ok(size)
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

fn log_path_for(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let ext = p
        .extension()
        .map(|e| format!("{}.log", e.to_string_lossy()))
        .unwrap_or_else(|| "log".to_string());
    p.set_extension(ext);
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "storage_core_disk_{}_{:?}",
            name,
            std::thread::current().id()
        ));
        p
    }

    #[test]
    fn create_open_read_write_roundtrip() {
        let dm = DiskManager::new();
        let path = temp_path("rw");
        let _ = dm.destroy_file(&path);
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();
        let page_no = dm.allocate_page(fd).unwrap();
        assert_eq!(page_no, 0);

        let mut buf = [7u8; PAGE_SIZE];
        dm.write_page(fd, page_no, &buf).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(fd, page_no, &mut out).unwrap();
        assert_eq!(buf, out);
        buf[0] = 9;

        dm.close_file(fd).unwrap();
        dm.destroy_file(&path).unwrap();
    }

    #[test]
    fn create_file_twice_fails() {
        let dm = DiskManager::new();
        let path = temp_path("twice");
        let _ = dm.destroy_file(&path);
        dm.create_file(&path).unwrap();
        assert!(matches!(
            dm.create_file(&path),
            Err(StorageError::FileExists(_))
        ));
        dm.destroy_file(&path).unwrap();
    }

    #[test]
    fn log_append_and_read() {
        let dm = DiskManager::new();
        let path = temp_path("log");
        let _ = dm.destroy_file(&path);
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let off1 = dm.append_log(fd, b"hello").unwrap();
        let off2 = dm.append_log(fd, b"world!").unwrap();
        assert_eq!(dm.read_log(fd, off1).unwrap(), b"hello");
        assert_eq!(dm.read_log(fd, off2).unwrap(), b"world!");

        dm.close_file(fd).unwrap();
        dm.destroy_file(&path).unwrap();
        let _ = fs::remove_file(log_path_for(&path));
    }
}
