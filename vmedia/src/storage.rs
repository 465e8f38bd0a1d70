use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{MediaError, Result};

/// Block-storage contract consumed by a session.
///
/// One handle per virtual file: sequential reads advance an internal seek
/// pointer, writes always append. Methods take `&self` so a live writer
/// and a live reader can share the handle; implementations synchronize
/// internally.
pub trait VirtualFile: Send + Sync {
    /// Read up to `buf.len()` bytes at the current seek pointer.
    /// Returns `Ok(0)` at end of file.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Move the read seek pointer to an absolute byte offset.
    fn change_seek_pointer(&self, offset: i64) -> Result<()>;

    /// Append bytes to the end of the file, returning the number written.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Current file size in bytes.
    fn file_size(&self) -> i64;

    /// Replace the side-channel metadata blob, stored outside the chunk
    /// stream.
    fn update_optional_data(&self, data: &[u8]) -> Result<()>;

    /// Read back the side-channel metadata blob. Empty if never written.
    fn optional_data(&self) -> Result<Vec<u8>>;

    /// Release the handle.
    fn close(&self) -> Result<()>;
}

/// Provider of virtual files, keyed by file ID.
pub trait FileSystem: Send + Sync {
    fn new_virtual_file(&self, id: u32, name: &str) -> Result<std::sync::Arc<dyn VirtualFile>>;

    fn open_virtual_file(&self, id: u32) -> Result<std::sync::Arc<dyn VirtualFile>>;

    /// Fixed block size of the underlying storage, in bytes. Drives the
    /// scanner's read-ahead granularity and the seek safety margin.
    fn block_size(&self) -> u32;

    fn close(&self) -> Result<()>;
}

struct MemInner {
    data: Vec<u8>,
    pos: usize,
    meta: Vec<u8>,
}

/// In-memory virtual file, used by unit tests and fixtures.
pub struct MemFile {
    inner: Mutex<MemInner>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::with_data(Vec::new())
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        MemFile {
            inner: Mutex::new(MemInner {
                data,
                pos: 0,
                meta: Vec::new(),
            }),
        }
    }

    /// Snapshot of the full backing store.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.inner).data.clone()
    }
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFile for MemFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        let remaining = inner.data.len().saturating_sub(inner.pos);
        let n = remaining.min(buf.len());
        let pos = inner.pos;
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        inner.pos += n;
        Ok(n)
    }

    fn change_seek_pointer(&self, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(MediaError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "negative seek offset",
            )));
        }
        lock(&self.inner).pos = offset as usize;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        lock(&self.inner).data.extend_from_slice(data);
        Ok(data.len())
    }

    fn file_size(&self) -> i64 {
        lock(&self.inner).data.len() as i64
    }

    fn update_optional_data(&self, data: &[u8]) -> Result<()> {
        lock(&self.inner).meta = data.to_vec();
        Ok(())
    }

    fn optional_data(&self) -> Result<Vec<u8>> {
        Ok(lock(&self.inner).meta.clone())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct BlockInner {
    file: File,
    read_pos: u64,
}

/// Plain-file implementation of [`VirtualFile`].
///
/// The chunk stream lives in the data file; the side-channel metadata
/// blob lives in a `.info` sidecar next to it.
pub struct BlockFile {
    inner: Mutex<BlockInner>,
    info_path: PathBuf,
    writable: bool,
}

impl BlockFile {
    /// Create a new data file; fails if one already exists at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::wrap(file, path, true))
    }

    /// Open an existing data file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::wrap(file, path, false))
    }

    fn wrap(file: File, path: &Path, writable: bool) -> Self {
        let mut info_path = path.as_os_str().to_owned();
        info_path.push(".info");
        BlockFile {
            inner: Mutex::new(BlockInner { file, read_pos: 0 }),
            info_path: PathBuf::from(info_path),
            writable,
        }
    }
}

impl VirtualFile for BlockFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        let pos = inner.read_pos;
        inner.file.seek(SeekFrom::Start(pos))?;
        let n = inner.file.read(buf)?;
        inner.read_pos += n as u64;
        Ok(n)
    }

    fn change_seek_pointer(&self, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(MediaError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "negative seek offset",
            )));
        }
        lock(&self.inner).read_pos = offset as u64;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(data)?;
        Ok(data.len())
    }

    fn file_size(&self) -> i64 {
        lock(&self.inner)
            .file
            .metadata()
            .map(|m| m.len() as i64)
            .unwrap_or(0)
    }

    fn update_optional_data(&self, data: &[u8]) -> Result<()> {
        std::fs::write(&self.info_path, data)?;
        Ok(())
    }

    fn optional_data(&self) -> Result<Vec<u8>> {
        match std::fs::read(&self.info_path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(MediaError::Io(e)),
        }
    }

    fn close(&self) -> Result<()> {
        if self.writable {
            lock(&self.inner).file.sync_all()?;
        }
        Ok(())
    }
}

/// Directory-backed [`FileSystem`]: one data file (plus `.info` sidecar)
/// per virtual file ID.
pub struct BlockFileSystem {
    dir: PathBuf,
    block_size: u32,
}

impl BlockFileSystem {
    pub fn new(dir: impl Into<PathBuf>, block_size: u32) -> Self {
        BlockFileSystem {
            dir: dir.into(),
            block_size,
        }
    }

    fn data_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("vf_{id:08}.vmf"))
    }
}

impl FileSystem for BlockFileSystem {
    fn new_virtual_file(&self, id: u32, _name: &str) -> Result<std::sync::Arc<dyn VirtualFile>> {
        Ok(std::sync::Arc::new(BlockFile::create(&self.data_path(id))?))
    }

    fn open_virtual_file(&self, id: u32) -> Result<std::sync::Arc<dyn VirtualFile>> {
        match BlockFile::open(&self.data_path(id)) {
            Ok(file) => Ok(std::sync::Arc::new(file)),
            Err(MediaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MediaError::NotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Lock a mutex, absorbing poisoning: the guarded state stays usable
/// even if another caller panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_file_sequential_read() {
        let file = MemFile::with_data(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mem_file_seek_and_append() {
        let file = MemFile::new();
        assert_eq!(file.write(&[9, 8, 7]).unwrap(), 3);
        assert_eq!(file.file_size(), 3);
        file.change_seek_pointer(1).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [8, 7]);
    }

    #[test]
    fn test_mem_file_optional_data() {
        let file = MemFile::new();
        assert!(file.optional_data().unwrap().is_empty());
        file.update_optional_data(&[1, 2]).unwrap();
        assert_eq!(file.optional_data().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_block_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media.vmf");

        let file = BlockFile::create(&path).unwrap();
        file.write(&[1, 2, 3]).unwrap();
        file.write(&[4, 5]).unwrap();
        file.update_optional_data(&[0xaa]).unwrap();
        assert_eq!(file.file_size(), 5);
        file.close().unwrap();

        let reopened = BlockFile::open(&path).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reopened.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
        reopened.change_seek_pointer(3).unwrap();
        assert_eq!(reopened.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(reopened.optional_data().unwrap(), vec![0xaa]);
    }

    #[test]
    fn test_block_file_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media.vmf");
        BlockFile::create(&path).unwrap();
        assert!(BlockFile::create(&path).is_err());
    }

    #[test]
    fn test_block_filesystem_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fs = BlockFileSystem::new(dir.path(), 4096);
        assert!(matches!(
            fs.open_virtual_file(42),
            Err(MediaError::NotFound(42))
        ));
    }
}
