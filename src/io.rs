//! Filesystem abstraction
//!
//! The database never talks to the OS directly; it goes through the
//! `Vfs`/`VfsFile` traits. Production uses `OsVfs` (real files plus a
//! read-only mmap). Tests install `MemVfs`, an in-memory implementation
//! whose every operation can be told to fail once, which is how the
//! open-path error handling is exercised without touching a disk.

use memmap2::MmapOptions;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file opened through a [`Vfs`].
pub trait VfsFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes at the offset.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    /// Writes all of `buf` at the offset.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// Current file length.
    fn len(&self) -> io::Result<u64>;
    /// Resizes the file.
    fn truncate(&self, len: u64) -> io::Result<()>;
    /// Flushes file contents and metadata to stable storage.
    fn sync(&self) -> io::Result<()>;
    /// Maps `len` bytes of the file read-only. The mapping stays valid
    /// for as long as the returned region is alive, independently of
    /// later remaps.
    fn map(&self, len: usize) -> io::Result<MapRegion>;
}

/// Filesystem entry points the engine needs.
pub trait Vfs: Send + Sync {
    /// Opens (creating if absent) the file read-write with the given unix
    /// mode. When `sync` is set the handle must write through (O_SYNC).
    fn open(&self, path: &Path, mode: u32, sync: bool) -> io::Result<Box<dyn VfsFile>>;
    /// OS page size.
    fn page_size(&self) -> usize;
}

/// A read-only mapped region of a file.
pub struct MapRegion {
    inner: RegionInner,
}

enum RegionInner {
    Os(memmap2::Mmap),
    Mem(Box<[u8]>),
}

impl Deref for MapRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            RegionInner::Os(m) => m,
            RegionInner::Mem(b) => b,
        }
    }
}

impl MapRegion {
    /// Wraps an in-memory buffer as a region (fake backends).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { inner: RegionInner::Mem(bytes.into_boxed_slice()) }
    }
}

/// Production filesystem: std files, unix modes, memmap2 mappings.
#[derive(Debug, Default)]
pub struct OsVfs;

impl Vfs for OsVfs {
    fn open(&self, path: &Path, mode: u32, sync: bool) -> io::Result<Box<dyn VfsFile>> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
            if sync {
                opts.custom_flags(libc::O_SYNC);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (mode, sync);
        }
        Ok(Box::new(OsFile { file: opts.open(path)? }))
    }

    fn page_size(&self) -> usize {
        #[cfg(unix)]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                return sz as usize;
            }
        }
        4096
    }
}

struct OsFile {
    file: std::fs::File,
}

impl VfsFile for OsFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            let _ = (buf, offset);
            Err(io::Error::new(io::ErrorKind::Unsupported, "read_at unsupported"))
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            let _ = (buf, offset);
            Err(io::Error::new(io::ErrorKind::Unsupported, "write_at unsupported"))
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn map(&self, len: usize) -> io::Result<MapRegion> {
        let mmap = unsafe { MmapOptions::new().len(len).map(&self.file)? };
        Ok(MapRegion { inner: RegionInner::Os(mmap) })
    }
}

type Faults = Arc<Mutex<HashMap<&'static str, io::Error>>>;

/// In-memory filesystem with one-shot fault injection, for tests.
///
/// `fail(op, err)` arms a fault that fires on the next call of that
/// operation: `"open"`, `"open_sync"`, `"read_at"`, `"write_at"`,
/// `"stat"`, `"truncate"`, `"sync"` or `"mmap"`.
pub struct MemVfs {
    files: Mutex<HashMap<PathBuf, Arc<MemFileData>>>,
    faults: Faults,
    page_size: usize,
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct MemFileData {
    bytes: Mutex<Vec<u8>>,
}

impl MemVfs {
    /// Creates an empty in-memory filesystem with 4 KiB pages.
    pub fn new() -> Self {
        Self { files: Mutex::new(HashMap::new()), faults: Faults::default(), page_size: 4096 }
    }

    /// Overrides the reported OS page size.
    pub fn with_page_size(page_size: usize) -> Self {
        Self { page_size, ..Self::new() }
    }

    /// Arms a one-shot fault for the named operation.
    pub fn fail(&self, op: &'static str, err: io::Error) {
        self.faults.lock().insert(op, err);
    }

    /// Current contents of a file, if it exists.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(path.as_ref()).map(|f| f.bytes.lock().clone())
    }

    /// Replaces (creating if needed) the contents of a file.
    pub fn set_contents(&self, path: impl AsRef<Path>, bytes: Vec<u8>) {
        let mut files = self.files.lock();
        let data = files.entry(path.as_ref().to_path_buf()).or_default();
        *data.bytes.lock() = bytes;
    }

    fn take_fault(faults: &Faults, op: &'static str) -> Option<io::Error> {
        faults.lock().remove(op)
    }
}

impl Vfs for MemVfs {
    fn open(&self, path: &Path, _mode: u32, sync: bool) -> io::Result<Box<dyn VfsFile>> {
        let op = if sync { "open_sync" } else { "open" };
        if let Some(err) = Self::take_fault(&self.faults, op) {
            return Err(err);
        }
        let mut files = self.files.lock();
        let data = Arc::clone(files.entry(path.to_path_buf()).or_default());
        Ok(Box::new(MemFile { data, faults: Arc::clone(&self.faults) }))
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

struct MemFile {
    data: Arc<MemFileData>,
    faults: Faults,
}

impl VfsFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "read_at") {
            return Err(err);
        }
        let bytes = self.data.bytes.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file"));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "write_at") {
            return Err(err);
        }
        let mut bytes = self.data.bytes.lock();
        let end = offset as usize + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "stat") {
            return Err(err);
        }
        Ok(self.data.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "truncate") {
            return Err(err);
        }
        self.data.bytes.lock().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "sync") {
            return Err(err);
        }
        Ok(())
    }

    fn map(&self, len: usize) -> io::Result<MapRegion> {
        if let Some(err) = MemVfs::take_fault(&self.faults, "mmap") {
            return Err(err);
        }
        let mut snapshot = self.data.bytes.lock().clone();
        snapshot.resize(len, 0);
        Ok(MapRegion::from_bytes(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memvfs_write_read() {
        let vfs = MemVfs::new();
        let f = vfs.open(Path::new("/x"), 0o666, false).unwrap();
        f.write_at(b"hello", 3).unwrap();
        assert_eq!(f.len().unwrap(), 8);

        let mut buf = [0u8; 5];
        f.read_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_memvfs_fault_fires_once() {
        let vfs = MemVfs::new();
        let f = vfs.open(Path::new("/x"), 0o666, false).unwrap();
        vfs.fail("write_at", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(f.write_at(b"a", 0).is_err());
        assert!(f.write_at(b"a", 0).is_ok());
    }

    #[test]
    fn test_memvfs_map_is_snapshot() {
        let vfs = MemVfs::new();
        let f = vfs.open(Path::new("/x"), 0o666, false).unwrap();
        f.write_at(&[7u8; 16], 0).unwrap();
        let map = f.map(32).unwrap();
        assert_eq!(map.len(), 32);
        assert_eq!(map[0], 7);
        assert_eq!(map[16], 0);
    }
}
