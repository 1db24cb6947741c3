//! Database lifecycle and file management
//!
//! The `Db` owns the data file, a second O_SYNC handle used only for
//! meta writes, and the read-only map of the file. Opening an empty file
//! writes four pages: both meta slots, an empty freelist and an empty
//! buckets directory. The map is sized by a doubling schedule and grows
//! in 1 GiB steps past 1 GiB; when a writer outgrows it, the file is
//! truncated to the next mapped size and remapped while readers keep
//! their own pinned regions.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::buckets::Buckets;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::io::{MapRegion, OsVfs, Vfs, VfsFile};
use crate::meta::{Meta, Txid, MAGIC, VERSION};
use crate::page::{Page, PageFlags, PageMut, Pgid};
use crate::txn::{RwTransaction, Transaction};

/// Smallest map size: files below this are mapped at this size.
pub const MIN_MMAP_SIZE: usize = 1 << 22;

/// Past this size the map grows linearly instead of doubling.
pub const MAX_MMAP_STEP: usize = 1 << 30;

/// Largest supported map.
pub const MAX_MAP_SIZE: usize = 0xFFFF_FFFF_FFFF;

/// An open (or openable) database over a single file.
pub struct Db {
    vfs: Arc<dyn Vfs>,
    io: RwLock<Option<DbIo>>,
    /// Writer mutex; the freelist is only touched while holding it.
    writer: Mutex<Freelist>,
    /// Transaction ids of the active readers.
    readers: Mutex<Vec<Txid>>,
}

struct DbIo {
    path: PathBuf,
    file: Box<dyn VfsFile>,
    /// O_SYNC handle used only for meta-page writes.
    metafile: Box<dyn VfsFile>,
    page_size: usize,
    mmap: Arc<MapRegion>,
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    /// Creates a closed database using the real filesystem.
    pub fn new() -> Self {
        Self::with_vfs(Arc::new(OsVfs))
    }

    /// Creates a closed database over an injected filesystem.
    pub fn with_vfs(vfs: Arc<dyn Vfs>) -> Self {
        Self {
            vfs,
            io: RwLock::new(None),
            writer: Mutex::new(Freelist::new()),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Opens the database file, creating and initializing it if absent.
    pub fn open(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut freelist = self.writer.lock();
        let mut io = self.io.write();
        if io.is_some() {
            return Err(Error::DatabaseOpen);
        }

        let file = self.vfs.open(&path, mode, false)?;
        let metafile = self.vfs.open(&path, mode, true)?;
        let page_size = self.vfs.page_size();

        // A brand new file gets its four bootstrap pages.
        let size = file.len().map_err(Error::Stat)?;
        if size == 0 {
            Self::init(&*metafile, page_size)?;
            debug!(path = %path.display(), page_size, "initialized new database");
        }

        let size = file.len().map_err(Error::Stat)? as usize;
        if size < page_size * 4 {
            return Err(Error::FileTooSmall);
        }

        // Map the file, first growing it to the mapped size.
        let msz = mmap_size(page_size, size);
        file.truncate(msz as u64).map_err(Error::Truncate)?;
        let mmap = Arc::new(file.map(msz).map_err(Error::Mmap)?);

        // At least one meta page must be intact.
        let meta = winner_meta(&mmap, page_size).map_err(|e| Error::Meta(Box::new(e)))?;
        *freelist = Freelist::new();
        freelist.read(&page_at(&mmap, page_size, meta.freelist));

        debug!(path = %path.display(), txid = meta.txid, pgid_high = meta.pgid_high, "open");
        *io = Some(DbIo { path, file, metafile, page_size, mmap });
        Ok(())
    }

    /// Writes the two meta pages, an empty freelist and an empty buckets
    /// directory through the O_SYNC handle.
    fn init(metafile: &dyn VfsFile, page_size: usize) -> Result<()> {
        let mut buf = vec![0u8; page_size * 4];
        for slot in 0..2u64 {
            let mut p = PageMut::new(&mut buf[slot as usize * page_size..]);
            p.set_id(slot);
            let mut m = Meta {
                magic: MAGIC,
                version: VERSION,
                page_size: page_size as u32,
                flags: 0,
                buckets: 3,
                freelist: 2,
                pgid_high: 3,
                txid: slot,
                checksum: 0,
            };
            m.write(&mut p);
        }
        {
            let mut p = PageMut::new(&mut buf[2 * page_size..]);
            p.set_id(2);
            p.set_flags(PageFlags::FREELIST);
        }
        {
            let mut p = PageMut::new(&mut buf[3 * page_size..]);
            p.set_id(3);
            Buckets::new().write(&mut p);
        }
        metafile.write_at(&buf, 0)?;
        metafile.sync()?;
        Ok(())
    }

    /// Unmaps and closes the file. Open transactions keep their pinned
    /// regions; new ones fail with DatabaseNotOpen.
    pub fn close(&self) {
        let mut io = self.io.write();
        *io = None;
    }

    /// Whether the database is open.
    pub fn is_open(&self) -> bool {
        self.io.read().is_some()
    }

    /// Path of the open database file.
    pub fn path(&self) -> Option<PathBuf> {
        self.io.read().as_ref().map(|io| io.path.clone())
    }

    /// Begins a read-only snapshot transaction.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::new(self)
    }

    /// Begins the write transaction, blocking until it is the only one.
    pub fn begin_rw(&self) -> Result<RwTransaction<'_>> {
        self.check_open()?;
        RwTransaction::new(self)
    }

    /// Creates a bucket in an ephemeral write transaction.
    pub fn create_bucket(&self, name: &str) -> Result<()> {
        let mut txn = self.begin_rw()?;
        txn.create_bucket(name)?;
        txn.commit()
    }

    /// Names of all buckets, via an ephemeral read transaction.
    pub fn buckets(&self) -> Result<Vec<String>> {
        Ok(self.begin()?.bucket_names())
    }

    /// Reads one key in an ephemeral read transaction.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.begin()?;
        let b = txn.bucket(bucket).ok_or(Error::BucketNotFound)?;
        Ok(b.get(key).map(|v| v.to_vec()))
    }

    /// Writes one key in an ephemeral write transaction.
    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.begin_rw()?;
        txn.put(bucket, key, value)?;
        txn.commit()
    }

    /// Deletes one key in an ephemeral write transaction.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        let mut txn = self.begin_rw()?;
        txn.delete(bucket, key)?;
        txn.commit()
    }

    fn check_open(&self) -> Result<()> {
        if self.io.read().is_some() {
            Ok(())
        } else {
            Err(Error::DatabaseNotOpen)
        }
    }

    /// Pins the current map and the winning meta.
    pub(crate) fn snapshot(&self) -> Result<(Arc<MapRegion>, Meta, usize)> {
        let io = self.io.read();
        let io = io.as_ref().ok_or(Error::DatabaseNotOpen)?;
        let meta = winner_meta(&io.mmap, io.page_size).map_err(|e| Error::Meta(Box::new(e)))?;
        Ok((Arc::clone(&io.mmap), meta, io.page_size))
    }

    /// Grows the file to the next mapped size covering `minsz` and
    /// remaps it. Readers keep the regions they pinned.
    pub(crate) fn grow(&self, minsz: usize) -> Result<Arc<MapRegion>> {
        let mut io = self.io.write();
        let io = io.as_mut().ok_or(Error::DatabaseNotOpen)?;
        let size = mmap_size(io.page_size, minsz);
        io.file.truncate(size as u64).map_err(Error::Truncate)?;
        io.mmap = Arc::new(io.file.map(size).map_err(Error::Mmap)?);
        debug!(bytes = size, "grow mmap");
        Ok(Arc::clone(&io.mmap))
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let io = self.io.read();
        let io = io.as_ref().ok_or(Error::DatabaseNotOpen)?;
        io.file.write_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        let io = self.io.read();
        let io = io.as_ref().ok_or(Error::DatabaseNotOpen)?;
        io.file.sync()?;
        Ok(())
    }

    pub(crate) fn write_meta_page(&self, buf: &[u8], offset: u64) -> Result<()> {
        let io = self.io.read();
        let io = io.as_ref().ok_or(Error::DatabaseNotOpen)?;
        io.metafile.write_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn writer_lock(&self) -> MutexGuard<'_, Freelist> {
        self.writer.lock()
    }

    pub(crate) fn readers_lock(&self) -> MutexGuard<'_, Vec<Txid>> {
        self.readers.lock()
    }

    pub(crate) fn deregister_txid(&self, id: Txid) {
        let mut readers = self.readers.lock();
        if let Some(pos) = readers.iter().position(|&t| t == id) {
            readers.swap_remove(pos);
        }
    }

    /// Highest transaction id whose freed pages nobody can still see.
    pub(crate) fn release_horizon(&self) -> Txid {
        let readers = self.readers.lock();
        readers.iter().min().copied().unwrap_or(Txid::MAX).saturating_sub(1)
    }
}

/// View of the page starting at `id` within a mapped region.
pub(crate) fn page_at<'a>(buf: &'a [u8], page_size: usize, id: Pgid) -> Page<'a> {
    Page::new(&buf[id as usize * page_size..])
}

/// Picks the valid meta with the higher transaction id.
pub(crate) fn winner_meta(buf: &[u8], page_size: usize) -> Result<Meta> {
    let m0 = Meta::read(&page_at(buf, page_size, 0));
    let m1 = Meta::read(&page_at(buf, page_size, 1));
    match (m0.validate(), m1.validate()) {
        (Ok(()), Ok(())) => Ok(if m0.txid >= m1.txid { m0 } else { m1 }),
        (Ok(()), Err(_)) => Ok(m0),
        (Err(_), Ok(())) => Ok(m1),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Map size for a file of `size` bytes: at least [`MIN_MMAP_SIZE`],
/// doubling below [`MAX_MMAP_STEP`] and stepping by it beyond, always
/// rounded up to a page multiple.
pub(crate) fn mmap_size(page_size: usize, size: usize) -> usize {
    if size < MIN_MMAP_SIZE {
        return MIN_MMAP_SIZE;
    }
    let mut size = if size < MAX_MMAP_STEP { size * 2 } else { size + MAX_MMAP_STEP };
    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }
    if size > MAX_MAP_SIZE {
        size = MAX_MAP_SIZE;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmap_size_schedule() {
        let ps = 4096;
        assert_eq!(mmap_size(ps, 0), MIN_MMAP_SIZE);
        assert_eq!(mmap_size(ps, 16384), MIN_MMAP_SIZE);
        assert_eq!(mmap_size(ps, MIN_MMAP_SIZE - 1), MIN_MMAP_SIZE);
        assert_eq!(mmap_size(ps, MIN_MMAP_SIZE), MIN_MMAP_SIZE * 2);
        assert_eq!(mmap_size(ps, 10_000_000), 20_000_768);
        assert_eq!(mmap_size(ps, (1 << 30) - 1), 1 << 31);
        assert_eq!(mmap_size(ps, 1 << 30), 1 << 31);
    }

    #[test]
    fn test_mmap_size_monotone_and_page_aligned() {
        let ps = 4096;
        let mut prev = 0;
        for size in [0usize, 1, 4095, 4096, 1 << 20, 1 << 22, 1 << 25, 1 << 29, 1 << 30] {
            let m = mmap_size(ps, size);
            assert!(m >= prev, "mmap_size not monotone at {size}");
            assert_eq!(m % ps, 0, "mmap_size not page aligned at {size}");
            assert!(m >= size);
            prev = m;
        }
    }

    #[test]
    fn test_winner_meta_picks_higher_txid() {
        let ps = 4096;
        let mut buf = vec![0u8; ps * 2];
        for (slot, txid) in [(0usize, 8u64), (1, 9)] {
            let mut p = PageMut::new(&mut buf[slot * ps..]);
            p.set_id(slot as u64);
            let mut m = Meta {
                magic: MAGIC,
                version: VERSION,
                page_size: ps as u32,
                flags: 0,
                buckets: 3,
                freelist: 2,
                pgid_high: 3,
                txid,
                checksum: 0,
            };
            m.write(&mut p);
        }
        assert_eq!(winner_meta(&buf, ps).unwrap().txid, 9);

        // Corrupting the winner's magic falls back to the other copy.
        buf[ps + 16] ^= 0xff;
        assert_eq!(winner_meta(&buf, ps).unwrap().txid, 8);

        // Corrupting both is fatal.
        buf[16] ^= 0xff;
        assert!(matches!(winner_meta(&buf, ps), Err(Error::Invalid)));
    }
}
