//! Free page bookkeeping
//!
//! The freelist tracks every page id available for reallocation plus the
//! ids freed by each transaction that cannot be handed out yet because an
//! older reader may still be looking at them. Pending ids are persisted
//! together with the free ids: after a crash nothing holds them open, so
//! they are effectively free.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::meta::Txid;
use crate::page::{Page, PageFlags, PageMut, Pgid, PAGE_HEADER_SIZE};

/// Largest number of ids a freelist page can describe; the count field is u16.
pub const MAX_FREELIST_IDS: usize = 65535;

/// Tracks free pages and pages pending release by open readers.
#[derive(Debug, Default)]
pub struct Freelist {
    /// All free and available page ids, sorted ascending.
    ids: Vec<Pgid>,
    /// Soon-to-be free page ids keyed by the transaction that freed them.
    pending: HashMap<Txid, Vec<Pgid>>,
    /// Fast membership check over both lists.
    cache: HashSet<Pgid>,
}

impl Freelist {
    /// Returns an empty, initialized freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized size of the freelist page.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE + 8 * self.count()
    }

    /// Total number of tracked ids.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Number of immediately reusable ids.
    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of ids still pinned by their freeing transaction.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// All free and pending ids in one sorted list.
    pub fn all(&self) -> Vec<Pgid> {
        let mut ids: Vec<Pgid> = self.ids.clone();
        for list in self.pending.values() {
            ids.extend_from_slice(list);
        }
        ids.sort_unstable();
        ids
    }

    /// Returns the starting id of a contiguous run of `n` free pages,
    /// or 0 if no such run exists and the caller must grow the file.
    pub fn allocate(&mut self, n: usize) -> Pgid {
        if self.ids.is_empty() {
            return 0;
        }

        let (mut initial, mut previd): (Pgid, Pgid) = (0, 0);
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            _assert!(id > 1, "invalid page allocation: {}", id);

            // Reset the run start if this id is not contiguous.
            if previd == 0 || id - previd != 1 {
                initial = id;
            }

            if (id - initial) + 1 == n as Pgid {
                if i + 1 == n {
                    self.ids.drain(..=i);
                } else {
                    self.ids.drain(i + 1 - n..=i);
                }
                for off in 0..n as Pgid {
                    self.cache.remove(&(initial + off));
                }
                return initial;
            }

            previd = id;
        }
        0
    }

    /// Releases a page and its overflow run under the given transaction.
    /// Panics if any id in the run is already tracked (double free).
    pub fn free(&mut self, txid: Txid, p: &Page<'_>) {
        let start = p.id();
        _assert!(start > 1, "cannot free page 0 or 1: {}", start);

        let ids = self.pending.entry(txid).or_default();
        for id in start..=start + p.overflow() as Pgid {
            _assert!(!self.cache.contains(&id), "page {} already freed", id);
            ids.push(id);
            self.cache.insert(id);
        }
    }

    /// Moves every pending id freed at or before `txid` into the free list.
    pub fn release(&mut self, txid: Txid) {
        let mut released: Vec<Pgid> = Vec::new();
        self.pending.retain(|tid, ids| {
            if *tid <= txid {
                released.extend_from_slice(ids);
                false
            } else {
                true
            }
        });
        released.sort_unstable();
        // Cache membership is unchanged: the pages stay free either way.
        self.ids = merge(&self.ids, &released);
    }

    /// Drops the pending list of an aborted transaction.
    pub fn rollback(&mut self, txid: Txid) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Whether the given id is tracked as free or pending.
    pub fn freed(&self, pgid: Pgid) -> bool {
        self.cache.contains(&pgid)
    }

    /// Initializes the freelist from a freelist page.
    pub fn read(&mut self, p: &Page<'_>) {
        let count = p.count();
        let b = p.payload();
        self.ids = (0..count)
            .map(|i| {
                let mut x = [0u8; 8];
                x.copy_from_slice(&b[i * 8..i * 8 + 8]);
                u64::from_le_bytes(x)
            })
            .collect();
        self.ids.sort_unstable();
        self.pending.clear();
        self.build_cache();
    }

    /// Serializes every free and pending id onto a freelist page.
    ///
    /// Pending ids are persisted too: in the event of a crash they all
    /// become free. Fails once the id count no longer fits the count field.
    pub fn write(&self, p: &mut PageMut<'_>) -> Result<()> {
        let ids = self.all();
        if ids.len() >= MAX_FREELIST_IDS {
            return Err(Error::FreelistOverflow);
        }

        p.set_flags(PageFlags::FREELIST);
        p.set_count(ids.len() as u16);
        for (i, id) in ids.iter().enumerate() {
            p.put_u64(PAGE_HEADER_SIZE + i * 8, *id);
        }
        Ok(())
    }

    /// Reads the freelist from a page, filtering out ids that are still
    /// pending in memory so a warm restart does not list them twice.
    pub fn reload(&mut self, p: &Page<'_>) {
        let pending: HashMap<Txid, Vec<Pgid>> = self.pending.drain().collect();

        self.read(p);

        let pending_set: HashSet<Pgid> =
            pending.values().flat_map(|ids| ids.iter().copied()).collect();
        self.ids.retain(|id| !pending_set.contains(id));

        self.pending = pending;
        self.build_cache();
    }

    /// Rebuilds the cache from the free and pending lists.
    fn build_cache(&mut self) {
        self.cache = self.ids.iter().copied().collect();
        for ids in self.pending.values() {
            self.cache.extend(ids.iter().copied());
        }
    }
}

/// Merges two sorted id lists into one sorted list.
pub fn merge(a: &[Pgid], b: &[Pgid]) -> Vec<Pgid> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
