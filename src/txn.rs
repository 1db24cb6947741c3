//! Transactions
//!
//! A read transaction pins the winning meta page, the buckets directory
//! and the current map; everything it can reach stays immutable until it
//! closes, because writers only ever produce new pages. A write
//! transaction additionally owns the writer mutex (and with it the
//! freelist), a node arena holding the copy-on-write shadows of every
//! page it touched, and the dirty page buffers produced at commit.

use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::buckets::{BucketDef, Buckets};
use crate::cursor::{Cursor, ElemRef, TreeSource};
use crate::db::{page_at, Db};
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::io::MapRegion;
use crate::meta::{Meta, Txid};
use crate::node::{inodes_size, write_inodes, Inode, Node, NodeId};
use crate::page::{Page, PageFlags, PageMut, Pgid};

/// Read-only snapshot of the database.
///
/// Close transactions promptly: the writer cannot reclaim any page that
/// an open reader might still see, so a long-lived reader makes the file
/// grow.
pub struct Transaction<'db> {
    db: &'db Db,
    mmap: Arc<MapRegion>,
    meta: Meta,
    buckets: Buckets,
    page_size: usize,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Db) -> Result<Self> {
        // Registration happens under the registry lock together with the
        // meta read, so a beginning writer cannot release pages in the
        // window between the two.
        let mut readers = db.readers_lock();
        let (mmap, meta, page_size) = db.snapshot()?;
        readers.push(meta.txid);
        drop(readers);

        let mut buckets = Buckets::new();
        buckets.read(&page_at(&mmap, page_size, meta.buckets));
        Ok(Self { db, mmap, meta, buckets, page_size })
    }

    /// Transaction id (the id of the commit this snapshot shows).
    pub fn id(&self) -> Txid {
        self.meta.txid
    }

    /// Returns a handle for the named bucket, or None if it does not exist.
    pub fn bucket(&self, name: &str) -> Option<Bucket<'_>> {
        let def = *self.buckets.get(name)?;
        Some(Bucket { name: name.to_string(), def, txn: self })
    }

    /// Names of all buckets, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.names()
    }

    /// Handles for all buckets.
    pub fn buckets(&self) -> Vec<Bucket<'_>> {
        self.buckets
            .names()
            .into_iter()
            .filter_map(|name| self.bucket(&name))
            .collect()
    }

    pub(crate) fn page(&self, id: Pgid) -> Page<'_> {
        page_at(&self.mmap, self.page_size, id)
    }

    /// Walks every page reachable from `pgid`, calling `f` with the page
    /// and its depth.
    pub fn for_each_page(&self, pgid: Pgid, depth: usize, f: &mut dyn FnMut(&Page<'_>, usize)) {
        let p = self.page(pgid);
        f(&p, depth);
        if p.flags().contains(PageFlags::BRANCH) {
            for i in 0..p.count() {
                let child = p.branch_element(i).pgid();
                self.for_each_page(child, depth + 1, f);
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.db.deregister_txid(self.meta.txid);
    }
}

impl TreeSource for Transaction<'_> {
    fn source_page(&self, id: Pgid) -> Page<'_> {
        self.page(id)
    }

    fn source_node(&self, _id: Pgid) -> Option<&Node> {
        None
    }
}

/// Read handle over one named bucket.
pub struct Bucket<'tx> {
    name: String,
    def: BucketDef,
    txn: &'tx Transaction<'tx>,
}

impl<'tx> Bucket<'tx> {
    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root page of the bucket's tree (0 while the bucket is empty).
    pub fn root(&self) -> Pgid {
        self.def.root
    }

    /// Returns the value for a key, or None if the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&'tx [u8]> {
        let mut c = self.cursor();
        let (k, v) = c.seek(key)?;
        (k == key).then_some(v)
    }

    /// Cursor over the bucket in key order.
    pub fn cursor(&self) -> Cursor<'tx, Transaction<'tx>> {
        Cursor::new(self.txn, self.def.root)
    }
}

/// Read-write transaction. Only one exists at a time; creating it blocks
/// on the writer mutex.
pub struct RwTransaction<'db> {
    db: &'db Db,
    mmap: Arc<MapRegion>,
    page_size: usize,
    meta: Meta,
    buckets: Buckets,
    freelist: MutexGuard<'db, Freelist>,
    /// Copy-on-write shadows of every page this transaction touched.
    nodes: Vec<Node>,
    by_pgid: HashMap<Pgid, NodeId>,
    /// Root node of each touched bucket.
    roots: HashMap<String, NodeId>,
    /// Dirty page buffers keyed by their new page id.
    pages: HashMap<Pgid, Vec<u8>>,
    done: bool,
}

impl<'db> RwTransaction<'db> {
    pub(crate) fn new(db: &'db Db) -> Result<Self> {
        let mut freelist = db.writer_lock();
        let (mmap, mut meta, page_size) = db.snapshot()?;

        // Pages freed by transactions that no active reader can still
        // see become allocatable now.
        freelist.release(db.release_horizon());

        meta.txid += 1;
        let mut buckets = Buckets::new();
        buckets.read(&page_at(&mmap, page_size, meta.buckets));

        Ok(Self {
            db,
            mmap,
            page_size,
            meta,
            buckets,
            freelist,
            nodes: Vec::new(),
            by_pgid: HashMap::new(),
            roots: HashMap::new(),
            pages: HashMap::new(),
            done: false,
        })
    }

    /// Transaction id this commit will carry.
    pub fn id(&self) -> Txid {
        self.meta.txid
    }

    /// Names of all buckets, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.names()
    }

    /// Creates a bucket. The directory page is rewritten at commit.
    pub fn create_bucket(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::KeyRequired);
        }
        if self.buckets.get(name).is_some() {
            return Err(Error::BucketExists);
        }
        self.buckets.put(name, BucketDef { root: 0 });
        debug!(bucket = name, "create bucket");
        Ok(())
    }

    /// Sets the value for a key in a bucket.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        self.buckets.get(bucket).ok_or(Error::BucketNotFound)?;
        let leaf = self.materialize_leaf(bucket, key)?;
        self.nodes[leaf].put(key, key, value, 0, 0);
        Ok(())
    }

    /// Removes a key from a bucket. Missing keys are a no-op.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        let def = *self.buckets.get(bucket).ok_or(Error::BucketNotFound)?;
        if key.is_empty() {
            return Ok(());
        }
        if def.root == 0 && !self.roots.contains_key(bucket) {
            return Ok(());
        }
        let leaf = self.materialize_leaf(bucket, key)?;
        self.nodes[leaf].del(key);
        Ok(())
    }

    /// Returns the value for a key, seeing this transaction's own writes.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<&[u8]>> {
        let def = *self.buckets.get(bucket).ok_or(Error::BucketNotFound)?;
        if let Some(&nid) = self.roots.get(bucket) {
            return Ok(self.node_get(nid, key));
        }
        if def.root == 0 {
            return Ok(None);
        }
        let mut c = Cursor::new(self, def.root);
        Ok(c.seek(key).and_then(|(k, v)| (k == key).then_some(v)))
    }

    /// Cursor over a bucket's last committed tree plus materialized nodes.
    pub fn cursor(&self, bucket: &str) -> Result<Cursor<'_, Self>> {
        let def = self.buckets.get(bucket).ok_or(Error::BucketNotFound)?;
        Ok(Cursor::new(self, def.root))
    }

    /// Commits the transaction: rebalance, spill, rewrite the directory
    /// and freelist, write all dirty pages, then flip the meta.
    pub fn commit(mut self) -> Result<()> {
        let result = self.commit_inner();
        if result.is_err() {
            self.rollback_inner();
        }
        self.done = true;
        result
    }

    /// Abandons the transaction; nothing reaches the file.
    pub fn rollback(mut self) {
        self.rollback_inner();
        self.done = true;
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.rebalance();
        self.spill()?;

        // The directory moves to a fresh page on every commit.
        let old = self.meta.buckets;
        self.free_page(old);
        let count = self.buckets.size() / self.page_size + 1;
        let pgid = self.allocate(count)?;
        let mut buf = vec![0u8; count * self.page_size];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(pgid);
            p.set_overflow((count - 1) as u32);
            self.buckets.write(&mut p);
        }
        self.pages.insert(pgid, buf);
        self.meta.buckets = pgid;

        // Likewise the freelist. Pending ids (this transaction's
        // included) are persisted: after a crash they are simply free.
        let old = self.meta.freelist;
        self.free_page(old);
        let count = self.freelist.size() / self.page_size + 1;
        let pgid = self.allocate(count)?;
        let mut buf = vec![0u8; count * self.page_size];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(pgid);
            p.set_overflow((count - 1) as u32);
            self.freelist.write(&mut p)?;
        }
        self.pages.insert(pgid, buf);
        self.meta.freelist = pgid;

        self.write_pages()?;
        self.write_meta()?;

        debug!(txid = self.meta.txid, dirty = self.pages.len(), "commit");
        Ok(())
    }

    fn rollback_inner(&mut self) {
        self.freelist.rollback(self.meta.txid);
        self.nodes.clear();
        self.by_pgid.clear();
        self.roots.clear();
        self.pages.clear();
    }

    /// Resolves a page id, preferring this transaction's dirty buffers.
    pub(crate) fn page(&self, id: Pgid) -> Page<'_> {
        if let Some(buf) = self.pages.get(&id) {
            return Page::new(buf);
        }
        page_at(&self.mmap, self.page_size, id)
    }

    /// Finds the leaf for `key` and materializes the whole path down to
    /// it as nodes, creating the root leaf for a fresh bucket.
    fn materialize_leaf(&mut self, bucket: &str, key: &[u8]) -> Result<NodeId> {
        let def = *self.buckets.get(bucket).ok_or(Error::BucketNotFound)?;
        if def.root == 0 {
            if let Some(&nid) = self.roots.get(bucket) {
                return Ok(nid);
            }
            let nid = self.nodes.len();
            self.nodes.push(Node { is_leaf: true, ..Default::default() });
            self.roots.insert(bucket.to_string(), nid);
            return Ok(nid);
        }

        let stack: Vec<ElemRef> = {
            let mut c = Cursor::new(&*self, def.root);
            c.seek(key);
            c.stack().to_vec()
        };
        let mut cur = self.node_for(stack[0].pgid, None);
        self.roots.entry(bucket.to_string()).or_insert(cur);
        for elem in &stack[1..] {
            cur = self.node_for(elem.pgid, Some(cur));
        }
        Ok(cur)
    }

    /// Returns the node shadowing a page, materializing it on first use.
    fn node_for(&mut self, pgid: Pgid, parent: Option<NodeId>) -> NodeId {
        if let Some(&nid) = self.by_pgid.get(&pgid) {
            return nid;
        }
        let mut n = Node { parent, ..Default::default() };
        {
            let p = self.page(pgid);
            n.read(&p);
        }
        let nid = self.nodes.len();
        self.nodes.push(n);
        self.by_pgid.insert(pgid, nid);
        nid
    }

    fn node_get(&self, nid: NodeId, key: &[u8]) -> Option<&[u8]> {
        let n = &self.nodes[nid];
        if n.is_leaf {
            return match n.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key)) {
                Ok(i) => Some(n.inodes[i].value.as_slice()),
                Err(_) => None,
            };
        }
        let idx = match n.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let child = n.inodes[idx].pgid;
        if let Some(&cid) = self.by_pgid.get(&child) {
            self.node_get(cid, key)
        } else {
            let mut c = Cursor::new(self, child);
            c.seek(key).and_then(|(k, v)| (k == key).then_some(v))
        }
    }

    /// Adds a page (and its overflow run) to this transaction's pending
    /// frees.
    fn free_page(&mut self, pgid: Pgid) {
        let txid = self.meta.txid;
        let p = page_at(&self.mmap, self.page_size, pgid);
        self.freelist.free(txid, &p);
    }

    /// Hands out `count` contiguous pages, reusing freed pages when
    /// possible and growing the file (and the map) otherwise.
    fn allocate(&mut self, count: usize) -> Result<Pgid> {
        let pgid = self.freelist.allocate(count);
        if pgid != 0 {
            return Ok(pgid);
        }

        let pgid = self.meta.pgid_high + 1;
        self.meta.pgid_high += count as Pgid;
        let minsz = (self.meta.pgid_high as usize + 1) * self.page_size;
        if minsz > self.mmap.len() {
            self.mmap = self.db.grow(minsz)?;
        }
        Ok(pgid)
    }

    /// Runs the merge pass over every node a delete left under-filled.
    fn rebalance(&mut self) {
        for nid in 0..self.nodes.len() {
            if self.nodes[nid].unbalanced {
                self.rebalance_node(nid);
            }
        }
    }

    fn rebalance_node(&mut self, nid: NodeId) {
        if !self.nodes[nid].unbalanced {
            return;
        }
        self.nodes[nid].unbalanced = false;

        let threshold = self.page_size / 4;
        if self.nodes[nid].size() > threshold
            && self.nodes[nid].inodes.len() > self.nodes[nid].min_keys()
        {
            return;
        }

        let Some(parent) = self.nodes[nid].parent else {
            // A branch root with a single child collapses into it.
            if !self.nodes[nid].is_leaf && self.nodes[nid].inodes.len() == 1 {
                let child_pgid = self.nodes[nid].inodes[0].pgid;
                let cid = self.node_for(child_pgid, Some(nid));
                let child = std::mem::take(&mut self.nodes[cid]);
                self.nodes[nid].is_leaf = child.is_leaf;
                self.nodes[nid].inodes = child.inodes;
                for g in 0..self.nodes.len() {
                    if self.nodes[g].parent == Some(cid) {
                        self.nodes[g].parent = Some(nid);
                    }
                }
                self.free_page(child_pgid);
                self.by_pgid.remove(&child_pgid);
                self.nodes[cid].parent = None;
                self.nodes[cid].spilled = true;
            }
            return;
        };

        // An empty node is removed from its parent outright.
        if self.nodes[nid].inodes.is_empty() {
            let key = std::mem::take(&mut self.nodes[nid].key);
            self.nodes[parent].del(&key);
            self.remove_node(nid);
            self.rebalance_node(parent);
            return;
        }

        let idx = self.child_index(parent, nid);
        if idx == 0 {
            // Merge the next sibling into this node.
            if self.nodes[parent].inodes.len() < 2 {
                return;
            }
            let sib_pgid = self.nodes[parent].inodes[1].pgid;
            let sid = self.node_for(sib_pgid, Some(parent));
            let moved = std::mem::take(&mut self.nodes[sid].inodes);
            for g in 0..self.nodes.len() {
                if self.nodes[g].parent == Some(sid) {
                    self.nodes[g].parent = Some(nid);
                }
            }
            self.nodes[nid].inodes.extend(moved);
            let sib_key = self.nodes[sid].key.clone();
            self.nodes[parent].del(&sib_key);
            self.remove_node(sid);
        } else {
            // Merge this node into its previous sibling.
            let sib_pgid = self.nodes[parent].inodes[idx - 1].pgid;
            let sid = self.node_for(sib_pgid, Some(parent));
            let moved = std::mem::take(&mut self.nodes[nid].inodes);
            for g in 0..self.nodes.len() {
                if self.nodes[g].parent == Some(nid) {
                    self.nodes[g].parent = Some(sid);
                }
            }
            self.nodes[sid].inodes.extend(moved);
            let key = self.nodes[nid].key.clone();
            self.nodes[parent].del(&key);
            self.remove_node(nid);
        }

        self.rebalance_node(parent);
    }

    /// Frees a merged-away node's page and marks it dead.
    fn remove_node(&mut self, nid: NodeId) {
        let pgid = self.nodes[nid].pgid;
        if pgid != 0 {
            self.free_page(pgid);
            self.by_pgid.remove(&pgid);
        }
        self.nodes[nid].parent = None;
        self.nodes[nid].unbalanced = false;
        self.nodes[nid].spilled = true;
    }

    /// Index of `nid`'s entry within its parent.
    fn child_index(&self, parent: NodeId, nid: NodeId) -> usize {
        let key = &self.nodes[nid].key;
        match self.nodes[parent].inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key)) {
            Ok(i) | Err(i) => i,
        }
    }

    /// Writes every touched subtree to freshly allocated pages, bottom
    /// up, and records the final root of each bucket.
    fn spill(&mut self) -> Result<()> {
        let roots: Vec<(String, NodeId)> =
            self.roots.iter().map(|(name, &nid)| (name.clone(), nid)).collect();
        for (name, nid) in roots {
            let top = self.spill_node(nid)?;
            let root = self.nodes[top].pgid;
            self.buckets.put(&name, BucketDef { root });
            self.roots.insert(name, top);
        }
        Ok(())
    }

    fn spill_node(&mut self, nid: NodeId) -> Result<NodeId> {
        if self.nodes[nid].spilled {
            return Ok(nid);
        }

        // Children first so separator keys and child ids are final.
        let children: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&c| self.nodes[c].parent == Some(nid) && !self.nodes[c].spilled)
            .collect();
        for c in children {
            self.spill_node(c)?;
        }

        // The page this node shadows is superseded by what we write now.
        let old_pgid = self.nodes[nid].pgid;
        if old_pgid != 0 {
            self.free_page(old_pgid);
        }

        let is_leaf = self.nodes[nid].is_leaf;
        let parent = self.nodes[nid].parent;
        let old_key = self.nodes[nid].key.clone();
        let pieces = self.nodes[nid].split(self.page_size);

        let mut extra: Vec<(Vec<u8>, Pgid)> = Vec::new();
        for (i, inodes) in pieces.iter().enumerate() {
            let pgid = self.spill_piece(is_leaf, inodes)?;
            let first_key = inodes.first().map(|inode| inode.key.clone()).unwrap_or_default();
            if i == 0 {
                self.nodes[nid].pgid = pgid;
                if let Some(p) = parent {
                    let from = if old_key.is_empty() { &first_key } else { &old_key };
                    self.nodes[p].put(from, &first_key, &[], pgid, 0);
                }
                self.nodes[nid].key = first_key;
            } else if let Some(p) = parent {
                self.nodes[p].put(&first_key, &first_key, &[], pgid, 0);
            } else {
                extra.push((first_key, pgid));
            }
        }
        self.nodes[nid].spilled = true;

        // The root itself split: grow a new root above it.
        if parent.is_none() && !extra.is_empty() {
            let mut root = Node { is_leaf: false, ..Default::default() };
            root.inodes.push(Inode {
                flags: 0,
                key: self.nodes[nid].key.clone(),
                value: Vec::new(),
                pgid: self.nodes[nid].pgid,
            });
            for (key, pgid) in extra {
                root.inodes.push(Inode { flags: 0, key, value: Vec::new(), pgid });
            }
            let rid = self.nodes.len();
            self.nodes.push(root);
            self.nodes[nid].parent = Some(rid);
            return self.spill_node(rid);
        }

        Ok(nid)
    }

    /// Allocates pages for one split piece and serializes it.
    fn spill_piece(&mut self, is_leaf: bool, inodes: &[Inode]) -> Result<Pgid> {
        let size = inodes_size(is_leaf, inodes);
        let count = size / self.page_size + 1;
        let pgid = self.allocate(count)?;

        let mut buf = vec![0u8; count * self.page_size];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(pgid);
            p.set_overflow((count - 1) as u32);
            write_inodes(is_leaf, inodes, &mut p);
        }
        self.pages.insert(pgid, buf);
        Ok(pgid)
    }

    /// Writes all dirty pages in id order and flushes the data file.
    fn write_pages(&mut self) -> Result<()> {
        let mut ids: Vec<Pgid> = self.pages.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let buf = &self.pages[&id];
            self.db.write_at(buf, id * self.page_size as u64)?;
        }
        self.db.sync_data()
    }

    /// Writes the new meta into the slot not currently in use. The write
    /// goes through the O_SYNC handle, so once it returns the commit is
    /// durable.
    fn write_meta(&mut self) -> Result<()> {
        let slot = self.meta.txid % 2;
        let mut buf = vec![0u8; self.page_size];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(slot);
            self.meta.write(&mut p);
        }
        self.db.write_meta_page(&buf, slot * self.page_size as u64)
    }
}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rollback_inner();
        }
    }
}

impl TreeSource for RwTransaction<'_> {
    fn source_page(&self, id: Pgid) -> Page<'_> {
        self.page(id)
    }

    fn source_node(&self, id: Pgid) -> Option<&Node> {
        self.by_pgid.get(&id).map(|&nid| &self.nodes[nid])
    }
}
