//! In-memory tree nodes
//!
//! A node is the mutable shadow of one branch or leaf page inside a write
//! transaction. Nodes live in an arena owned by the transaction and refer
//! to each other through arena indices, never through pointers; the tree
//! structure on disk is only rebuilt when the transaction spills.

use crate::page::{
    Page, PageFlags, PageMut, Pgid, BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, MIN_KEYS_PER_PAGE,
    PAGE_HEADER_SIZE,
};

/// Index of a node within the transaction's arena.
pub type NodeId = usize;

/// One entry of a node. Branch entries carry a child page id and no
/// value; leaf entries carry user data and a zero page id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inode {
    /// Element flags, persisted verbatim.
    pub flags: u32,
    /// Entry key.
    pub key: Vec<u8>,
    /// User value (leaf entries only).
    pub value: Vec<u8>,
    /// Child page id (branch entries only).
    pub pgid: Pgid,
}

/// Mutable shadow of a single tree page.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Arena index of the parent, or None for a root.
    pub parent: Option<NodeId>,
    /// Whether this node is a leaf.
    pub is_leaf: bool,
    /// Set when a delete may have left the node under-filled.
    pub unbalanced: bool,
    /// Set once the node has been written out (or merged away).
    pub spilled: bool,
    /// First key of the node at materialization time; this is the key
    /// the parent still holds for it.
    pub key: Vec<u8>,
    /// Page this node shadows; 0 until one is assigned.
    pub pgid: Pgid,
    /// Sorted entries.
    pub inodes: Vec<Inode>,
}

impl Node {
    /// Minimum entries this node may hold before rebalancing.
    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    /// Size of one serialized element for this node type.
    pub fn page_element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Serialized size of the node.
    pub fn size(&self) -> usize {
        inodes_size(self.is_leaf, &self.inodes)
    }

    /// Fast check whether the serialized node stays under `v` bytes.
    pub fn size_less_than(&self, v: usize) -> bool {
        let elem = self.page_element_size();
        let mut size = PAGE_HEADER_SIZE;
        for inode in &self.inodes {
            size += elem + inode.key.len() + inode.value.len();
            if size >= v {
                return false;
            }
        }
        true
    }

    /// Hydrates the node from an on-disk page.
    pub fn read(&mut self, p: &Page<'_>) {
        self.pgid = p.id();
        self.is_leaf = p.flags().contains(PageFlags::LEAF);
        let count = p.count();
        self.inodes = Vec::with_capacity(count);
        for i in 0..count {
            if self.is_leaf {
                let e = p.leaf_element(i);
                self.inodes.push(Inode {
                    flags: e.flags(),
                    key: e.key().to_vec(),
                    value: e.value().to_vec(),
                    pgid: 0,
                });
            } else {
                let e = p.branch_element(i);
                self.inodes.push(Inode {
                    flags: 0,
                    key: e.key().to_vec(),
                    value: Vec::new(),
                    pgid: e.pgid(),
                });
            }
        }
        self.key = self.inodes.first().map(|inode| inode.key.clone()).unwrap_or_default();
    }

    /// Serializes the node onto a page.
    pub fn write(&self, p: &mut PageMut<'_>) {
        write_inodes(self.is_leaf, &self.inodes, p);
    }

    /// Inserts a new entry or replaces the entry currently keyed by
    /// `old_key`. `old_key` differs from `new_key` only when a parent
    /// updates the separator for a rewritten child.
    pub fn put(&mut self, old_key: &[u8], new_key: &[u8], value: &[u8], pgid: Pgid, flags: u32) {
        _assert!(!new_key.is_empty(), "put: zero-length new key");

        match self.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(old_key)) {
            Ok(i) => {
                let inode = &mut self.inodes[i];
                inode.flags = flags;
                inode.key = new_key.to_vec();
                inode.value = value.to_vec();
                inode.pgid = pgid;
            }
            Err(i) => {
                self.inodes.insert(
                    i,
                    Inode { flags, key: new_key.to_vec(), value: value.to_vec(), pgid },
                );
            }
        }
    }

    /// Removes the entry with the given key; missing keys are ignored.
    pub fn del(&mut self, key: &[u8]) {
        if let Ok(i) = self.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key)) {
            self.inodes.remove(i);
            self.unbalanced = true;
        }
    }

    /// Partitions the entries so every piece serializes within a page,
    /// targeting a 50% fill per piece. Returns a single piece when no
    /// split is needed.
    pub fn split(&self, page_size: usize) -> Vec<Vec<Inode>> {
        // Not enough entries for two pages, or everything already fits.
        if self.inodes.len() <= MIN_KEYS_PER_PAGE * 2 || self.size_less_than(page_size) {
            return vec![self.inodes.clone()];
        }

        let threshold = page_size / 2;
        let elem = self.page_element_size();
        let mut pieces: Vec<Vec<Inode>> = Vec::new();
        let mut current: Vec<Inode> = Vec::new();
        let mut size = PAGE_HEADER_SIZE;

        for (i, inode) in self.inodes.iter().enumerate() {
            let entry_size = elem + inode.key.len() + inode.value.len();
            let remaining = self.inodes.len() - i;
            if current.len() >= MIN_KEYS_PER_PAGE
                && remaining > MIN_KEYS_PER_PAGE
                && size + entry_size > threshold
            {
                pieces.push(std::mem::take(&mut current));
                size = PAGE_HEADER_SIZE;
            }
            size += entry_size;
            current.push(inode.clone());
        }
        pieces.push(current);
        pieces
    }
}

/// Serialized size of a set of entries as one page.
pub fn inodes_size(is_leaf: bool, inodes: &[Inode]) -> usize {
    let elem = if is_leaf { LEAF_ELEMENT_SIZE } else { BRANCH_ELEMENT_SIZE };
    PAGE_HEADER_SIZE
        + inodes.iter().map(|inode| elem + inode.key.len() + inode.value.len()).sum::<usize>()
}

/// Writes entries onto a page: the element array first, then the packed
/// key/value region, with each element's pos relative to itself.
pub fn write_inodes(is_leaf: bool, inodes: &[Inode], p: &mut PageMut<'_>) {
    p.set_flags(if is_leaf { PageFlags::LEAF } else { PageFlags::BRANCH });
    p.set_count(inodes.len() as u16);

    let elem = if is_leaf { LEAF_ELEMENT_SIZE } else { BRANCH_ELEMENT_SIZE };
    let mut off = PAGE_HEADER_SIZE + inodes.len() * elem;
    for (i, inode) in inodes.iter().enumerate() {
        let elem_off = PAGE_HEADER_SIZE + i * elem;
        let pos = (off - elem_off) as u32;
        if is_leaf {
            p.put_u32(elem_off, inode.flags);
            p.put_u32(elem_off + 4, pos);
            p.put_u32(elem_off + 8, inode.key.len() as u32);
            p.put_u32(elem_off + 12, inode.value.len() as u32);
            p.write_bytes(off, &inode.key);
            off += inode.key.len();
            p.write_bytes(off, &inode.value);
            off += inode.value.len();
        } else {
            p.put_u32(elem_off, pos);
            p.put_u32(elem_off + 4, inode.key.len() as u32);
            p.put_u64(elem_off + 8, inode.pgid);
            p.write_bytes(off, &inode.key);
            off += inode.key.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_inode(key: &[u8], value: &[u8]) -> Inode {
        Inode { flags: 0, key: key.to_vec(), value: value.to_vec(), pgid: 0 }
    }

    #[test]
    fn test_node_put_orders_keys() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        n.put(b"baz", b"baz", b"2", 0, 0);
        n.put(b"foo", b"foo", b"0", 0, 0);
        n.put(b"bar", b"bar", b"1", 0, 0);
        n.put(b"foo", b"foo", b"3", 0, 1);

        assert_eq!(n.inodes.len(), 3);
        assert_eq!((n.inodes[0].key.as_slice(), n.inodes[0].value.as_slice()), (&b"bar"[..], &b"1"[..]));
        assert_eq!((n.inodes[1].key.as_slice(), n.inodes[1].value.as_slice()), (&b"baz"[..], &b"2"[..]));
        assert_eq!((n.inodes[2].key.as_slice(), n.inodes[2].value.as_slice()), (&b"foo"[..], &b"3"[..]));
        assert_eq!(n.inodes[2].flags, 1);
    }

    #[test]
    fn test_node_put_replaces_separator_key() {
        let mut n = Node { is_leaf: false, ..Default::default() };
        n.put(b"bar", b"bar", &[], 2, 0);
        n.put(b"foo", b"foo", &[], 3, 0);
        // A rewritten child moves its first key from "foo" to "fop".
        n.put(b"foo", b"fop", &[], 9, 0);

        assert_eq!(n.inodes.len(), 2);
        assert_eq!(n.inodes[1].key.as_slice(), b"fop");
        assert_eq!(n.inodes[1].pgid, 9);
    }

    #[test]
    fn test_node_del() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        n.put(b"bar", b"bar", b"1", 0, 0);
        n.put(b"foo", b"foo", b"2", 0, 0);

        n.del(b"missing");
        assert!(!n.unbalanced);
        assert_eq!(n.inodes.len(), 2);

        n.del(b"bar");
        assert!(n.unbalanced);
        assert_eq!(n.inodes.len(), 1);
        assert_eq!(n.inodes[0].key.as_slice(), b"foo");
    }

    #[test]
    fn test_node_write_read_round_trip_leaf() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        n.put(b"susy", b"susy", b"que", 0, 0);
        n.put(b"ricki", b"ricki", b"lake", 0, 0);
        n.put(b"john", b"john", b"johnson", 0, 0);

        let mut buf = vec![0u8; 4096];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(1);
            n.write(&mut p);
        }

        let mut got = Node::default();
        got.read(&Page::new(&buf));
        assert!(got.is_leaf);
        assert_eq!(got.inodes, n.inodes);
        assert_eq!(got.key.as_slice(), b"john");
    }

    #[test]
    fn test_node_write_read_round_trip_branch() {
        let mut n = Node { is_leaf: false, ..Default::default() };
        n.put(b"abc", b"abc", &[], 11, 0);
        n.put(b"xyz", b"xyz", &[], 12, 0);

        let mut buf = vec![0u8; 4096];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(2);
            n.write(&mut p);
        }

        let p = Page::new(&buf);
        assert_eq!(p.typ(), "branch");
        assert_eq!(p.branch_element(0).pgid(), 11);
        assert_eq!(p.branch_element(1).key(), b"xyz");

        let mut got = Node::default();
        got.read(&p);
        assert_eq!(got.inodes, n.inodes);
    }

    #[test]
    fn test_node_split_no_split_when_small() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        for k in [&b"a"[..], b"b", b"c", b"d"] {
            n.inodes.push(leaf_inode(k, b"v"));
        }
        assert_eq!(n.split(4096).len(), 1);
    }

    #[test]
    fn test_node_split_pieces_fit() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        for i in 0..64u32 {
            let key = format!("{i:08}");
            n.inodes.push(leaf_inode(key.as_bytes(), &[0u8; 64]));
        }
        let page_size = 1024;
        let pieces = n.split(page_size);
        assert!(pieces.len() > 1);
        let total: usize = pieces.iter().map(Vec::len).sum();
        assert_eq!(total, 64);
        for piece in &pieces {
            assert!(piece.len() >= MIN_KEYS_PER_PAGE);
            assert!(inodes_size(true, piece) <= page_size);
        }
        // The pieces concatenate back to the original ordering.
        let flat: Vec<Inode> = pieces.into_iter().flatten().collect();
        assert_eq!(flat, n.inodes);
    }

    #[test]
    fn test_node_size_less_than() {
        let mut n = Node { is_leaf: true, ..Default::default() };
        n.inodes.push(leaf_inode(b"key", b"value"));
        let exact = n.size();
        assert!(n.size_less_than(exact + 1));
        assert!(!n.size_less_than(exact));
    }
}
