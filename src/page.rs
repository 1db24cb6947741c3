//! Page layout and typed accessors
//!
//! Pages are the fundamental unit of storage and allocation. Every page
//! starts with a fixed 16-byte header followed by a payload whose layout
//! depends on the page flags. All multi-byte fields are little-endian and
//! are decoded explicitly rather than by overlaying structs on the mmap.

use bitflags::bitflags;
use static_assertions::const_assert;
use std::fmt::Write as _;
use tracing::debug;

/// 64-bit page identifier. Pages 0 and 1 are reserved for the meta pages.
pub type Pgid = u64;

/// Size of the page header: id (8) + flags (2) + count (2) + overflow (4).
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of a branch element: pos (4) + ksize (4) + pgid (8).
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Size of a leaf element: flags (4) + pos (4) + ksize (4) + vsize (4).
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Minimum number of keys a tree page holds, except for a root leaf.
pub const MIN_KEYS_PER_PAGE: usize = 2;

const_assert!(PAGE_HEADER_SIZE % 8 == 0);
const_assert!(BRANCH_ELEMENT_SIZE == LEAF_ELEMENT_SIZE);

bitflags! {
    /// On-disk page type flags. Exactly one is set per page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page (internal B+tree node)
        const BRANCH = 0x01;
        /// Leaf page (contains keys and values)
        const LEAF = 0x02;
        /// Meta page (root descriptor)
        const META = 0x04;
        /// Freelist page (reusable page ids)
        const FREELIST = 0x10;
        /// Buckets directory page
        const BUCKETS = 0x20;
    }
}

#[inline]
fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Read-only view over a raw page buffer.
///
/// The buffer starts at the page boundary and may extend past the page
/// end (into the rest of the map) so that overflow payloads stay
/// addressable. A view must never outlive the transaction that resolved
/// it: the bytes belong to that transaction's pinned map.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    buf: &'a [u8],
}

impl<'a> Page<'a> {
    /// Wraps a buffer beginning at a page boundary.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Page id stored in the header.
    pub fn id(&self) -> Pgid {
        u64_at(self.buf, 0)
    }

    /// Raw flags word.
    pub fn flags_raw(&self) -> u16 {
        u16_at(self.buf, 8)
    }

    /// Typed flags; unknown bits are dropped.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags_raw())
    }

    /// Number of elements (or freelist ids, or buckets) on the page.
    pub fn count(&self) -> usize {
        u16_at(self.buf, 10) as usize
    }

    /// Number of additional contiguous pages owned by this page.
    pub fn overflow(&self) -> u32 {
        u32_at(self.buf, 12)
    }

    /// Human-readable page type; unrecognized flags are shown in hex.
    pub fn typ(&self) -> String {
        let f = self.flags_raw();
        if f == PageFlags::BRANCH.bits() {
            "branch".to_string()
        } else if f == PageFlags::LEAF.bits() {
            "leaf".to_string()
        } else if f == PageFlags::META.bits() {
            "meta".to_string()
        } else if f == PageFlags::BUCKETS.bits() {
            "buckets".to_string()
        } else if f == PageFlags::FREELIST.bits() {
            "freelist".to_string()
        } else {
            format!("unknown<{f:04x}>")
        }
    }

    /// Payload bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    /// Branch element view at the given index.
    pub fn branch_element(&self, index: usize) -> BranchElement<'a> {
        BranchElement { buf: self.buf, off: PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE }
    }

    /// Leaf element view at the given index.
    pub fn leaf_element(&self, index: usize) -> LeafElement<'a> {
        LeafElement { buf: self.buf, off: PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE }
    }

    /// Dumps the first `n` bytes of the page to the debug log.
    pub fn hexdump(&self, n: usize) {
        let n = n.min(self.buf.len());
        let mut out = String::with_capacity(n * 2);
        for b in &self.buf[..n] {
            let _ = write!(out, "{b:02x}");
        }
        debug!(page = self.id(), "hexdump: {out}");
    }
}

/// Fixed-size branch record pointing at a child page.
pub struct BranchElement<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> BranchElement<'a> {
    /// Byte offset of the key, relative to the element start.
    pub fn pos(&self) -> u32 {
        u32_at(self.buf, self.off)
    }

    /// Key length in bytes.
    pub fn ksize(&self) -> u32 {
        u32_at(self.buf, self.off + 4)
    }

    /// Child page id. The key equals the minimum key of that subtree.
    pub fn pgid(&self) -> Pgid {
        u64_at(self.buf, self.off + 8)
    }

    /// Key bytes from the packed region.
    pub fn key(&self) -> &'a [u8] {
        let start = self.off + self.pos() as usize;
        &self.buf[start..start + self.ksize() as usize]
    }
}

/// Fixed-size leaf record holding one key/value pair.
pub struct LeafElement<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> LeafElement<'a> {
    /// Element flags (reserved, always zero today).
    pub fn flags(&self) -> u32 {
        u32_at(self.buf, self.off)
    }

    /// Byte offset of the key, relative to the element start.
    pub fn pos(&self) -> u32 {
        u32_at(self.buf, self.off + 4)
    }

    /// Key length in bytes.
    pub fn ksize(&self) -> u32 {
        u32_at(self.buf, self.off + 8)
    }

    /// Value length in bytes.
    pub fn vsize(&self) -> u32 {
        u32_at(self.buf, self.off + 12)
    }

    /// Key bytes from the packed region.
    pub fn key(&self) -> &'a [u8] {
        let start = self.off + self.pos() as usize;
        &self.buf[start..start + self.ksize() as usize]
    }

    /// Value bytes, immediately after the key.
    pub fn value(&self) -> &'a [u8] {
        let start = self.off + self.pos() as usize + self.ksize() as usize;
        &self.buf[start..start + self.vsize() as usize]
    }
}

/// Mutable view used when serializing a page.
pub struct PageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wraps a writable buffer beginning at a page boundary.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Sets the page id.
    pub fn set_id(&mut self, id: Pgid) {
        self.buf[0..8].copy_from_slice(&id.to_le_bytes());
    }

    /// Sets the page flags.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.buf[8..10].copy_from_slice(&flags.bits().to_le_bytes());
    }

    /// Sets the element count.
    pub fn set_count(&mut self, count: u16) {
        self.buf[10..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Sets the overflow page count.
    pub fn set_overflow(&mut self, overflow: u32) {
        self.buf[12..16].copy_from_slice(&overflow.to_le_bytes());
    }

    /// Writes a u32 at an absolute offset within the page buffer.
    pub fn put_u32(&mut self, off: usize, v: u32) {
        self.buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u64 at an absolute offset within the page buffer.
    pub fn put_u64(&mut self, off: usize, v: u64) {
        self.buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Copies raw bytes at an absolute offset within the page buffer.
    pub fn write_bytes(&mut self, off: usize, bytes: &[u8]) {
        self.buf[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Re-reads the buffer as an immutable page view.
    pub fn as_page(&self) -> Page<'_> {
        Page::new(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_flags(flags: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[8..10].copy_from_slice(&flags.to_le_bytes());
        buf
    }

    #[test]
    fn test_page_typ() {
        assert_eq!(Page::new(&page_with_flags(0x01)).typ(), "branch");
        assert_eq!(Page::new(&page_with_flags(0x02)).typ(), "leaf");
        assert_eq!(Page::new(&page_with_flags(0x04)).typ(), "meta");
        assert_eq!(Page::new(&page_with_flags(0x20)).typ(), "buckets");
        assert_eq!(Page::new(&page_with_flags(0x10)).typ(), "freelist");
        assert_eq!(Page::new(&page_with_flags(20000)).typ(), "unknown<4e20>");
    }

    #[test]
    fn test_page_header_round_trip() {
        let mut buf = vec![0u8; 4096];
        {
            let mut p = PageMut::new(&mut buf);
            p.set_id(256);
            p.set_flags(PageFlags::LEAF);
            p.set_count(7);
            p.set_overflow(3);
        }
        let p = Page::new(&buf);
        assert_eq!(p.id(), 256);
        assert_eq!(p.flags(), PageFlags::LEAF);
        assert_eq!(p.count(), 7);
        assert_eq!(p.overflow(), 3);
    }

    #[test]
    fn test_page_hexdump() {
        let buf = page_with_flags(0x02);
        Page::new(&buf).hexdump(16);
    }
}
