//! Byte layout of pages.
//!
//! ```text
//! | lsn (8) | pgno (4) | prev_pgno (4) | next_pgno (4) | entries (2) |
//! | hf_offset (2) | type (1) | level (1) | reserved (6) |   32 bytes
//! ```
//!
//! Slotted pages keep a `u16` slot array right after the header and pack
//! items from the end of the page downward; `hf_offset` is the lowest item
//! offset. Overflow pages reuse `entries` as the chain reference count (head
//! page only) and `hf_offset` as the number of data bytes on the page. Free
//! pages are chained through `next_pgno`.

use crate::error::{CoreError, CoreResult};
use crate::page::item::Item;
use crate::types::{Lsn, PageNo, PGNO_INVALID, PGNO_META};
use pagelog_storage::PageStore;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 32;

const LSN_OFF: usize = 0;
const PGNO_OFF: usize = 8;
const PREV_OFF: usize = 12;
const NEXT_OFF: usize = 16;
const ENTRIES_OFF: usize = 20;
const HF_OFF: usize = 22;
const TYPE_OFF: usize = 24;
const LEVEL_OFF: usize = 25;

const META_MAGIC_OFF: usize = 32;
const META_VERSION_OFF: usize = 36;
const META_PAGESIZE_OFF: usize = 40;
const META_LAST_OFF: usize = 44;
const META_FREE_OFF: usize = 48;

/// Identifies a metadata page.
pub const META_MAGIC: u32 = 0x504C_4D54;

/// Metadata page format version.
pub const META_VERSION: u32 = 1;

/// What a page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Never initialized.
    Invalid = 0,
    /// The metadata page.
    Meta = 1,
    /// On the free list.
    Free = 2,
    /// Part of an overflow chain.
    Overflow = 3,
    /// Slotted leaf page.
    Leaf = 4,
    /// Slotted internal page.
    Internal = 5,
}

impl PageType {
    /// Converts a byte to a page type.
    #[must_use]
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Invalid),
            1 => Some(Self::Meta),
            2 => Some(Self::Free),
            3 => Some(Self::Overflow),
            4 => Some(Self::Leaf),
            5 => Some(Self::Internal),
            _ => None,
        }
    }

    /// Converts the page type to a byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether pages of this type hold a slot array.
    #[must_use]
    pub const fn is_slotted(self) -> bool {
        matches!(self, Self::Leaf | Self::Internal)
    }

    /// Whether a page of this type holds nothing worth keeping.
    #[must_use]
    pub const fn is_unused(self) -> bool {
        matches!(self, Self::Free | Self::Invalid)
    }
}

/// A page buffer with typed accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Wraps raw page bytes.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Reads page `pgno` from a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn read(store: &dyn PageStore, pgno: PageNo) -> CoreResult<Self> {
        Ok(Self::from_bytes(store.read_page(pgno)?))
    }

    /// Writes the page back to the slot named by its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn write(&self, store: &dyn PageStore) -> CoreResult<()> {
        store.write_page(self.pgno(), &self.data)?;
        Ok(())
    }

    /// A fresh, empty page of `ptype`.
    #[must_use]
    pub fn new(pgno: PageNo, page_size: usize, ptype: PageType) -> Self {
        let mut page = Self::from_bytes(vec![0u8; page_size]);
        page.set_pgno(pgno);
        page.set_page_type(ptype);
        if ptype.is_slotted() {
            page.set_hf_offset(page_size as u16);
        }
        page
    }

    /// A free page linked to `next`.
    #[must_use]
    pub fn new_free(pgno: PageNo, page_size: usize, next: PageNo) -> Self {
        let mut page = Self::new(pgno, page_size, PageType::Free);
        page.set_next_pgno(next);
        page
    }

    /// An empty metadata page.
    #[must_use]
    pub fn new_meta(page_size: usize) -> Self {
        let mut page = Self::new(PGNO_META, page_size, PageType::Meta);
        page.put_u32(META_MAGIC_OFF, META_MAGIC);
        page.put_u32(META_VERSION_OFF, META_VERSION);
        page.put_u32(META_PAGESIZE_OFF, page_size as u32);
        page.set_last_pgno(PGNO_META);
        page.set_free_head(PGNO_INVALID);
        page
    }

    /// Resets the page to an empty page of `ptype`, keeping its LSN.
    pub fn reinit(&mut self, ptype: PageType) {
        let lsn = self.lsn();
        *self = Self::new(self.pgno(), self.data.len(), ptype);
        self.set_lsn(lsn);
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the page, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// The header bytes.
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.data[..PAGE_HEADER_SIZE]
    }

    /// Overwrites the header, leaving the body untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedRecord`] if `header` has the wrong size.
    pub fn restore_header(&mut self, header: &[u8]) -> CoreResult<()> {
        if header.len() != PAGE_HEADER_SIZE {
            return Err(CoreError::malformed(format!(
                "page header image is {} bytes",
                header.len()
            )));
        }
        self.data[..PAGE_HEADER_SIZE].copy_from_slice(header);
        Ok(())
    }

    /// Overwrites the whole page.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedRecord`] if `image` has the wrong size.
    pub fn restore_image(&mut self, image: &[u8]) -> CoreResult<()> {
        if image.len() != self.data.len() {
            return Err(CoreError::malformed(format!(
                "page image is {} bytes, page size is {}",
                image.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(image);
        Ok(())
    }

    /// LSN of the last mutation applied to this page.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        Lsn::new(self.get_u32(LSN_OFF), self.get_u32(LSN_OFF + 4))
    }

    /// Stamps the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.put_u32(LSN_OFF, lsn.file);
        self.put_u32(LSN_OFF + 4, lsn.offset);
    }

    /// Page number recorded in the header.
    #[must_use]
    pub fn pgno(&self) -> PageNo {
        self.get_u32(PGNO_OFF)
    }

    /// Sets the page number.
    pub fn set_pgno(&mut self, pgno: PageNo) {
        self.put_u32(PGNO_OFF, pgno);
    }

    /// Previous sibling.
    #[must_use]
    pub fn prev_pgno(&self) -> PageNo {
        self.get_u32(PREV_OFF)
    }

    /// Sets the previous sibling.
    pub fn set_prev_pgno(&mut self, pgno: PageNo) {
        self.put_u32(PREV_OFF, pgno);
    }

    /// Next sibling, next overflow page, or next free page.
    #[must_use]
    pub fn next_pgno(&self) -> PageNo {
        self.get_u32(NEXT_OFF)
    }

    /// Sets the next link.
    pub fn set_next_pgno(&mut self, pgno: PageNo) {
        self.put_u32(NEXT_OFF, pgno);
    }

    /// Slot count, or reference count on an overflow head.
    #[must_use]
    pub fn entries(&self) -> u16 {
        self.get_u16(ENTRIES_OFF)
    }

    /// Sets the entries field.
    pub fn set_entries(&mut self, v: u16) {
        self.put_u16(ENTRIES_OFF, v);
    }

    /// Lowest item offset, or data length on overflow pages.
    #[must_use]
    pub fn hf_offset(&self) -> u16 {
        self.get_u16(HF_OFF)
    }

    /// Sets the `hf_offset` field.
    pub fn set_hf_offset(&mut self, v: u16) {
        self.put_u16(HF_OFF, v);
    }

    /// Page type; unknown bytes read as [`PageType::Invalid`].
    #[must_use]
    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.data[TYPE_OFF]).unwrap_or(PageType::Invalid)
    }

    /// Sets the page type.
    pub fn set_page_type(&mut self, ptype: PageType) {
        self.data[TYPE_OFF] = ptype.as_u8();
    }

    /// Tree level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.data[LEVEL_OFF]
    }

    /// Sets the tree level.
    pub fn set_level(&mut self, level: u8) {
        self.data[LEVEL_OFF] = level;
    }

    // Metadata page fields.

    /// Validates the metadata page signature.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] if this is not a metadata page
    /// of the expected version and page size.
    pub fn check_meta(&self) -> CoreResult<()> {
        if self.page_type() != PageType::Meta
            || self.get_u32(META_MAGIC_OFF) != META_MAGIC
            || self.get_u32(META_VERSION_OFF) != META_VERSION
            || self.get_u32(META_PAGESIZE_OFF) as usize != self.data.len()
        {
            return Err(CoreError::log_corruption("metadata page is not initialized"));
        }
        Ok(())
    }

    /// Highest page number in use or on the free list.
    #[must_use]
    pub fn last_pgno(&self) -> PageNo {
        self.get_u32(META_LAST_OFF)
    }

    /// Sets the last page number.
    pub fn set_last_pgno(&mut self, pgno: PageNo) {
        self.put_u32(META_LAST_OFF, pgno);
    }

    /// Head of the free list.
    #[must_use]
    pub fn free_head(&self) -> PageNo {
        self.get_u32(META_FREE_OFF)
    }

    /// Sets the free-list head.
    pub fn set_free_head(&mut self, pgno: PageNo) {
        self.put_u32(META_FREE_OFF, pgno);
    }

    // Slotted pages.

    /// Bytes available for one more item and its slot.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let used = PAGE_HEADER_SIZE + 2 * usize::from(self.entries());
        usize::from(self.hf_offset()).saturating_sub(used)
    }

    fn slot_pos(index: u16) -> usize {
        PAGE_HEADER_SIZE + 2 * usize::from(index)
    }

    fn slot(&self, index: u16) -> usize {
        usize::from(self.get_u16(Self::slot_pos(index)))
    }

    fn check_slot(&self, index: u16) -> CoreResult<()> {
        if index >= self.entries() {
            return Err(CoreError::SlotNotFound {
                pgno: self.pgno(),
                index,
                entries: self.entries(),
            });
        }
        Ok(())
    }

    /// Encoded bytes of the item in slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SlotNotFound`] for an index past the last slot.
    pub fn item_bytes(&self, index: u16) -> CoreResult<&[u8]> {
        self.check_slot(index)?;
        let off = self.slot(index);
        let len = Item::stored_len(&self.data[off..])?;
        Ok(&self.data[off..off + len])
    }

    /// Decoded item in slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SlotNotFound`] or a decode error.
    pub fn item(&self, index: u16) -> CoreResult<Item> {
        Item::decode(self.item_bytes(index)?)
    }

    /// All items in slot order.
    ///
    /// # Errors
    ///
    /// Returns an error if an item fails to decode.
    pub fn items(&self) -> CoreResult<Vec<Item>> {
        (0..self.entries()).map(|i| self.item(i)).collect()
    }

    /// Inserts encoded item bytes at slot `index`, shifting later slots.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SlotNotFound`] if `index` is past the end of the
    /// slot array, or [`CoreError::PageFull`] if the item and its slot do not
    /// fit.
    pub fn insert_raw(&mut self, index: u16, bytes: &[u8]) -> CoreResult<()> {
        let entries = self.entries();
        if index > entries {
            return Err(CoreError::SlotNotFound {
                pgno: self.pgno(),
                index,
                entries,
            });
        }
        let needed = bytes.len() + 2;
        let available = self.free_space();
        if needed > available {
            return Err(CoreError::PageFull {
                pgno: self.pgno(),
                needed,
                available,
            });
        }
        let off = usize::from(self.hf_offset()) - bytes.len();
        self.data[off..off + bytes.len()].copy_from_slice(bytes);

        let start = Self::slot_pos(index);
        let end = Self::slot_pos(entries);
        self.data.copy_within(start..end, start + 2);
        self.put_u16(start, off as u16);
        self.set_entries(entries + 1);
        self.set_hf_offset(off as u16);
        Ok(())
    }

    /// Removes slot `index` and returns its encoded bytes, compacting the
    /// item area.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SlotNotFound`] for an index past the last slot.
    pub fn remove_raw(&mut self, index: u16) -> CoreResult<Vec<u8>> {
        let removed = self.item_bytes(index)?.to_vec();
        let off = self.slot(index);
        let len = removed.len();
        let hf = usize::from(self.hf_offset());
        let entries = self.entries();

        self.data.copy_within(hf..off, hf + len);
        self.data[hf..hf + len].fill(0);
        for i in 0..entries {
            let slot = self.slot(i);
            if i != index && slot < off {
                self.put_u16(Self::slot_pos(i), (slot + len) as u16);
            }
        }

        let start = Self::slot_pos(index);
        let end = Self::slot_pos(entries);
        self.data.copy_within(start + 2..end, start);
        self.data[end - 2..end].fill(0);
        self.set_entries(entries - 1);
        self.set_hf_offset((hf + len) as u16);
        Ok(removed)
    }

    /// Drops every item, keeping the type, links and level.
    pub fn clear_items(&mut self) {
        let size = self.data.len();
        self.data[PAGE_HEADER_SIZE..].fill(0);
        self.set_entries(0);
        if self.page_type().is_slotted() {
            self.set_hf_offset(size as u16);
        } else {
            self.set_hf_offset(0);
        }
    }

    /// Whether the body holds items or overflow data.
    #[must_use]
    pub fn holds_data(&self) -> bool {
        match self.page_type() {
            PageType::Leaf | PageType::Internal => self.entries() > 0,
            PageType::Overflow => self.hf_offset() > 0,
            _ => false,
        }
    }

    // Overflow pages.

    /// Data bytes one overflow page can hold.
    #[must_use]
    pub const fn overflow_capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE
    }

    /// Data stored on an overflow page.
    #[must_use]
    pub fn overflow_data(&self) -> &[u8] {
        let len = usize::from(self.hf_offset()).min(Self::overflow_capacity(self.data.len()));
        &self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]
    }

    /// Replaces the data of an overflow page.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PageFull`] if `data` exceeds the page capacity.
    pub fn set_overflow_data(&mut self, data: &[u8]) -> CoreResult<()> {
        let capacity = Self::overflow_capacity(self.data.len());
        if data.len() > capacity {
            return Err(CoreError::PageFull {
                pgno: self.pgno(),
                needed: data.len(),
                available: capacity,
            });
        }
        self.data[PAGE_HEADER_SIZE..].fill(0);
        self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
        self.set_hf_offset(data.len() as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> Page {
        Page::new(3, 512, PageType::Leaf)
    }

    fn data(bytes: &[u8]) -> Vec<u8> {
        Item::Data(bytes.to_vec()).encode().unwrap()
    }

    #[test]
    fn fresh_leaf_is_empty() {
        let page = leaf();
        assert_eq!(page.pgno(), 3);
        assert_eq!(page.entries(), 0);
        assert_eq!(page.hf_offset(), 512);
        assert_eq!(page.free_space(), 512 - PAGE_HEADER_SIZE);
        assert_eq!(page.lsn(), Lsn::ZERO);
    }

    #[test]
    fn insert_keeps_slot_order() {
        let mut page = leaf();
        page.insert_raw(0, &data(b"b")).unwrap();
        page.insert_raw(0, &data(b"a")).unwrap();
        page.insert_raw(2, &data(b"c")).unwrap();
        assert_eq!(
            page.items().unwrap(),
            vec![
                Item::Data(b"a".to_vec()),
                Item::Data(b"b".to_vec()),
                Item::Data(b"c".to_vec())
            ]
        );
    }

    #[test]
    fn remove_compacts_and_frees_space() {
        let mut page = leaf();
        let before = page.free_space();
        page.insert_raw(0, &data(b"first")).unwrap();
        page.insert_raw(1, &data(b"second")).unwrap();
        page.insert_raw(2, &data(b"third")).unwrap();

        let removed = page.remove_raw(1).unwrap();
        assert_eq!(Item::decode(&removed).unwrap(), Item::Data(b"second".to_vec()));
        assert_eq!(page.item(1).unwrap(), Item::Data(b"third".to_vec()));
        assert_eq!(page.item(0).unwrap(), Item::Data(b"first".to_vec()));

        page.remove_raw(0).unwrap();
        page.remove_raw(0).unwrap();
        assert_eq!(page.free_space(), before);
        assert_eq!(page, {
            let mut fresh = leaf();
            fresh.set_lsn(page.lsn());
            fresh
        });
    }

    #[test]
    fn full_page_reports_sizes() {
        let mut page = leaf();
        let big = data(&[7u8; 470]);
        page.insert_raw(0, &big).unwrap();
        let err = page.insert_raw(1, &data(&[1u8; 10])).unwrap_err();
        assert!(matches!(err, CoreError::PageFull { pgno: 3, needed: 15, .. }));
    }

    #[test]
    fn missing_slot_is_reported() {
        let mut page = leaf();
        assert!(matches!(
            page.remove_raw(0),
            Err(CoreError::SlotNotFound { index: 0, entries: 0, .. })
        ));
        assert!(page.insert_raw(2, &data(b"x")).is_err());
    }

    #[test]
    fn meta_page_fields() {
        let mut meta = Page::new_meta(1024);
        meta.check_meta().unwrap();
        assert_eq!(meta.free_head(), PGNO_INVALID);
        meta.set_last_pgno(12);
        meta.set_free_head(5);
        assert_eq!(meta.last_pgno(), 12);
        assert_eq!(meta.free_head(), 5);
        assert!(Page::from_bytes(vec![0u8; 1024]).check_meta().is_err());
    }

    #[test]
    fn overflow_data_roundtrip_and_reinit() {
        let mut page = Page::new(4, 512, PageType::Overflow);
        page.set_overflow_data(b"chunk").unwrap();
        page.set_lsn(Lsn::new(1, 40));
        assert_eq!(page.overflow_data(), b"chunk");
        assert!(page.set_overflow_data(&[0u8; 481]).is_err());

        page.reinit(PageType::Leaf);
        assert_eq!(page.lsn(), Lsn::new(1, 40));
        assert_eq!(page.page_type(), PageType::Leaf);
        assert_eq!(page.entries(), 0);
    }
}
