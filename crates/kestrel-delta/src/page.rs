//! Immutable delta index pages.
//!
//! When a chapter closes, its chapter index is packed into immutable pages
//! for the on-disk volume. A page carries a fixed header (nonce, virtual
//! chapter, first list, list count), a table of 19-bit bit offsets with one
//! sentinel entry, the packed delta list bit streams, and seven guard bytes
//! of ones.
//!
//! Pages are written little endian. Legacy volumes wrote the header big
//! endian, so loading tries little endian first and falls back; a page that
//! fails both is reported as corrupt without logging, because unwritten
//! pages are expected while rebuilding a partially written volume.

use crate::bits::{get_field, set_field, transfer_bits, GUARD_BYTES};
use crate::codec::DeltaCoding;
use crate::index::{search_list, DeltaIndex};
use kestrel_common::geometry::IMMUTABLE_HEADER_BITS;
use kestrel_common::record::RecordName;
use kestrel_common::{KestrelError, Result};

/// Byte size of the fixed page header.
pub const PAGE_HEADER_BYTES: usize = 20;

/// Bit offset of the Nth list-offset table entry.
fn immutable_header_offset(list_number: u32) -> u64 {
    (PAGE_HEADER_BYTES * 8) as u64 + list_number as u64 * IMMUTABLE_HEADER_BITS as u64
}

/// Reads the start offset of the Nth packed list.
fn immutable_start(memory: &[u8], list_number: u32) -> u32 {
    get_field(memory, immutable_header_offset(list_number), IMMUTABLE_HEADER_BITS)
}

fn set_immutable_start(memory: &mut [u8], list_number: u32, start: u32) {
    set_field(start, memory, immutable_header_offset(list_number), IMMUTABLE_HEADER_BITS);
}

struct PageHeader {
    nonce: u64,
    virtual_chapter: u64,
    first_list: u16,
    list_count: u16,
}

fn parse_header_le(memory: &[u8]) -> PageHeader {
    PageHeader {
        nonce: u64::from_le_bytes(memory[0..8].try_into().unwrap()),
        virtual_chapter: u64::from_le_bytes(memory[8..16].try_into().unwrap()),
        first_list: u16::from_le_bytes(memory[16..18].try_into().unwrap()),
        list_count: u16::from_le_bytes(memory[18..20].try_into().unwrap()),
    }
}

fn parse_header_be(memory: &[u8]) -> PageHeader {
    PageHeader {
        nonce: u64::from_be_bytes(memory[0..8].try_into().unwrap()),
        virtual_chapter: u64::from_be_bytes(memory[8..16].try_into().unwrap()),
        first_list: u16::from_be_bytes(memory[16..18].try_into().unwrap()),
        list_count: u16::from_be_bytes(memory[18..20].try_into().unwrap()),
    }
}

fn verify_page(header: &PageHeader, expected_nonce: u64, memory: &[u8]) -> bool {
    // A nonce mismatch is expected during rebuild, before the whole
    // volume has been written at least once.
    if header.nonce != expected_nonce {
        return false;
    }

    let list_count = header.list_count as u32;
    let max_lists =
        ((memory.len() - PAGE_HEADER_BYTES) * 8) as u64 / IMMUTABLE_HEADER_BITS as u64;
    if list_count as u64 > max_lists {
        return false;
    }

    // The first list must start immediately after the offset table.
    if immutable_start(memory, 0) as u64 != immutable_header_offset(list_count + 1) {
        return false;
    }

    // Offsets must not decrease.
    for i in 0..list_count {
        if immutable_start(memory, i) > immutable_start(memory, i + 1) {
            return false;
        }
    }

    // The last list must end on the page, leaving room for the guard.
    if immutable_start(memory, list_count) as u64 > ((memory.len() - GUARD_BYTES) * 8) as u64 {
        return false;
    }

    // The guard bytes must be all ones.
    memory[memory.len() - GUARD_BYTES..].iter().all(|&b| b == 0xFF)
}

/// An immutable chapter index page.
#[derive(Debug)]
pub struct DeltaIndexPage {
    memory: Vec<u8>,
    coding: DeltaCoding,
    value_bits: u32,
    virtual_chapter: u64,
    lowest_list: u32,
    highest_list: u32,
    list_count: u32,
}

impl DeltaIndexPage {
    /// Validates and adopts a page read from the volume.
    ///
    /// Corrupt pages return `CorruptData` without logging; they are
    /// expected while rebuilding a partially written volume.
    pub fn new(
        expected_nonce: u64,
        mean_delta: u32,
        payload_bits: u32,
        memory: Vec<u8>,
    ) -> Result<Self> {
        if memory.len() < PAGE_HEADER_BYTES + GUARD_BYTES {
            return Err(KestrelError::CorruptData(
                "chapter index page too small".to_string(),
            ));
        }

        let mut header = parse_header_le(&memory);
        if !verify_page(&header, expected_nonce, &memory) {
            // Legacy pages were written big endian.
            header = parse_header_be(&memory);
            if !verify_page(&header, expected_nonce, &memory) {
                return Err(KestrelError::CorruptData(
                    "chapter index page failed validation".to_string(),
                ));
            }
        }

        let first_list = header.first_list as u32;
        let list_count = header.list_count as u32;
        Ok(Self {
            memory,
            coding: DeltaCoding::new(mean_delta),
            value_bits: payload_bits,
            virtual_chapter: header.virtual_chapter,
            lowest_list: first_list,
            highest_list: first_list + list_count.saturating_sub(1),
            list_count,
        })
    }

    /// The virtual chapter this page belongs to.
    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    /// The lowest chapter delta list number on this page.
    pub fn lowest_list_number(&self) -> u32 {
        self.lowest_list
    }

    /// The highest chapter delta list number on this page.
    pub fn highest_list_number(&self) -> u32 {
        self.highest_list
    }

    /// The number of delta lists packed on this page.
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    /// Searches the page for the given chapter delta list entry, resolving
    /// collisions by full record name. Returns the entry's payload.
    pub fn search(&self, list_number: u32, key: u32, name: &RecordName) -> Result<Option<u32>> {
        if self.list_count == 0 || list_number < self.lowest_list || list_number > self.highest_list
        {
            return Err(KestrelError::CorruptData(format!(
                "list {} not on page [{}, {}]",
                list_number, self.lowest_list, self.highest_list
            )));
        }

        let local = list_number - self.lowest_list;
        let start = immutable_start(&self.memory, local) as u64;
        let end = immutable_start(&self.memory, local + 1) as u64;
        search_list(
            &self.memory,
            &self.coding,
            self.value_bits,
            start,
            (end - start) as u32,
            key,
            name,
        )
    }
}

/// Packs delta lists from a mutable index into an immutable page.
///
/// Consecutive lists starting at `first_list` are copied until the page is
/// full. Returns the number of lists packed; zero means every remaining
/// list was already packed onto earlier pages.
pub fn pack_delta_index_page(
    index: &DeltaIndex,
    nonce: u64,
    virtual_chapter: u64,
    first_list: u32,
    memory: &mut [u8],
) -> Result<u32> {
    let zone = index.zone(0);
    let max_lists = index.list_count() - first_list;

    // Space available for list offsets and list data: the page minus the
    // fixed header, one sentinel offset, and the guard bytes.
    let mut free_bits = (memory.len() * 8) as i64;
    free_bits -= immutable_header_offset(1) as i64;
    free_bits -= (GUARD_BYTES * 8) as i64;
    if free_bits < IMMUTABLE_HEADER_BITS as i64 {
        return Err(KestrelError::Overflow);
    }

    let mut list_count = 0u32;
    while list_count < max_lists {
        let size = zone.lists[(first_list + list_count) as usize + 1].size as i64;
        let bits = IMMUTABLE_HEADER_BITS as i64 + size;
        if bits > free_bits {
            break;
        }
        list_count += 1;
        free_bits -= bits;
    }

    memory[0..8].copy_from_slice(&nonce.to_le_bytes());
    memory[8..16].copy_from_slice(&virtual_chapter.to_le_bytes());
    memory[16..18].copy_from_slice(&(first_list as u16).to_le_bytes());
    memory[18..20].copy_from_slice(&(list_count as u16).to_le_bytes());

    // The delta list offset table.
    let mut offset = immutable_header_offset(list_count + 1) as u32;
    set_immutable_start(memory, 0, offset);
    for i in 0..list_count {
        offset += zone.lists[(first_list + i) as usize + 1].size as u32;
        set_immutable_start(memory, i + 1, offset);
    }

    // The packed list data.
    for i in 0..list_count {
        let list = &zone.lists[(first_list + i) as usize + 1];
        transfer_bits(
            &zone.memory,
            list.start,
            memory,
            immutable_start(memory, i) as u64,
            list.size as u32,
        );
    }

    let guard_start = memory.len() - GUARD_BYTES;
    for byte in &mut memory[guard_start..] {
        *byte = 0xFF;
    }
    Ok(list_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: u64 = 0xDEAD_BEEF_CAFE_F00D;

    fn filled_index(list_count: u32, entries_per_list: u32) -> DeltaIndex {
        let mut index = DeltaIndex::new(1, list_count, 256, 8, 64 * 1024, b'c').unwrap();
        for list in 0..list_count {
            for i in 0..entries_per_list {
                let key = i * 199 + list;
                let mut entry = index.get_entry(list, key, None).unwrap();
                index
                    .put_entry(&mut entry, key, (key % 251) as u32, None)
                    .unwrap();
            }
        }
        index
    }

    fn swap_page_endianness(memory: &mut [u8]) {
        let header = parse_header_le(memory);
        memory[0..8].copy_from_slice(&header.nonce.to_be_bytes());
        memory[8..16].copy_from_slice(&header.virtual_chapter.to_be_bytes());
        memory[16..18].copy_from_slice(&header.first_list.to_be_bytes());
        memory[18..20].copy_from_slice(&header.list_count.to_be_bytes());
    }

    #[test]
    fn test_pack_and_search() {
        let index = filled_index(8, 20);
        let mut memory = vec![0u8; 4096];
        let packed = pack_delta_index_page(&index, NONCE, 17, 0, &mut memory).unwrap();
        assert_eq!(packed, 8, "small index should fit on one page");

        let page = DeltaIndexPage::new(NONCE, 256, 8, memory).unwrap();
        assert_eq!(page.virtual_chapter(), 17);
        assert_eq!(page.lowest_list_number(), 0);
        assert_eq!(page.highest_list_number(), 7);

        let name = RecordName([7; 32]);
        for list in 0..8u32 {
            for i in 0..20u32 {
                let key = i * 199 + list;
                let value = page.search(list, key, &name).unwrap();
                assert_eq!(value, Some(key % 251), "list {} key {}", list, key);
            }
            assert_eq!(page.search(list, 39, &name).unwrap(), None);
        }
    }

    #[test]
    fn test_pack_multiple_pages() {
        let index = filled_index(64, 60);
        let mut first_list = 0u32;
        let mut pages = Vec::new();
        while first_list < index.list_count() {
            let mut memory = vec![0u8; 1024];
            let packed =
                pack_delta_index_page(&index, NONCE, 3, first_list, &mut memory).unwrap();
            assert!(packed > 0, "page must hold at least one list");
            pages.push(DeltaIndexPage::new(NONCE, 256, 8, memory).unwrap());
            first_list += packed;
        }
        assert!(pages.len() > 1, "test should span several pages");

        // The pages must partition the lists in order.
        let mut expected = 0u32;
        for page in &pages {
            assert_eq!(page.lowest_list_number(), expected);
            expected = page.highest_list_number() + 1;
        }
        assert_eq!(expected, 64);

        // Every entry must be findable on its page.
        let name = RecordName([9; 32]);
        for list in 0..64u32 {
            let page = pages
                .iter()
                .find(|p| p.lowest_list_number() <= list && list <= p.highest_list_number())
                .unwrap();
            for i in 0..60u32 {
                let key = i * 199 + list;
                assert_eq!(page.search(list, key, &name).unwrap(), Some(key % 251));
            }
        }
    }

    #[test]
    fn test_corrupt_nonce_rejected() {
        let index = filled_index(4, 10);
        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 5, 0, &mut memory).unwrap();

        let result = DeltaIndexPage::new(NONCE + 1, 256, 8, memory);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_corrupt_guard_rejected() {
        let index = filled_index(4, 10);
        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 5, 0, &mut memory).unwrap();

        let end = memory.len();
        memory[end - 3] = 0x00;
        let result = DeltaIndexPage::new(NONCE, 256, 8, memory);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_corrupt_offset_table_rejected() {
        let index = filled_index(4, 10);
        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 5, 0, &mut memory).unwrap();

        // Make the offsets non-monotonic.
        let second = immutable_start(&memory, 2);
        set_immutable_start(&mut memory, 1, second + 100);
        let result = DeltaIndexPage::new(NONCE, 256, 8, memory);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_big_endian_fallback() {
        let index = filled_index(8, 15);
        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 11, 0, &mut memory).unwrap();
        swap_page_endianness(&mut memory);

        let page = DeltaIndexPage::new(NONCE, 256, 8, memory).unwrap();
        assert_eq!(page.virtual_chapter(), 11);
        assert_eq!(page.lowest_list_number(), 0);
        assert_eq!(page.highest_list_number(), 7);

        let name = RecordName([1; 32]);
        for list in 0..8u32 {
            let key = 3 * 199 + list;
            assert_eq!(page.search(list, key, &name).unwrap(), Some(key % 251));
        }
    }

    #[test]
    fn test_search_out_of_range_list() {
        let index = filled_index(4, 5);
        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 1, 0, &mut memory).unwrap();
        let page = DeltaIndexPage::new(NONCE, 256, 8, memory).unwrap();

        let name = RecordName([0; 32]);
        assert!(page.search(4, 0, &name).is_err());
    }

    #[test]
    fn test_page_with_collisions() {
        let mut index = DeltaIndex::new(1, 2, 256, 8, 64 * 1024, b'c').unwrap();
        let name_a = RecordName([0xA5; 32]);
        let name_b = RecordName([0x5A; 32]);

        let mut entry = index.get_entry(0, 77, Some(&name_a)).unwrap();
        index.put_entry(&mut entry, 77, 1, None).unwrap();
        let mut entry = index.get_entry(0, 77, Some(&name_b)).unwrap();
        index.put_entry(&mut entry, 77, 2, Some(&name_b)).unwrap();

        let mut memory = vec![0u8; 2048];
        pack_delta_index_page(&index, NONCE, 9, 0, &mut memory).unwrap();
        let page = DeltaIndexPage::new(NONCE, 256, 8, memory).unwrap();

        assert_eq!(page.search(0, 77, &name_a).unwrap(), Some(1));
        assert_eq!(page.search(0, 77, &name_b).unwrap(), Some(2));
    }
}
