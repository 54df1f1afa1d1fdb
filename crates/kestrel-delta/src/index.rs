//! The mutable delta index.
//!
//! Entries live in delta lists packed into one memory region per zone. The
//! zone can move lists around within its memory, so nothing ever holds a
//! pointer into it: lists are described by 64-bit bit offsets, and the
//! [`DeltaEntry`] cursor records only offsets and decode state.
//!
//! Each zone's memory is framed by two invalid guard lists: list 0 before
//! the first real list, and list N+1 after the last. The tail guard is
//! filled with ones so the delta decoder's zero-scan always terminates.
//! Real lists are numbered 1..=N inside the zone.

use crate::bits::{
    get_field, load_le16, move_bits, scan_word, set_field, set_zero, store_le16,
    DELTA_LIST_MAX_BITS, GUARD_BITS, GUARD_BYTES,
};
use crate::codec::DeltaCoding;
use kestrel_common::record::RecordName;
use kestrel_common::{KestrelError, Result};
use tracing::warn;

/// Bits in a collision entry's full-name extension.
pub const COLLISION_BITS: u32 = 256;

/// Bytes in a collision entry's full-name extension.
pub const COLLISION_BYTES: usize = 32;

/// Zone memory allocations are rounded up to this boundary.
const ZONE_ALLOC_BOUNDARY: usize = 64 * 1024;

/// Header for one delta list.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeltaList {
    /// Bit offset of the list within the zone memory.
    pub start: u64,
    /// Length of the list in bits.
    pub size: u16,
    /// Key of the last entry a search remembered.
    pub save_key: u32,
    /// Bit offset (within the list) of that entry.
    pub save_offset: u16,
}

impl DeltaList {
    fn byte_start(&self) -> usize {
        (self.start / 8) as usize
    }

    fn byte_size(&self) -> usize {
        ((self.start % 8 + self.size as u64) as usize + 7) / 8
    }
}

/// A decoding cursor positioned on one entry of a delta list.
///
/// The cursor describes the entry most recently decoded, with `offset`
/// giving the entry's starting bit within its list. It never borrows the
/// zone memory, so it stays valid across rebalancing (offsets within the
/// list are preserved; only list starts move).
#[derive(Debug, Clone, Copy)]
pub struct DeltaEntry {
    /// Zone-local list number (0-based).
    pub list_number: u32,
    /// Index of the owning zone within a multi-zone index.
    pub zone_index: u32,
    /// The key of this entry.
    pub key: u32,
    /// The delta that produced this key.
    pub delta: u32,
    /// Bit offset of this entry within the list.
    pub offset: u32,
    /// Total encoded size of this entry in bits.
    pub entry_bits: u32,
    /// Width of the payload field.
    pub value_bits: u32,
    /// Whether this entry carries a full-name extension.
    pub is_collision: bool,
    /// Whether the cursor has passed the last entry.
    pub at_end: bool,
    /// Whether an insertion through this cursor overflowed the list.
    pub list_overflow: bool,
}

/// Statistics for a delta index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub list_count: u64,
    pub rebalance_count: u64,
    pub memory_allocated: u64,
}

/// Decodes the entry starting at `entry.offset + entry.entry_bits` and
/// advances the cursor to it. Shared by the mutable zone and the immutable
/// page search.
pub(crate) fn step_entry(
    memory: &[u8],
    coding: &DeltaCoding,
    list_start: u64,
    list_size: u32,
    entry: &mut DeltaEntry,
) -> Result<()> {
    if entry.at_end {
        return Err(KestrelError::BadState(
            "cannot advance past the end of a delta list".to_string(),
        ));
    }

    entry.offset += entry.entry_bits;
    if entry.offset >= list_size {
        entry.at_end = true;
        entry.delta = 0;
        entry.is_collision = false;
        if entry.offset != list_size {
            return Err(KestrelError::CorruptData(
                "next offset past end of delta list".to_string(),
            ));
        }
        return Ok(());
    }

    decode_delta(memory, coding, list_start, entry);

    if entry.offset + entry.entry_bits > list_size {
        warn!("decoded past the end of the delta list");
        return Err(KestrelError::CorruptData(
            "decoded past the end of the delta list".to_string(),
        ));
    }
    Ok(())
}

/// Decodes the delta at the cursor's current offset and updates the key.
fn decode_delta(memory: &[u8], coding: &DeltaCoding, list_start: u64, entry: &mut DeltaEntry) {
    let delta_offset = list_start + entry.offset as u64 + entry.value_bits as u64;
    let mut addr = (delta_offset / 8) as usize;
    let shift = (delta_offset % 8) as u32;
    let mut data = scan_word(memory, addr) >> shift;
    addr += 4;

    let mut key_bits = coding.min_bits;
    let mut delta = data & ((1u32 << key_bits) - 1);
    if delta >= coding.min_keys {
        data >>= key_bits;
        if data == 0 {
            key_bits = 32 - shift;
            loop {
                data = scan_word(memory, addr);
                if data != 0 || addr >= memory.len() {
                    break;
                }
                addr += 4;
                key_bits += 32;
            }
        }
        key_bits += data.trailing_zeros() + 1;
        delta += (key_bits - coding.min_bits - 1) * coding.incr_keys;
    }

    entry.delta = delta;
    entry.key = entry.key.wrapping_add(delta);

    // A delta of zero after the start of the list marks a collision entry.
    if delta == 0 && entry.offset > 0 {
        entry.is_collision = true;
        entry.entry_bits = entry.value_bits + key_bits + COLLISION_BITS;
    } else {
        entry.is_collision = false;
        entry.entry_bits = entry.value_bits + key_bits;
    }
}

/// Reads the full-name extension of a collision entry.
pub(crate) fn read_collision_name(
    memory: &[u8],
    list_start: u64,
    entry: &DeltaEntry,
) -> [u8; COLLISION_BYTES] {
    let offset = list_start + entry.offset as u64 + entry.entry_bits as u64 - COLLISION_BITS as u64;
    let addr = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let mut name = [0u8; COLLISION_BYTES];
    for (i, byte) in name.iter_mut().enumerate() {
        *byte = (load_le16(memory, addr + i) >> shift) as u8;
    }
    name
}

fn write_collision_name(memory: &mut [u8], list_start: u64, entry: &DeltaEntry, name: &[u8; 32]) {
    let offset = list_start + entry.offset as u64 + entry.entry_bits as u64 - COLLISION_BITS as u64;
    let addr = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let mask = !(0xFFu16 << shift);
    for (i, byte) in name.iter().enumerate() {
        let data = (load_le16(memory, addr + i) & mask) | ((*byte as u16) << shift);
        store_le16(memory, addr + i, data);
    }
}

/// Searches one raw delta list for the entry with the given key, resolving
/// collisions by full name. Returns the matching entry's payload.
pub(crate) fn search_list(
    memory: &[u8],
    coding: &DeltaCoding,
    value_bits: u32,
    list_start: u64,
    list_size: u32,
    key: u32,
    name: &RecordName,
) -> Result<Option<u32>> {
    let mut entry = DeltaEntry {
        list_number: 0,
        zone_index: 0,
        key: 0,
        delta: 0,
        offset: 0,
        entry_bits: 0,
        value_bits,
        is_collision: false,
        at_end: false,
        list_overflow: false,
    };

    loop {
        step_entry(memory, coding, list_start, list_size, &mut entry)?;
        if entry.at_end || entry.key >= key {
            break;
        }
    }

    if entry.at_end || entry.key != key {
        return Ok(None);
    }

    let base_value = get_field(memory, list_start + entry.offset as u64, value_bits);
    let mut collision = entry;
    loop {
        step_entry(memory, coding, list_start, list_size, &mut collision)?;
        if collision.at_end || !collision.is_collision {
            break;
        }
        if read_collision_name(memory, list_start, &collision) == name.0 {
            let value = get_field(memory, list_start + collision.offset as u64, value_bits);
            return Ok(Some(value));
        }
    }
    Ok(Some(base_value))
}

/// One zone of a mutable delta index: a contiguous range of delta lists in
/// a contiguous memory region, owned and mutated by a single thread.
#[derive(Debug)]
pub struct DeltaZone {
    pub(crate) memory: Vec<u8>,
    pub(crate) lists: Vec<DeltaList>,
    new_offsets: Vec<u64>,
    pub(crate) coding: DeltaCoding,
    pub(crate) value_bits: u32,
    pub(crate) first_list: u32,
    pub(crate) list_count: u32,
    pub(crate) record_count: u64,
    pub(crate) collision_count: u64,
    pub(crate) discard_count: u64,
    pub(crate) overflow_count: u64,
    pub(crate) rebalance_count: u64,
    pub(crate) tag: u8,
}

impl DeltaZone {
    /// Creates a zone holding `list_count` empty lists in `size` bytes of
    /// memory.
    pub fn new(
        size: usize,
        first_list: u32,
        list_count: u32,
        mean_delta: u32,
        payload_bits: u32,
        tag: u8,
    ) -> Self {
        let mut zone = Self {
            memory: vec![0u8; size],
            lists: vec![DeltaList::default(); list_count as usize + 2],
            new_offsets: vec![0u64; list_count as usize + 2],
            coding: DeltaCoding::new(mean_delta),
            value_bits: payload_bits,
            first_list,
            list_count,
            record_count: 0,
            collision_count: 0,
            discard_count: 0,
            overflow_count: 0,
            rebalance_count: 0,
            tag,
        };
        zone.reset();
        zone
    }

    /// Empties every list and spaces them evenly through the zone memory.
    pub fn reset(&mut self) {
        for list in self.lists.iter_mut() {
            *list = DeltaList::default();
        }

        // The tail guard list is all ones so decoding can never scan past
        // the end of the zone memory.
        let list_bits = self.memory.len() as u64 * 8 - GUARD_BITS as u64;
        let tail = self.list_count as usize + 1;
        self.lists[tail].start = list_bits;
        self.lists[tail].size = GUARD_BITS as u16;
        let guard_start = (list_bits / 8) as usize;
        for byte in &mut self.memory[guard_start..guard_start + GUARD_BYTES] {
            *byte = 0xFF;
        }

        let spacing = list_bits / self.list_count as u64;
        let mut offset = spacing / 2;
        for i in 1..=self.list_count as usize {
            self.lists[i].start = offset;
            offset += spacing;
        }

        self.discard_count += self.record_count;
        self.record_count = 0;
        self.collision_count = 0;
    }

    /// Returns the number of lists in this zone.
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    /// Returns the global index of this zone's first list.
    pub fn first_list(&self) -> u32 {
        self.first_list
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn collision_count(&self) -> u64 {
        self.collision_count
    }

    pub fn discard_count(&self) -> u64 {
        self.discard_count
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    fn list(&self, list_number: u32) -> &DeltaList {
        &self.lists[list_number as usize + 1]
    }

    /// Prepares a cursor for searching the given list for the given key,
    /// resuming from the list's remembered position when possible.
    pub fn start_search(&self, list_number: u32, key: u32) -> Result<DeltaEntry> {
        if list_number >= self.list_count {
            return Err(KestrelError::CorruptData(format!(
                "delta list number {} out of range {}",
                list_number, self.list_count
            )));
        }

        let list = self.list(list_number);
        let (start_key, start_offset) = if key > list.save_key {
            (list.save_key, list.save_offset as u32)
        } else {
            (0, 0)
        };

        Ok(DeltaEntry {
            list_number,
            zone_index: 0,
            key: start_key,
            delta: 0,
            offset: start_offset,
            entry_bits: 0,
            value_bits: self.value_bits,
            is_collision: false,
            at_end: false,
            list_overflow: false,
        })
    }

    /// Advances the cursor to the next entry and decodes it.
    pub fn next_entry(&self, entry: &mut DeltaEntry) -> Result<()> {
        let list = self.list(entry.list_number);
        step_entry(
            &self.memory,
            &self.coding,
            list.start,
            list.size as u32,
            entry,
        )
    }

    /// Remembers the cursor position so a later search of the same list can
    /// resume from here instead of the list head.
    pub fn remember_offset(&mut self, entry: &DeltaEntry) -> Result<()> {
        if entry.is_collision {
            return Err(KestrelError::BadState(
                "cannot remember a collision entry".to_string(),
            ));
        }
        let list = &mut self.lists[entry.list_number as usize + 1];
        list.save_key = entry.key - entry.delta;
        list.save_offset = entry.offset as u16;
        Ok(())
    }

    /// Finds the first entry with a key not less than `key`. When a name is
    /// supplied and an entry with the exact key exists, collision entries
    /// are resolved by comparing full names.
    pub fn get_entry(
        &mut self,
        list_number: u32,
        key: u32,
        name: Option<&RecordName>,
    ) -> Result<DeltaEntry> {
        let mut entry = self.start_search(list_number, key)?;
        loop {
            self.next_entry(&mut entry)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }
        self.remember_offset(&entry)?;

        if let Some(name) = name {
            if !entry.at_end && key == entry.key {
                let mut collision = entry;
                loop {
                    self.next_entry(&mut collision)?;
                    if collision.at_end || !collision.is_collision {
                        break;
                    }
                    let list_start = self.list(collision.list_number).start;
                    if read_collision_name(&self.memory, list_start, &collision) == name.0 {
                        entry = collision;
                        break;
                    }
                }
            }
        }

        Ok(entry)
    }

    /// Returns the full name stored in a collision entry.
    pub fn collision_name(&self, entry: &DeltaEntry) -> Result<[u8; COLLISION_BYTES]> {
        if entry.at_end {
            return Err(KestrelError::BadState(
                "entry is at the end of the delta list".to_string(),
            ));
        }
        if !entry.is_collision {
            return Err(KestrelError::BadState(
                "cannot get a full name from a non-collision entry".to_string(),
            ));
        }
        let list_start = self.list(entry.list_number).start;
        Ok(read_collision_name(&self.memory, list_start, entry))
    }

    /// Returns the payload of the entry under the cursor.
    pub fn entry_value(&self, entry: &DeltaEntry) -> u32 {
        let list_start = self.list(entry.list_number).start;
        get_field(
            &self.memory,
            list_start + entry.offset as u64,
            entry.value_bits,
        )
    }

    /// Overwrites the payload of the entry under the cursor.
    pub fn set_entry_value(&mut self, entry: &DeltaEntry, value: u32) -> Result<()> {
        if entry.at_end {
            return Err(KestrelError::BadState(
                "cannot set the value of an end-of-list entry".to_string(),
            ));
        }
        let value_mask = (1u32 << entry.value_bits) - 1;
        if value & value_mask != value {
            return Err(KestrelError::InvalidArgument(format!(
                "value {} does not fit in {} bits",
                value, entry.value_bits
            )));
        }
        let list_start = self.list(entry.list_number).start;
        set_field(
            value,
            &mut self.memory,
            list_start + entry.offset as u64,
            entry.value_bits,
        );
        Ok(())
    }

    fn set_delta(&self, entry: &mut DeltaEntry, delta: u32) {
        entry.delta = delta;
        entry.entry_bits = entry.value_bits + self.coding.key_bits(delta);
    }

    fn encode_entry(&mut self, entry: &DeltaEntry, value: u32, name: Option<&RecordName>) {
        let list_start = self.list(entry.list_number).start;
        let offset = list_start + entry.offset as u64;
        set_field(value, &mut self.memory, offset, entry.value_bits);
        self.encode_delta(entry, offset);
        if let Some(name) = name {
            write_collision_name(&mut self.memory, list_start, entry, &name.0);
        }
    }

    fn encode_delta(&mut self, entry: &DeltaEntry, entry_offset: u64) {
        let offset = entry_offset + entry.value_bits as u64;
        if entry.delta < self.coding.min_keys {
            set_field(entry.delta, &mut self.memory, offset, self.coding.min_bits);
            return;
        }

        let temp = entry.delta - self.coding.min_keys;
        let t1 = (temp % self.coding.incr_keys) + self.coding.min_keys;
        let t2 = temp / self.coding.incr_keys;
        set_field(t1, &mut self.memory, offset, self.coding.min_bits);
        set_zero(&mut self.memory, offset + self.coding.min_bits as u64, t2);
        set_field(
            1,
            &mut self.memory,
            offset + (self.coding.min_bits + t2) as u64,
            1,
        );
    }

    /// Creates a new entry at the cursor position. A collision entry (one
    /// whose key already exists under a different name) must supply the
    /// full record name.
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaEntry,
        key: u32,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<()> {
        if entry.is_collision {
            // Inserting a collision onto a collision entry only happens
            // when replaying a closed chapter during rebuild.
            return Err(KestrelError::DuplicateName);
        }

        if entry.offset < self.list(entry.list_number).save_offset as u32 {
            // The remembered position follows the insertion point and is
            // about to become stale.
            self.remember_offset(entry)?;
        }

        if let Some(_full_name) = name {
            // Insert a collision entry placed after the current entry.
            if entry.at_end {
                return Err(KestrelError::BadState(
                    "cannot insert a collision at the end of a list".to_string(),
                ));
            }
            if key != entry.key {
                return Err(KestrelError::InvalidArgument(
                    "incorrect key for collision entry".to_string(),
                ));
            }

            entry.offset += entry.entry_bits;
            self.set_delta(entry, 0);
            entry.is_collision = true;
            entry.entry_bits += COLLISION_BITS;
            self.insert_bits(entry, entry.entry_bits)?;
        } else if entry.at_end {
            // Insert a new entry at the end of the delta list.
            if key < entry.key {
                return Err(KestrelError::InvalidArgument(
                    "key precedes the end of the list".to_string(),
                ));
            }

            self.set_delta(entry, key - entry.key);
            entry.key = key;
            entry.at_end = false;
            self.insert_bits(entry, entry.entry_bits)?;
        } else {
            // Insert before the current entry, which requires re-encoding
            // the following entry's delta.
            if key >= entry.key {
                return Err(KestrelError::InvalidArgument(
                    "key does not precede the following entry".to_string(),
                ));
            }
            if key < entry.key - entry.delta {
                return Err(KestrelError::InvalidArgument(
                    "key would change the preceding entry's delta".to_string(),
                ));
            }

            let old_entry_size = entry.entry_bits;
            let mut next_entry = *entry;
            let next_value = self.entry_value(&next_entry);

            self.set_delta(entry, key - (entry.key - entry.delta));
            entry.key = key;
            let next_delta = next_entry.key - key;
            self.set_delta(&mut next_entry, next_delta);
            next_entry.offset += entry.entry_bits;
            // The two new entries are always bigger than the one replaced.
            let additional_size = entry.entry_bits + next_entry.entry_bits - old_entry_size;
            self.insert_bits(entry, additional_size)?;
            self.encode_entry(&next_entry, next_value, None);
        }

        self.encode_entry(entry, value, name);
        self.record_count += 1;
        if entry.is_collision {
            self.collision_count += 1;
        }
        Ok(())
    }

    /// Makes room for `size` more bits at the cursor position.
    fn insert_bits(&mut self, entry: &mut DeltaEntry, size: u32) -> Result<()> {
        let index = entry.list_number as usize + 1;
        let total_size = self.lists[index].size as u32;
        let before_size = entry.offset;
        let after_size = total_size - entry.offset;

        if total_size + size > DELTA_LIST_MAX_BITS {
            entry.list_overflow = true;
            self.overflow_count += 1;
            return Err(KestrelError::Overflow);
        }

        // Free bits in the gaps adjacent to this list.
        let free_before = self.lists[index].start
            - (self.lists[index - 1].start + self.lists[index - 1].size as u64);
        let free_after = self.lists[index + 1].start
            - (self.lists[index].start + self.lists[index].size as u64);

        let before_flag = if size as u64 <= free_before && size as u64 <= free_after {
            // Both gaps fit: move the smaller side, breaking ties toward
            // the larger gap.
            if before_size < after_size {
                true
            } else if after_size < before_size {
                false
            } else {
                free_before > free_after
            }
        } else if size as u64 <= free_before {
            true
        } else if size as u64 <= free_after {
            false
        } else {
            // Neither gap is big enough; rebalance the zone, opening the
            // extra space on the side that moves less data.
            let before = before_size < after_size;
            let mut growing_index = entry.list_number + 1;
            if !before {
                growing_index += 1;
            }
            self.extend(growing_index, ((size + 7) / 8) as u64)?;
            before
        };

        self.lists[index].size += size as u16;
        let (source, destination, count) = if before_flag {
            let source = self.lists[index].start;
            self.lists[index].start -= size as u64;
            (source, source - size as u64, before_size)
        } else {
            let source = self.lists[index].start + entry.offset as u64;
            (source, source + size as u64, after_size)
        };

        move_bits(&mut self.memory, source, destination, count);
        Ok(())
    }

    /// Removes the entry under the cursor, leaving the cursor on the
    /// following entry.
    pub fn remove_entry(&mut self, entry: &mut DeltaEntry) -> Result<()> {
        let mut next_entry = *entry;
        self.next_entry(&mut next_entry)?;

        if entry.is_collision {
            // A collision entry can simply be cut out.
            self.delete_bits(entry, entry.entry_bits);
            next_entry.offset = entry.offset;
            self.collision_count = self.collision_count.saturating_sub(1);
        } else if next_entry.at_end {
            // The last entry of the list can simply be cut out.
            self.delete_bits(entry, entry.entry_bits);
            next_entry.key -= entry.delta;
            next_entry.offset = entry.offset;
        } else {
            // The following entry's delta absorbs the removed one.
            let next_value = self.entry_value(&next_entry);
            let old_size = entry.entry_bits + next_entry.entry_bits;

            if next_entry.is_collision {
                next_entry.is_collision = false;
                self.collision_count = self.collision_count.saturating_sub(1);
            }

            let merged_delta = entry.delta + next_entry.delta;
            self.set_delta(&mut next_entry, merged_delta);
            next_entry.offset = entry.offset;
            // The one new entry is always smaller than the two replaced.
            self.delete_bits(entry, old_size - next_entry.entry_bits);
            self.encode_entry(&next_entry, next_value, None);
        }

        // Saturating: a restore parks the aggregate record counts on zone
        // zero, so another zone's counter may read zero while it still
        // holds entries.
        self.record_count = self.record_count.saturating_sub(1);
        self.discard_count += 1;
        *entry = next_entry;

        let list = &mut self.lists[entry.list_number as usize + 1];
        if entry.offset < list.save_offset as u32 {
            // The remembered position is no longer valid.
            list.save_key = 0;
            list.save_offset = 0;
        }
        Ok(())
    }

    /// Gives `size` bits at the cursor position back to the gaps.
    fn delete_bits(&mut self, entry: &DeltaEntry, size: u32) {
        let index = entry.list_number as usize + 1;
        let total_size = self.lists[index].size as u32;
        let before_size = entry.offset;
        let after_size = total_size - entry.offset - size;

        // Move the least data; tie-break toward the smaller gap.
        let before_flag = if before_size < after_size {
            true
        } else if after_size < before_size {
            false
        } else {
            let free_before = self.lists[index].start
                - (self.lists[index - 1].start + self.lists[index - 1].size as u64);
            let free_after = self.lists[index + 1].start
                - (self.lists[index].start + self.lists[index].size as u64);
            free_before < free_after
        };

        self.lists[index].size -= size as u16;
        let (source, destination, count) = if before_flag {
            let source = self.lists[index].start;
            self.lists[index].start += size as u64;
            (source, source + size as u64, before_size)
        } else {
            let destination = self.lists[index].start + entry.offset as u64;
            (destination + size as u64, destination, after_size)
        };

        move_bits(&mut self.memory, source, destination, count);
    }

    /// Rebalances the zone, opening `growing_size` extra bytes of space
    /// before the list with the given 1-based index.
    pub(crate) fn extend(&mut self, growing_index: u32, growing_size: u64) -> Result<()> {
        let mut used_space = growing_size;
        for list in &self.lists {
            used_space += list.byte_size() as u64;
        }

        if (self.memory.len() as u64) < used_space {
            return Err(KestrelError::Overflow);
        }

        self.compute_new_offsets(growing_index, growing_size, used_space);
        // The tail guard participates so its all-ones bits get copied too.
        self.rebalance(1, self.list_count as usize + 1);
        self.rebalance_count += 1;
        Ok(())
    }

    /// Computes new list start offsets with the residual free space spread
    /// evenly between lists.
    fn compute_new_offsets(&mut self, growing_index: u32, growing_size: u64, used_space: u64) {
        let count = self.list_count as usize;
        let spacing = (self.memory.len() as u64 - used_space) / self.list_count as u64;

        self.new_offsets[0] = 0;
        for i in 0..=count {
            self.new_offsets[i + 1] =
                self.new_offsets[i] + self.lists[i].byte_size() as u64 + spacing;
            self.new_offsets[i] = self.new_offsets[i] * 8 + self.lists[i].start % 8;
            if i == 0 {
                self.new_offsets[i + 1] -= spacing / 2;
            }
            if i + 1 == growing_index as usize {
                self.new_offsets[i + 1] += growing_size;
            }
        }
        self.new_offsets[count + 1] =
            self.memory.len() as u64 * 8 - self.lists[count + 1].size as u64;
    }

    /// Physically relocates lists to their new offsets. The half containing
    /// the growing gap moves first so no list is ever overwritten.
    fn rebalance(&mut self, first: usize, last: usize) {
        if first == last {
            let new_start = self.new_offsets[first];
            if self.lists[first].start != new_start {
                let source = self.lists[first].byte_start();
                self.lists[first].start = new_start;
                let destination = self.lists[first].byte_start();
                let length = self.lists[first].byte_size();
                self.memory.copy_within(source..source + length, destination);
            }
        } else {
            let middle = (first + last) / 2;
            if self.new_offsets[middle] > self.lists[middle].start {
                self.rebalance(middle + 1, last);
                self.rebalance(first, middle);
            } else {
                self.rebalance(first, middle);
                self.rebalance(middle + 1, last);
            }
        }
    }

    /// Recomputes list starts so that list sizes assigned by a restore fit
    /// with the residual free space spread evenly. No data is moved; the
    /// lists are about to be filled from the save streams.
    pub(crate) fn rebalance_restored_lists(&mut self) -> Result<()> {
        let mut used_space = 0u64;
        for list in &self.lists {
            used_space += list.byte_size() as u64;
        }
        if (self.memory.len() as u64) < used_space {
            return Err(KestrelError::CorruptData(
                "restored delta lists do not fit in zone memory".to_string(),
            ));
        }

        self.compute_new_offsets(0, 0, used_space);
        for i in 1..=self.list_count as usize + 1 {
            self.lists[i].start = self.new_offsets[i];
        }
        Ok(())
    }

    pub fn memory_allocated(&self) -> u64 {
        self.memory.len() as u64
            + (self.lists.len() * std::mem::size_of::<DeltaList>()) as u64
            + (self.new_offsets.len() * 8) as u64
    }
}

/// A mutable delta index: delta lists partitioned across one or more zones.
#[derive(Debug)]
pub struct DeltaIndex {
    pub(crate) zones: Vec<DeltaZone>,
    zone_count: u32,
    list_count: u32,
    lists_per_zone: u32,
    pub(crate) tag: u8,
}

/// Rounds the per-zone memory size up to an allocation boundary.
pub fn zone_memory_size(zone_count: u32, memory_size: u64) -> usize {
    let per_zone = memory_size as usize / zone_count as usize;
    (per_zone + ZONE_ALLOC_BOUNDARY - 1) & !(ZONE_ALLOC_BOUNDARY - 1)
}

/// Estimates the number of bits needed to hold the given number of entries.
pub fn compute_delta_index_size(entry_count: u64, mean_delta: u32, payload_bits: u32) -> u64 {
    let coding = DeltaCoding::new(mean_delta);
    // On average each delta codes in about min_bits + 1.5 bits.
    entry_count * (payload_bits + coding.min_bits + 1) as u64 + entry_count / 2
}

impl DeltaIndex {
    /// Creates a mutable delta index.
    pub fn new(
        zone_count: u32,
        list_count: u32,
        mean_delta: u32,
        payload_bits: u32,
        memory_size: u64,
        tag: u8,
    ) -> Result<Self> {
        let lists_per_zone = list_count.div_ceil(zone_count);
        let mut zones = Vec::with_capacity(zone_count as usize);

        for z in 0..zone_count {
            let first_list = z * lists_per_zone;
            if list_count <= first_list {
                return Err(KestrelError::InvalidArgument(format!(
                    "{} delta lists not enough for {} zones",
                    list_count, zone_count
                )));
            }
            let lists_in_zone = if z == zone_count - 1 {
                list_count - first_list
            } else {
                lists_per_zone
            };
            zones.push(DeltaZone::new(
                zone_memory_size(zone_count, memory_size),
                first_list,
                lists_in_zone,
                mean_delta,
                payload_bits,
                tag,
            ));
        }

        Ok(Self {
            zones,
            zone_count,
            list_count,
            lists_per_zone,
            tag,
        })
    }

    /// Empties every list in every zone.
    pub fn reset(&mut self) {
        for zone in &mut self.zones {
            zone.reset();
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    pub fn lists_per_zone(&self) -> u32 {
        self.lists_per_zone
    }

    /// Maps a global list number to (zone index, zone-local list number).
    pub fn zone_for_list(&self, list_number: u32) -> Result<(usize, u32)> {
        if list_number >= self.list_count {
            return Err(KestrelError::CorruptData(format!(
                "delta list number {} out of range {}",
                list_number, self.list_count
            )));
        }
        let zone = (list_number / self.lists_per_zone) as usize;
        Ok((zone, list_number - self.zones[zone].first_list))
    }

    pub fn zone(&self, zone: usize) -> &DeltaZone {
        &self.zones[zone]
    }

    pub fn zone_mut(&mut self, zone: usize) -> &mut DeltaZone {
        &mut self.zones[zone]
    }

    /// Finds the first entry with a key not less than `key` in a global
    /// list, resolving collisions by name when one is supplied.
    pub fn get_entry(
        &mut self,
        list_number: u32,
        key: u32,
        name: Option<&RecordName>,
    ) -> Result<DeltaEntry> {
        let (zone, local) = self.zone_for_list(list_number)?;
        let mut entry = self.zones[zone].get_entry(local, key, name)?;
        entry.zone_index = zone as u32;
        Ok(entry)
    }

    /// Creates an entry through a cursor returned by [`Self::get_entry`].
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaEntry,
        key: u32,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<()> {
        self.zones[entry.zone_index as usize].put_entry(entry, key, value, name)
    }

    /// Removes the entry under the cursor.
    pub fn remove_entry(&mut self, entry: &mut DeltaEntry) -> Result<()> {
        self.zones[entry.zone_index as usize].remove_entry(entry)
    }

    /// Returns the payload of the entry under the cursor.
    pub fn entry_value(&self, entry: &DeltaEntry) -> u32 {
        self.zones[entry.zone_index as usize].entry_value(entry)
    }

    /// Overwrites the payload of the entry under the cursor.
    pub fn set_entry_value(&mut self, entry: &DeltaEntry, value: u32) -> Result<()> {
        self.zones[entry.zone_index as usize].set_entry_value(entry, value)
    }

    /// Returns aggregate statistics across all zones.
    pub fn stats(&self) -> DeltaIndexStats {
        let mut stats = DeltaIndexStats::default();
        for zone in &self.zones {
            stats.record_count += zone.record_count;
            stats.collision_count += zone.collision_count;
            stats.discard_count += zone.discard_count;
            stats.overflow_count += zone.overflow_count;
            stats.rebalance_count += zone.rebalance_count;
            stats.list_count += zone.list_count as u64;
            stats.memory_allocated += zone.memory_allocated();
        }
        stats
    }
}
