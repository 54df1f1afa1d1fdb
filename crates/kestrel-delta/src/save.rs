//! Delta index persistence.
//!
//! Each zone is saved as an independent stream:
//!
//! - a fixed header: the magic `"DI-00002"`, then little-endian
//!   `u32 zone_number`, `u32 zone_count`, `u32 first_list`,
//!   `u32 list_count`, `u64 record_count`, `u64 collision_count`;
//! - `list_count` little-endian `u16` list sizes in bits;
//! - for every non-empty list, a save record
//!   `{ u8 tag, u8 bit_offset, u16 byte_count, u32 list_index }` followed
//!   by the list's raw bit-stream bytes;
//! - a sentinel save record whose tag is `'z'`.
//!
//! Restore reads the headers from every stream first, validating that
//! together they describe a contiguous, non-overlapping set of lists, then
//! distributes the list sizes to the zones that own those lists *now* — the
//! zone count may differ from the one that wrote the save — and finally
//! scatters the list data as the save records arrive.

use crate::bits::{transfer_bits, DELTA_LIST_MAX_BYTE_COUNT};
use crate::index::{zone_memory_size, DeltaIndex, DeltaZone};
use bytes::{Buf, BufMut, BytesMut};
use kestrel_common::{KestrelError, Result};
use std::io::{Read, Write};
use tracing::warn;

/// Magic identifying a saved delta index zone.
pub const DELTA_INDEX_MAGIC: &[u8; 8] = b"DI-00002";

/// Tag of the sentinel save record terminating a zone stream.
const GUARD_TAG: u8 = b'z';

const HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 8 + 8;
const SAVE_INFO_SIZE: usize = 8;

struct DeltaIndexHeader {
    zone_number: u32,
    zone_count: u32,
    first_list: u32,
    list_count: u32,
    record_count: u64,
    collision_count: u64,
}

fn read_exact<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<()> {
    reader.read_exact(buffer).map_err(|e| {
        warn!("failed to read delta index data: {}", e);
        KestrelError::Io(e)
    })
}

fn read_header<R: Read>(reader: &mut R) -> Result<DeltaIndexHeader> {
    let mut buffer = [0u8; HEADER_SIZE];
    read_exact(reader, &mut buffer)?;
    let mut buf = &buffer[..];

    let mut magic = [0u8; 8];
    buf.copy_to_slice(&mut magic);
    if &magic != DELTA_INDEX_MAGIC {
        return Err(KestrelError::CorruptData(
            "delta index file has bad magic number".to_string(),
        ));
    }

    Ok(DeltaIndexHeader {
        zone_number: buf.get_u32_le(),
        zone_count: buf.get_u32_le(),
        first_list: buf.get_u32_le(),
        list_count: buf.get_u32_le(),
        record_count: buf.get_u64_le(),
        collision_count: buf.get_u64_le(),
    })
}

/// Saves one zone of a delta index to a stream.
pub fn save_delta_zone<W: Write>(
    zone: &DeltaZone,
    zone_number: u32,
    zone_count: u32,
    writer: &mut W,
) -> Result<()> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.put_slice(DELTA_INDEX_MAGIC);
    header.put_u32_le(zone_number);
    header.put_u32_le(zone_count);
    header.put_u32_le(zone.first_list());
    header.put_u32_le(zone.list_count());
    header.put_u64_le(zone.record_count());
    header.put_u64_le(zone.collision_count());
    writer.write_all(&header)?;

    for i in 0..zone.list_count() as usize {
        let size = zone.lists[i + 1].size;
        writer.write_all(&size.to_le_bytes())?;
    }

    for i in 0..zone.list_count() {
        let list = zone.lists[i as usize + 1];
        if list.size == 0 {
            continue;
        }

        let bit_offset = (list.start % 8) as u8;
        let byte_count = ((bit_offset as u64 + list.size as u64 + 7) / 8) as u16;
        let byte_start = (list.start / 8) as usize;

        let mut record = BytesMut::with_capacity(SAVE_INFO_SIZE);
        record.put_u8(zone.tag);
        record.put_u8(bit_offset);
        record.put_u16_le(byte_count);
        record.put_u32_le(zone.first_list() + i);
        writer.write_all(&record)?;
        writer.write_all(&zone.memory[byte_start..byte_start + byte_count as usize])?;
    }

    let mut guard = BytesMut::zeroed(SAVE_INFO_SIZE);
    guard[0] = GUARD_TAG;
    writer.write_all(&guard)?;
    Ok(())
}

/// Restores a set of zones from the streams of a previous save.
///
/// `zones` is the full set of zones of the index being restored, in order;
/// `readers` holds one stream per zone of the *saved* index. A list's
/// owning zone after restore may differ from the zone that wrote it.
pub fn restore_delta_zones<R: Read>(
    zones: &mut [&mut DeltaZone],
    lists_per_zone: u32,
    total_list_count: u32,
    tag: u8,
    readers: &mut [R],
) -> Result<()> {
    let reader_count = readers.len();
    let mut first_lists = vec![0u32; reader_count];
    let mut list_counts = vec![0u32; reader_count];
    let mut record_count = 0u64;
    let mut collision_count = 0u64;
    let mut list_next = 0u32;

    for (z, reader) in readers.iter_mut().enumerate() {
        let header = read_header(reader)?;

        if header.zone_count as usize != reader_count {
            return Err(KestrelError::CorruptData(format!(
                "delta index files contain mismatched zone counts ({}, {})",
                reader_count, header.zone_count
            )));
        }
        if header.zone_number != z as u32 {
            return Err(KestrelError::CorruptData(format!(
                "delta index zone {} found in slot {}",
                header.zone_number, z
            )));
        }
        if header.first_list != list_next {
            return Err(KestrelError::CorruptData(format!(
                "delta index file for zone {} starts with list {} instead of list {}",
                z, header.first_list, list_next
            )));
        }

        first_lists[z] = header.first_list;
        list_counts[z] = header.list_count;
        record_count += header.record_count;
        collision_count += header.collision_count;
        list_next += header.list_count;
    }

    if list_next != total_list_count {
        return Err(KestrelError::CorruptData(format!(
            "delta index files contain {} delta lists instead of {}",
            list_next, total_list_count
        )));
    }
    if collision_count > record_count {
        return Err(KestrelError::CorruptData(format!(
            "delta index files contain {} collisions and {} records",
            collision_count, record_count
        )));
    }

    for zone in zones.iter_mut() {
        zone.reset();
    }
    zones[0].record_count = record_count;
    zones[0].collision_count = collision_count;

    // Distribute the list sizes to the zones that own the lists now.
    let mut load_lists = vec![0u32; reader_count];
    for (z, reader) in readers.iter_mut().enumerate() {
        for i in 0..list_counts[z] {
            let mut size_data = [0u8; 2];
            read_exact(reader, &mut size_data)?;
            let list_size = u16::from_le_bytes(size_data);
            if list_size > 0 {
                load_lists[z] += 1;
            }

            let list_number = first_lists[z] + i;
            let new_zone = (list_number / lists_per_zone) as usize;
            let local = (list_number - zones[new_zone].first_list()) as usize;
            zones[new_zone].lists[local + 1].size = list_size;
        }
    }

    // Make room for the incoming list data.
    for zone in zones.iter_mut() {
        zone.rebalance_restored_lists()?;
    }

    // Scatter the list data to its new homes.
    let mut data = vec![0u8; DELTA_LIST_MAX_BYTE_COUNT];
    for (z, reader) in readers.iter_mut().enumerate() {
        while load_lists[z] > 0 {
            restore_list_data(zones, lists_per_zone, total_list_count, tag, reader, &mut data)?;
            load_lists[z] -= 1;
        }
    }

    // Each stream must end with the sentinel record.
    for reader in readers.iter_mut() {
        let mut buffer = [0u8; SAVE_INFO_SIZE];
        read_exact(reader, &mut buffer)?;
        if buffer[0] != GUARD_TAG {
            return Err(KestrelError::CorruptData(
                "missing guard delta list record".to_string(),
            ));
        }
    }

    Ok(())
}

fn restore_list_data<R: Read>(
    zones: &mut [&mut DeltaZone],
    lists_per_zone: u32,
    total_list_count: u32,
    tag: u8,
    reader: &mut R,
    data: &mut [u8],
) -> Result<()> {
    let mut buffer = [0u8; SAVE_INFO_SIZE];
    read_exact(reader, &mut buffer)?;
    let save_tag = buffer[0];
    let bit_offset = buffer[1];
    let byte_count = u16::from_le_bytes([buffer[2], buffer[3]]);
    let index = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);

    if bit_offset >= 8 || byte_count as usize > DELTA_LIST_MAX_BYTE_COUNT {
        return Err(KestrelError::CorruptData(
            "corrupt delta list data".to_string(),
        ));
    }
    if save_tag != tag {
        return Err(KestrelError::CorruptData(
            "delta list data has the wrong tag".to_string(),
        ));
    }
    if index >= total_list_count {
        return Err(KestrelError::CorruptData(format!(
            "invalid delta list number {} of {}",
            index, total_list_count
        )));
    }

    read_exact(reader, &mut data[..byte_count as usize])?;

    let zone = &mut zones[(index / lists_per_zone) as usize];
    let local = index - zone.first_list();
    if local >= zone.list_count() {
        return Err(KestrelError::CorruptData(format!(
            "invalid delta list number {} not in zone range",
            index
        )));
    }

    let list = zone.lists[local as usize + 1];
    if list.size == 0 {
        return Err(KestrelError::CorruptData(format!(
            "unexpected delta list number {}",
            index
        )));
    }

    let expected = ((bit_offset as u64 + list.size as u64 + 7) / 8) as u16;
    if byte_count != expected {
        return Err(KestrelError::CorruptData(format!(
            "unexpected delta list size {} != {}",
            byte_count, expected
        )));
    }

    transfer_bits(
        data,
        bit_offset as u64,
        &mut zone.memory,
        list.start,
        list.size as u32,
    );
    Ok(())
}

/// Upper bound on the bytes one zone's save stream can occupy.
pub fn compute_save_bytes(list_count: u32, memory_size: u64) -> u64 {
    HEADER_SIZE as u64
        + list_count as u64 * (SAVE_INFO_SIZE as u64 + 2)
        + zone_memory_size(1, memory_size) as u64
        + SAVE_INFO_SIZE as u64
}

impl DeltaIndex {
    /// Saves one zone of this index to a stream.
    pub fn save_zone_to<W: Write>(&self, zone: usize, writer: &mut W) -> Result<()> {
        save_delta_zone(&self.zones[zone], zone as u32, self.zone_count(), writer)
    }

    /// Restores this index from the streams of a previous save. The number
    /// of streams is the zone count of the saved index, which may differ
    /// from this index's zone count.
    pub fn restore_from<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        let lists_per_zone = self.lists_per_zone();
        let list_count = self.list_count();
        let tag = self.tag;
        let mut zones: Vec<&mut DeltaZone> = self.zones.iter_mut().collect();
        restore_delta_zones(&mut zones, lists_per_zone, list_count, tag, readers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::record::RecordName;

    fn filled_index(zone_count: u32, list_count: u32) -> DeltaIndex {
        let mut index =
            DeltaIndex::new(zone_count, list_count, 512, 12, 256 * 1024, b'v').unwrap();
        for list in 0..list_count {
            for i in 0..30u32 {
                let key = i * 97 + list;
                let mut entry = index.get_entry(list, key, None).unwrap();
                index
                    .put_entry(&mut entry, key, (key * 7) % 4096, None)
                    .unwrap();
            }
        }
        index
    }

    fn save_all(index: &DeltaIndex) -> Vec<Vec<u8>> {
        (0..index.zone_count() as usize)
            .map(|z| {
                let mut buffer = Vec::new();
                index.save_zone_to(z, &mut buffer).unwrap();
                buffer
            })
            .collect()
    }

    fn verify_contents(index: &mut DeltaIndex, list_count: u32) {
        for list in 0..list_count {
            for i in 0..30u32 {
                let key = i * 97 + list;
                let entry = index.get_entry(list, key, None).unwrap();
                assert!(!entry.at_end && entry.key == key, "lost list {} key {}", list, key);
                assert_eq!(index.entry_value(&entry), (key * 7) % 4096);
            }
        }
    }

    #[test]
    fn test_save_restore_single_zone() {
        let index = filled_index(1, 8);
        let saved = save_all(&index);
        let stats_before = index.stats();

        let mut restored = DeltaIndex::new(1, 8, 512, 12, 256 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        restored.restore_from(&mut readers).unwrap();

        assert_eq!(restored.stats().record_count, stats_before.record_count);
        verify_contents(&mut restored, 8);
    }

    #[test]
    fn test_save_restore_rezoning() {
        // Save with two zones, restore into three: lists are redistributed
        // to their new owning zones.
        let index = filled_index(2, 12);
        let saved = save_all(&index);

        let mut restored = DeltaIndex::new(3, 12, 512, 12, 256 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        restored.restore_from(&mut readers).unwrap();
        verify_contents(&mut restored, 12);
    }

    #[test]
    fn test_restore_rejects_bad_magic() {
        let index = filled_index(1, 4);
        let mut saved = save_all(&index);
        saved[0][0] = b'X';

        let mut restored = DeltaIndex::new(1, 4, 512, 12, 256 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        let result = restored.restore_from(&mut readers);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_restore_rejects_wrong_tag() {
        let index = filled_index(1, 4);
        let saved = save_all(&index);

        // An index with a different tag refuses this data.
        let mut restored = DeltaIndex::new(1, 4, 512, 12, 256 * 1024, b'x').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        let result = restored.restore_from(&mut readers);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_restore_rejects_truncated_stream() {
        let index = filled_index(1, 4);
        let mut saved = save_all(&index);
        let len = saved[0].len();
        saved[0].truncate(len - 12);

        let mut restored = DeltaIndex::new(1, 4, 512, 12, 256 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        assert!(restored.restore_from(&mut readers).is_err());
    }

    #[test]
    fn test_restore_rejects_list_count_mismatch() {
        let index = filled_index(1, 4);
        let saved = save_all(&index);

        let mut restored = DeltaIndex::new(1, 6, 512, 12, 256 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        let result = restored.restore_from(&mut readers);
        assert!(matches!(result, Err(KestrelError::CorruptData(_))));
    }

    #[test]
    fn test_save_preserves_collisions() {
        let mut index = DeltaIndex::new(1, 2, 512, 12, 128 * 1024, b'v').unwrap();
        let name_a = RecordName([0x11; 32]);
        let name_b = RecordName([0x22; 32]);
        let mut entry = index.get_entry(0, 50, Some(&name_a)).unwrap();
        index.put_entry(&mut entry, 50, 100, None).unwrap();
        let mut entry = index.get_entry(0, 50, Some(&name_b)).unwrap();
        index.put_entry(&mut entry, 50, 200, Some(&name_b)).unwrap();

        let saved = save_all(&index);
        let mut restored = DeltaIndex::new(1, 2, 512, 12, 128 * 1024, b'v').unwrap();
        let mut readers: Vec<&[u8]> = saved.iter().map(|s| s.as_slice()).collect();
        restored.restore_from(&mut readers).unwrap();

        let entry = restored.get_entry(0, 50, Some(&name_a)).unwrap();
        assert_eq!(restored.entry_value(&entry), 100);
        let entry = restored.get_entry(0, 50, Some(&name_b)).unwrap();
        assert!(entry.is_collision);
        assert_eq!(restored.entry_value(&entry), 200);
        assert_eq!(restored.stats().collision_count, 1);
    }
}
