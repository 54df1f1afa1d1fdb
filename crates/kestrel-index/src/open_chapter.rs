//! The open chapter.
//!
//! Each zone fills its own open chapter: an append-only record array
//! (1-based, so slot zero can mean "empty") reached through a power-of-two
//! open-addressing hash table. Deletion tombstones a slot; re-adding the
//! same name revives the tombstone without consuming a new record slot.
//!
//! A clean shutdown saves every zone's open chapter in one stream so the
//! next load can resume without replaying the newest chapter. Records are
//! interleaved round-robin across zones and redistributed on load, which
//! allows the zone count to change between runs.

use bytes::{Buf, BufMut, BytesMut};
use kestrel_common::record::{RecordData, RecordName, VolumeRecord, BYTES_PER_RECORD};
use kestrel_common::{Geometry, KestrelError, Result};
use std::io::{Read, Write};

/// Magic identifying a saved open chapter.
pub const OPEN_CHAPTER_MAGIC: &[u8; 8] = b"OPC-0001";

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Record number addressed by this hash slot; zero means empty.
    record_number: u32,
    /// Whether the record at this slot was deleted.
    deleted: bool,
}

/// One zone's share of the open chapter.
#[derive(Debug)]
pub struct OpenChapterZone {
    capacity: u32,
    size: u32,
    deletions: u32,
    /// Records indexed 1..=size.
    records: Vec<VolumeRecord>,
    deleted: Vec<bool>,
    slots: Vec<Slot>,
}

impl OpenChapterZone {
    /// Creates an empty open chapter for one of `zone_count` zones.
    pub fn new(geometry: &Geometry, zone_count: u32) -> Self {
        let capacity = (geometry.records_per_chapter / zone_count).max(1);
        let slot_count = (capacity as usize * 2).next_power_of_two();
        Self {
            capacity,
            size: 0,
            deletions: 0,
            records: vec![
                VolumeRecord {
                    name: RecordName([0; 32]),
                    data: RecordData::default(),
                };
                capacity as usize + 1
            ],
            deleted: vec![false; capacity as usize + 1],
            slots: vec![Slot::default(); slot_count],
        }
    }

    /// Maximum number of records this zone's open chapter can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of record slots consumed (deleted records still count).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of tombstoned records.
    pub fn deletions(&self) -> u32 {
        self.deletions
    }

    /// Empties the chapter for reuse.
    pub fn reset(&mut self) {
        self.size = 0;
        self.deletions = 0;
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        for deleted in &mut self.deleted {
            *deleted = false;
        }
    }

    /// Finds the slot index for a name: either the slot already holding
    /// it (tombstoned or not), or the first empty slot on its probe path.
    fn probe(&self, name: &RecordName) -> usize {
        let mask = self.slots.len() - 1;
        let mut slot_index = name.hash_slot(self.slots.len());
        loop {
            let slot = &self.slots[slot_index];
            if slot.record_number == 0 {
                return slot_index;
            }
            if self.records[slot.record_number as usize].name == *name {
                return slot_index;
            }
            slot_index = (slot_index + 1) & mask;
        }
    }

    /// Looks up a record.
    pub fn search(&self, name: &RecordName) -> Option<RecordData> {
        let slot = &self.slots[self.probe(name)];
        if slot.record_number == 0 || slot.deleted {
            return None;
        }
        Some(self.records[slot.record_number as usize].data)
    }

    /// Adds or replaces a record, returning the remaining capacity. A
    /// return of zero tells the caller to close the chapter.
    pub fn put(&mut self, name: &RecordName, data: &RecordData) -> u32 {
        let slot_index = self.probe(name);
        let slot = self.slots[slot_index];

        if slot.record_number != 0 {
            // The name is already here, possibly tombstoned: revive the
            // slot and replace the data without consuming capacity.
            let record_number = slot.record_number as usize;
            self.records[record_number].data = *data;
            if slot.deleted {
                self.slots[slot_index].deleted = false;
                self.deleted[record_number] = false;
                self.deletions -= 1;
            }
            return self.capacity - self.size;
        }

        if self.size >= self.capacity {
            return 0;
        }

        self.size += 1;
        let record_number = self.size as usize;
        self.records[record_number] = VolumeRecord {
            name: *name,
            data: *data,
        };
        self.deleted[record_number] = false;
        self.slots[slot_index] = Slot {
            record_number: self.size,
            deleted: false,
        };
        self.capacity - self.size
    }

    /// Tombstones a record so a later search will not find it.
    pub fn remove(&mut self, name: &RecordName) {
        let slot_index = self.probe(name);
        let slot = self.slots[slot_index];
        if slot.record_number == 0 || slot.deleted {
            return;
        }
        self.slots[slot_index].deleted = true;
        self.deleted[slot.record_number as usize] = true;
        self.deletions += 1;
    }

    /// Returns the record in a slot, or None if it was deleted. Record
    /// numbers run 1..=size.
    pub fn record(&self, record_number: u32) -> Option<&VolumeRecord> {
        if record_number == 0 || record_number > self.size {
            return None;
        }
        if self.deleted[record_number as usize] {
            return None;
        }
        Some(&self.records[record_number as usize])
    }
}

/// Saves every zone's open chapter in one stream, interleaving records
/// round-robin and skipping tombstones.
pub fn save_open_chapters<W: Write>(
    virtual_chapter: u64,
    zones: &[&OpenChapterZone],
    writer: &mut W,
) -> Result<()> {
    let mut records = Vec::new();
    let max_size = zones.iter().map(|z| z.size()).max().unwrap_or(0);
    for record_number in 1..=max_size {
        for zone in zones {
            if let Some(record) = zone.record(record_number) {
                records.push(*record);
            }
        }
    }

    let mut buffer = BytesMut::with_capacity(8 + 8 + 4 + records.len() * BYTES_PER_RECORD);
    buffer.put_slice(OPEN_CHAPTER_MAGIC);
    buffer.put_u64_le(virtual_chapter);
    buffer.put_u32_le(records.len() as u32);
    let mut encoded = [0u8; BYTES_PER_RECORD];
    for record in &records {
        record.encode(&mut encoded);
        buffer.put_slice(&encoded);
    }
    writer.write_all(&buffer)?;
    Ok(())
}

/// Loads a saved open chapter, returning the chapter number and records
/// for the caller to redistribute across its zones.
pub fn load_open_chapters<R: Read>(reader: &mut R) -> Result<(u64, Vec<VolumeRecord>)> {
    let mut header = [0u8; 8 + 8 + 4];
    reader.read_exact(&mut header)?;
    let mut buf = &header[..];

    let mut magic = [0u8; 8];
    buf.copy_to_slice(&mut magic);
    if &magic != OPEN_CHAPTER_MAGIC {
        return Err(KestrelError::CorruptData(
            "open chapter save has bad magic number".to_string(),
        ));
    }
    let virtual_chapter = buf.get_u64_le();
    let record_count = buf.get_u32_le() as usize;

    let mut data = vec![0u8; record_count * BYTES_PER_RECORD];
    reader.read_exact(&mut data)?;
    let records = data
        .chunks_exact(BYTES_PER_RECORD)
        .map(VolumeRecord::decode)
        .collect();
    Ok((virtual_chapter, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(seed: u8, i: u32) -> RecordName {
        let mut bytes = [seed; 32];
        bytes[8..12].copy_from_slice(&i.to_be_bytes());
        RecordName(bytes)
    }

    fn data(value: u8) -> RecordData {
        RecordData([value; 16])
    }

    fn test_zone() -> OpenChapterZone {
        OpenChapterZone::new(&Geometry::small_test(), 1)
    }

    #[test]
    fn test_put_and_search() {
        let mut zone = test_zone();
        assert_eq!(zone.capacity(), 128);

        let remaining = zone.put(&name(1, 0), &data(7));
        assert_eq!(remaining, 127);
        assert_eq!(zone.size(), 1);
        assert_eq!(zone.search(&name(1, 0)), Some(data(7)));
        assert_eq!(zone.search(&name(1, 1)), None);
    }

    #[test]
    fn test_put_same_name_overwrites() {
        let mut zone = test_zone();
        zone.put(&name(1, 0), &data(1));
        let remaining = zone.put(&name(1, 0), &data(2));
        assert_eq!(remaining, 127, "overwrite must not consume capacity");
        assert_eq!(zone.size(), 1);
        assert_eq!(zone.search(&name(1, 0)), Some(data(2)));
    }

    #[test]
    fn test_fill_to_capacity() {
        let mut zone = test_zone();
        let mut last_remaining = u32::MAX;
        for i in 0..zone.capacity() {
            last_remaining = zone.put(&name(2, i), &data(0));
        }
        assert_eq!(last_remaining, 0, "filling the chapter reports zero");
        assert_eq!(zone.size(), zone.capacity());

        for i in 0..zone.capacity() {
            assert!(zone.search(&name(2, i)).is_some(), "record {} lost", i);
        }
    }

    #[test]
    fn test_remove_then_search() {
        let mut zone = test_zone();
        zone.put(&name(3, 0), &data(1));
        zone.put(&name(3, 1), &data(2));

        zone.remove(&name(3, 0));
        assert_eq!(zone.search(&name(3, 0)), None);
        assert_eq!(zone.search(&name(3, 1)), Some(data(2)));
        assert_eq!(zone.deletions(), 1);
        assert_eq!(zone.size(), 2, "removal does not shrink the chapter");
    }

    #[test]
    fn test_tombstone_reuse() {
        // Deleting a name and posting it again revives the tombstone:
        // the hash slot is reused and the size is unchanged.
        let mut zone = test_zone();
        zone.put(&name(4, 0), &data(1));
        let size_before = zone.size();

        zone.remove(&name(4, 0));
        let remaining = zone.put(&name(4, 0), &data(9));

        assert_eq!(zone.size(), size_before);
        assert_eq!(remaining, zone.capacity() - size_before);
        assert_eq!(zone.deletions(), 0);
        assert_eq!(zone.search(&name(4, 0)), Some(data(9)));
    }

    #[test]
    fn test_deleted_records_skipped_in_iteration() {
        let mut zone = test_zone();
        zone.put(&name(5, 0), &data(1));
        zone.put(&name(5, 1), &data(2));
        zone.put(&name(5, 2), &data(3));
        zone.remove(&name(5, 1));

        let live: Vec<_> = (1..=zone.size()).filter_map(|i| zone.record(i)).collect();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn test_reset() {
        let mut zone = test_zone();
        for i in 0..10 {
            zone.put(&name(6, i), &data(0));
        }
        zone.remove(&name(6, 3));
        zone.reset();

        assert_eq!(zone.size(), 0);
        assert_eq!(zone.deletions(), 0);
        for i in 0..10 {
            assert_eq!(zone.search(&name(6, i)), None);
        }
    }

    #[test]
    fn test_capacity_split_across_zones() {
        let geometry = Geometry::small_test();
        let zone = OpenChapterZone::new(&geometry, 4);
        assert_eq!(zone.capacity(), geometry.records_per_chapter / 4);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let geometry = Geometry::small_test();
        let mut zone_a = OpenChapterZone::new(&geometry, 2);
        let mut zone_b = OpenChapterZone::new(&geometry, 2);
        for i in 0..5 {
            zone_a.put(&name(7, i), &data(i as u8));
        }
        for i in 0..3 {
            zone_b.put(&name(8, i), &data(i as u8 + 100));
        }
        zone_a.remove(&name(7, 2));

        let mut buffer = Vec::new();
        save_open_chapters(12, &[&zone_a, &zone_b], &mut buffer).unwrap();

        let (virtual_chapter, records) = load_open_chapters(&mut buffer.as_slice()).unwrap();
        assert_eq!(virtual_chapter, 12);
        assert_eq!(records.len(), 7, "tombstoned record is not saved");

        // Every live record survives with its data.
        for i in 0..5 {
            if i == 2 {
                continue;
            }
            let record = records.iter().find(|r| r.name == name(7, i)).unwrap();
            assert_eq!(record.data, data(i as u8));
        }
        for i in 0..3 {
            let record = records.iter().find(|r| r.name == name(8, i)).unwrap();
            assert_eq!(record.data, data(i as u8 + 100));
        }
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let zone = test_zone();
        let mut buffer = Vec::new();
        save_open_chapters(0, &[&zone], &mut buffer).unwrap();
        buffer[0] = b'X';
        assert!(load_open_chapters(&mut buffer.as_slice()).is_err());
    }
}
