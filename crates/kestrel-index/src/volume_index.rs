//! The volume index.
//!
//! Maps sampled record-name bits to the virtual chapter most likely to
//! hold the record. The map is a partitioned delta store: bits of the name
//! select a delta list, further bits form the key within that list, and
//! the payload stores the chapter number modulo a power of two. Each zone
//! keeps a rolling window `[low, high]` of live chapters; an entry whose
//! decoded chapter falls outside the window is treated as absent and is
//! pruned the next time a mutating search walks past it. A hit is only
//! ever advice: the chapter probe compares full names, so a stale entry
//! costs a wasted page read, never a wrong answer.
//!
//! Sparse geometries use two sub-indexes. Sample names (hooks) go to a
//! sub-index whose window spans every live chapter; everything else goes
//! to a sub-index spanning only the dense window, which is how records in
//! chapters that turn sparse silently leave the volume index.

use bytes::{Buf, BufMut, BytesMut};
use kestrel_common::geometry::bits_per;
use kestrel_common::{Geometry, IndexConfig, KestrelError, RecordName, Result};
use kestrel_delta::save::{restore_delta_zones, save_delta_zone};
use kestrel_delta::{compute_delta_index_size, zone_memory_size, DeltaEntry, DeltaZone};
use parking_lot::{Mutex, MutexGuard};
use std::io::{Read, Write};

/// Magic identifying a saved volume index zone.
pub const VOLUME_INDEX_MAGIC: &[u8; 8] = b"VI-00001";

/// Target number of records per volume index delta list.
const RECORDS_PER_LIST: u64 = 256;

const DENSE_TAG: u8 = b'v';
const HOOK_TAG: u8 = b'h';

/// Statistics for the volume index.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub memory_allocated: u64,
}

#[derive(Debug, Clone, Copy)]
struct SubIndexParams {
    list_count: u32,
    lists_per_zone: u32,
    address_bits: u32,
    address_mask: u64,
    chapter_mask: u64,
    /// Number of chapters the rolling window spans.
    span: u64,
    payload_bits: u32,
}

impl SubIndexParams {
    fn new(record_count: u64, mean_delta: u32, span: u64, zone_count: u32) -> Self {
        let raw_lists = record_count.div_ceil(RECORDS_PER_LIST).max(1) as u32;
        let lists_per_zone = raw_lists.div_ceil(zone_count);
        let list_count = lists_per_zone * zone_count;
        let address_bits = bits_per(mean_delta as u64 * RECORDS_PER_LIST - 1);
        let payload_bits = bits_per(span);
        Self {
            list_count,
            lists_per_zone,
            address_bits,
            address_mask: (1u64 << address_bits) - 1,
            chapter_mask: (1u64 << payload_bits) - 1,
            span,
            payload_bits,
        }
    }
}

struct SubZone {
    delta: DeltaZone,
    virtual_chapter_low: u64,
    virtual_chapter_high: u64,
}

/// One delta-store-backed map with a rolling chapter window.
struct VolumeSubIndex {
    params: SubIndexParams,
    zones: Vec<Mutex<SubZone>>,
    tag: u8,
}

impl VolumeSubIndex {
    fn new(record_count: u64, mean_delta: u32, span: u64, zone_count: u32, tag: u8) -> Self {
        let params = SubIndexParams::new(record_count, mean_delta, span, zone_count);
        let memory_size =
            compute_delta_index_size(record_count, mean_delta, params.payload_bits) / 8 * 2;
        let zone_size = zone_memory_size(zone_count, memory_size);

        let zones = (0..zone_count)
            .map(|z| {
                Mutex::new(SubZone {
                    delta: DeltaZone::new(
                        zone_size,
                        z * params.lists_per_zone,
                        params.lists_per_zone,
                        mean_delta,
                        params.payload_bits,
                        tag,
                    ),
                    virtual_chapter_low: 0,
                    virtual_chapter_high: 0,
                })
            })
            .collect();

        Self { params, zones, tag }
    }

    fn address(&self, name: &RecordName) -> u32 {
        (name.volume_index_bytes() & self.params.address_mask) as u32
    }

    fn list_for(&self, name: &RecordName) -> u32 {
        ((name.volume_index_bytes() >> self.params.address_bits)
            % self.params.list_count as u64) as u32
    }

    fn zone_for(&self, list: u32) -> u32 {
        list / self.params.lists_per_zone
    }

    /// Decodes a stored payload into a virtual chapter, or None when the
    /// entry has aged out of the window.
    fn decode_chapter(&self, zone: &SubZone, value: u32) -> Option<u64> {
        let high = zone.virtual_chapter_high;
        let distance = high.wrapping_sub(value as u64) & self.params.chapter_mask;
        if distance > high {
            return None;
        }
        let chapter = high - distance;
        (chapter >= zone.virtual_chapter_low).then_some(chapter)
    }

    /// Positions a cursor on the first live entry whose key is not less
    /// than `address`, pruning dead entries encountered on the way, then
    /// resolves collisions by full name. Returns None when a stale entry
    /// was pruned mid-resolution and the search must run again.
    fn position(
        &self,
        zone: &mut SubZone,
        local_list: u32,
        address: u32,
        name: &RecordName,
    ) -> Result<Option<DeltaEntry>> {
        let mut entry = zone.delta.start_search(local_list, address)?;
        zone.delta.next_entry(&mut entry)?;
        loop {
            if entry.at_end || entry.key > address {
                break;
            }
            let value = zone.delta.entry_value(&entry);
            if self.decode_chapter(zone, value).is_none() {
                zone.delta.remove_entry(&mut entry)?;
                continue;
            }
            if entry.key == address {
                break;
            }
            zone.delta.next_entry(&mut entry)?;
        }

        if !entry.is_collision {
            zone.delta.remember_offset(&entry)?;
        }

        if !entry.at_end && entry.key == address {
            let mut collision = entry;
            loop {
                zone.delta.next_entry(&mut collision)?;
                if collision.at_end || !collision.is_collision {
                    break;
                }
                if zone.delta.collision_name(&collision)? == name.0 {
                    let value = zone.delta.entry_value(&collision);
                    if self.decode_chapter(zone, value).is_none() {
                        // The exact name is stale; drop it and restart so
                        // the cursor lands on a clean insertion point.
                        zone.delta.remove_entry(&mut collision)?;
                        return Ok(None);
                    }
                    entry = collision;
                    break;
                }
            }
        }
        Ok(Some(entry))
    }

    fn get_record(&self, name: &RecordName, hook: bool) -> Result<VolumeIndexRecord> {
        let list = self.list_for(name);
        let zone_index = self.zone_for(list);
        let mut zone = self.zones[zone_index as usize].lock();
        let local_list = list - zone.delta.first_list();
        let address = self.address(name);

        let entry = loop {
            if let Some(entry) = self.position(&mut zone, local_list, address, name)? {
                break entry;
            }
        };

        let mut record = VolumeIndexRecord {
            name: *name,
            hook,
            zone: zone_index,
            address,
            entry,
            is_found: false,
            is_collision: false,
            virtual_chapter: 0,
        };
        if !entry.at_end && entry.key == address {
            let value = zone.delta.entry_value(&entry);
            if let Some(chapter) = self.decode_chapter(&zone, value) {
                record.is_found = true;
                record.is_collision = entry.is_collision;
                record.virtual_chapter = chapter;
            }
        }
        Ok(record)
    }

    /// Read-only lookup, used by triage. Does not prune.
    fn lookup(&self, name: &RecordName) -> Result<Option<u64>> {
        let list = self.list_for(name);
        let zone = self.zones[self.zone_for(list) as usize].lock();
        let local_list = list - zone.delta.first_list();
        let address = self.address(name);

        let mut entry = zone.delta.start_search(local_list, address)?;
        loop {
            zone.delta.next_entry(&mut entry)?;
            if entry.at_end || entry.key >= address {
                break;
            }
        }
        if entry.at_end || entry.key != address {
            return Ok(None);
        }

        let mut best = entry;
        let mut collision = entry;
        loop {
            zone.delta.next_entry(&mut collision)?;
            if collision.at_end || !collision.is_collision {
                break;
            }
            if zone.delta.collision_name(&collision)? == name.0 {
                best = collision;
                break;
            }
        }

        let value = zone.delta.entry_value(&best);
        Ok(self.decode_chapter(&zone, value))
    }

    fn lock_record_zone(&self, record: &VolumeIndexRecord) -> MutexGuard<'_, SubZone> {
        self.zones[record.zone as usize].lock()
    }

    fn check_window(&self, zone: &SubZone, virtual_chapter: u64) -> Result<()> {
        if virtual_chapter < zone.virtual_chapter_low
            || virtual_chapter > zone.virtual_chapter_high
        {
            return Err(KestrelError::InvalidArgument(format!(
                "chapter {} outside window [{}, {}]",
                virtual_chapter, zone.virtual_chapter_low, zone.virtual_chapter_high
            )));
        }
        Ok(())
    }

    fn put_record(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let mut zone = self.lock_record_zone(record);
        self.check_window(&zone, virtual_chapter)?;

        let value = (virtual_chapter & self.params.chapter_mask) as u32;
        let name = record.name;
        let mut entry = record.entry;
        zone.delta.put_entry(
            &mut entry,
            record.address,
            value,
            record.is_found.then_some(&name),
        )?;

        record.entry = entry;
        record.is_found = true;
        record.is_collision = entry.is_collision;
        record.virtual_chapter = virtual_chapter;
        Ok(())
    }

    fn set_record_chapter(
        &self,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        if !record.is_found {
            return Err(KestrelError::BadState(
                "cannot move an absent volume index record".to_string(),
            ));
        }
        let mut zone = self.lock_record_zone(record);
        self.check_window(&zone, virtual_chapter)?;
        let value = (virtual_chapter & self.params.chapter_mask) as u32;
        zone.delta.set_entry_value(&record.entry, value)?;
        record.virtual_chapter = virtual_chapter;
        Ok(())
    }

    fn remove_record(&self, record: &mut VolumeIndexRecord) -> Result<()> {
        if !record.is_found {
            return Err(KestrelError::BadState(
                "cannot remove an absent volume index record".to_string(),
            ));
        }
        let mut zone = self.lock_record_zone(record);
        let mut entry = record.entry;
        zone.delta.remove_entry(&mut entry)?;
        record.is_found = false;
        record.is_collision = false;
        Ok(())
    }

    fn set_zone_open_chapter(&self, zone_index: u32, virtual_chapter: u64) {
        let mut zone = self.zones[zone_index as usize].lock();
        zone.virtual_chapter_high = virtual_chapter;
        zone.virtual_chapter_low = (virtual_chapter + 1).saturating_sub(self.params.span);
    }
}

/// A search result positioned for in-place update.
#[derive(Debug, Clone, Copy)]
pub struct VolumeIndexRecord {
    name: RecordName,
    hook: bool,
    zone: u32,
    address: u32,
    entry: DeltaEntry,
    /// Whether an entry with this name's key exists.
    pub is_found: bool,
    /// Whether that entry carries this exact name.
    pub is_collision: bool,
    /// The chapter the entry refers to.
    pub virtual_chapter: u64,
}

/// The volume index: the in-memory map from names to chapters.
pub struct VolumeIndex {
    geometry: Geometry,
    zone_count: u32,
    sample_rate: u32,
    dense: VolumeSubIndex,
    hooks: Option<VolumeSubIndex>,
}

impl VolumeIndex {
    /// Creates the volume index for the given configuration.
    pub fn new(config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry;
        let zone_count = config.zone_count;
        let mean_delta = config.volume_index_mean_delta;
        let records_per_chapter = geometry.records_per_chapter as u64;

        let dense_span = if geometry.is_sparse() {
            geometry.dense_chapters_per_volume as u64
        } else {
            geometry.chapters_per_volume as u64
        };
        let dense = VolumeSubIndex::new(
            records_per_chapter * dense_span,
            mean_delta,
            dense_span,
            zone_count,
            DENSE_TAG,
        );

        let hooks = geometry.is_sparse().then(|| {
            let hook_records = (records_per_chapter * geometry.chapters_per_volume as u64
                / config.sparse_sample_rate as u64)
                .max(RECORDS_PER_LIST);
            VolumeSubIndex::new(
                hook_records,
                mean_delta,
                geometry.chapters_per_volume as u64,
                zone_count,
                HOOK_TAG,
            )
        });

        Ok(Self {
            geometry,
            zone_count,
            sample_rate: config.sparse_sample_rate,
            dense,
            hooks,
        })
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    /// Returns true iff this name's sample bits select the index. In a
    /// dense geometry every name is a sample.
    pub fn is_sample(&self, name: &RecordName) -> bool {
        match self.hooks {
            Some(_) => name.sampling_bytes() as u32 % self.sample_rate == 0,
            None => true,
        }
    }

    fn sub_for(&self, name: &RecordName) -> (&VolumeSubIndex, bool) {
        match &self.hooks {
            Some(hooks) if self.is_sample(name) => (hooks, true),
            _ => (&self.dense, false),
        }
    }

    fn sub_of(&self, record: &VolumeIndexRecord) -> &VolumeSubIndex {
        if record.hook {
            self.hooks.as_ref().expect("hook record without hook index")
        } else {
            &self.dense
        }
    }

    /// The zone every request for this name must be routed to.
    pub fn zone_of(&self, name: &RecordName) -> u32 {
        let (sub, _) = self.sub_for(name);
        sub.zone_for(sub.list_for(name))
    }

    /// Read-only search for the newest chapter known to hold this name.
    pub fn lookup(&self, name: &RecordName) -> Result<Option<u64>> {
        let (sub, _) = self.sub_for(name);
        sub.lookup(name)
    }

    /// Searches for this name and returns a record positioned for
    /// in-place update.
    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let (sub, hook) = self.sub_for(name);
        sub.get_record(name, hook)
    }

    /// Creates or extends the entry for the record's name.
    pub fn put_record(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        self.sub_of(record).put_record(record, virtual_chapter)
    }

    /// Repoints an existing entry at a different chapter.
    pub fn set_record_chapter(
        &self,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        self.sub_of(record).set_record_chapter(record, virtual_chapter)
    }

    /// Deletes the record's entry.
    pub fn remove_record(&self, record: &mut VolumeIndexRecord) -> Result<()> {
        self.sub_of(record).remove_record(record)
    }

    /// Advances one zone's window to a newly opened chapter. Entries that
    /// now decode outside the window are implicitly invalidated.
    pub fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) {
        self.dense.set_zone_open_chapter(zone, virtual_chapter);
        if let Some(hooks) = &self.hooks {
            hooks.set_zone_open_chapter(zone, virtual_chapter);
        }
    }

    /// Advances every zone's window, used by load and rebuild.
    pub fn set_open_chapter(&self, virtual_chapter: u64) {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, virtual_chapter);
        }
    }

    /// Empties the index. Rebuild starts from here after a failed load
    /// may have left a partial restore behind.
    pub fn reset(&self) {
        for sub in std::iter::once(&self.dense).chain(self.hooks.iter()) {
            for zone in &sub.zones {
                let mut zone = zone.lock();
                zone.delta.reset();
                zone.virtual_chapter_low = 0;
                zone.virtual_chapter_high = 0;
            }
        }
    }

    /// Thread-safe aggregate statistics.
    pub fn stats(&self) -> VolumeIndexStats {
        let mut stats = VolumeIndexStats::default();
        for sub in std::iter::once(&self.dense).chain(self.hooks.iter()) {
            for zone in &sub.zones {
                let zone = zone.lock();
                let delta = &zone.delta;
                stats.record_count += delta.record_count();
                stats.collision_count += delta.collision_count();
                stats.discard_count += delta.discard_count();
                stats.overflow_count += delta.overflow_count();
                stats.memory_allocated += delta.memory_allocated();
            }
        }
        stats
    }

    /// Saves one zone of the volume index: a wrapper header with the zone
    /// anchors, then the delta index streams of each sub-index.
    pub fn save_zone_to<W: Write>(&self, zone: u32, writer: &mut W) -> Result<()> {
        let mut header = BytesMut::new();
        header.put_slice(VOLUME_INDEX_MAGIC);
        header.put_u32_le(zone);
        header.put_u32_le(self.zone_count);
        header.put_u32_le(if self.hooks.is_some() { 2 } else { 1 });
        header.put_u32_le(self.sample_rate);
        for sub in std::iter::once(&self.dense).chain(self.hooks.iter()) {
            let sub_zone = sub.zones[zone as usize].lock();
            header.put_u64_le(sub_zone.virtual_chapter_low);
            header.put_u64_le(sub_zone.virtual_chapter_high);
        }
        writer.write_all(&header)?;

        for sub in std::iter::once(&self.dense).chain(self.hooks.iter()) {
            let sub_zone = sub.zones[zone as usize].lock();
            save_delta_zone(&sub_zone.delta, zone, self.zone_count, writer)?;
        }
        Ok(())
    }

    /// Restores the volume index from one stream per saved zone.
    pub fn restore_from<R: Read>(&self, readers: &mut [R]) -> Result<()> {
        let saved_zones = readers.len();
        let expected_subs = if self.hooks.is_some() { 2 } else { 1 };
        let mut anchors = vec![Vec::new(); expected_subs];

        for (z, reader) in readers.iter_mut().enumerate() {
            let mut fixed = [0u8; 8 + 4 * 4];
            reader.read_exact(&mut fixed)?;
            let mut buf = &fixed[..];

            let mut magic = [0u8; 8];
            buf.copy_to_slice(&mut magic);
            if &magic != VOLUME_INDEX_MAGIC {
                return Err(KestrelError::CorruptData(
                    "volume index save has bad magic number".to_string(),
                ));
            }
            let zone_number = buf.get_u32_le();
            let zone_count = buf.get_u32_le();
            let sub_count = buf.get_u32_le();
            let sample_rate = buf.get_u32_le();

            if zone_number != z as u32 || zone_count as usize != saved_zones {
                return Err(KestrelError::CorruptData(
                    "volume index save has inconsistent zones".to_string(),
                ));
            }
            if sub_count as usize != expected_subs || sample_rate != self.sample_rate {
                return Err(KestrelError::UnsupportedVersion(format!(
                    "volume index save has {} sub-indexes at rate {}",
                    sub_count, sample_rate
                )));
            }

            for anchor in anchors.iter_mut() {
                let mut pair = [0u8; 16];
                reader.read_exact(&mut pair)?;
                let mut buf = &pair[..];
                anchor.push((buf.get_u64_le(), buf.get_u64_le()));
            }
        }

        for (s, sub) in std::iter::once(&self.dense)
            .chain(self.hooks.iter())
            .enumerate()
        {
            let mut guards: Vec<_> = sub.zones.iter().map(|z| z.lock()).collect();
            {
                let mut zones: Vec<&mut DeltaZone> =
                    guards.iter_mut().map(|g| &mut g.delta).collect();
                restore_delta_zones(
                    &mut zones,
                    sub.params.lists_per_zone,
                    sub.params.list_count,
                    sub.tag,
                    readers,
                )?;
            }

            // Saved anchors apply directly when the zone count matches;
            // a rezoned index adopts the widest saved window everywhere.
            let same_zoning = guards.len() == saved_zones;
            let widest = (
                anchors[s].iter().map(|a| a.0).min().unwrap_or(0),
                anchors[s].iter().map(|a| a.1).max().unwrap_or(0),
            );
            for (z, guard) in guards.iter_mut().enumerate() {
                let (low, high) = if same_zoning { anchors[s][z] } else { widest };
                guard.virtual_chapter_low = low;
                guard.virtual_chapter_high = high;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::record::RECORD_NAME_SIZE;

    fn test_name(counter: u64) -> RecordName {
        // A cheap deterministic spread of the counter over all 32 bytes.
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        let mut x = counter.wrapping_add(0x9E37_79B9_7F4A_7C15);
        for chunk in bytes.chunks_mut(8) {
            x ^= x >> 30;
            x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
            x ^= x >> 27;
            x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
            x ^= x >> 31;
            chunk.copy_from_slice(&x.to_le_bytes());
        }
        RecordName(bytes)
    }

    fn dense_index(zone_count: u32) -> VolumeIndex {
        let mut config = IndexConfig::new(Geometry::small_test(), "./unused");
        config.zone_count = zone_count;
        let index = VolumeIndex::new(&config).unwrap();
        index.set_open_chapter(0);
        index
    }

    #[test]
    fn test_put_then_lookup() {
        let index = dense_index(1);
        let name = test_name(1);

        assert_eq!(index.lookup(&name).unwrap(), None);
        let mut record = index.get_record(&name).unwrap();
        assert!(!record.is_found);
        index.put_record(&mut record, 0).unwrap();

        assert_eq!(index.lookup(&name).unwrap(), Some(0));
        let record = index.get_record(&name).unwrap();
        assert!(record.is_found);
        assert_eq!(record.virtual_chapter, 0);
    }

    #[test]
    fn test_many_names_roundtrip() {
        let index = dense_index(1);
        index.set_open_chapter(3);
        for i in 0..2000u64 {
            let mut record = index.get_record(&test_name(i)).unwrap();
            index.put_record(&mut record, 3).unwrap();
        }
        for i in 0..2000u64 {
            assert_eq!(index.lookup(&test_name(i)).unwrap(), Some(3), "name {}", i);
        }
        assert_eq!(index.stats().record_count, 2000);
    }

    #[test]
    fn test_set_record_chapter() {
        let index = dense_index(1);
        index.set_open_chapter(5);
        let name = test_name(7);
        let mut record = index.get_record(&name).unwrap();
        index.put_record(&mut record, 2).unwrap();

        let mut record = index.get_record(&name).unwrap();
        index.set_record_chapter(&mut record, 5).unwrap();
        assert_eq!(index.lookup(&name).unwrap(), Some(5));
    }

    #[test]
    fn test_remove_record() {
        let index = dense_index(1);
        let name = test_name(9);
        let mut record = index.get_record(&name).unwrap();
        index.put_record(&mut record, 0).unwrap();

        let mut record = index.get_record(&name).unwrap();
        index.remove_record(&mut record).unwrap();
        assert_eq!(index.lookup(&name).unwrap(), None);
        assert!(!index.get_record(&name).unwrap().is_found);
    }

    #[test]
    fn test_window_invalidation() {
        // Entries referring to chapters that fall out of the window are
        // implicitly forgotten as the open chapter advances.
        let index = dense_index(1);
        let name = test_name(11);
        let mut record = index.get_record(&name).unwrap();
        index.put_record(&mut record, 0).unwrap();
        assert_eq!(index.lookup(&name).unwrap(), Some(0));

        // The small geometry has 10 chapters; advance past the window.
        index.set_open_chapter(10);
        assert_eq!(index.lookup(&name).unwrap(), None);
        assert!(!index.get_record(&name).unwrap().is_found);
    }

    #[test]
    fn test_zone_routing_is_stable() {
        let index = dense_index(4);
        for i in 0..100u64 {
            let name = test_name(i);
            let zone = index.zone_of(&name);
            assert!(zone < 4);
            assert_eq!(index.zone_of(&name), zone);
        }
    }

    #[test]
    fn test_put_outside_window_rejected() {
        let index = dense_index(1);
        index.set_open_chapter(2);
        let name = test_name(13);
        let mut record = index.get_record(&name).unwrap();
        assert!(index.put_record(&mut record, 7).is_err());
    }

    #[test]
    fn test_dense_geometry_all_names_sampled() {
        let index = dense_index(1);
        for i in 0..50u64 {
            assert!(index.is_sample(&test_name(i)));
        }
    }

    fn sparse_index() -> VolumeIndex {
        let geometry = Geometry::new(3072, 2, 10, 8).unwrap();
        let mut config = IndexConfig::new(geometry, "./unused");
        config.sparse_sample_rate = 4;
        let index = VolumeIndex::new(&config).unwrap();
        index.set_open_chapter(0);
        index
    }

    #[test]
    fn test_sparse_sampling() {
        let index = sparse_index();
        let sampled = (0..1000u64)
            .filter(|i| index.is_sample(&test_name(*i)))
            .count();
        // Roughly one in four names is a hook.
        assert!(sampled > 150 && sampled < 350, "{} hooks", sampled);
    }

    #[test]
    fn test_sparse_hook_outlives_dense_window() {
        let index = sparse_index();
        // Find a hook and a non-hook.
        let hook = (0..).map(test_name).find(|n| index.is_sample(n)).unwrap();
        let plain = (0..)
            .map(test_name)
            .find(|n| !index.is_sample(n))
            .unwrap();

        let mut record = index.get_record(&hook).unwrap();
        index.put_record(&mut record, 0).unwrap();
        let mut record = index.get_record(&plain).unwrap();
        index.put_record(&mut record, 0).unwrap();

        // Both resolve while chapter 0 is dense (dense window is 2).
        index.set_open_chapter(1);
        assert_eq!(index.lookup(&hook).unwrap(), Some(0));
        assert_eq!(index.lookup(&plain).unwrap(), Some(0));

        // Once chapter 0 is sparse, only the hook remains visible.
        index.set_open_chapter(3);
        assert_eq!(index.lookup(&hook).unwrap(), Some(0));
        assert_eq!(index.lookup(&plain).unwrap(), None);
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let index = dense_index(2);
        index.set_open_chapter(4);
        for i in 0..500u64 {
            let mut record = index.get_record(&test_name(i)).unwrap();
            index.put_record(&mut record, 2 + (i % 3)).unwrap();
        }

        let mut streams = Vec::new();
        for z in 0..2 {
            let mut buffer = Vec::new();
            index.save_zone_to(z, &mut buffer).unwrap();
            streams.push(buffer);
        }

        let restored = dense_index(2);
        let mut readers: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        restored.restore_from(&mut readers).unwrap();

        for i in 0..500u64 {
            assert_eq!(
                restored.lookup(&test_name(i)).unwrap(),
                index.lookup(&test_name(i)).unwrap(),
                "name {}",
                i
            );
        }
        assert_eq!(
            restored.stats().record_count,
            index.stats().record_count
        );
    }

    #[test]
    fn test_restore_rejects_bad_magic() {
        let index = dense_index(1);
        let mut buffer = Vec::new();
        index.save_zone_to(0, &mut buffer).unwrap();
        buffer[0] = b'X';

        let restored = dense_index(1);
        let mut readers = vec![buffer.as_slice()];
        assert!(restored.restore_from(&mut readers).is_err());
    }
}
