//! The open chapter index.
//!
//! While a chapter is being committed, its records are indexed by a
//! single-zone mutable delta index keyed by the chapter delta list and
//! address bits of each name, with the record page number as the payload.
//! The chapter writer then packs this index into the chapter's immutable
//! index pages.

use kestrel_common::{Geometry, KestrelError, RecordName, Result};
use kestrel_delta::{compute_delta_index_size, DeltaIndex};
use tracing::warn;

/// The in-memory index of a closing chapter.
pub struct OpenChapterIndex {
    geometry: Geometry,
    delta_index: DeltaIndex,
    virtual_chapter: u64,
}

impl OpenChapterIndex {
    /// Creates an empty open chapter index.
    pub fn new(geometry: Geometry) -> Result<Self> {
        let memory_size = compute_delta_index_size(
            geometry.records_per_chapter as u64,
            geometry.chapter_mean_delta,
            geometry.chapter_payload_bits,
        ) / 8
            * 2;
        let delta_index = DeltaIndex::new(
            1,
            geometry.chapter_delta_lists(),
            geometry.chapter_mean_delta,
            geometry.chapter_payload_bits,
            memory_size,
            b'c',
        )?;
        Ok(Self {
            geometry,
            delta_index,
            virtual_chapter: 0,
        })
    }

    /// Empties the index for a new chapter.
    pub fn empty(&mut self, virtual_chapter: u64) {
        self.delta_index.reset();
        self.virtual_chapter = virtual_chapter;
    }

    /// The chapter currently being indexed.
    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    /// The underlying delta index, for page packing.
    pub fn delta_index(&self) -> &DeltaIndex {
        &self.delta_index
    }

    /// Returns the bytes of memory this index occupies.
    pub fn memory_allocated(&self) -> u64 {
        self.delta_index.stats().memory_allocated
    }

    /// Indexes one record: name to record page number. An overflowing
    /// delta list drops the entry; the record itself is still on its
    /// page, just not findable through this chapter's index.
    pub fn put(&mut self, name: &RecordName, record_page: u32) -> Result<()> {
        let list = name.chapter_delta_list(&self.geometry);
        let address = name.chapter_delta_address(&self.geometry);

        let mut entry = self.delta_index.get_entry(list, address, Some(name))?;
        let collision = !entry.at_end && entry.key == address;
        match self
            .delta_index
            .put_entry(&mut entry, address, record_page, collision.then_some(name))
        {
            Ok(()) => Ok(()),
            Err(KestrelError::Overflow) => {
                warn!(
                    "chapter {} delta list {} overflowed; entry dropped",
                    self.virtual_chapter, list
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Searches for a name, returning its record page number.
    pub fn search(&mut self, name: &RecordName) -> Result<Option<u32>> {
        let list = name.chapter_delta_list(&self.geometry);
        let address = name.chapter_delta_address(&self.geometry);
        let entry = self.delta_index.get_entry(list, address, Some(name))?;
        if entry.at_end || entry.key != address {
            return Ok(None);
        }
        Ok(Some(self.delta_index.entry_value(&entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_names(count: usize, seed: u64) -> Vec<RecordName> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let mut bytes = [0u8; 32];
                rng.fill(&mut bytes);
                RecordName(bytes)
            })
            .collect()
    }

    #[test]
    fn test_index_full_chapter() {
        let geometry = Geometry::small_test();
        let mut index = OpenChapterIndex::new(geometry).unwrap();
        index.empty(5);
        assert_eq!(index.virtual_chapter(), 5);

        let names = random_names(geometry.records_per_chapter as usize, 17);
        for (i, name) in names.iter().enumerate() {
            let page = i as u32 / geometry.records_per_page;
            index.put(name, page).unwrap();
        }

        for (i, name) in names.iter().enumerate() {
            let page = i as u32 / geometry.records_per_page;
            assert_eq!(index.search(name).unwrap(), Some(page), "record {}", i);
        }
    }

    #[test]
    fn test_absent_name() {
        let geometry = Geometry::small_test();
        let mut index = OpenChapterIndex::new(geometry).unwrap();
        index.empty(0);
        for name in random_names(20, 3) {
            index.put(&name, 0).unwrap();
        }
        let absent = random_names(1, 999)[0];
        assert_eq!(index.search(&absent).unwrap(), None);
    }

    #[test]
    fn test_empty_resets() {
        let geometry = Geometry::small_test();
        let mut index = OpenChapterIndex::new(geometry).unwrap();
        index.empty(0);
        let names = random_names(10, 5);
        for name in &names {
            index.put(name, 1).unwrap();
        }

        index.empty(1);
        assert_eq!(index.virtual_chapter(), 1);
        for name in &names {
            assert_eq!(index.search(name).unwrap(), None);
        }
    }
}
