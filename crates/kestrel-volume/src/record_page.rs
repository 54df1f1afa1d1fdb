//! Record page encoding and search.
//!
//! A record page holds `records_per_page` full records, sorted by name so
//! that a probe can binary search. Pages of a short chapter are padded
//! with zero records, which sort ahead of real names and are never the
//! subject of a lookup.

use kestrel_common::record::{RecordData, RecordName, VolumeRecord, BYTES_PER_RECORD};
use kestrel_common::{Geometry, KestrelError, Result};

/// Builds one record page from the given records.
pub fn encode_record_page(geometry: &Geometry, records: &[VolumeRecord]) -> Result<Vec<u8>> {
    let records_per_page = geometry.records_per_page as usize;
    if records.len() > records_per_page {
        return Err(KestrelError::InvalidArgument(format!(
            "{} records do not fit on a page of {}",
            records.len(),
            records_per_page
        )));
    }

    let mut sorted = vec![
        VolumeRecord {
            name: RecordName([0; 32]),
            data: RecordData::default(),
        };
        records_per_page
    ];
    sorted[..records.len()].copy_from_slice(records);
    sorted.sort_unstable_by(|a, b| a.name.0.cmp(&b.name.0));

    let mut page = vec![0u8; geometry.bytes_per_page];
    for (i, record) in sorted.iter().enumerate() {
        record.encode(&mut page[i * BYTES_PER_RECORD..(i + 1) * BYTES_PER_RECORD]);
    }
    Ok(page)
}

/// Binary searches a record page for a name.
pub fn search_record_page(
    geometry: &Geometry,
    page: &[u8],
    name: &RecordName,
) -> Option<RecordData> {
    let mut low = 0usize;
    let mut high = geometry.records_per_page as usize;
    while low < high {
        let middle = (low + high) / 2;
        let offset = middle * BYTES_PER_RECORD;
        let candidate = &page[offset..offset + 32];
        match candidate.cmp(&name.0[..]) {
            std::cmp::Ordering::Less => low = middle + 1,
            std::cmp::Ordering::Greater => high = middle,
            std::cmp::Ordering::Equal => {
                let record = VolumeRecord::decode(&page[offset..offset + BYTES_PER_RECORD]);
                return Some(record.data);
            }
        }
    }
    None
}
