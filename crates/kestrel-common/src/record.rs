//! Record names and record data.
//!
//! A record name is a 256-bit content hash supplied by the caller. The index
//! never hashes anything itself; it only slices portions of the name for the
//! various addressing schemes:
//!
//! - bytes 0..8  select the volume index delta list and address,
//! - bytes 8..14 select the chapter index delta list and address,
//! - bytes 14..16 are the sparse sampling bytes.

use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};

/// Size of a record name in bytes (256 bits).
pub const RECORD_NAME_SIZE: usize = 32;

/// Size of the opaque record payload in bytes.
pub const RECORD_DATA_SIZE: usize = 16;

/// Size of a full record (name + data) on a record page.
pub const BYTES_PER_RECORD: usize = RECORD_NAME_SIZE + RECORD_DATA_SIZE;

/// A 256-bit record name (content hash).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

impl RecordName {
    /// Returns the portion of the name used to address the volume index.
    pub fn volume_index_bytes(&self) -> u64 {
        u64::from_be_bytes(self.0[0..8].try_into().unwrap())
    }

    /// Returns the 48-bit portion of the name used to address chapter indexes.
    pub fn chapter_index_bytes(&self) -> u64 {
        let high = u16::from_be_bytes(self.0[8..10].try_into().unwrap()) as u64;
        let low = u32::from_be_bytes(self.0[10..14].try_into().unwrap()) as u64;
        (high << 32) | low
    }

    /// Returns the sparse sampling bytes of the name.
    pub fn sampling_bytes(&self) -> u16 {
        u16::from_be_bytes(self.0[14..16].try_into().unwrap())
    }

    /// Computes the chapter delta list for this name.
    pub fn chapter_delta_list(&self, geometry: &Geometry) -> u32 {
        ((self.chapter_index_bytes() >> geometry.chapter_address_bits)
            & ((1 << geometry.chapter_delta_list_bits) - 1)) as u32
    }

    /// Computes the chapter delta address for this name.
    pub fn chapter_delta_address(&self, geometry: &Geometry) -> u32 {
        (self.chapter_index_bytes() & ((1 << geometry.chapter_address_bits) - 1)) as u32
    }

    /// Computes the open chapter hash table slot for this name.
    pub fn hash_slot(&self, slot_count: usize) -> usize {
        (self.chapter_index_bytes() % slot_count as u64) as usize
    }
}

impl std::fmt::Debug for RecordName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordName(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// The fixed-width opaque payload stored with each record.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordData(pub [u8; RECORD_DATA_SIZE]);

impl std::fmt::Debug for RecordData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordData(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// A full record as stored on a record page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: RecordName,
    pub data: RecordData,
}

impl VolumeRecord {
    /// Encodes this record into its on-disk form.
    pub fn encode(&self, buffer: &mut [u8]) {
        buffer[..RECORD_NAME_SIZE].copy_from_slice(&self.name.0);
        buffer[RECORD_NAME_SIZE..BYTES_PER_RECORD].copy_from_slice(&self.data.0);
    }

    /// Decodes a record from its on-disk form.
    pub fn decode(buffer: &[u8]) -> Self {
        let mut name = [0u8; RECORD_NAME_SIZE];
        let mut data = [0u8; RECORD_DATA_SIZE];
        name.copy_from_slice(&buffer[..RECORD_NAME_SIZE]);
        data.copy_from_slice(&buffer[RECORD_NAME_SIZE..BYTES_PER_RECORD]);
        Self {
            name: RecordName(name),
            data: RecordData(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_from_prefix(prefix: &[u8]) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[..prefix.len()].copy_from_slice(prefix);
        RecordName(bytes)
    }

    #[test]
    fn test_volume_index_bytes_big_endian() {
        let name = name_from_prefix(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(name.volume_index_bytes(), 0x0102030405060708);
    }

    #[test]
    fn test_chapter_index_bytes() {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[8] = 0xAA;
        bytes[9] = 0xBB;
        bytes[10] = 0x01;
        bytes[11] = 0x02;
        bytes[12] = 0x03;
        bytes[13] = 0x04;
        let name = RecordName(bytes);
        assert_eq!(name.chapter_index_bytes(), 0xAABB_0102_0304);
    }

    #[test]
    fn test_sampling_bytes() {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[14] = 0x12;
        bytes[15] = 0x34;
        let name = RecordName(bytes);
        assert_eq!(name.sampling_bytes(), 0x1234);
    }

    #[test]
    fn test_chapter_slicing_disjoint() {
        // The chapter list and address together consume exactly the chapter
        // index bytes, with no overlap.
        let geometry = Geometry::small_test();
        let mut bytes = [0xFFu8; RECORD_NAME_SIZE];
        bytes[8..14].copy_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
        let name = RecordName(bytes);
        assert_eq!(name.chapter_delta_list(&geometry), 0);
        assert_eq!(name.chapter_delta_address(&geometry), 1);
    }

    #[test]
    fn test_hash_slot_in_range() {
        for i in 0..64u8 {
            let name = name_from_prefix(&[0, 0, 0, 0, 0, 0, 0, 0, i, i, i, i]);
            assert!(name.hash_slot(128) < 128);
        }
    }

    #[test]
    fn test_record_encode_decode() {
        let record = VolumeRecord {
            name: RecordName([0xAB; RECORD_NAME_SIZE]),
            data: RecordData([0xCD; RECORD_DATA_SIZE]),
        };

        let mut buffer = [0u8; BYTES_PER_RECORD];
        record.encode(&mut buffer);
        let decoded = VolumeRecord::decode(&buffer);

        assert_eq!(decoded, record);
        assert_eq!(buffer[0], 0xAB);
        assert_eq!(buffer[RECORD_NAME_SIZE], 0xCD);
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(RECORD_NAME_SIZE, 32);
        assert_eq!(RECORD_DATA_SIZE, 16);
        assert_eq!(BYTES_PER_RECORD, 48);
    }
}
