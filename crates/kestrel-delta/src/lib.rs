//! Delta index structures for KestrelDB.
//!
//! A delta index stores many small (payload, key) entries as bit-packed
//! delta lists in a single memory region. Keys within a list are sorted and
//! stored as Huffman-coded deltas from their predecessors, so an entry
//! costs only a few bits more than the entropy of its key distribution.
//!
//! The index exists in two forms. The mutable form ([`DeltaIndex`],
//! [`DeltaZone`]) supports insertion and removal and rebalances its memory
//! as lists grow; it backs the volume index and the open chapter index. The
//! immutable form ([`DeltaIndexPage`]) is a densely packed read-only page
//! produced when a chapter closes, and is what the volume keeps on disk.

pub mod bits;
pub mod codec;
pub mod index;
pub mod page;
pub mod save;

pub use codec::DeltaCoding;
pub use index::{
    compute_delta_index_size, zone_memory_size, DeltaEntry, DeltaIndex, DeltaIndexStats, DeltaZone,
};
pub use page::{pack_delta_index_page, DeltaIndexPage};
