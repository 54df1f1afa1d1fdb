//! The KestrelDB deduplication index engine.
//!
//! Given a stream of 256-bit record names, the index answers whether each
//! name has been seen before and, if so, returns the small payload stored
//! with it. Lookups go through a two-level pipeline: an in-memory volume
//! index maps sampled name bits to the chapter most likely to hold the
//! record, and that chapter's on-disk index pages (read through a
//! coalescing page cache) resolve the final answer.
//!
//! Work is partitioned into zones, each served by its own thread; a
//! dedicated chapter writer commits chapters as the zones close them, and
//! a sparse chapter-index cache (coordinated by barrier messages) serves
//! chapters older than the dense horizon.

pub mod chapter_index;
pub mod index;
pub mod layout;
pub mod open_chapter;
pub mod volume_index;
pub mod writer;
pub mod zone;

pub use index::{Index, IndexObserver, IndexStats, LoadContext, LoadState, OpenType};
pub use volume_index::{VolumeIndex, VolumeIndexRecord, VolumeIndexStats};
