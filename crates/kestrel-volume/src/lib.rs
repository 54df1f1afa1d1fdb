//! The on-disk volume layer of KestrelDB.
//!
//! A volume is a ring of chapters on a block store. Each chapter holds a
//! few immutable chapter index pages followed by record pages. This crate
//! provides the block store, the page cache that fronts it (with in-flight
//! read coalescing), the index page map, record page encoding, the sparse
//! chapter-index cache, and the [`Volume`] that ties them together.

pub mod index_page_map;
pub mod page_cache;
pub mod record_page;
pub mod sparse_cache;
pub mod storage;
pub mod volume;

pub use index_page_map::IndexPageMap;
pub use page_cache::{EnqueueResult, PageCache, RequestRestarter, VOLUME_CACHE_MAX_QUEUED_READS};
pub use sparse_cache::SparseCache;
pub use storage::BlockStore;
pub use volume::{PageFetch, RecordProbe, Volume};
