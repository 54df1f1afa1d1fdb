//! The volume: a ring of chapters on a block store.
//!
//! Each chapter occupies `pages_per_chapter` consecutive pages: the
//! chapter index pages first, then the record pages. The volume serves
//! probes through the page cache, writes closed chapters, expires old
//! ones, and supports the chapter scan used by rebuild.

use crate::index_page_map::IndexPageMap;
use crate::page_cache::{EnqueueResult, PageCache, RequestRestarter};
use crate::record_page::{encode_record_page, search_record_page};
use crate::sparse_cache::SparseCache;
use crate::storage::BlockStore;
use kestrel_common::record::VolumeRecord;
use kestrel_common::{
    Geometry, IndexConfig, KestrelError, RecordData, RecordName, Request, Result,
};
use kestrel_delta::{pack_delta_index_page, DeltaIndex, DeltaIndexPage};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// The outcome of fetching one page through the cache.
pub enum PageFetch {
    /// The page data, from the cache or a synchronous read.
    Data(Arc<Vec<u8>>),
    /// The request was parked behind an in-flight read.
    Queued,
    /// The read queue is full; the request was handed back.
    Rejected,
}

/// The outcome of a record probe through the page cache.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordProbe {
    Found(RecordData),
    NotFound,
    /// The request was parked behind a page read.
    Queued,
    /// The read queue is full; the request was handed back.
    Rejected,
}

/// The on-disk volume and its caches.
pub struct Volume {
    geometry: Geometry,
    nonce: u64,
    store: Arc<RwLock<Arc<BlockStore>>>,
    page_cache: Arc<PageCache>,
    sparse_cache: SparseCache,
    index_page_map: RwLock<IndexPageMap>,
}

impl Volume {
    /// Opens the volume described by the configuration.
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let geometry = config.geometry;
        let store = Arc::new(RwLock::new(Arc::new(BlockStore::open(
            config.data_dir.join("volume"),
            geometry.bytes_per_page,
            geometry.pages_per_volume,
            config.fsync_enabled,
        )?)));

        let reader_store = Arc::clone(&store);
        let cache_size =
            config.cache_chapters_of_pages as usize * geometry.pages_per_chapter as usize;
        let page_cache = PageCache::new(
            cache_size.max(1),
            config.zone_count,
            config.read_threads,
            Arc::new(move |page| {
                let store = Arc::clone(&reader_store.read());
                store.read_page(page)
            }),
        );

        Ok(Self {
            geometry,
            nonce: config.nonce,
            store,
            page_cache,
            sparse_cache: SparseCache::new(
                geometry,
                config.cache_chapters as usize,
                config.zone_count,
            ),
            index_page_map: RwLock::new(IndexPageMap::new(geometry)),
        })
    }

    fn store(&self) -> Arc<BlockStore> {
        Arc::clone(&self.store.read())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub fn sparse_cache(&self) -> &SparseCache {
        &self.sparse_cache
    }

    /// Registers the callback that re-enqueues requests parked behind
    /// page reads.
    pub fn set_request_restarter(&self, restarter: RequestRestarter) {
        self.page_cache.set_request_restarter(restarter);
    }

    /// Records the highest delta list on one chapter index page. Used by
    /// rebuild, which reconstructs the map from the pages themselves.
    pub fn update_index_page_map(
        &self,
        virtual_chapter: u64,
        chapter: u32,
        index_page: u32,
        highest_list: u32,
    ) {
        self.index_page_map
            .write()
            .update(virtual_chapter, chapter, index_page, highest_list);
    }

    /// Saves the index page map to a stream.
    pub fn save_index_page_map<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        self.index_page_map.read().save_to(writer)
    }

    /// Restores the index page map from a stream.
    pub fn restore_index_page_map<R: std::io::Read>(&self, reader: &mut R) -> Result<()> {
        self.index_page_map.write().restore_from(reader)
    }

    /// Fetches one physical page. With a request, a cache miss parks the
    /// request behind a (possibly coalesced) read; without one, the page
    /// is read synchronously and cached.
    pub fn fetch_page(
        &self,
        physical_page: u64,
        request: &mut Option<Box<Request>>,
    ) -> Result<PageFetch> {
        if let Some(data) = self.page_cache.get(physical_page) {
            return Ok(PageFetch::Data(data));
        }

        match request.take() {
            Some(parked) => match self.page_cache.enqueue_read(parked, physical_page) {
                EnqueueResult::Queued => Ok(PageFetch::Queued),
                EnqueueResult::Cached(data, returned) => {
                    *request = Some(returned);
                    Ok(PageFetch::Data(data))
                }
                EnqueueResult::Rejected(returned) => {
                    *request = Some(returned);
                    Ok(PageFetch::Rejected)
                }
            },
            None => {
                let data = Arc::new(self.store().read_page(physical_page)?);
                self.page_cache.install(physical_page, Arc::clone(&data));
                Ok(PageFetch::Data(data))
            }
        }
    }

    /// Fetches and decodes one chapter index page, synchronously. A page
    /// that fails validation or belongs to another chapter is an error.
    pub fn get_index_page(&self, virtual_chapter: u64, index_page: u32) -> Result<DeltaIndexPage> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let physical_page = self.geometry.map_to_physical_page(chapter, index_page);
        let data = match self.fetch_page(physical_page, &mut None)? {
            PageFetch::Data(data) => data,
            _ => unreachable!("synchronous fetch cannot park"),
        };

        let page = DeltaIndexPage::new(
            self.nonce,
            self.geometry.chapter_mean_delta,
            self.geometry.chapter_payload_bits,
            data.as_ref().clone(),
        )?;
        if page.virtual_chapter() != virtual_chapter {
            return Err(KestrelError::CorruptData(format!(
                "index page holds chapter {} instead of {}",
                page.virtual_chapter(),
                virtual_chapter
            )));
        }
        Ok(page)
    }

    /// Reads all of a chapter's index pages, for the sparse cache.
    pub fn read_chapter_index_pages(&self, virtual_chapter: u64) -> Result<Vec<DeltaIndexPage>> {
        (0..self.geometry.index_pages_per_chapter)
            .map(|page| self.get_index_page(virtual_chapter, page))
            .collect()
    }

    /// Fetches one record page of a chapter, synchronously.
    pub fn get_record_page(&self, physical_chapter: u32, record_page: u32) -> Result<Arc<Vec<u8>>> {
        let page = self.geometry.map_to_physical_page(
            physical_chapter,
            self.geometry.index_pages_per_chapter + record_page,
        );
        match self.fetch_page(page, &mut None)? {
            PageFetch::Data(data) => Ok(data),
            _ => unreachable!("synchronous fetch cannot park"),
        }
    }

    /// Probes the chapter holding `virtual_chapter` for a name: one index
    /// page (located through the index page map), then one record page.
    ///
    /// When a request is supplied, a cache miss parks it and `Queued` is
    /// returned; the restarted request resumes at the record page via its
    /// recorded `record_page_number`.
    pub fn search_page_cache(
        &self,
        name: &RecordName,
        virtual_chapter: u64,
        request: &mut Option<Box<Request>>,
    ) -> Result<RecordProbe> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let index_page_number = self.index_page_map.read().find_index_page(chapter, name);
        let physical_page = self.geometry.map_to_physical_page(chapter, index_page_number);

        let zone = request.as_ref().map_or(0, |r| r.zone_number);
        self.page_cache.begin_pending_search(physical_page, zone);
        let fetch = self.fetch_page(physical_page, request);
        self.page_cache.end_pending_search(zone);

        let data = match fetch? {
            PageFetch::Data(data) => data,
            PageFetch::Queued => return Ok(RecordProbe::Queued),
            PageFetch::Rejected => return Ok(RecordProbe::Rejected),
        };

        let page = match DeltaIndexPage::new(
            self.nonce,
            self.geometry.chapter_mean_delta,
            self.geometry.chapter_payload_bits,
            data.as_ref().clone(),
        ) {
            Ok(page) => page,
            Err(_) => {
                // Expected for chapters that were never fully written.
                warn!(
                    "chapter {} index page {} failed validation",
                    chapter, index_page_number
                );
                return Ok(RecordProbe::NotFound);
            }
        };
        if page.virtual_chapter() != virtual_chapter {
            debug!(
                "chapter slot {} holds chapter {} instead of {}",
                chapter,
                page.virtual_chapter(),
                virtual_chapter
            );
            return Ok(RecordProbe::NotFound);
        }

        let list = name.chapter_delta_list(&self.geometry);
        let key = name.chapter_delta_address(&self.geometry);
        let record_page = match page.search(list, key, name)? {
            Some(record_page) => record_page,
            None => return Ok(RecordProbe::NotFound),
        };

        if let Some(parked) = request.as_deref_mut() {
            // Let a restarted request resume at the record page.
            parked.record_page_number = record_page;
            parked.virtual_chapter = virtual_chapter;
        }
        self.search_record_page_cached(name, virtual_chapter, record_page, request)
    }

    /// Probes one record page of a chapter for a name.
    pub fn search_record_page_cached(
        &self,
        name: &RecordName,
        virtual_chapter: u64,
        record_page: u32,
        request: &mut Option<Box<Request>>,
    ) -> Result<RecordProbe> {
        if record_page >= self.geometry.record_pages_per_chapter {
            return Err(KestrelError::CorruptData(format!(
                "record page {} out of range {}",
                record_page, self.geometry.record_pages_per_chapter
            )));
        }

        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let physical_page = self.geometry.map_to_physical_page(
            chapter,
            self.geometry.index_pages_per_chapter + record_page,
        );

        let zone = request.as_ref().map_or(0, |r| r.zone_number);
        self.page_cache.begin_pending_search(physical_page, zone);
        let fetch = self.fetch_page(physical_page, request);
        self.page_cache.end_pending_search(zone);

        let data = match fetch? {
            PageFetch::Data(data) => data,
            PageFetch::Queued => return Ok(RecordProbe::Queued),
            PageFetch::Rejected => return Ok(RecordProbe::Rejected),
        };

        match search_record_page(&self.geometry, &data, name) {
            Some(record_data) => Ok(RecordProbe::Found(record_data)),
            None => Ok(RecordProbe::NotFound),
        }
    }

    /// Writes a closed chapter: packs the chapter index into index pages
    /// (updating the index page map), then writes the collated records as
    /// sorted record pages.
    pub fn write_chapter(
        &self,
        virtual_chapter: u64,
        chapter_index: &DeltaIndex,
        records: &[VolumeRecord],
    ) -> Result<()> {
        let geometry = &self.geometry;
        let chapter = geometry.map_to_physical_chapter(virtual_chapter);

        // The slot may still hold cached pages of the chapter it is
        // replacing.
        self.page_cache.invalidate_chapter(
            geometry.map_to_physical_page(chapter, 0),
            geometry.pages_per_chapter,
        );

        let list_count = chapter_index.list_count();
        let mut first_list = 0u32;
        for index_page in 0..geometry.index_pages_per_chapter {
            let mut memory = vec![0u8; geometry.bytes_per_page];
            let packed = pack_delta_index_page(
                chapter_index,
                self.nonce,
                virtual_chapter,
                first_list,
                &mut memory,
            )?;
            first_list += packed;

            let highest = if first_list == 0 { 0 } else { first_list - 1 };
            self.index_page_map.write().update(
                virtual_chapter,
                chapter,
                index_page,
                highest,
            );
            self.store()
                .write_page(geometry.map_to_physical_page(chapter, index_page), &memory)?;
        }
        if first_list < list_count {
            return Err(KestrelError::Overflow);
        }

        for record_page in 0..geometry.record_pages_per_chapter {
            let start = (record_page as usize * geometry.records_per_page as usize)
                .min(records.len());
            let end = ((record_page as usize + 1) * geometry.records_per_page as usize)
                .min(records.len());
            let page = encode_record_page(geometry, &records[start..end])?;
            self.store().write_page(
                geometry.map_to_physical_page(
                    chapter,
                    geometry.index_pages_per_chapter + record_page,
                ),
                &page,
            )?;
        }

        self.store().sync()?;
        Ok(())
    }

    /// Forgets an expired chapter: drops it from the sparse cache and
    /// evicts its pages from the page cache.
    pub fn forget_chapter(&self, virtual_chapter: u64) {
        debug!("forgetting chapter {}", virtual_chapter);
        self.sparse_cache.invalidate(virtual_chapter);
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        self.page_cache.invalidate_chapter(
            self.geometry.map_to_physical_page(chapter, 0),
            self.geometry.pages_per_chapter,
        );
    }

    /// Hints that a chapter is about to be replayed.
    pub fn prefetch_chapter(&self, virtual_chapter: u64) {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        self.store().prefetch(
            self.geometry.map_to_physical_page(chapter, 0),
            self.geometry.pages_per_chapter,
        );
    }

    /// Scans every chapter slot for a valid first index page, returning
    /// the lowest and highest virtual chapters found on disk. Used when
    /// rebuilding after an unclean shutdown.
    pub fn find_chapter_boundaries(&self) -> Result<(u64, u64, bool)> {
        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        let mut found = false;

        for chapter in 0..self.geometry.chapters_per_volume {
            let physical_page = self.geometry.map_to_physical_page(chapter, 0);
            let data = self.store().read_page(physical_page)?;
            let page = match DeltaIndexPage::new(
                self.nonce,
                self.geometry.chapter_mean_delta,
                self.geometry.chapter_payload_bits,
                data,
            ) {
                Ok(page) => page,
                Err(_) => continue,
            };

            let vc = page.virtual_chapter();
            if self.geometry.map_to_physical_chapter(vc) != chapter {
                continue;
            }
            found = true;
            lowest = lowest.min(vc);
            highest = highest.max(vc);
        }

        Ok((if found { lowest } else { 0 }, highest, !found))
    }

    /// Replaces the backing storage with a new path. The caller must have
    /// quiesced the index first.
    pub fn replace_storage(&self, path: &Path) -> Result<()> {
        let store = Arc::new(BlockStore::open(
            path,
            self.geometry.bytes_per_page,
            self.geometry.pages_per_volume,
            true,
        )?);
        *self.store.write() = store;
        Ok(())
    }

    /// Returns the bytes of memory used by the page cache.
    pub fn cache_size_bytes(&self) -> u64 {
        self.page_cache.size_bytes(self.geometry.bytes_per_page)
    }

    /// Stops the reader threads and fails parked requests.
    pub fn shutdown(&self) {
        self.page_cache.shutdown();
    }
}
