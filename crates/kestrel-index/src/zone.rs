//! Index zones.
//!
//! Each zone owns an open chapter, the previous ("writing") chapter being
//! committed, and its own oldest/newest chapter counters. One thread per
//! zone processes that zone's queue strictly in order: control messages
//! first, then data requests, which probe the volume index, the in-memory
//! chapters, the sparse cache, and finally the on-disk page cache.
//!
//! A request whose page read misses the cache is parked by the volume and
//! restarted on this zone's queue when the read completes; `requeued` plus
//! the previously recorded chapter let the zone notice that the chapter
//! moved underneath the request and redo the search.

use crate::index::IndexShared;
use crate::open_chapter::OpenChapterZone;
use kestrel_common::{
    KestrelError, Location, RecordData, Request, RequestType, Result, ZoneMessage,
};
use kestrel_volume::RecordProbe;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A zone's chapter counters, readable from the triage thread and tests.
#[derive(Debug, Default)]
pub struct ZoneCounters {
    pub oldest_virtual_chapter: AtomicU64,
    pub newest_virtual_chapter: AtomicU64,
}

impl ZoneCounters {
    pub fn oldest(&self) -> u64 {
        self.oldest_virtual_chapter.load(Ordering::Acquire)
    }

    pub fn newest(&self) -> u64 {
        self.newest_virtual_chapter.load(Ordering::Acquire)
    }
}

/// One zone of the index.
pub struct IndexZone {
    id: u32,
    open_chapter: Arc<Mutex<OpenChapterZone>>,
    writing_chapter: Arc<OpenChapterZone>,
    oldest_virtual_chapter: u64,
    newest_virtual_chapter: u64,
    counters: Arc<ZoneCounters>,
}

impl IndexZone {
    pub(crate) fn new(
        id: u32,
        open_chapter: Arc<Mutex<OpenChapterZone>>,
        writing_chapter: Arc<OpenChapterZone>,
        oldest: u64,
        newest: u64,
        counters: Arc<ZoneCounters>,
    ) -> Self {
        counters.oldest_virtual_chapter.store(oldest, Ordering::Release);
        counters.newest_virtual_chapter.store(newest, Ordering::Release);
        Self {
            id,
            open_chapter,
            writing_chapter,
            oldest_virtual_chapter: oldest,
            newest_virtual_chapter: newest,
            counters,
        }
    }

    fn is_zone_chapter_sparse(&self, shared: &IndexShared, virtual_chapter: u64) -> bool {
        shared.geometry.is_chapter_sparse(
            self.oldest_virtual_chapter,
            self.newest_virtual_chapter,
            virtual_chapter,
        )
    }

    /// Processes one request from this zone's queue. The request is
    /// completed through the index callback unless it gets parked.
    pub(crate) fn execute(&mut self, shared: &IndexShared, request: Box<Request>) {
        if let Some(message) = request.message {
            if let Err(e) = self.dispatch_control(shared, message) {
                error!("error executing zone message {:?}: {}", message, e);
            }
            // Message requests carry no callback; they are simply freed.
            return;
        }

        shared.need_to_save.store(true, Ordering::Release);
        if request.requeued && request.status.is_err() {
            let mut request = request;
            request.set_location(Location::Unavailable);
            (shared.callback)(request);
            return;
        }

        let mut slot = Some(request);
        let result = self.dispatch_request(shared, &mut slot);
        let Some(mut request) = slot.take() else {
            // Parked: the request now belongs to the I/O subsystem.
            return;
        };

        if let Err(e) = result {
            request.status = Err(e);
        }
        if !request.found {
            request.set_location(Location::Unavailable);
        }
        (shared.callback)(request);
    }

    fn dispatch_control(&mut self, shared: &IndexShared, message: ZoneMessage) -> Result<()> {
        match message {
            ZoneMessage::SparseCacheBarrier(virtual_chapter) => {
                self.update_sparse_cache(shared, virtual_chapter)
            }
            ZoneMessage::AnnounceChapterClosed(virtual_chapter) => {
                if self.newest_virtual_chapter == virtual_chapter {
                    self.open_next_chapter(shared)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn update_sparse_cache(&self, shared: &IndexShared, virtual_chapter: u64) -> Result<()> {
        let volume = &shared.volume;
        volume
            .sparse_cache()
            .update(virtual_chapter, || volume.read_chapter_index_pages(virtual_chapter))
    }

    fn dispatch_request(
        &mut self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
    ) -> Result<()> {
        if !slot.as_ref().unwrap().requeued {
            self.simulate_zone_barrier(shared, slot.as_ref().unwrap())?;
        }

        match slot.as_ref().unwrap().kind {
            RequestType::Post
            | RequestType::Update
            | RequestType::Query
            | RequestType::QueryNoUpdate => self.search_index_zone(shared, slot),
            RequestType::Delete => self.remove_from_index_zone(shared, slot),
        }
    }

    /// A single-zone sparse index has no triage queue, so the barrier is
    /// simulated inline before the request is processed.
    fn simulate_zone_barrier(&self, shared: &IndexShared, request: &Request) -> Result<()> {
        if shared.zone_count() > 1 || !shared.geometry.is_sparse() {
            return Ok(());
        }

        let Some(virtual_chapter) = shared.volume_index.lookup(&request.name)? else {
            return Ok(());
        };
        if !self.is_zone_chapter_sparse(shared, virtual_chapter) {
            return Ok(());
        }
        self.update_sparse_cache(shared, virtual_chapter)
    }

    fn set_chapter_location(
        &self,
        shared: &IndexShared,
        request: &mut Request,
        virtual_chapter: u64,
    ) {
        request.found = true;
        request.location = if virtual_chapter == self.newest_virtual_chapter {
            Location::OpenChapter
        } else if self.is_zone_chapter_sparse(shared, virtual_chapter) {
            Location::Sparse
        } else {
            Location::Dense
        };
    }

    /// Maps a page cache probe outcome onto the request: records found
    /// data, parks, or schedules a retry for a full read queue.
    fn apply_probe(
        &self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
        probe: RecordProbe,
    ) -> Result<bool> {
        match probe {
            RecordProbe::Found(data) => {
                slot.as_mut().unwrap().old_data = data;
                Ok(true)
            }
            RecordProbe::NotFound => Ok(false),
            RecordProbe::Queued => Ok(false),
            RecordProbe::Rejected => {
                // The read queue is full. Hand the request back to our own
                // queue to retry after the readers drain.
                let request = slot.take().unwrap();
                shared.requeue(request);
                Ok(false)
            }
        }
    }

    fn search_sparse_cache_in_zone(
        &self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
        virtual_chapter: Option<u64>,
    ) -> Result<bool> {
        let name = slot.as_ref().unwrap().name;
        let Some((found_chapter, record_page)) =
            shared.volume.sparse_cache().search(&name, virtual_chapter)?
        else {
            return Ok(false);
        };

        {
            let request = slot.as_mut().unwrap();
            request.virtual_chapter = found_chapter;
            request.record_page_number = record_page;
            request.location = Location::RecordPageLookup;
        }
        let probe = shared
            .volume
            .search_record_page_cached(&name, found_chapter, record_page, slot)?;
        self.apply_probe(shared, slot, probe)
    }

    /// Looks for the record wherever its chapter currently lives: the
    /// open chapter, the writing chapter, the sparse cache, or the
    /// on-disk page cache.
    fn get_record_from_zone(
        &self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
    ) -> Result<bool> {
        let (name, virtual_chapter, location, record_page) = {
            let request = slot.as_ref().unwrap();
            (
                request.name,
                request.virtual_chapter,
                request.location,
                request.record_page_number,
            )
        };

        match location {
            Location::RecordPageLookup => {
                // A previous pass already resolved the record page.
                let probe = shared.volume.search_record_page_cached(
                    &name,
                    virtual_chapter,
                    record_page,
                    slot,
                )?;
                self.apply_probe(shared, slot, probe)
            }
            Location::Unavailable => Ok(false),
            _ => {
                if virtual_chapter == self.newest_virtual_chapter {
                    let found = self.open_chapter.lock().search(&name);
                    if let Some(data) = found {
                        slot.as_mut().unwrap().old_data = data;
                        return Ok(true);
                    }
                    return Ok(false);
                }

                if self.newest_virtual_chapter > 0
                    && virtual_chapter == self.newest_virtual_chapter - 1
                    && self.writing_chapter.size() > 0
                {
                    if let Some(data) = self.writing_chapter.search(&name) {
                        slot.as_mut().unwrap().old_data = data;
                        return Ok(true);
                    }
                    return Ok(false);
                }

                if self.is_zone_chapter_sparse(shared, virtual_chapter)
                    && shared.volume.sparse_cache().contains(virtual_chapter)
                {
                    return self.search_sparse_cache_in_zone(
                        shared,
                        slot,
                        Some(virtual_chapter),
                    );
                }

                let probe = shared.volume.search_page_cache(&name, virtual_chapter, slot)?;
                self.apply_probe(shared, slot, probe)
            }
        }
    }

    fn search_index_zone(
        &mut self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
    ) -> Result<()> {
        let name = slot.as_ref().unwrap().name;
        let mut record = shared.volume_index.get_record(&name)?;
        let mut found = false;

        if record.is_found {
            {
                let request = slot.as_mut().unwrap();
                if request.requeued && request.virtual_chapter != record.virtual_chapter {
                    // The chapter moved while the request was parked.
                    request.set_location(Location::Unknown);
                    request.record_page_number = 0;
                }
                request.virtual_chapter = record.virtual_chapter;
            }
            found = self.get_record_from_zone(shared, slot)?;
            if slot.is_none() {
                return Ok(());
            }
        }

        if found {
            let request = slot.as_mut().unwrap();
            self.set_chapter_location(shared, request, record.virtual_chapter);
        }

        // A record that overflowed its chapter index exists as a collision
        // in the volume index but cannot be found in the volume.
        let overflow_record = record.is_found && record.is_collision && !found;
        let chapter = self.newest_virtual_chapter;
        let kind = slot.as_ref().unwrap().kind;

        if found || overflow_record {
            if kind == RequestType::QueryNoUpdate
                || (kind == RequestType::Query && overflow_record)
            {
                return Ok(());
            }

            if record.virtual_chapter != chapter {
                // Repoint the volume index at the open chapter; a record
                // deleted or dropped from its chapter index comes back.
                match shared.volume_index.set_record_chapter(&mut record, chapter) {
                    Ok(()) => {}
                    Err(KestrelError::Overflow) => {
                        warn!("volume index overflow; record not re-indexed");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            } else if kind != RequestType::Update {
                // The record is already in the open chapter.
                return Ok(());
            }
        } else {
            // Not in the volume index: a non-sample name may still be in a
            // cached sparse chapter. Results from a previous pass short-
            // circuit the search.
            let location = slot.as_ref().unwrap().location;
            match location {
                Location::RecordPageLookup => {
                    let virtual_chapter = slot.as_ref().unwrap().virtual_chapter;
                    let record_page = slot.as_ref().unwrap().record_page_number;
                    let probe = shared.volume.search_record_page_cached(
                        &name,
                        virtual_chapter,
                        record_page,
                        slot,
                    )?;
                    found = self.apply_probe(shared, slot, probe)?;
                    if slot.is_none() {
                        return Ok(());
                    }
                }
                Location::Unavailable => found = false,
                _ => {
                    if shared.geometry.is_sparse()
                        && !shared.volume_index.is_sample(&name)
                    {
                        found = self.search_sparse_cache_in_zone(shared, slot, None)?;
                        if slot.is_none() {
                            return Ok(());
                        }
                    }
                }
            }

            if found {
                slot.as_mut().unwrap().set_location(Location::Sparse);
            }

            if kind == RequestType::QueryNoUpdate || (kind == RequestType::Query && !found) {
                return Ok(());
            }

            // Index the name under the open chapter; this is how records
            // from cached sparse chapters become dense again.
            match shared.volume_index.put_record(&mut record, chapter) {
                Ok(()) => {}
                Err(KestrelError::Overflow) => {
                    // The record simply is not indexed.
                    warn!("volume index overflow; record not indexed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let data = {
            let request = slot.as_ref().unwrap();
            if !found || kind == RequestType::Update {
                request.new_data
            } else {
                request.old_data
            }
        };
        self.put_record_in_zone(shared, slot, data)
    }

    fn remove_from_index_zone(
        &mut self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
    ) -> Result<()> {
        let name = slot.as_ref().unwrap().name;
        let mut record = shared.volume_index.get_record(&name)?;
        if !record.is_found {
            return Ok(());
        }

        if !record.is_collision {
            // Non-collision entries are hints; resolve the name in the
            // chapter before deleting anything.
            {
                let request = slot.as_mut().unwrap();
                if request.requeued && request.virtual_chapter != record.virtual_chapter {
                    request.set_location(Location::Unknown);
                    request.record_page_number = 0;
                }
                request.virtual_chapter = record.virtual_chapter;
            }
            let found = self.get_record_from_zone(shared, slot)?;
            if slot.is_none() {
                return Ok(());
            }
            if !found {
                // There is no record to remove.
                return Ok(());
            }
        }

        {
            let request = slot.as_mut().unwrap();
            self.set_chapter_location(shared, request, record.virtual_chapter);
        }

        // Remove only the named entry. A later search may return stale
        // advice if a colliding name shares the chapter, but that case is
        // vanishingly rare.
        shared.volume_index.remove_record(&mut record)?;

        // A record still in the open chapter must be tombstoned so a
        // later post of the same name behaves correctly.
        if slot.as_ref().unwrap().location == Location::OpenChapter {
            self.open_chapter.lock().remove(&name);
        }
        Ok(())
    }

    fn put_record_in_zone(
        &mut self,
        shared: &IndexShared,
        slot: &mut Option<Box<Request>>,
        data: RecordData,
    ) -> Result<()> {
        let name = slot.as_ref().unwrap().name;
        let remaining = self.open_chapter.lock().put(&name, &data);
        if remaining == 0 {
            self.open_next_chapter(shared)?;
        }
        Ok(())
    }

    /// Closes this zone's open chapter and opens the next one. The first
    /// zone to close broadcasts the closure so its peers close too; the
    /// last zone forgets the chapters that have now expired.
    pub(crate) fn open_next_chapter(&mut self, shared: &IndexShared) -> Result<()> {
        {
            let open = self.open_chapter.lock();
            debug!(
                "closing chapter {} of zone {} after {} entries ({} short)",
                self.newest_virtual_chapter,
                self.id,
                open.size(),
                open.capacity() - open.size()
            );
        }

        // Wait for the writer to finish any chapter older than ours.
        shared
            .writer
            .finish_previous_chapter(self.newest_virtual_chapter)?;

        // Freeze the open chapter and start a fresh one in its place.
        let fresh = OpenChapterZone::new(&shared.geometry, shared.zone_count());
        let closed = {
            let mut open = self.open_chapter.lock();
            Arc::new(std::mem::replace(&mut *open, fresh))
        };
        self.writing_chapter = Arc::clone(&closed);

        let closed_chapter = self.newest_virtual_chapter;
        self.newest_virtual_chapter += 1;
        self.counters
            .newest_virtual_chapter
            .store(self.newest_virtual_chapter, Ordering::Release);
        shared
            .volume_index
            .set_zone_open_chapter(self.id, self.newest_virtual_chapter);

        let finished_zones = shared.writer.start_closing_chapter(self.id, closed);
        if finished_zones == 1 && shared.zone_count() > 1 {
            // Closing first: tell the other zones to close immediately,
            // bounding inter-zone skew to one chapter.
            for zone in 0..shared.zone_count() {
                if zone != self.id {
                    shared.send_message(
                        ZoneMessage::AnnounceChapterClosed(closed_chapter),
                        zone,
                    );
                }
            }
        }

        let expiring = self.oldest_virtual_chapter;
        let expire_count =
            shared.geometry.chapters_to_expire(self.newest_virtual_chapter) as u64;
        self.oldest_virtual_chapter += expire_count;
        self.counters
            .oldest_virtual_chapter
            .store(self.oldest_virtual_chapter, Ordering::Release);

        if finished_zones < shared.zone_count() {
            return Ok(());
        }

        // Last zone to close: the expired chapters can now be forgotten.
        for offset in 0..expire_count {
            shared.volume.forget_chapter(expiring + offset);
        }
        Ok(())
    }
}
