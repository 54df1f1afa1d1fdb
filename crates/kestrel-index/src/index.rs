//! The index core.
//!
//! Owns the zones, their request queues, the chapter writer, the volume,
//! and the volume index, and wires up the request pipeline: triage queue
//! (sparse multi-zone only), per-zone queues, and the restarter that
//! returns parked requests to their zones after a page read completes.
//!
//! Loading prefers a clean save; when none exists the whole volume is
//! replayed chapter by chapter to reconstruct the volume index and the
//! index page map. The replay is best-effort: overflow and duplicate-name
//! errors are expected and swallowed.

use crate::layout::{IndexLayout, IndexState};
use crate::open_chapter::{load_open_chapters, save_open_chapters, OpenChapterZone};
use crate::volume_index::VolumeIndex;
use crate::writer::ChapterWriter;
use crate::zone::{IndexZone, ZoneCounters};
use crossbeam_channel::{unbounded, Receiver, Sender};
use kestrel_common::record::VolumeRecord;
use kestrel_common::{
    Geometry, IndexConfig, KestrelError, Request, Result, Stage, ZoneMessage,
};
use kestrel_volume::{RecordProbe, Volume};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// How to open an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenType {
    /// Create a new empty index, overwriting any existing saves.
    Create,
    /// Load a saved index, rebuilding from the volume if the save is
    /// missing or damaged.
    Load,
    /// Load a saved index, failing rather than rebuilding.
    NoRebuild,
}

/// The completion callback invoked exactly once per request.
pub type IndexCallback = Arc<dyn Fn(Box<Request>) + Send + Sync>;

/// States of the load context used by the suspend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Opening,
    Ready,
    Suspending,
    Suspended,
    Freeing,
}

/// Lets the caller suspend or abort an in-progress rebuild.
pub struct LoadContext {
    state: Mutex<LoadState>,
    cond: Condvar,
}

impl LoadContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoadState::Opening),
            cond: Condvar::new(),
        })
    }

    /// The current state.
    pub fn state(&self) -> LoadState {
        *self.state.lock()
    }

    /// Moves to a new state and wakes any waiter.
    pub fn set_state(&self, state: LoadState) {
        *self.state.lock() = state;
        self.cond.notify_all();
    }

    /// Blocks until the context reaches the given state.
    pub fn wait_for(&self, target: LoadState) {
        let mut state = self.state.lock();
        while *state != target {
            self.cond.wait(&mut state);
        }
    }
}

/// Counters the tests watch; no-ops unless someone reads them.
#[derive(Debug, Default)]
pub struct IndexObserver {
    chapters_written: AtomicU64,
    chapters_replayed: AtomicU64,
}

impl IndexObserver {
    pub fn chapter_written(&self) {
        self.chapters_written.fetch_add(1, Ordering::AcqRel);
    }

    pub fn chapter_replayed(&self) {
        self.chapters_replayed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn chapters_written(&self) -> u64 {
        self.chapters_written.load(Ordering::Acquire)
    }

    pub fn chapters_replayed(&self) -> u64 {
        self.chapters_replayed.load(Ordering::Acquire)
    }
}

/// A thread-safe snapshot of index statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub entries_indexed: u64,
    pub memory_used: u64,
    pub collisions: u64,
    pub entries_discarded: u64,
}

/// State shared between the index handle, the zone threads, the triage
/// thread, and the page cache restarter.
pub(crate) struct IndexShared {
    pub(crate) geometry: Geometry,
    pub(crate) volume: Arc<Volume>,
    pub(crate) volume_index: Arc<VolumeIndex>,
    pub(crate) writer: Arc<ChapterWriter>,
    pub(crate) callback: IndexCallback,
    pub(crate) need_to_save: AtomicBool,
    /// Dropped on shutdown so the zone threads see their queues close.
    senders: Mutex<Option<Vec<Sender<Box<Request>>>>>,
}

impl IndexShared {
    pub(crate) fn zone_count(&self) -> u32 {
        self.volume_index.zone_count()
    }

    /// Sends a control message to a zone's queue.
    pub(crate) fn send_message(&self, message: ZoneMessage, zone: u32) {
        let request = Box::new(Request::message(message, zone));
        self.requeue(request);
    }

    /// Returns a request to its zone's queue.
    pub(crate) fn requeue(&self, request: Box<Request>) {
        let senders = self.senders.lock();
        if let Some(senders) = senders.as_ref() {
            let _ = senders[request.zone_number as usize].send(request);
        }
    }

    fn close_senders(&self) {
        self.senders.lock().take();
    }
}

/// The deduplication index.
pub struct Index {
    shared: Arc<IndexShared>,
    layout: Arc<IndexLayout>,
    observer: Arc<IndexObserver>,
    open_chapters: Vec<Arc<Mutex<OpenChapterZone>>>,
    zone_counters: Vec<Arc<ZoneCounters>>,
    zone_threads: Vec<JoinHandle<()>>,
    triage_sender: Option<Sender<Box<Request>>>,
    triage_thread: Option<JoinHandle<()>>,
    zone_count: u32,
}

impl Index {
    /// Creates or loads an index.
    pub fn new(
        config: IndexConfig,
        open_type: OpenType,
        load_context: Option<Arc<LoadContext>>,
        callback: IndexCallback,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let geometry = config.geometry;
        let zone_count = config.zone_count;

        let layout = Arc::new(IndexLayout::new(&config.data_dir)?);
        if open_type == OpenType::Create {
            // A stale save must not shadow the fresh volume.
            layout.discard_open_chapter()?;
        }
        let volume = Arc::new(Volume::new(&config)?);
        let volume_index = Arc::new(VolumeIndex::new(&config)?);
        let observer = Arc::new(IndexObserver::default());
        let writer = ChapterWriter::start(
            geometry,
            zone_count,
            Arc::clone(&volume),
            Arc::clone(&layout),
            Arc::clone(&observer),
        )?;

        let open_chapters: Vec<Arc<Mutex<OpenChapterZone>>> = (0..zone_count)
            .map(|_| Arc::new(Mutex::new(OpenChapterZone::new(&geometry, zone_count))))
            .collect();
        let zone_counters: Vec<Arc<ZoneCounters>> = (0..zone_count)
            .map(|_| Arc::new(ZoneCounters::default()))
            .collect();

        let mut zone_channels: Vec<(Sender<Box<Request>>, Receiver<Box<Request>>)> =
            (0..zone_count).map(|_| unbounded()).collect();
        let shared = Arc::new(IndexShared {
            geometry,
            volume: Arc::clone(&volume),
            volume_index: Arc::clone(&volume_index),
            writer: Arc::clone(&writer),
            callback,
            need_to_save: AtomicBool::new(false),
            senders: Mutex::new(Some(
                zone_channels.iter().map(|(s, _)| s.clone()).collect(),
            )),
        });

        // Parked requests come back through their zone's queue.
        let restarter_shared = Arc::clone(&shared);
        volume.set_request_restarter(Arc::new(move |request| {
            restarter_shared.requeue(request);
        }));

        // Recover the chapter range before the zones start serving.
        let mut loaded = false;
        let recovered = match open_type {
            OpenType::Create => Ok((0, 0)),
            OpenType::Load | OpenType::NoRebuild => {
                match Self::load_index(&layout, &volume, &volume_index, &open_chapters) {
                    Ok(range) => {
                        loaded = true;
                        Ok(range)
                    }
                    Err(e) => {
                        error!("index could not be loaded: {}", e);
                        if open_type == OpenType::NoRebuild {
                            Err(KestrelError::NotSavedCleanly)
                        } else {
                            Self::rebuild_index(
                                &volume,
                                &volume_index,
                                &observer,
                                &load_context,
                                &geometry,
                            )
                        }
                    }
                }
            }
        };
        let (oldest, newest) = match recovered {
            Ok(range) => range,
            Err(e) => {
                // Nothing is serving requests yet; stop the threads that
                // have already started.
                writer.stop();
                volume.shutdown();
                if let Some(context) = &load_context {
                    context.set_state(LoadState::Freeing);
                }
                return Err(e);
            }
        };

        writer.set_chapter_range(oldest, newest);
        writer.set_has_saved_open_chapter(loaded);
        shared.need_to_save.store(!loaded, Ordering::Release);

        // Start the zone threads.
        let mut zone_threads = Vec::with_capacity(zone_count as usize);
        for z in (0..zone_count).rev() {
            let (_, receiver) = zone_channels.pop().expect("zone channel missing");
            let mut zone = IndexZone::new(
                z,
                Arc::clone(&open_chapters[z as usize]),
                Arc::new(OpenChapterZone::new(&geometry, zone_count)),
                oldest,
                newest,
                Arc::clone(&zone_counters[z as usize]),
            );
            let zone_shared = Arc::clone(&shared);
            zone_threads.push(
                std::thread::Builder::new()
                    .name(format!("kestrel-zone{}", z))
                    .spawn(move || {
                        for request in receiver {
                            zone.execute(&zone_shared, request);
                        }
                    })
                    .map_err(|e| {
                        KestrelError::BadState(format!("cannot start zone thread: {}", e))
                    })?,
            );
        }
        zone_threads.reverse();

        // The triage queue only exists for sparse multi-zone indexes.
        let mut triage_sender = None;
        let mut triage_thread = None;
        if zone_count > 1 && geometry.is_sparse() {
            let (sender, receiver): (Sender<Box<Request>>, Receiver<Box<Request>>) = unbounded();
            let triage_shared = Arc::clone(&shared);
            let triage_counters = zone_counters.clone();
            triage_thread = Some(
                std::thread::Builder::new()
                    .name("kestrel-triage".to_string())
                    .spawn(move || {
                        for request in receiver {
                            triage_request(&triage_shared, &triage_counters, request);
                        }
                    })
                    .map_err(|e| {
                        KestrelError::BadState(format!("cannot start triage thread: {}", e))
                    })?,
            );
            triage_sender = Some(sender);
        }

        if let Some(context) = &load_context {
            // If anyone is trying to suspend us, wake them; suspend is
            // meaningless now.
            context.set_state(LoadState::Ready);
        }

        Ok(Self {
            shared,
            layout,
            observer,
            open_chapters,
            zone_counters,
            zone_threads,
            triage_sender,
            triage_thread,
            zone_count,
        })
    }

    /// Submits a request at the given pipeline stage. The request will
    /// complete exactly once through the index callback.
    pub fn enqueue(&self, mut request: Box<Request>, stage: Stage) {
        match stage {
            Stage::Triage => {
                request.zone_number = self.shared.volume_index.zone_of(&request.name);
                match &self.triage_sender {
                    Some(sender) => {
                        let _ = sender.send(request);
                    }
                    None => self.shared.requeue(request),
                }
            }
            Stage::Index => {
                request.zone_number = self.shared.volume_index.zone_of(&request.name);
                self.shared.requeue(request);
            }
            Stage::Message => self.shared.requeue(request),
        }
    }

    /// Waits until the chapter writer has no outstanding work.
    pub fn wait_for_idle(&self) {
        self.shared.writer.wait_for_idle();
    }

    /// The zone every request for this name is routed to.
    pub fn zone_of(&self, name: &kestrel_common::RecordName) -> u32 {
        self.shared.volume_index.zone_of(name)
    }

    /// Whether this name is a sample (hook) in a sparse index.
    pub fn is_sample(&self, name: &kestrel_common::RecordName) -> bool {
        self.shared.volume_index.is_sample(name)
    }

    /// The index-wide (oldest, newest) chapter range.
    pub fn chapter_range(&self) -> (u64, u64) {
        self.shared.writer.chapter_range()
    }

    /// One zone's (oldest, newest) chapter counters.
    pub fn zone_chapter_range(&self, zone: u32) -> (u64, u64) {
        let counters = &self.zone_counters[zone as usize];
        (counters.oldest(), counters.newest())
    }

    /// The observability counters.
    pub fn observer(&self) -> &IndexObserver {
        &self.observer
    }

    /// A thread-safe snapshot of the index statistics.
    pub fn stats(&self) -> IndexStats {
        let vi = self.shared.volume_index.stats();
        IndexStats {
            entries_indexed: vi.record_count,
            memory_used: vi.memory_allocated
                + self.shared.volume.cache_size_bytes()
                + self.shared.writer.memory_allocated(),
            collisions: vi.collision_count,
            entries_discarded: vi.discard_count,
        }
    }

    /// Saves the index so the next open can load instead of rebuilding.
    /// The caller must have drained all requests first.
    pub fn save(&self) -> Result<()> {
        if !self.shared.need_to_save.load(Ordering::Acquire) {
            return Ok(());
        }
        self.wait_for_idle();

        let (oldest, newest) = self.shared.writer.chapter_range();
        info!("beginning save (vcn {})", newest);

        self.layout.save_state(&IndexState {
            newest_virtual_chapter: newest,
            oldest_virtual_chapter: oldest,
            zone_count: self.zone_count,
        })?;

        for zone in 0..self.zone_count {
            let mut writer = self.layout.volume_index_writer(zone)?;
            self.shared.volume_index.save_zone_to(zone, &mut writer)?;
            std::io::Write::flush(&mut writer)?;
        }

        let mut map_writer = self.layout.page_map_writer()?;
        self.shared.volume.save_index_page_map(&mut map_writer)?;
        std::io::Write::flush(&mut map_writer)?;

        {
            let guards: Vec<_> = self.open_chapters.iter().map(|c| c.lock()).collect();
            let zones: Vec<&OpenChapterZone> = guards.iter().map(|g| &**g).collect();
            let mut chapter_writer = self.layout.open_chapter_writer()?;
            save_open_chapters(newest, &zones, &mut chapter_writer)?;
            std::io::Write::flush(&mut chapter_writer)?;
        }

        self.shared.writer.set_has_saved_open_chapter(true);
        self.shared.need_to_save.store(false, Ordering::Release);
        info!("finished save (vcn {})", newest);
        Ok(())
    }

    /// Re-opens the volume at a new path. The index must be idle.
    pub fn replace_storage(&self, path: &std::path::Path) -> Result<()> {
        self.shared.volume.replace_storage(path)
    }

    /// Stops the pipeline: drains the queues, stops the writer (which
    /// exits only when idle), and shuts down the page cache readers.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.triage_sender.take();
        if let Some(thread) = self.triage_thread.take() {
            let _ = thread.join();
        }

        self.shared.close_senders();
        for thread in self.zone_threads.drain(..) {
            let _ = thread.join();
        }

        self.shared.writer.stop();
        self.shared.volume.shutdown();
    }

    fn load_index(
        layout: &IndexLayout,
        volume: &Volume,
        volume_index: &VolumeIndex,
        open_chapters: &[Arc<Mutex<OpenChapterZone>>],
    ) -> Result<(u64, u64)> {
        if !layout.has_saved_open_chapter() {
            return Err(KestrelError::NotSavedCleanly);
        }

        let state = layout.load_state().map_err(|_| KestrelError::NotSavedCleanly)?;
        let mut readers = layout
            .volume_index_readers(state.zone_count)
            .map_err(|_| KestrelError::NotSavedCleanly)?;
        volume_index
            .restore_from(&mut readers)
            .map_err(|_| KestrelError::NotSavedCleanly)?;

        let mut map_reader = layout
            .page_map_reader()
            .map_err(|_| KestrelError::NotSavedCleanly)?;
        volume
            .restore_index_page_map(&mut map_reader)
            .map_err(|_| KestrelError::NotSavedCleanly)?;

        let mut chapter_reader = layout
            .open_chapter_reader()
            .map_err(|_| KestrelError::NotSavedCleanly)?;
        let (open_chapter, records) =
            load_open_chapters(&mut chapter_reader).map_err(|_| KestrelError::NotSavedCleanly)?;
        if open_chapter != state.newest_virtual_chapter {
            return Err(KestrelError::NotSavedCleanly);
        }

        // Redistribute the saved open chapter, whatever the zone count.
        for record in records {
            let zone = volume_index.zone_of(&record.name);
            open_chapters[zone as usize]
                .lock()
                .put(&record.name, &record.data);
        }

        info!(
            "loaded index from chapter {} through chapter {}",
            state.oldest_virtual_chapter, state.newest_virtual_chapter
        );
        Ok((state.oldest_virtual_chapter, state.newest_virtual_chapter))
    }

    /// Walks the volume chapter by chapter, reconstructing the volume
    /// index and the index page map. Lossy: overflow and duplicate-name
    /// replay errors are swallowed.
    fn rebuild_index(
        volume: &Volume,
        volume_index: &VolumeIndex,
        observer: &IndexObserver,
        load_context: &Option<Arc<LoadContext>>,
        geometry: &Geometry,
    ) -> Result<(u64, u64)> {
        volume_index.reset();
        let (lowest, highest, is_empty) = volume.find_chapter_boundaries()?;
        if is_empty {
            return Ok((0, 0));
        }

        let newest = highest + 1;
        let mut oldest = lowest;
        if newest == oldest + geometry.chapters_per_volume as u64 {
            // Skip the chapter shadowed by the open chapter.
            oldest += 1;
        }

        info!(
            "replaying volume from chapter {} through chapter {}",
            oldest, newest
        );
        for virtual_chapter in oldest..newest {
            let sparse = geometry.is_chapter_sparse(oldest, newest, virtual_chapter);
            Self::replay_chapter(
                volume,
                volume_index,
                observer,
                load_context,
                geometry,
                virtual_chapter,
                sparse,
            )?;
        }

        // Also reap the chapter being replaced by the open chapter.
        volume_index.set_open_chapter(newest);
        Ok((oldest, newest))
    }

    fn replay_chapter(
        volume: &Volume,
        volume_index: &VolumeIndex,
        observer: &IndexObserver,
        load_context: &Option<Arc<LoadContext>>,
        geometry: &Geometry,
        virtual_chapter: u64,
        will_be_sparse: bool,
    ) -> Result<()> {
        if check_for_suspend(load_context) {
            info!(
                "replay interrupted by index shutdown at chapter {}",
                virtual_chapter
            );
            return Err(KestrelError::Busy("rebuild aborted".to_string()));
        }

        volume.prefetch_chapter(virtual_chapter);
        volume_index.set_open_chapter(virtual_chapter);

        // Rebuild the index page map from the chapter's own pages.
        let chapter = geometry.map_to_physical_chapter(virtual_chapter);
        let mut expected_list = 0u32;
        for index_page in 0..geometry.index_pages_per_chapter {
            let page = volume.get_index_page(virtual_chapter, index_page)?;
            if page.list_count() > 0 {
                if page.lowest_list_number() != expected_list {
                    return Err(KestrelError::CorruptData(format!(
                        "chapter {} index page {} is corrupt",
                        chapter, index_page
                    )));
                }
                expected_list = page.highest_list_number() + 1;
            }
            volume.update_index_page_map(
                virtual_chapter,
                chapter,
                index_page,
                page.highest_list_number(),
            );
        }

        for record_page in 0..geometry.record_pages_per_chapter {
            let data = volume.get_record_page(chapter, record_page)?;
            for slot in 0..geometry.records_per_page as usize {
                let offset = slot * kestrel_common::record::BYTES_PER_RECORD;
                let record = VolumeRecord::decode(
                    &data[offset..offset + kestrel_common::record::BYTES_PER_RECORD],
                );
                if record.name.0 == [0u8; 32] {
                    // An unfilled slot of a short chapter.
                    continue;
                }
                Self::replay_record(
                    volume,
                    volume_index,
                    &record.name,
                    virtual_chapter,
                    will_be_sparse,
                )?;
            }
        }

        observer.chapter_replayed();
        Ok(())
    }

    fn replay_record(
        volume: &Volume,
        volume_index: &VolumeIndex,
        name: &kestrel_common::RecordName,
        virtual_chapter: u64,
        will_be_sparse: bool,
    ) -> Result<()> {
        if will_be_sparse && !volume_index.is_sample(name) {
            // This record will land in a sparse chapter; only samples are
            // worth re-indexing.
            return Ok(());
        }

        let mut record = volume_index.get_record(name)?;
        let update_record = if record.is_found {
            if record.is_collision {
                if record.virtual_chapter == virtual_chapter {
                    // Already correct.
                    return Ok(());
                }
                true
            } else if record.virtual_chapter == virtual_chapter {
                // An entry points at this chapter, but it may belong to a
                // different name; assume it does not and accept one extra
                // collision record if a deleted record shared the list.
                false
            } else {
                // The entry points elsewhere; search that chapter to see
                // whether it is really for this name.
                matches!(
                    volume.search_page_cache(name, record.virtual_chapter, &mut None)?,
                    RecordProbe::Found(_)
                )
            }
        } else {
            false
        };

        let result = if update_record {
            volume_index.set_record_chapter(&mut record, virtual_chapter)
        } else {
            volume_index.put_record(&mut record, virtual_chapter)
        };
        match result {
            // The rebuilt index loses these records.
            Err(KestrelError::Overflow) | Err(KestrelError::DuplicateName) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decides whether a request should trigger sparse cache barriers, then
/// forwards it to its zone.
fn triage_request(
    shared: &IndexShared,
    counters: &[Arc<ZoneCounters>],
    request: Box<Request>,
) {
    match shared.volume_index.lookup(&request.name) {
        Ok(Some(virtual_chapter)) => {
            let zone = &counters[request.zone_number as usize];
            if shared
                .geometry
                .is_chapter_sparse(zone.oldest(), zone.newest(), virtual_chapter)
                && !shared.volume.sparse_cache().contains(virtual_chapter)
            {
                for z in 0..shared.zone_count() {
                    shared.send_message(ZoneMessage::SparseCacheBarrier(virtual_chapter), z);
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!("triage lookup failed: {}", e),
    }
    shared.requeue(request);
}

/// Polled between replayed chapters: parks the rebuild while the caller
/// suspends, and reports whether the rebuild should abort.
fn check_for_suspend(load_context: &Option<Arc<LoadContext>>) -> bool {
    let Some(context) = load_context else {
        return false;
    };

    let mut state = context.state.lock();
    if *state != LoadState::Suspending {
        return false;
    }

    // Announce the suspension and wait for a resume or an abort.
    *state = LoadState::Suspended;
    context.cond.notify_all();
    while *state != LoadState::Opening && *state != LoadState::Freeing {
        context.cond.wait(&mut state);
    }
    *state == LoadState::Freeing
}
