//! The chapter writer.
//!
//! A single dedicated thread commits chapters to the volume. Each zone
//! that fills its open chapter hands the closed chapter to the writer and
//! keeps going; when every zone has submitted its share, the writer merges
//! the zones' records into a chapter index, collates the records into
//! record pages, writes the chapter, and publishes the new chapter range.
//! One mutex and condvar protect all of the coordination state.

use crate::chapter_index::OpenChapterIndex;
use crate::index::IndexObserver;
use crate::layout::IndexLayout;
use crate::open_chapter::OpenChapterZone;
use kestrel_common::record::VolumeRecord;
use kestrel_common::{Geometry, KestrelError, Result};
use kestrel_volume::Volume;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

struct WriterState {
    /// Set to stop the thread; it exits only when idle.
    stop: bool,
    /// The result of the most recent chapter write.
    error: Option<String>,
    /// Number of zones that have submitted a chapter for writing.
    zones_to_write: u32,
    /// The submitted chapters, one slot per zone.
    chapters: Vec<Option<Arc<OpenChapterZone>>>,
    /// The index-wide chapter range, published under the writer mutex.
    newest_virtual_chapter: u64,
    oldest_virtual_chapter: u64,
    /// Whether a clean-shutdown open chapter save still exists on disk.
    has_saved_open_chapter: bool,
}

/// The chapter writer thread and its coordination state.
pub struct ChapterWriter {
    geometry: Geometry,
    zone_count: u32,
    state: Mutex<WriterState>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    memory_allocated: u64,
}

impl ChapterWriter {
    /// Creates the writer and starts its thread.
    pub fn start(
        geometry: Geometry,
        zone_count: u32,
        volume: Arc<Volume>,
        layout: Arc<IndexLayout>,
        observer: Arc<IndexObserver>,
    ) -> Result<Arc<Self>> {
        let chapter_index = OpenChapterIndex::new(geometry)?;
        let memory_allocated = chapter_index.memory_allocated()
            + geometry.records_per_chapter as u64 * std::mem::size_of::<VolumeRecord>() as u64;

        let writer = Arc::new(Self {
            geometry,
            zone_count,
            state: Mutex::new(WriterState {
                stop: false,
                error: None,
                zones_to_write: 0,
                chapters: (0..zone_count).map(|_| None).collect(),
                newest_virtual_chapter: 0,
                oldest_virtual_chapter: 0,
                has_saved_open_chapter: false,
            }),
            cond: Condvar::new(),
            thread: Mutex::new(None),
            memory_allocated,
        });

        let thread_writer = Arc::clone(&writer);
        let handle = std::thread::Builder::new()
            .name("kestrel-writer".to_string())
            .spawn(move || {
                thread_writer.close_chapters(volume, layout, observer, chapter_index)
            })
            .map_err(|e| KestrelError::BadState(format!("cannot start chapter writer: {}", e)))?;
        *writer.thread.lock() = Some(handle);
        Ok(writer)
    }

    /// The writer thread: waits until every zone has submitted a chapter,
    /// commits it, and publishes the new chapter range.
    fn close_chapters(
        &self,
        volume: Arc<Volume>,
        layout: Arc<IndexLayout>,
        observer: Arc<IndexObserver>,
        mut chapter_index: OpenChapterIndex,
    ) {
        debug!("chapter writer starting");
        loop {
            let (chapters, virtual_chapter, discard_save) = {
                let mut state = self.state.lock();
                loop {
                    if state.zones_to_write >= self.zone_count {
                        break;
                    }
                    if state.stop && state.zones_to_write == 0 {
                        debug!("chapter writer stopping");
                        return;
                    }
                    self.cond.wait(&mut state);
                }

                let chapters: Vec<Arc<OpenChapterZone>> = state
                    .chapters
                    .iter_mut()
                    .map(|slot| slot.take().expect("zone submitted no chapter"))
                    .collect();
                let discard_save = state.has_saved_open_chapter;
                state.has_saved_open_chapter = false;
                (chapters, state.newest_virtual_chapter, discard_save)
            };

            if discard_save {
                // The absence of the saved open chapter is what marks the
                // next load as needing recovery.
                if let Err(e) = layout.discard_open_chapter() {
                    warn!("could not discard saved open chapter: {}", e);
                }
            }

            let result =
                close_open_chapter(&chapters, &volume, &mut chapter_index, virtual_chapter);
            observer.chapter_written();

            let mut state = self.state.lock();
            state.newest_virtual_chapter += 1;
            state.oldest_virtual_chapter += self
                .geometry
                .chapters_to_expire(state.newest_virtual_chapter)
                as u64;
            state.error = result.err().map(|e| e.to_string());
            state.zones_to_write = 0;
            self.cond.notify_all();
        }
    }

    /// Waits until every chapter older than `current_chapter` has been
    /// committed, then surfaces the most recent write result.
    pub fn finish_previous_chapter(&self, current_chapter: u64) -> Result<()> {
        let mut state = self.state.lock();
        while state.newest_virtual_chapter < current_chapter {
            self.cond.wait(&mut state);
        }
        match &state.error {
            Some(message) => {
                error!("writing of previous open chapter failed: {}", message);
                Err(KestrelError::ChapterWrite(message.clone()))
            }
            None => Ok(()),
        }
    }

    /// Submits a zone's closed chapter. The chapter is not written until
    /// every zone has submitted; returns how many have.
    pub fn start_closing_chapter(&self, zone: u32, chapter: Arc<OpenChapterZone>) -> u32 {
        let mut state = self.state.lock();
        state.zones_to_write += 1;
        state.chapters[zone as usize] = Some(chapter);
        let finished = state.zones_to_write;
        self.cond.notify_all();
        finished
    }

    /// Waits until no chapter write is outstanding.
    pub fn wait_for_idle(&self) {
        let mut state = self.state.lock();
        while state.zones_to_write > 0 {
            self.cond.wait(&mut state);
        }
    }

    /// The index-wide (oldest, newest) chapter range.
    pub fn chapter_range(&self) -> (u64, u64) {
        let state = self.state.lock();
        (
            state.oldest_virtual_chapter,
            state.newest_virtual_chapter,
        )
    }

    /// Installs the chapter range after a load or rebuild.
    pub fn set_chapter_range(&self, oldest: u64, newest: u64) {
        let mut state = self.state.lock();
        state.oldest_virtual_chapter = oldest;
        state.newest_virtual_chapter = newest;
    }

    /// Records whether a clean-shutdown open chapter save exists.
    pub fn set_has_saved_open_chapter(&self, saved: bool) {
        self.state.lock().has_saved_open_chapter = saved;
    }

    /// Bytes of memory held by the writer's index and collation buffers.
    pub fn memory_allocated(&self) -> u64 {
        self.memory_allocated
    }

    /// Stops the writer thread. It finishes any chapter in progress
    /// first and exits only when idle.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stop = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Merges every zone's records into the chapter index, collates them into
/// record-page order, and writes the chapter.
fn close_open_chapter(
    chapters: &[Arc<OpenChapterZone>],
    volume: &Volume,
    chapter_index: &mut OpenChapterIndex,
    virtual_chapter: u64,
) -> Result<()> {
    let geometry = volume.geometry();
    chapter_index.empty(virtual_chapter);

    // Interleave the zones' records, skipping tombstones.
    let mut collated: Vec<VolumeRecord> =
        Vec::with_capacity(geometry.records_per_chapter as usize);
    let max_size = chapters.iter().map(|c| c.size()).max().unwrap_or(0);
    for record_number in 1..=max_size {
        for zone in chapters {
            if let Some(record) = zone.record(record_number) {
                collated.push(*record);
            }
        }
    }

    // Group records by delta list so each index page's lists refer only
    // to that page's record pages.
    collated.sort_by_key(|record| record.name.chapter_delta_list(geometry));

    for (i, record) in collated.iter().enumerate() {
        let record_page = i as u32 / geometry.records_per_page;
        chapter_index.put(&record.name, record_page)?;
    }

    debug!(
        "writing chapter {} with {} records",
        virtual_chapter,
        collated.len()
    );
    volume.write_chapter(virtual_chapter, chapter_index.delta_index(), &collated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::record::{RecordData, RecordName};
    use kestrel_common::IndexConfig;
    use kestrel_volume::RecordProbe;
    use tempfile::tempdir;

    fn test_setup(zone_count: u32) -> (Arc<Volume>, Arc<IndexLayout>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = IndexConfig::new(Geometry::small_test(), dir.path());
        config.zone_count = zone_count;
        let volume = Arc::new(Volume::new(&config).unwrap());
        let layout = Arc::new(IndexLayout::new(dir.path()).unwrap());
        (volume, layout, dir)
    }

    fn filled_chapter(geometry: &Geometry, zone_count: u32, seed: u8) -> OpenChapterZone {
        let mut zone = OpenChapterZone::new(geometry, zone_count);
        for i in 0..zone.capacity() {
            let mut name = [seed; 32];
            name[8..12].copy_from_slice(&i.to_be_bytes());
            name[20] = seed;
            zone.put(&RecordName(name), &RecordData([seed; 16]));
        }
        zone
    }

    #[test]
    fn test_single_zone_commit() {
        let (volume, layout, _dir) = test_setup(1);
        let geometry = *volume.geometry();
        let observer = Arc::new(IndexObserver::default());
        let writer = ChapterWriter::start(
            geometry,
            1,
            Arc::clone(&volume),
            layout,
            Arc::clone(&observer),
        )
        .unwrap();

        let chapter = Arc::new(filled_chapter(&geometry, 1, 1));
        let finished = writer.start_closing_chapter(0, Arc::clone(&chapter));
        assert_eq!(finished, 1);

        writer.finish_previous_chapter(1).unwrap();
        assert_eq!(observer.chapters_written(), 1);
        assert_eq!(writer.chapter_range(), (0, 1));

        // Every record of the committed chapter is findable on disk.
        for i in 1..=chapter.size() {
            let record = chapter.record(i).unwrap();
            let probe = volume
                .search_page_cache(&record.name, 0, &mut None)
                .unwrap();
            assert_eq!(probe, RecordProbe::Found(record.data));
        }

        writer.stop();
    }

    #[test]
    fn test_writer_waits_for_all_zones() {
        let (volume, layout, _dir) = test_setup(2);
        let geometry = *volume.geometry();
        let observer = Arc::new(IndexObserver::default());
        let writer = ChapterWriter::start(
            geometry,
            2,
            Arc::clone(&volume),
            layout,
            Arc::clone(&observer),
        )
        .unwrap();

        let chapter_a = Arc::new(filled_chapter(&geometry, 2, 1));
        assert_eq!(writer.start_closing_chapter(0, chapter_a), 1);

        // One zone is not enough to trigger a write.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(observer.chapters_written(), 0);
        assert_eq!(writer.chapter_range(), (0, 0));

        let chapter_b = Arc::new(filled_chapter(&geometry, 2, 2));
        assert_eq!(writer.start_closing_chapter(1, chapter_b), 2);

        writer.finish_previous_chapter(1).unwrap();
        assert_eq!(observer.chapters_written(), 1);
        writer.wait_for_idle();
        writer.stop();
    }

    #[test]
    fn test_stop_while_idle() {
        let (volume, layout, _dir) = test_setup(1);
        let geometry = *volume.geometry();
        let writer = ChapterWriter::start(
            geometry,
            1,
            volume,
            layout,
            Arc::new(IndexObserver::default()),
        )
        .unwrap();
        writer.stop();
    }

    #[test]
    fn test_discards_saved_open_chapter_on_first_close() {
        let (volume, layout, _dir) = test_setup(1);
        let geometry = *volume.geometry();
        std::io::Write::write_all(
            &mut layout.open_chapter_writer().unwrap(),
            b"placeholder",
        )
        .unwrap();
        assert!(layout.has_saved_open_chapter());

        let writer = ChapterWriter::start(
            geometry,
            1,
            Arc::clone(&volume),
            Arc::clone(&layout),
            Arc::new(IndexObserver::default()),
        )
        .unwrap();
        writer.set_has_saved_open_chapter(true);

        let chapter = Arc::new(filled_chapter(&geometry, 1, 3));
        writer.start_closing_chapter(0, chapter);
        writer.finish_previous_chapter(1).unwrap();

        assert!(
            !layout.has_saved_open_chapter(),
            "first close discards the clean-shutdown marker"
        );
        writer.stop();
    }
}
