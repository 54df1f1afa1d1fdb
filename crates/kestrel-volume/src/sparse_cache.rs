//! The sparse chapter index cache.
//!
//! A fully-associative cache of decoded chapter indexes for sparse
//! chapters. Every zone must agree on its contents, so membership changes
//! are funneled through barrier messages: each zone, on dequeuing its
//! barrier, arrives at [`SparseCache::update`] and blocks until all zones
//! have arrived; the last arrival performs the membership change and
//! releases the rest. A single-zone index passes through the barrier
//! immediately, which is how the inline simulation works.

use kestrel_delta::DeltaIndexPage;
use kestrel_common::{Geometry, RecordName, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

struct CachedChapter {
    virtual_chapter: u64,
    index_pages: Vec<DeltaIndexPage>,
    last_used: AtomicU64,
}

struct BarrierState {
    waiting: u32,
    generation: u64,
}

/// A cache of chapter indexes for sparse chapters.
pub struct SparseCache {
    geometry: Geometry,
    capacity: usize,
    zone_count: u32,
    chapters: RwLock<Vec<CachedChapter>>,
    clock: AtomicU64,
    barrier: Mutex<BarrierState>,
    barrier_cond: Condvar,
}

impl SparseCache {
    /// Creates a cache holding up to `capacity` chapter indexes,
    /// coordinated across `zone_count` zones.
    pub fn new(geometry: Geometry, capacity: usize, zone_count: u32) -> Self {
        Self {
            geometry,
            capacity,
            zone_count,
            chapters: RwLock::new(Vec::new()),
            clock: AtomicU64::new(0),
            barrier: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            barrier_cond: Condvar::new(),
        }
    }

    /// Returns true if the chapter's index is cached.
    pub fn contains(&self, virtual_chapter: u64) -> bool {
        self.chapters
            .read()
            .iter()
            .any(|c| c.virtual_chapter == virtual_chapter)
    }

    /// The barrier rendezvous. Each zone calls this once per barrier
    /// message; the last zone to arrive loads the chapter (unless it is
    /// already cached) and releases the others.
    pub fn update<F>(&self, virtual_chapter: u64, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<DeltaIndexPage>>,
    {
        let mut barrier = self.barrier.lock();
        let generation = barrier.generation;
        barrier.waiting += 1;

        if barrier.waiting == self.zone_count {
            let result = if self.contains(virtual_chapter) {
                Ok(())
            } else {
                load().map(|pages| self.insert(virtual_chapter, pages))
            };
            barrier.waiting = 0;
            barrier.generation += 1;
            self.barrier_cond.notify_all();
            result
        } else {
            while barrier.generation == generation {
                self.barrier_cond.wait(&mut barrier);
            }
            Ok(())
        }
    }

    fn insert(&self, virtual_chapter: u64, index_pages: Vec<DeltaIndexPage>) {
        let mut chapters = self.chapters.write();
        if chapters.len() >= self.capacity {
            // Evict the least recently used chapter.
            let victim = chapters
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.last_used.load(Ordering::Relaxed))
                .map(|(i, _)| i)
                .expect("sparse cache has no capacity");
            chapters.swap_remove(victim);
        }
        chapters.push(CachedChapter {
            virtual_chapter,
            index_pages,
            last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed) + 1),
        });
    }

    /// Searches one cached chapter (or all of them, newest first) for a
    /// name. Returns the chapter and record page number on a hit.
    pub fn search(
        &self,
        name: &RecordName,
        target: Option<u64>,
    ) -> Result<Option<(u64, u32)>> {
        let list = name.chapter_delta_list(&self.geometry);
        let key = name.chapter_delta_address(&self.geometry);

        let chapters = self.chapters.read();
        let mut order: Vec<&CachedChapter> = chapters
            .iter()
            .filter(|c| target.map_or(true, |vc| c.virtual_chapter == vc))
            .collect();
        order.sort_by_key(|c| std::cmp::Reverse(c.virtual_chapter));

        for chapter in order {
            let page = chapter
                .index_pages
                .iter()
                .find(|p| p.lowest_list_number() <= list && list <= p.highest_list_number());
            let Some(page) = page else { continue };
            if let Some(record_page) = page.search(list, key, name)? {
                chapter
                    .last_used
                    .store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
                return Ok(Some((chapter.virtual_chapter, record_page)));
            }
        }
        Ok(None)
    }

    /// Drops the chapter from the cache, typically because it expired.
    pub fn invalidate(&self, virtual_chapter: u64) {
        let mut chapters = self.chapters.write();
        chapters.retain(|c| c.virtual_chapter != virtual_chapter);
    }

    /// Empties the cache.
    pub fn invalidate_all(&self) {
        self.chapters.write().clear();
    }

    /// Returns the number of cached chapters.
    pub fn len(&self) -> usize {
        self.chapters.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.chapters.read().is_empty()
    }
}
