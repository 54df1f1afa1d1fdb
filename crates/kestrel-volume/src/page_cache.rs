//! The chapter page cache.
//!
//! A bounded cache of on-disk chapter pages with in-flight read
//! coalescing: at most one disk read is ever outstanding for a physical
//! page, and every request that arrives while a read is in flight is
//! attached to it. A pool of reader threads drains the read queue, fills
//! the cache, and hands each attached request to the registered request
//! restarter.
//!
//! Lookups that run outside the cache lock bracket their access with
//! [`PageCache::begin_pending_search`] / [`PageCache::end_pending_search`]
//! so that invalidation can wait until no consumer references the page it
//! is evicting.

use kestrel_common::{KestrelError, Request, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on queued or in-flight page reads. The queue holds at most
/// one fewer entries, ring-buffer style.
pub const VOLUME_CACHE_MAX_QUEUED_READS: usize = 4096;

/// Re-enqueues a request whose page read has completed.
pub type RequestRestarter = Arc<dyn Fn(Box<Request>) + Send + Sync>;

/// Reads one physical page from the underlying store.
pub type PageReader = Arc<dyn Fn(u64) -> Result<Vec<u8>> + Send + Sync>;

/// The outcome of [`PageCache::enqueue_read`].
#[derive(Debug)]
pub enum EnqueueResult {
    /// The request is attached to a new or existing in-flight read.
    Queued,
    /// The page was already cached; the request was not consumed.
    Cached(Arc<Vec<u8>>, Box<Request>),
    /// The read queue is full; the caller must retry later.
    Rejected(Box<Request>),
}

struct CachedPage {
    /// Physical page stored one-based; zero means the slot is empty.
    physical_page: u64,
    last_used: u64,
    data: Arc<Vec<u8>>,
}

struct QueuedRead {
    waiters: Vec<Box<Request>>,
    /// Set when the page was invalidated while the read was queued; the
    /// read still completes its waiters but does not populate the cache.
    invalid: bool,
}

struct CacheState {
    entries: Vec<CachedPage>,
    /// Physical page (one-based) to entry slot.
    map: HashMap<u64, usize>,
    free: Vec<usize>,
    clock: u64,
    queue: VecDeque<u64>,
    pending: HashMap<u64, QueuedRead>,
    stopped: bool,
    shutdown: bool,
}

/// A bounded page cache with read coalescing.
pub struct PageCache {
    state: Mutex<CacheState>,
    read_cond: Condvar,
    /// Per-zone pending search markers: physical page + 1 while a search
    /// is in progress, zero when idle.
    pending_searches: Vec<AtomicU64>,
    restarter: RwLock<Option<RequestRestarter>>,
    page_reader: PageReader,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl PageCache {
    /// Creates a cache of `cache_size` page entries with a pool of reader
    /// threads.
    pub fn new(
        cache_size: usize,
        zone_count: u32,
        read_threads: u32,
        page_reader: PageReader,
    ) -> Arc<Self> {
        let entries = (0..cache_size)
            .map(|_| CachedPage {
                physical_page: 0,
                last_used: 0,
                data: Arc::new(Vec::new()),
            })
            .collect();

        let cache = Arc::new(Self {
            state: Mutex::new(CacheState {
                entries,
                map: HashMap::new(),
                free: (0..cache_size).collect(),
                clock: 0,
                queue: VecDeque::new(),
                pending: HashMap::new(),
                stopped: false,
                shutdown: false,
            }),
            read_cond: Condvar::new(),
            pending_searches: (0..zone_count).map(|_| AtomicU64::new(0)).collect(),
            restarter: RwLock::new(None),
            page_reader,
            readers: Mutex::new(Vec::new()),
        });

        let mut readers = cache.readers.lock();
        for i in 0..read_threads {
            let cache = Arc::clone(&cache);
            readers.push(
                std::thread::Builder::new()
                    .name(format!("kestrel-reader{}", i))
                    .spawn(move || cache.read_loop())
                    .expect("failed to spawn reader thread"),
            );
        }
        drop(readers);
        cache
    }

    /// Registers the callback that re-enqueues restarted requests.
    pub fn set_request_restarter(&self, restarter: RequestRestarter) {
        *self.restarter.write() = Some(restarter);
    }

    /// Marks the start of a lock-free search of the given page.
    pub fn begin_pending_search(&self, physical_page: u64, zone: u32) {
        self.pending_searches[zone as usize].store(physical_page + 1, Ordering::Release);
    }

    /// Marks the end of a lock-free search.
    pub fn end_pending_search(&self, zone: u32) {
        self.pending_searches[zone as usize].store(0, Ordering::Release);
    }

    fn wait_for_pending_searches(&self, physical_page: u64) {
        // Callers must not hold the cache lock here: a searcher with its
        // marker set may be blocked acquiring it.
        let marker = physical_page + 1;
        loop {
            let busy = self
                .pending_searches
                .iter()
                .any(|p| p.load(Ordering::Acquire) == marker);
            if !busy {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Looks up a page, bumping its recency.
    pub fn get(&self, physical_page: u64) -> Option<Arc<Vec<u8>>> {
        let mut state = self.state.lock();
        state.clock += 1;
        let clock = state.clock;
        if let Some(&slot) = state.map.get(&(physical_page + 1)) {
            let entry = &mut state.entries[slot];
            entry.last_used = clock;
            return Some(Arc::clone(&entry.data));
        }
        None
    }

    /// Inserts a page read outside the reader threads.
    pub fn install(&self, physical_page: u64, data: Arc<Vec<u8>>) {
        let mut state = self.state.lock();
        self.install_locked(&mut state, physical_page, data);
    }

    fn install_locked(&self, state: &mut CacheState, physical_page: u64, data: Arc<Vec<u8>>) {
        state.clock += 1;
        let clock = state.clock;
        let key = physical_page + 1;

        if let Some(&slot) = state.map.get(&key) {
            let entry = &mut state.entries[slot];
            entry.last_used = clock;
            entry.data = data;
            return;
        }

        let slot = if let Some(slot) = state.free.pop() {
            slot
        } else {
            // Evict the least recently used entry. The data is reference
            // counted, so a concurrent consumer keeps its copy alive.
            let victim = state
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
                .expect("page cache has no entries");
            let old_key = state.entries[victim].physical_page;
            state.map.remove(&old_key);
            victim
        };

        state.entries[slot] = CachedPage {
            physical_page: key,
            last_used: clock,
            data,
        };
        state.map.insert(key, slot);
    }

    /// Attaches a request to a read of the given page, scheduling the read
    /// if one is not already queued or in flight. Never holds two reads
    /// for the same physical page.
    pub fn enqueue_read(&self, request: Box<Request>, physical_page: u64) -> EnqueueResult {
        let mut state = self.state.lock();

        if let Some(&slot) = state.map.get(&(physical_page + 1)) {
            state.clock += 1;
            let clock = state.clock;
            let entry = &mut state.entries[slot];
            entry.last_used = clock;
            return EnqueueResult::Cached(Arc::clone(&entry.data), request);
        }

        if let Some(read) = state.pending.get_mut(&physical_page) {
            read.waiters.push(request);
            return EnqueueResult::Queued;
        }

        if state.queue.len() >= VOLUME_CACHE_MAX_QUEUED_READS - 1 {
            return EnqueueResult::Rejected(request);
        }

        state.pending.insert(
            physical_page,
            QueuedRead {
                waiters: vec![request],
                invalid: false,
            },
        );
        state.queue.push_back(physical_page);
        drop(state);
        self.read_cond.notify_one();
        EnqueueResult::Queued
    }

    /// Pauses the reader threads without losing queued work.
    pub fn stop_readers(&self) {
        self.state.lock().stopped = true;
    }

    /// Resumes the reader threads.
    pub fn start_readers(&self) {
        self.state.lock().stopped = false;
        self.read_cond.notify_all();
    }

    fn read_loop(&self) {
        loop {
            let physical_page = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if !state.stopped {
                        if let Some(page) = state.queue.pop_front() {
                            break page;
                        }
                    }
                    self.read_cond.wait(&mut state);
                }
            };

            let result = (self.page_reader)(physical_page);

            let (waiters, error) = {
                let mut state = self.state.lock();
                let Some(read) = state.pending.remove(&physical_page) else {
                    // Shutdown claimed the pending reads while this read
                    // was in flight; it will fail the waiters itself.
                    continue;
                };
                match result {
                    Ok(data) => {
                        if !read.invalid {
                            self.install_locked(&mut state, physical_page, Arc::new(data));
                        }
                        (read.waiters, None)
                    }
                    Err(e) => {
                        warn!("page {} read failed: {}", physical_page, e);
                        (read.waiters, Some(e.to_string()))
                    }
                }
            };

            let restarter = self.restarter.read().clone();
            for mut waiter in waiters {
                waiter.requeued = true;
                if let Some(message) = &error {
                    waiter.status = Err(KestrelError::BufferError(message.clone()));
                }
                match &restarter {
                    Some(restart) => restart(waiter),
                    None => debug!("dropping restarted request: no restarter registered"),
                }
            }
        }
    }

    /// Removes any cache entry for the page and marks a queued read of it
    /// invalid. Waits until no in-progress search references the page.
    pub fn invalidate_page(&self, physical_page: u64) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.map.remove(&(physical_page + 1)) {
                state.entries[slot].physical_page = 0;
                state.entries[slot].data = Arc::new(Vec::new());
                state.free.push(slot);
            }
            if let Some(read) = state.pending.get_mut(&physical_page) {
                read.invalid = true;
            }
        }
        self.wait_for_pending_searches(physical_page);
    }

    /// Evicts every page of an expiring chapter.
    pub fn invalidate_chapter(&self, first_physical_page: u64, page_count: u32) {
        for page in 0..page_count as u64 {
            self.invalidate_page(first_physical_page + page);
        }
    }

    /// Returns the number of bytes of page data the cache can hold.
    pub fn size_bytes(&self, bytes_per_page: usize) -> u64 {
        (self.state.lock().entries.len() * bytes_per_page) as u64
    }

    /// Stops the reader threads and fails any queued requests.
    pub fn shutdown(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.queue.clear();
            std::mem::take(&mut state.pending)
        };
        self.read_cond.notify_all();

        let mut readers = self.readers.lock();
        for reader in readers.drain(..) {
            let _ = reader.join();
        }

        let restarter = self.restarter.read().clone();
        for (_, read) in pending {
            for mut waiter in read.waiters {
                waiter.requeued = true;
                waiter.status = Err(KestrelError::BadState("page cache shut down".to_string()));
                if let Some(restart) = &restarter {
                    restart(waiter);
                }
            }
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
