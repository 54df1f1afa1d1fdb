//! The block store backing a volume.
//!
//! A single file of fixed-size pages. Reads of pages that have never been
//! written return zeros, which upstream validation treats as corrupt (and
//! therefore absent) pages; this is what makes rebuilding a partially
//! written volume possible.

use kestrel_common::{KestrelError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A page-granular file store.
pub struct BlockStore {
    file: Mutex<File>,
    path: PathBuf,
    bytes_per_page: usize,
    page_count: u64,
    fsync_enabled: bool,
}

impl BlockStore {
    /// Opens or creates the store at the given path.
    pub fn open(
        path: impl Into<PathBuf>,
        bytes_per_page: usize,
        page_count: u64,
        fsync_enabled: bool,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            bytes_per_page,
            page_count,
            fsync_enabled,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size in bytes.
    pub fn bytes_per_page(&self) -> usize {
        self.bytes_per_page
    }

    /// Returns the number of pages this store can hold.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    fn check_page(&self, page: u64) -> Result<u64> {
        if page >= self.page_count {
            return Err(KestrelError::InvalidArgument(format!(
                "page {} beyond volume of {} pages",
                page, self.page_count
            )));
        }
        Ok(page * self.bytes_per_page as u64)
    }

    /// Reads one page. Pages never written read as zeros.
    pub fn read_page(&self, page: u64) -> Result<Vec<u8>> {
        let offset = self.check_page(page)?;
        let mut buffer = vec![0u8; self.bytes_per_page];

        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(buffer);
        }

        file.seek(SeekFrom::Start(offset))?;
        let available = ((file_size - offset) as usize).min(self.bytes_per_page);
        file.read_exact(&mut buffer[..available])?;
        Ok(buffer)
    }

    /// Writes one page, extending the file as needed.
    pub fn write_page(&self, page: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.bytes_per_page {
            return Err(KestrelError::InvalidArgument(format!(
                "page data is {} bytes, expected {}",
                data.len(),
                self.bytes_per_page
            )));
        }
        let offset = self.check_page(page)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if self.fsync_enabled {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Hints that the given pages will be read soon. The buffered store
    /// has nothing useful to do with the hint.
    pub fn prefetch(&self, _page: u64, _count: u32) {}

    /// Flushes all pending writes to the device.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
