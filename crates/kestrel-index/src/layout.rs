//! On-disk layout of the index saves.
//!
//! Beside the volume file, a save directory holds the index state, the
//! volume index zone streams, the index page map, and the open chapter.
//! The open chapter file doubles as the clean-shutdown marker: its
//! absence on load means the last shutdown did not save, and a full
//! rebuild is required.

use bytes::{Buf, BufMut, BytesMut};
use kestrel_common::{KestrelError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic identifying the saved index state.
pub const INDEX_STATE_MAGIC: &[u8; 8] = b"IST-0001";

/// The persistent counters of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexState {
    pub newest_virtual_chapter: u64,
    pub oldest_virtual_chapter: u64,
    pub zone_count: u32,
}

/// Paths and helpers for the index save files.
pub struct IndexLayout {
    save_dir: PathBuf,
}

impl IndexLayout {
    /// Creates the layout rooted at the index data directory.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let save_dir = data_dir.join("save");
        std::fs::create_dir_all(&save_dir)?;
        Ok(Self { save_dir })
    }

    fn state_path(&self) -> PathBuf {
        self.save_dir.join("index_state")
    }

    fn volume_index_path(&self, zone: u32) -> PathBuf {
        self.save_dir.join(format!("volume_index_{}", zone))
    }

    fn page_map_path(&self) -> PathBuf {
        self.save_dir.join("index_page_map")
    }

    fn open_chapter_path(&self) -> PathBuf {
        self.save_dir.join("open_chapter")
    }

    /// Writes the index state file.
    pub fn save_state(&self, state: &IndexState) -> Result<()> {
        let mut buffer = BytesMut::new();
        buffer.put_slice(INDEX_STATE_MAGIC);
        buffer.put_u64_le(state.newest_virtual_chapter);
        buffer.put_u64_le(state.oldest_virtual_chapter);
        buffer.put_u32_le(state.zone_count);

        let mut file = File::create(self.state_path())?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the index state file.
    pub fn load_state(&self) -> Result<IndexState> {
        let mut file = File::open(self.state_path())?;
        let mut data = [0u8; 8 + 8 + 8 + 4];
        file.read_exact(&mut data)?;
        let mut buf = &data[..];

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != INDEX_STATE_MAGIC {
            return Err(KestrelError::CorruptData(
                "index state has bad magic number".to_string(),
            ));
        }
        Ok(IndexState {
            newest_virtual_chapter: buf.get_u64_le(),
            oldest_virtual_chapter: buf.get_u64_le(),
            zone_count: buf.get_u32_le(),
        })
    }

    /// Opens a writer for one volume index zone stream.
    pub fn volume_index_writer(&self, zone: u32) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(self.volume_index_path(zone))?))
    }

    /// Opens readers for every saved volume index zone stream.
    pub fn volume_index_readers(&self, zone_count: u32) -> Result<Vec<BufReader<File>>> {
        (0..zone_count)
            .map(|z| Ok(BufReader::new(File::open(self.volume_index_path(z))?)))
            .collect()
    }

    /// Opens a writer for the index page map.
    pub fn page_map_writer(&self) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(self.page_map_path())?))
    }

    /// Opens a reader for the index page map.
    pub fn page_map_reader(&self) -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(self.page_map_path())?))
    }

    /// Opens a writer for the open chapter save.
    pub fn open_chapter_writer(&self) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(self.open_chapter_path())?))
    }

    /// Opens a reader for the open chapter save, if one exists.
    pub fn open_chapter_reader(&self) -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(self.open_chapter_path())?))
    }

    /// Returns true if a saved open chapter exists, the sign of a clean
    /// shutdown.
    pub fn has_saved_open_chapter(&self) -> bool {
        self.open_chapter_path().exists()
    }

    /// Removes the saved open chapter. Done the first time a chapter
    /// closes after a clean load, so an unclean shutdown is detectable.
    pub fn discard_open_chapter(&self) -> Result<()> {
        let path = self.open_chapter_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
            debug!("discarded saved open chapter");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let layout = IndexLayout::new(dir.path()).unwrap();
        let state = IndexState {
            newest_virtual_chapter: 42,
            oldest_virtual_chapter: 33,
            zone_count: 4,
        };
        layout.save_state(&state).unwrap();
        assert_eq!(layout.load_state().unwrap(), state);
    }

    #[test]
    fn test_missing_state_is_an_error() {
        let dir = tempdir().unwrap();
        let layout = IndexLayout::new(dir.path()).unwrap();
        assert!(layout.load_state().is_err());
    }

    #[test]
    fn test_open_chapter_marker() {
        let dir = tempdir().unwrap();
        let layout = IndexLayout::new(dir.path()).unwrap();
        assert!(!layout.has_saved_open_chapter());

        layout.open_chapter_writer().unwrap().write_all(b"x").unwrap();
        assert!(layout.has_saved_open_chapter());

        layout.discard_open_chapter().unwrap();
        assert!(!layout.has_saved_open_chapter());

        // Discarding twice is harmless.
        layout.discard_open_chapter().unwrap();
    }
}
