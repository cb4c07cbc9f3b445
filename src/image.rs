//! In-memory image of the target binary.
//!
//! The whole file is memory-mapped once and copied into an owned buffer. All
//! reads and writes go through bounds-checked accessors, and the buffer is
//! written back in one pass by [`BinaryImage::flush`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::macho::{parse_slice_table, SliceTable};
use crate::util::checked_range;

/// Mutable byte image of a target file.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    /// Backing file, if the image was loaded from disk
    path: Option<PathBuf>,
    /// File contents
    data: Vec<u8>,
    /// Whether the buffer differs from what was loaded
    dirty: bool,
}

impl BinaryImage {
    /// Loads a file into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        let len = file.metadata()?.len();
        // Zero-length files cannot be mapped on every platform.
        let data = if len == 0 {
            Vec::new()
        } else {
            // SAFETY: the target is exclusively owned for the session.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
                path: path.to_path_buf(),
                source: e,
            })?;
            mmap.to_vec()
        };

        debug!("loaded {} ({} bytes)", path.display(), data.len());

        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
            dirty: false,
        })
    }

    /// Wraps an in-memory buffer with no backing file.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            path: None,
            data,
            dirty: false,
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the image size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the image is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the buffer has unflushed changes.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Parses the fat slice table of the current contents.
    pub fn slice_table(&self) -> SliceTable {
        parse_slice_table(&self.data)
    }

    /// Reads `len` bytes at `offset`, or `None` if out of bounds.
    #[inline]
    pub fn read(&self, offset: u64, len: usize) -> Option<&[u8]> {
        checked_range(offset, len, self.data.len()).map(|r| &self.data[r])
    }

    /// Reads `len` bytes at `offset` on behalf of a named site.
    pub fn read_checked(&self, name: &str, offset: u64, len: usize) -> Result<&[u8]> {
        self.read(offset, len)
            .ok_or_else(|| Error::out_of_bounds(name, offset, len, self.data.len()))
    }

    /// Writes bytes at `offset` on behalf of a named site.
    ///
    /// Fails without touching the buffer if any part of the range is out of
    /// bounds.
    pub fn write(&mut self, name: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let range = checked_range(offset, bytes.len(), self.data.len())
            .ok_or_else(|| Error::out_of_bounds(name, offset, bytes.len(), self.data.len()))?;
        self.data[range].copy_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    /// Writes the buffer back to its file through a writable mapping.
    ///
    /// Returns `Ok(false)` if there was nothing to flush (clean buffer or no
    /// backing file). The file length must still match the buffer.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::FileOpen {
                path: path.clone(),
                source: e,
            })?;

        let on_disk = file.metadata()?.len();
        if on_disk != self.data.len() as u64 {
            return Err(Error::FileChanged {
                path,
                expected: self.data.len() as u64,
                actual: on_disk,
            });
        }

        // SAFETY: the target is exclusively owned for the session.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;
        mmap.copy_from_slice(&self.data);
        mmap.flush().map_err(|e| Error::FileWrite {
            path: path.clone(),
            source: e,
        })?;

        debug!("flushed {} bytes to {}", self.data.len(), path.display());
        self.dirty = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_in_bounds() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x20]);
        image.write("site", 0x10, &[1, 2, 3]).unwrap();

        assert!(image.is_dirty());
        assert_eq!(image.read(0x10, 3), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_write_out_of_bounds_fails_closed() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x20]);
        let err = image.write("site", 0x1E, &[0xFF; 4]).unwrap_err();

        assert!(matches!(err, Error::SiteOutOfBounds { .. }));
        assert!(!image.is_dirty());
        assert!(image.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let image = BinaryImage::from_bytes(vec![0u8; 0x20]);
        assert!(image.read(0x20, 1).is_none());
        assert!(image.read(u64::MAX, 1).is_none());
        assert!(image.read_checked("x", 0x1F, 2).is_err());
    }

    #[test]
    fn test_flush_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        std::fs::write(&path, vec![0u8; 0x100]).unwrap();

        let mut image = BinaryImage::open(&path).unwrap();
        assert!(!image.flush().unwrap());

        image.write("site", 0x80, &[0xAA, 0xBB]).unwrap();
        assert!(image.flush().unwrap());
        assert!(!image.is_dirty());

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[0x80..0x82], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_flush_detects_resized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        std::fs::write(&path, vec![0u8; 0x100]).unwrap();

        let mut image = BinaryImage::open(&path).unwrap();
        image.write("site", 0, &[1]).unwrap();
        std::fs::write(&path, vec![0u8; 0x80]).unwrap();

        assert!(matches!(image.flush(), Err(Error::FileChanged { .. })));
    }

    #[test]
    fn test_open_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let image = BinaryImage::open(&path).unwrap();
        assert!(image.is_empty());
        assert!(image.slice_table().slices.is_empty());
    }
}
