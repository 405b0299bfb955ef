//! Capability (i): file I/O the core needs — read a range, append, and
//! (re)create from scratch — abstracted behind a trait so tests can swap in
//! an in-memory store and the real binaries can use plain `std::fs`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File-I/O capability required by the engine: read a byte range, append,
/// report length, and (re)create empty for an overwrite-from-scratch.
pub trait FileStore: Send {
    fn exists(&self) -> bool;
    fn len(&self) -> io::Result<u64>;
    /// Reads up to `max_len` bytes starting at `offset`. Returns fewer bytes
    /// at EOF; never pads.
    fn read_range(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>>;
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Truncates (or creates) the backing file to empty, for the RESEND path.
    fn create_empty(&mut self) -> io::Result<()>;
}

/// A [`FileStore`] backed by a real path on disk.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    read_handle: Option<File>,
    write_handle: Option<File>,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalFile {
            path: path.into(),
            read_handle: None,
            write_handle: None,
        }
    }

    fn read_handle(&mut self) -> io::Result<&mut File> {
        if self.read_handle.is_none() {
            self.read_handle = Some(File::open(&self.path)?);
        }
        Ok(self.read_handle.as_mut().unwrap())
    }

    fn write_handle(&mut self) -> io::Result<&mut File> {
        if self.write_handle.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            self.write_handle = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        Ok(self.write_handle.as_mut().unwrap())
    }
}

impl FileStore for LocalFile {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn len(&self) -> io::Result<u64> {
        if !self.exists() {
            return Ok(0);
        }
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn read_range(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>> {
        let handle = self.read_handle()?;
        handle.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; max_len];
        let mut total = 0;
        loop {
            let n = handle.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == max_len {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_handle()?.write_all(bytes)
    }

    fn create_empty(&mut self) -> io::Result<()> {
        self.write_handle = None;
        self.read_handle = None;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        File::create(&self.path)?;
        Ok(())
    }
}

impl AsRef<Path> for LocalFile {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_range_returns_short_read_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let mut store = LocalFile::new(&path);
        assert_eq!(store.read_range(0, 5).unwrap(), b"hello");
        assert_eq!(store.read_range(6, 100).unwrap(), b"world");
        assert_eq!(store.len().unwrap(), 11);
    }

    #[test]
    fn append_creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("f.bin");

        let mut store = LocalFile::new(&path);
        store.append(b"abc").unwrap();
        store.append(b"def").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn create_empty_truncates_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"stale").unwrap();

        let mut store = LocalFile::new(&path);
        store.create_empty().unwrap();
        assert_eq!(store.len().unwrap(), 0);
        store.append(b"fresh").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"fresh");
    }

    #[test]
    fn nonexistent_file_reports_zero_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let store = LocalFile::new(&path);
        assert!(!store.exists());
        assert_eq!(store.len().unwrap(), 0);
    }
}
