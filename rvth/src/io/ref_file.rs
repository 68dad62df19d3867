//! Shared file handle.

use std::{
    fs::{File, OpenOptions},
    io,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::debug;

/// A shared random-access handle over a disc image file or block device.
///
/// One `RefFile` backs the [`RvtH`](crate::RvtH) root and every
/// [`Reader`](crate::io::Reader) window into it; `Arc` provides the
/// reference count, and the handle is dropped when the last clone goes
/// away. All I/O is positioned (seek-then-read/write) behind an internal
/// lock, so multiple windows can share the stream without tracking a
/// cursor.
#[derive(Debug)]
pub struct RefFile {
    path: PathBuf,
    is_device: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    writable: bool,
}

impl RefFile {
    /// Opens an existing file read-only.
    ///
    /// Images are always opened read-only first; [`RefFile::make_writable`]
    /// promotes the handle when a mutating operation needs it.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let is_device = file_is_device(&file)?;
        Ok(Arc::new(Self { path, is_device, inner: Mutex::new(Inner { file, writable: false }) }))
    }

    /// Creates a new file, truncating any existing content, opened
    /// read-write.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        Ok(Arc::new(Self {
            path,
            is_device: false,
            inner: Mutex::new(Inner { file, writable: true }),
        }))
    }

    /// The path the handle was opened with.
    #[inline]
    pub fn path(&self) -> &Path { &self.path }

    /// Whether the underlying stream is a block device.
    #[inline]
    pub fn is_device(&self) -> bool { self.is_device }

    /// Whether the handle is open for writing.
    pub fn is_writable(&self) -> bool { self.inner.lock().unwrap().writable }

    /// Current length of the underlying stream in bytes.
    pub fn len(&self) -> io::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::End(0))
    }

    /// Whether the underlying stream is empty.
    pub fn is_empty(&self) -> io::Result<bool> { Ok(self.len()? == 0) }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)
    }

    /// Reads up to `buf.len()` bytes at `offset`, zero-filling past EOF.
    ///
    /// Bank table defaults can point into regions an image file never
    /// materialized; those read as zeroes, like the device would return
    /// for unwritten sectors.
    pub fn read_at_zero_fill(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let read = inner.file.read(buf)?;
            if read == 0 {
                buf.fill(0);
                break;
            }
            buf = &mut buf[read..];
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is opened read-only",
            ));
        }
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(buf)
    }

    /// Flushes buffered writes to the underlying stream.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writable {
            inner.file.flush()?;
            inner.file.sync_data()?;
        }
        Ok(())
    }

    /// Best-effort sparse-extent hint: sets the file length to
    /// `total_bytes`. On filesystems with hole support the unwritten
    /// ranges become holes; elsewhere this is just a truncate. No-op for
    /// block devices.
    pub fn make_sparse(&self, total_bytes: u64) -> io::Result<()> {
        if self.is_device {
            return Ok(());
        }
        let inner = self.inner.lock().unwrap();
        if !inner.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is opened read-only",
            ));
        }
        inner.file.set_len(total_bytes)
    }

    /// Promotes a read-only handle to read-write by reopening the path.
    /// All existing windows observe the promotion. No-op when already
    /// writable.
    pub fn make_writable(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writable {
            return Ok(());
        }
        debug!(path = %self.path.display(), "reopening read-write");
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.file = file;
        inner.writable = true;
        Ok(())
    }
}

#[cfg(unix)]
fn file_is_device(file: &File) -> io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;
    let ft = file.metadata()?.file_type();
    Ok(ft.is_block_device() || ft.is_char_device())
}

#[cfg(not(unix))]
fn file_is_device(_file: &File) -> io::Result<bool> { Ok(false) }
