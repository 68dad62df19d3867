//! Sector-addressed reader over a window of a shared file.

use std::sync::Arc;

use crate::{
    common::{bytes_to_lba, lba_to_bytes, ImageType, MagicBytes, LBA_SIZE},
    io::RefFile,
    util::Align,
    BankError, Error, ErrorContext, Result, ResultContext,
};

/// Magic bytes of a CISO container.
pub const CISO_MAGIC: MagicBytes = *b"CISO";
/// Magic bytes of a WBFS container.
pub const WBFS_MAGIC: MagicBytes = *b"WBFS";

/// Threshold above which a plain image file is assumed to be a full RVT-H
/// HDD image rather than a standalone disc image. (10 GiB)
const HDD_IMAGE_THRESHOLD: u64 = 10 * 1024 * 1024 * 1024;

/// Behavioral variant of a reader window.
///
/// Plain windows map LBAs linearly onto the underlying stream. Compressed
/// containers (CISO, WBFS) are detected so they can be rejected with a
/// clear error; translating their index tables is a non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    /// Uncompressed image; LBAs map linearly.
    Plain,
}

/// An immutable LBA-addressed window `[lba_start, lba_start + lba_len)`
/// over a shared [`RefFile`].
///
/// All reads and writes are whole 512-byte LBAs, bounds-checked against
/// the window; partial LBAs are never exposed.
#[derive(Debug, Clone)]
pub struct Reader {
    file: Arc<RefFile>,
    kind: ReaderKind,
    image_type: ImageType,
    lba_start: u32,
    lba_len: u32,
}

impl Reader {
    /// Opens a reader window. When both `lba_start` and `lba_len` are 0,
    /// the window covers the whole file.
    pub fn open(file: Arc<RefFile>, lba_start: u32, mut lba_len: u32) -> Result<Self> {
        let file_size = file.len().context("Getting file size")?;
        if lba_start == 0 && lba_len == 0 {
            // Any partial LBA at the end of the file is ignored.
            lba_len = bytes_to_lba(file_size);
        }

        // Reject compressed containers up front.
        let mut magic: MagicBytes = [0; 4];
        file.read_at_zero_fill(&mut magic, lba_to_bytes(lba_start))
            .context("Reading image magic")?;
        if magic == CISO_MAGIC || magic == WBFS_MAGIC {
            return Err(Error::Bank(BankError::UnrecognizedFile));
        }

        let image_type = if file.is_device() {
            ImageType::HddReader
        } else if file_size > HDD_IMAGE_THRESHOLD {
            ImageType::HddImage
        } else if lba_start == 0 {
            ImageType::Gcm
        } else {
            ImageType::GcmSdk
        };

        Ok(Self { file, kind: ReaderKind::Plain, image_type, lba_start, lba_len })
    }

    /// The backing file handle.
    #[inline]
    pub fn file(&self) -> &Arc<RefFile> { &self.file }

    /// Starting LBA of the window within the backing file.
    #[inline]
    pub fn lba_start(&self) -> u32 { self.lba_start }

    /// Length of the window in LBAs.
    #[inline]
    pub fn lba_len(&self) -> u32 { self.lba_len }

    /// Classification of the backing stream.
    #[inline]
    pub fn image_type(&self) -> ImageType { self.image_type }

    fn check_range(&self, lba: u32, lba_count: u32, buf_len: usize) -> Result<()> {
        let end = lba.checked_add(lba_count);
        if end.is_none() || end.unwrap() > self.lba_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "LBA range {}+{} exceeds window of {} LBAs",
                    lba, lba_count, self.lba_len
                ),
            )
            .context("Reader bounds check"));
        }
        if buf_len < lba_count as usize * LBA_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer too small for LBA count",
            )
            .context("Reader bounds check"));
        }
        Ok(())
    }

    /// Reads `lba_count` LBAs starting at window-relative `lba`.
    ///
    /// Regions past the end of a sparse image file read as zeroes.
    pub fn read(&self, buf: &mut [u8], lba: u32, lba_count: u32) -> Result<()> {
        self.check_range(lba, lba_count, buf.len())?;
        match self.kind {
            ReaderKind::Plain => self
                .file
                .read_at_zero_fill(
                    &mut buf[..lba_count as usize * LBA_SIZE],
                    lba_to_bytes(self.lba_start + lba),
                )
                .with_context(|| format!("Reading {} LBAs at {}", lba_count, lba)),
        }
    }

    /// Writes `lba_count` LBAs starting at window-relative `lba`.
    pub fn write(&self, buf: &[u8], lba: u32, lba_count: u32) -> Result<()> {
        self.check_range(lba, lba_count, buf.len())?;
        match self.kind {
            ReaderKind::Plain => self
                .file
                .write_at(
                    &buf[..lba_count as usize * LBA_SIZE],
                    lba_to_bytes(self.lba_start + lba),
                )
                .with_context(|| format!("Writing {} LBAs at {}", lba_count, lba)),
        }
    }

    /// Reads an arbitrary byte range by reading the covering LBAs.
    pub fn read_bytes(&self, byte_off: u64, len: usize) -> Result<Vec<u8>> {
        let lba = bytes_to_lba(byte_off);
        let skip = (byte_off % LBA_SIZE as u64) as usize;
        let lba_count = ((skip + len).align_up(LBA_SIZE) / LBA_SIZE) as u32;
        let mut buf = vec![0u8; lba_count as usize * LBA_SIZE];
        self.read(&mut buf, lba, lba_count)?;
        buf.drain(..skip);
        buf.truncate(len);
        Ok(buf)
    }

    /// Writes an arbitrary byte range with a read-modify-write of the
    /// covering LBAs.
    pub fn write_bytes(&self, data: &[u8], byte_off: u64) -> Result<()> {
        let lba = bytes_to_lba(byte_off);
        let skip = (byte_off % LBA_SIZE as u64) as usize;
        let lba_count = ((skip + data.len()).align_up(LBA_SIZE) / LBA_SIZE) as u32;
        let mut buf = vec![0u8; lba_count as usize * LBA_SIZE];
        self.read(&mut buf, lba, lba_count)?;
        buf[skip..skip + data.len()].copy_from_slice(data);
        self.write(&buf, lba, lba_count)
    }

    /// Flushes the backing file.
    pub fn flush(&self) -> Result<()> {
        self.file.flush().context("Flushing file")
    }

    /// Shifts the window start forward by `delta` LBAs, shrinking the
    /// window. Used once, right after construction, to exclude a
    /// pre-written SDK preamble from logical offsets.
    pub fn lba_adjust(&mut self, delta: u32) -> Result<()> {
        if delta > self.lba_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "adjustment exceeds window length",
            )
            .context("Reader LBA adjust"));
        }
        self.lba_start += delta;
        self.lba_len -= delta;
        if self.image_type == ImageType::Gcm {
            self.image_type = ImageType::GcmSdk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LBA_SIZE;

    fn temp_reader(content: &[u8]) -> (tempfile::NamedTempFile, Reader) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), content).unwrap();
        let file = RefFile::open(tmp.path()).unwrap();
        let reader = Reader::open(file, 0, 0).unwrap();
        (tmp, reader)
    }

    #[test]
    fn test_whole_file_window() {
        let (_tmp, reader) = temp_reader(&vec![0u8; LBA_SIZE * 4 + 100]);
        // Partial trailing LBA is ignored.
        assert_eq!(reader.lba_len(), 4);
        assert_eq!(reader.image_type(), ImageType::Gcm);
    }

    #[test]
    fn test_bounds_are_strict() {
        let (_tmp, reader) = temp_reader(&vec![0u8; LBA_SIZE * 4]);
        let mut buf = vec![0u8; LBA_SIZE * 2];
        assert!(reader.read(&mut buf, 3, 2).is_err());
        assert!(reader.read(&mut buf, 0, 2).is_ok());
        assert!(reader.read(&mut buf, u32::MAX, 2).is_err());
    }

    #[test]
    fn test_rejects_containers() {
        let mut content = vec![0u8; LBA_SIZE * 4];
        content[..4].copy_from_slice(b"WBFS");
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &content).unwrap();
        let file = RefFile::open(tmp.path()).unwrap();
        match Reader::open(file, 0, 0) {
            Err(Error::Bank(BankError::UnrecognizedFile)) => {}
            other => panic!("expected UnrecognizedFile, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_lba_adjust() {
        let (_tmp, reader) = temp_reader(&vec![0u8; LBA_SIZE * 8]);
        let mut reader = reader;
        reader.lba_adjust(2).unwrap();
        assert_eq!(reader.lba_start(), 2);
        assert_eq!(reader.lba_len(), 6);
        assert_eq!(reader.image_type(), ImageType::GcmSdk);
        assert!(reader.lba_adjust(7).is_err());
    }

    #[test]
    fn test_read_bytes_unaligned() {
        let mut content = vec![0u8; LBA_SIZE * 4];
        content[700..704].copy_from_slice(b"ABCD");
        let (_tmp, reader) = temp_reader(&content);
        assert_eq!(reader.read_bytes(700, 4).unwrap(), b"ABCD");
    }
}
