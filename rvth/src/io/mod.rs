//! Low-level I/O: shared file handles and LBA-addressed readers.

pub mod reader;
pub mod ref_file;

pub use reader::Reader;
pub use ref_file::RefFile;
