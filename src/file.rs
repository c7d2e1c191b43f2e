//! Random-access file abstraction.
//!
//! The reader only ever needs positional reads of known length, so the
//! trait is deliberately narrow. Two implementations are provided: plain
//! `pread` on a [`std::fs::File`], and a memory-mapped variant for callers
//! that prefer the page cache to own the working set.

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};

use memmap2::Mmap;

use crate::encoding::put_varint64;

/// A randomly seekable, immutable byte source.
pub trait RandomAccessFile: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// A range that runs past the end of the file is an error; the table
    /// layer turns short files into `Corruption` before getting here.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// A stable identity for this file, if the platform provides one.
    ///
    /// Used as the cache-key prefix so that two readers over the same file
    /// share cached blocks. `None` makes the cache allocate a fresh id,
    /// which is always safe but never shared.
    fn unique_id(&self) -> Option<Vec<u8>> {
        None
    }
}

impl RandomAccessFile for File {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        FileExt::read_exact_at(self, &mut buf, offset)?;
        Ok(buf)
    }

    fn unique_id(&self) -> Option<Vec<u8>> {
        let meta = self.metadata().ok()?;
        let mut id = Vec::with_capacity(20);
        put_varint64(&mut id, meta.dev());
        put_varint64(&mut id, meta.ino());
        Some(id)
    }
}

/// Memory-mapped file. Reads copy out of the mapping, so the uniform
/// `Vec<u8>` contract holds and the mapping's lifetime never leaks into
/// blocks.
pub struct MmapFile {
    map: Mmap,
    id: Option<Vec<u8>>,
}

impl MmapFile {
    /// Map `file` read-only.
    ///
    /// # Safety considerations
    ///
    /// The mapping is only sound while nothing truncates or rewrites the
    /// file; tables are immutable once written, which is exactly the
    /// contract this crate reads under.
    pub fn open(file: &File) -> io::Result<MmapFile> {
        let map = unsafe { Mmap::map(file)? };
        let id = RandomAccessFile::unique_id(file);
        Ok(MmapFile { map, id })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl RandomAccessFile for MmapFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of range"))?;
        let end = start.checked_add(len).filter(|&end| end <= self.map.len());
        match end {
            Some(end) => Ok(self.map[start..end].to_vec()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of mapped file",
            )),
        }
    }

    fn unique_id(&self) -> Option<Vec<u8>> {
        self.id.clone()
    }
}
