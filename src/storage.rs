//! Table file storage
//!
//! One binary file per table:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | header (55 bytes, little endian)                             |
//! |   format version u16 | magic [u8; 8] | primary i64           |
//! |   secondary i64 | file version u16 | reserved u16, u32, u32  |
//! |   page size i32 | compression u8 | record count i32          |
//! |   stored length i32 | uncompressed length i32                |
//! +--------------------------------------------------------------+
//! | record block (stored length bytes)                           |
//! | zero padding up to the allocated page area                   |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every mutation writes the header and the whole record block to a staged
//! `<table>.tmp` image, syncs it and renames it over the table file, so a
//! failed write leaves the previous image in place. The exclusive lock is
//! held on a `<table>.lock` sidecar. The allocated page area only grows
//! until [`TableFile::compact`] trims it, which is what `compact_percent`
//! measures.

use crate::error::{Result, StoreError};
use crate::schema::Compression;
use crate::sequence::Sequences;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Table file signature
pub const MAGIC: [u8; 8] = *b"FLATSTOR";

/// Version of the header layout itself
pub const HEADER_FORMAT_VERSION: u16 = 1;

/// Serialized header size
pub const HEADER_LEN: u64 = 55;

/// Fixed table file header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub format_version: u16,
    pub magic: [u8; 8],
    pub sequences: Sequences,
    pub file_version: u16,
    pub reserved_a: u16,
    pub reserved_b: u32,
    pub reserved_c: u32,
    pub page_size: i32,
    pub compression: u8,
    pub record_count: i32,
    pub stored_length: i32,
    pub data_length: i32,
}

impl FileHeader {
    pub fn new(file_version: u16, page_size: i32, compression: Compression) -> Self {
        FileHeader {
            format_version: HEADER_FORMAT_VERSION,
            magic: MAGIC,
            sequences: Sequences::initial(),
            file_version,
            reserved_a: 0,
            reserved_b: 0,
            reserved_c: 0,
            page_size,
            compression: compression.as_u8(),
            record_count: 0,
            stored_length: 0,
            data_length: 0,
        }
    }

    pub fn compression(&self) -> Compression {
        Compression::from_u8(self.compression).unwrap_or(Compression::None)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        debug_assert_eq!(bytes.len() as u64, HEADER_LEN);
        Ok(bytes)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::corruption(path, "header signature mismatch"));
        }
        if self.format_version != HEADER_FORMAT_VERSION {
            return Err(StoreError::corruption(
                path,
                format!("unknown header layout version {}", self.format_version),
            ));
        }
        if self.reserved_a != 0 || self.reserved_b != 0 || self.reserved_c != 0 {
            return Err(StoreError::corruption(path, "reserved header fields are not zero"));
        }
        if Compression::from_u8(self.compression).is_none() {
            return Err(StoreError::corruption(
                path,
                format!("unknown compression type {}", self.compression),
            ));
        }
        if self.page_size <= 0 {
            return Err(StoreError::corruption(
                path,
                format!("invalid page size {}", self.page_size),
            ));
        }
        if self.record_count < 0 || self.stored_length < 0 || self.data_length < 0 {
            return Err(StoreError::corruption(path, "negative record accounting"));
        }
        Ok(())
    }
}

/// Number of pages needed to hold `len` bytes
pub fn pages_for(len: u64, page_size: i32) -> u64 {
    let page_size = page_size.max(1) as u64;
    (len + page_size - 1) / page_size
}

/// Suffix of the staged image written before it replaces the table file
const STAGED_SUFFIX: &str = ".tmp";

/// Suffix of the sidecar file holding the exclusive lock
const LOCK_SUFFIX: &str = ".lock";

/// An open, exclusively locked table file
#[derive(Debug)]
pub struct TableFile {
    path: PathBuf,
    file: File,
    lock: File,
    header: FileHeader,
    allocated_pages: u64,
}

impl TableFile {
    /// Open an existing table file or create it with `initial` as header.
    ///
    /// Returns the file and whether it was newly created.
    pub fn open_or_create(
        path: &Path,
        initial: FileHeader,
        min_supported_version: u16,
    ) -> Result<(Self, bool)> {
        let lock = acquire_lock(path)?;
        discard_staged(path);

        let len = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::Io(e)),
        };

        if len == 0 {
            let image = build_image(&initial, &[], HEADER_LEN)?;
            let file = replace_file(path, &image)?;
            info!(path = %path.display(), "Created table file");
            let table_file = TableFile {
                path: path.to_path_buf(),
                file,
                lock,
                header: initial,
                allocated_pages: 0,
            };
            return Ok((table_file, true));
        }

        if len < HEADER_LEN {
            return Err(StoreError::corruption(
                path,
                format!("file is {} bytes, shorter than the header", len),
            ));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_bytes = vec![0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_bytes)?;
        let header: FileHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| StoreError::corruption(path, format!("unreadable header: {}", e)))?;

        if let Err(e) = header.validate(path) {
            error!(path = %path.display(), error = %e, "Rejected table file header");
            return Err(e);
        }
        if header.file_version < min_supported_version {
            return Err(StoreError::UnsupportedVersion {
                found: header.file_version,
                minimum: min_supported_version,
            });
        }
        if HEADER_LEN + header.stored_length as u64 > len {
            return Err(StoreError::corruption(
                path,
                format!(
                    "header claims {} stored bytes, file holds {}",
                    header.stored_length,
                    len - HEADER_LEN
                ),
            ));
        }

        let table_file = TableFile {
            path: path.to_path_buf(),
            file,
            lock,
            allocated_pages: pages_for(len - HEADER_LEN, header.page_size),
            header,
        };
        debug!(
            path = %path.display(),
            records = table_file.header.record_count,
            stored = table_file.header.stored_length,
            "Opened table file"
        );
        Ok((table_file, false))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    /// Pages needed for the stored record block
    pub fn page_count(&self) -> u64 {
        pages_for(self.header.stored_length as u64, self.header.page_size)
    }

    /// Share of the allocated page area not holding record data, in percent
    pub fn compact_percent(&self) -> f64 {
        let allocated = self.allocated_pages * self.header.page_size as u64;
        if allocated == 0 {
            return 0.0;
        }
        let stored = (self.header.stored_length as u64).min(allocated);
        (allocated - stored) as f64 * 100.0 / allocated as f64
    }

    /// Read the stored (sealed) record block
    pub fn read_block(&mut self) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.header.stored_length as usize];
        self.file.seek(SeekFrom::Start(HEADER_LEN))?;
        self.file.read_exact(&mut block).map_err(|e| {
            StoreError::corruption(&self.path, format!("record block unreadable: {}", e))
        })?;
        Ok(block)
    }

    /// Replace header and record block together.
    ///
    /// The new image is staged next to the table, synced and renamed over
    /// it. On any error the table file and `self.header` are unchanged.
    pub fn write(&mut self, header: FileHeader, stored_block: &[u8]) -> Result<()> {
        if stored_block.len() as u64 != header.stored_length as u64 {
            return Err(StoreError::InvariantViolation(format!(
                "header stored length {} does not match block of {} bytes",
                header.stored_length,
                stored_block.len()
            )));
        }
        let needed = pages_for(stored_block.len() as u64, header.page_size);
        let allocated = self.allocated_pages.max(needed);
        let total = HEADER_LEN + allocated * header.page_size as u64;

        let image = build_image(&header, stored_block, total)?;
        self.file = replace_file(&self.path, &image)?;
        self.header = header;
        self.allocated_pages = allocated;
        Ok(())
    }

    /// Replace the header, keeping the current record block
    pub fn write_header(&mut self, header: FileHeader) -> Result<()> {
        if header.stored_length != self.header.stored_length {
            return Err(StoreError::InvariantViolation(format!(
                "header-only write changes stored length from {} to {}",
                self.header.stored_length, header.stored_length
            )));
        }
        let block = self.read_block()?;
        self.write(header, &block)
    }

    /// Trim the allocated page area to what the record block needs.
    ///
    /// Returns the number of bytes released.
    pub fn compact(&mut self) -> Result<u64> {
        let block = self.read_block()?;
        let before = self.allocated_pages;
        let page_size = self.header.page_size as u64;

        self.allocated_pages = 0;
        let header = self.header.clone();
        if let Err(e) = self.write(header, &block) {
            self.allocated_pages = before;
            return Err(e);
        }

        let released = before.saturating_sub(self.allocated_pages) * page_size;
        info!(path = %self.path.display(), released, "Compacted table file");
        Ok(released)
    }
}

impl Drop for TableFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            error!(path = %self.path.display(), error = %e, "Failed to release table file lock");
        } else {
            debug!(path = %self.path.display(), "Released table file lock");
        }
    }
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Take the exclusive lock on the table's sidecar lock file.
///
/// The lock lives outside the table file so it survives the rename that
/// replaces the table on every write.
fn acquire_lock(path: &Path) -> Result<File> {
    let lock_path = sibling(path, LOCK_SUFFIX);
    let lock = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&lock_path)?;

    match lock.try_lock_exclusive() {
        Ok(()) => Ok(lock),
        Err(e) if is_lock_contention(&e) => {
            warn!(path = %path.display(), "Table file is already locked");
            Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Remove an image left behind by an interrupted write; the table file
/// itself still holds the last complete state
fn discard_staged(path: &Path) {
    let staged = sibling(path, STAGED_SUFFIX);
    match fs::remove_file(&staged) {
        Ok(()) => warn!(path = %staged.display(), "Discarded incomplete table image"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staged.display(), error = %e, "Failed to discard incomplete table image"),
    }
}

/// Header, block and zero padding up to `total` bytes
fn build_image(header: &FileHeader, stored_block: &[u8], total: u64) -> Result<Vec<u8>> {
    let mut image = Vec::with_capacity(total as usize);
    image.extend_from_slice(&header.to_bytes()?);
    image.extend_from_slice(stored_block);
    image.resize(total as usize, 0);
    Ok(image)
}

/// Stage `image`, sync it and rename it over `path`. Returns a handle to
/// the new table file.
fn replace_file(path: &Path, image: &[u8]) -> Result<File> {
    let staged = sibling(path, STAGED_SUFFIX);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staged)?;

    let result = file
        .write_all(image)
        .and_then(|_| file.sync_all())
        .and_then(|_| fs::rename(&staged, path));
    if let Err(e) = result {
        drop(file);
        let _ = fs::remove_file(&staged);
        error!(path = %path.display(), error = %e, "Table rewrite failed; previous image kept");
        return Err(StoreError::Io(e));
    }

    if let Err(e) = sync_parent(path) {
        warn!(path = %path.display(), error = %e, "Failed to sync table directory");
    }
    Ok(file)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn is_lock_contention(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
