//! Node files
//!
//! A node is a fixed-capacity file, pre-extended on creation and mapped
//! read-write in full. Records are appended back to back:
//!
//! ```text
//! [fingerprint][payload length: u32 BE][payload]
//! ```
//!
//! Appends are serialized per node; readers never lock. Bytes below the
//! published end are never written again, so a reader that checks its range
//! against [`NodeFile::end`] sees stable data.

use blobnode_common::{Error, Fingerprint, NodeId, Result};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Width of the payload length field
pub const LEN_FIELD: usize = 4;

/// Bytes a record header occupies for a given fingerprint width
#[must_use]
pub const fn header_len(fp_len: usize) -> usize {
    fp_len + LEN_FIELD
}

/// One step of a sequential record scan
#[derive(Debug, PartialEq, Eq)]
pub enum ScanStep {
    /// A well-formed record
    Record {
        fingerprint: Fingerprint,
        offset: u64,
        len: u64,
        next: u64,
    },
    /// A zero-length header (unwritten space or a hole left by a crash)
    Empty { next: u64 },
    /// A header whose payload runs past `limit`
    Invalid { offset: u64 },
    /// Fewer than a header's worth of bytes remain before `limit`
    End,
}

/// Append-only, memory-mapped node file
pub struct NodeFile {
    id: NodeId,
    path: PathBuf,
    // keeps the descriptor alive for the mapping
    _file: File,
    map: MmapRaw,
    capacity: u64,
    end: AtomicU64,
    append_lock: Mutex<()>,
    sync_writes: bool,
}

impl NodeFile {
    /// Create a new node file of `capacity` bytes at `path`
    pub fn create(path: &Path, id: NodeId, capacity: u64, sync_writes: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::NodeCreateFailed(format!("{}: {e}", path.display())))?;
        file.set_len(capacity)
            .map_err(|e| Error::NodeCreateFailed(format!("{}: {e}", path.display())))?;
        if sync_writes {
            file.sync_all()?;
        }
        let node = Self::map(file, path, id, capacity, 0, sync_writes)
            .map_err(|e| Error::NodeCreateFailed(format!("{}: {e}", path.display())))?;
        info!("Created node {} ({} bytes) at {:?}", id, capacity, path);
        Ok(node)
    }

    /// Open an existing node file whose committed data ends at `end`
    pub fn open(path: &Path, id: NodeId, end: u64, sync_writes: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        if capacity == 0 {
            return Err(Error::corruption(format!("node {id} has an empty file")));
        }
        if end > capacity {
            return Err(Error::corruption(format!(
                "node {id}: committed end {end} exceeds file size {capacity}"
            )));
        }
        let node = Self::map(file, path, id, capacity, end, sync_writes)?;
        debug!("Opened node {} at {:?}, end {}", id, path, end);
        Ok(node)
    }

    fn map(
        file: File,
        path: &Path,
        id: NodeId,
        capacity: u64,
        end: u64,
        sync_writes: bool,
    ) -> Result<Self> {
        let len = usize::try_from(capacity)
            .map_err(|_| Error::Configuration(format!("node size {capacity} cannot be mapped")))?;
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            _file: file,
            map,
            capacity,
            end: AtomicU64::new(end),
            append_lock: Mutex::new(()),
            sync_writes,
        })
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Logical end of written data
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Bytes still free
    pub fn remaining(&self) -> u64 {
        self.capacity - self.end()
    }

    /// Fraction of capacity in use
    pub fn utilization(&self) -> f64 {
        self.end() as f64 / self.capacity as f64
    }

    /// Whether a record with `payload_len` bytes of payload would fit
    pub fn fits(&self, fp_len: usize, payload_len: usize) -> bool {
        (header_len(fp_len) + payload_len) as u64 <= self.remaining()
    }

    /// Append one record and return its offset
    ///
    /// Returns `Ok(None)` when the record does not fit; the node is left
    /// untouched so the caller can rotate and retry elsewhere.
    pub fn append_record(&self, fingerprint: &Fingerprint, payload: &[u8]) -> Result<Option<u64>> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| Error::OversizeObject {
            size: payload.len() as u64,
            max: u64::from(u32::MAX),
        })?;
        let _guard = self.append_lock.lock();
        let offset = self.end.load(Ordering::Acquire);
        let total = (header_len(fingerprint.len()) + payload.len()) as u64;
        if offset + total > self.capacity {
            return Ok(None);
        }

        self.write_at(offset, fingerprint.as_bytes());
        self.write_at(offset + fingerprint.len() as u64, &payload_len.to_be_bytes());
        self.write_at(offset + header_len(fingerprint.len()) as u64, payload);

        if self.sync_writes {
            self.flush_range(offset, total).map_err(|e| Error::NodeAppendFailed {
                node: self.id,
                reason: e.to_string(),
            })?;
        }
        self.end.store(offset + total, Ordering::Release);
        Ok(Some(offset))
    }

    /// Copy `bytes` verbatim at the current end (used by compaction)
    pub fn append_raw(&self, bytes: &[u8]) -> Result<u64> {
        let _guard = self.append_lock.lock();
        let offset = self.end.load(Ordering::Acquire);
        if offset + bytes.len() as u64 > self.capacity {
            return Err(Error::NodeAppendFailed {
                node: self.id,
                reason: format!("{} bytes do not fit at offset {offset}", bytes.len()),
            });
        }
        self.write_at(offset, bytes);
        self.end.store(offset + bytes.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Copy of `len` bytes at `offset`; the range must lie below the end
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let end = self.end();
        if offset.checked_add(len).is_none_or(|stop| stop > end) {
            return Err(Error::corruption(format!(
                "node {}: read of {len} bytes at {offset} past end {end}",
                self.id
            )));
        }
        Ok(self.slice(offset, len).to_vec())
    }

    /// Read the record at `offset`, checking its header against the caller's
    /// expectations, and return the payload
    pub fn read_record(&self, offset: u64, fingerprint: &Fingerprint, len: u64) -> Result<Vec<u8>> {
        let hdr = header_len(fingerprint.len()) as u64;
        let record = self.read(offset, hdr + len)?;
        let (fp, rest) = record.split_at(fingerprint.len());
        let (len_bytes, payload) = rest.split_at(LEN_FIELD);
        let stored_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if fp != fingerprint.as_bytes() || u64::from(stored_len) != len {
            return Err(Error::corruption(format!(
                "node {}: record at {offset} does not match blob {fingerprint}",
                self.id
            )));
        }
        Ok(payload.to_vec())
    }

    /// Decode the record header at `offset` without reading past `limit`
    pub fn scan(&self, offset: u64, fp_len: usize, limit: u64) -> ScanStep {
        let limit = limit.min(self.capacity);
        let hdr = header_len(fp_len) as u64;
        if offset + hdr > limit {
            return ScanStep::End;
        }
        let header = self.slice(offset, hdr);
        let (fp, len_bytes) = header.split_at(fp_len);
        let len = u64::from(u32::from_be_bytes([
            len_bytes[0],
            len_bytes[1],
            len_bytes[2],
            len_bytes[3],
        ]));
        if len == 0 {
            return ScanStep::Empty {
                next: offset + hdr,
            };
        }
        if offset + hdr + len > limit {
            return ScanStep::Invalid { offset };
        }
        ScanStep::Record {
            fingerprint: Fingerprint::from_bytes(fp),
            offset,
            len,
            next: offset + hdr + len,
        }
    }

    /// Raw bytes of the whole record at `offset` with payload length `len`
    pub fn raw_record(&self, offset: u64, fp_len: usize, len: u64) -> Result<Vec<u8>> {
        let total = header_len(fp_len) as u64 + len;
        if offset + total > self.capacity {
            return Err(Error::corruption(format!(
                "node {}: record at {offset} runs past the file",
                self.id
            )));
        }
        Ok(self.slice(offset, total).to_vec())
    }

    /// Move the end forward over well-formed records a crash left behind it
    ///
    /// Returns the number of bytes skipped.
    pub fn recover_tail(&self, fp_len: usize) -> u64 {
        let _guard = self.append_lock.lock();
        let start = self.end.load(Ordering::Acquire);
        let mut cursor = start;
        while let ScanStep::Record { next, .. } = self.scan(cursor, fp_len, self.capacity) {
            cursor = next;
        }
        if cursor > start {
            warn!(
                "Node {}: skipping {} uncommitted bytes after offset {}",
                self.id,
                cursor - start,
                start
            );
            self.end.store(cursor, Ordering::Release);
        }
        cursor - start
    }

    /// Whether the first `len` bytes of the file are all zero
    pub fn is_blank(&self, len: u64) -> bool {
        self.slice(0, len.min(self.capacity)).iter().all(|&b| b == 0)
    }

    /// Flush all written data to the file
    pub fn flush(&self) -> Result<()> {
        let end = self.end();
        if end > 0 {
            self.flush_range(0, end)?;
        }
        Ok(())
    }

    fn flush_range(&self, offset: u64, len: u64) -> std::io::Result<()> {
        // offset and len are bounded by capacity, which fits usize
        self.map.flush_range(offset as usize, len as usize)
    }

    fn slice(&self, offset: u64, len: u64) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: the range lies within the mapping (callers bound it by
        // capacity) and bytes below the end are never written again; bytes
        // past the end are only read by scans that tolerate any content.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(offset as usize), len as usize)
        }
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() as u64 <= self.capacity);
        // SAFETY: callers hold the append lock and write only past the
        // published end, which no reader dereferences yet.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset as usize),
                bytes.len(),
            );
        }
    }
}

impl std::fmt::Debug for NodeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("end", &self.end())
            .finish()
    }
}
