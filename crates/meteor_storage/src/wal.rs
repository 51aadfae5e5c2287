//! Write-ahead log manager.
//!
//! Single file `meteor.wal`, laid out as
//! `u16 header_len || header || (u16 row_len || row)*`. The header carries
//! the durable `next_txn_id` / `next_gsn` watermarks and is rewritten in
//! place each time a batch is allocated. Rows are framed with a `u16`
//! length prefix so sequential reads self-synchronize.
//!
//! One mutex serializes append, header rewrite, and sequential reads; the
//! read/append cursor (`lso`) is shared, so recovery reading to EOF leaves
//! the cursor positioned for the next append.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use meteor_common::codec::{read_u16, read_u32};
use meteor_common::error::StorageError;
use meteor_common::types::LogRecord;

pub const WAL_FILE: &str = "meteor.wal";
pub const WAL_VERSION: u32 = 1;

/// GSNs and transaction ids are handed out in batches of this size; the
/// header is rewritten (and synced) once per batch, not per allocation.
pub const SEQUENCE_BATCH_SIZE: u32 = 1000;

const HEADER_LEN: usize = 16;

/// Durable WAL header: format version plus the next-unissued watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub version: u32,
    pub next_txn_id: u32,
    pub next_gsn: u32,
    /// Reserved; always written as zero.
    pub checksum: u32,
}

impl WalHeader {
    fn initial() -> Self {
        Self {
            version: WAL_VERSION,
            next_txn_id: 0,
            next_gsn: 0,
            checksum: 0,
        }
    }

    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        out.put_u32(self.version);
        out.put_u32(self.next_txn_id);
        out.put_u32(self.next_gsn);
        out.put_u32(self.checksum);
        out
    }

    fn decode(data: &[u8]) -> Result<Self, StorageError> {
        let mut buf = data;
        Ok(Self {
            version: read_u32(&mut buf)?,
            next_txn_id: read_u32(&mut buf)?,
            next_gsn: read_u32(&mut buf)?,
            checksum: read_u32(&mut buf)?,
        })
    }
}

struct WalInner {
    file: File,
    header: WalHeader,
    /// Offset of the first row (just past the framed header).
    row_start: u64,
    /// Shared read/append cursor.
    lso: u64,
}

impl WalInner {
    fn write_header(&mut self) -> Result<(), StorageError> {
        let bytes = self.header.encode();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&(bytes.len() as u16).to_be_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn file_len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }
}

/// Append / sequential-read access to `meteor.wal` plus batch allocation of
/// GSNs and transaction ids.
pub struct WalManager {
    inner: Mutex<WalInner>,
    /// When false (config `useWal = false`), row appends are no-ops. The
    /// header and batch allocation stay live, since the allocators depend
    /// on the durable watermarks.
    append_enabled: bool,
}

impl WalManager {
    /// Open (or create) the WAL under `dir`. The header is validated and
    /// rewritten back in place to normalize offsets.
    pub fn open(dir: &Path, append_enabled: bool) -> Result<Self, StorageError> {
        let path = dir.join(WAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let header = if len == 0 {
            WalHeader::initial()
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut len_buf = [0u8; 2];
            file.read_exact(&mut len_buf)?;
            let header_len = read_u16(&mut len_buf.as_slice())? as usize;
            if header_len != HEADER_LEN {
                return Err(StorageError::Corrupt(format!(
                    "unexpected WAL header length {header_len}"
                )));
            }
            let mut header_buf = vec![0u8; header_len];
            file.read_exact(&mut header_buf)?;
            let header = WalHeader::decode(&header_buf)?;
            if header.version != WAL_VERSION {
                return Err(StorageError::Corrupt(format!(
                    "unsupported WAL version {}",
                    header.version
                )));
            }
            header
        };

        let row_start = 2 + HEADER_LEN as u64;
        let mut inner = WalInner {
            file,
            header,
            row_start,
            lso: row_start,
        };
        inner.write_header()?;

        tracing::debug!(
            path = %path.display(),
            next_txn_id = inner.header.next_txn_id,
            next_gsn = inner.header.next_gsn,
            "WAL opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            append_enabled,
        })
    }

    /// Reserve the next GSN batch. Returns `[start, end)` and persists the
    /// advanced watermark before the batch is used.
    pub fn allocate_gsn_batch(&self) -> Result<(u32, u32), StorageError> {
        let mut inner = self.inner.lock();
        let start = inner.header.next_gsn;
        let end = start
            .checked_add(SEQUENCE_BATCH_SIZE)
            .ok_or(StorageError::SequenceExhausted("GSN"))?;
        inner.header.next_gsn = end;
        inner.write_header()?;
        Ok((start, end))
    }

    /// Reserve the next transaction-id batch. Symmetric to GSN allocation.
    pub fn allocate_txn_id_batch(&self) -> Result<(u32, u32), StorageError> {
        let mut inner = self.inner.lock();
        let start = inner.header.next_txn_id;
        let end = start
            .checked_add(SEQUENCE_BATCH_SIZE)
            .ok_or(StorageError::SequenceExhausted("transaction id"))?;
        inner.header.next_txn_id = end;
        inner.write_header()?;
        Ok((start, end))
    }

    /// Append one row at the cursor. The row's `lso`, `timestamp`, and
    /// `checksum` fields are filled in here; concurrent appenders are
    /// linearized by the manager mutex.
    pub fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        if !self.append_enabled {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let lso = inner.lso;

        let mut row = record.clone();
        row.lso = lso as i64;
        row.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        row.checksum = 0;

        let mut bytes = row.encode();
        let body = bytes.len();
        let crc = crc32fast::hash(&bytes[..body - 4]);
        bytes[body - 4..].copy_from_slice(&crc.to_be_bytes());

        inner.file.seek(SeekFrom::Start(lso))?;
        inner.file.write_all(&(body as u16).to_be_bytes())?;
        inner.file.write_all(&bytes)?;
        inner.lso = lso + 2 + body as u64;
        Ok(())
    }

    /// Read the row at the cursor and advance. Returns `None` at EOF; a
    /// trailing partial row (torn write) also ends the scan.
    pub fn read_next(&self) -> Result<Option<LogRecord>, StorageError> {
        let mut inner = self.inner.lock();
        let len = inner.file_len()?;
        let lso = inner.lso;
        if lso + 2 > len {
            return Ok(None);
        }

        inner.file.seek(SeekFrom::Start(lso))?;
        let mut len_buf = [0u8; 2];
        inner.file.read_exact(&mut len_buf)?;
        let body = u16::from_be_bytes(len_buf) as u64;
        if lso + 2 + body > len {
            tracing::warn!(lso, "WAL truncated mid-row, stopping scan");
            return Ok(None);
        }

        let mut row_buf = vec![0u8; body as usize];
        inner.file.read_exact(&mut row_buf)?;

        // Verify the CRC before decoding. Zero is the reserved/legacy
        // checksum value; anything else must match the row prefix.
        if row_buf.len() >= 4 {
            let split = row_buf.len() - 4;
            let stored = u32::from_be_bytes([
                row_buf[split],
                row_buf[split + 1],
                row_buf[split + 2],
                row_buf[split + 3],
            ]);
            if stored != 0 {
                let crc = crc32fast::hash(&row_buf[..split]);
                if crc != stored {
                    return Err(StorageError::Corrupt(format!(
                        "checksum mismatch at offset {lso}: stored {stored:08x}, computed {crc:08x}"
                    )));
                }
            }
        }
        let record = LogRecord::decode(&row_buf)?;

        inner.lso = lso + 2 + body;
        Ok(Some(record))
    }

    /// Reset the cursor to the first row.
    pub fn rewind(&self) {
        let mut inner = self.inner.lock();
        inner.lso = inner.row_start;
    }

    /// Force buffered row data to stable storage. Called at commit points.
    pub fn flush(&self) -> Result<(), StorageError> {
        if !self.append_enabled {
            return Ok(());
        }
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }

    /// Current header contents (for diagnostics and tests).
    pub fn header(&self) -> WalHeader {
        self.inner.lock().header
    }
}
