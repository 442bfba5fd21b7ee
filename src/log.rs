use crate::{
    bytes_ext::{BytesExt, ByteVecExt},
    storage::StorageId,
    xct_id::XctId,
    Error, Result,
};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

// Log record wire format, little-endian:
//   [0..4)   total record length
//   [4]      kind
//   [5..9)   storage id
//   [9..17)  xct id
//   [17..19) key length
//   [19..)   key, then payload
pub const RECORD_HEADER_LEN: usize = 19;
const XCT_ID_OFFSET: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    /// Record log: insert or overwrite a record's payload.
    RecordUpsert = 1,
    /// Record log: delete a record.
    RecordDelete = 2,
    /// Storage log: a storage came into existence.
    StorageCreate = 3,
    /// Storage log: a storage was dropped.
    StorageDrop = 4,
}

impl LogKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::RecordUpsert),
            2 => Some(Self::RecordDelete),
            3 => Some(Self::StorageCreate),
            4 => Some(Self::StorageDrop),
            _ => None,
        }
    }

    /// Record logs modify a single record and take part in snapshot
    /// partitioning; everything else is consolidated separately.
    pub fn is_record(self) -> bool {
        matches!(self, Self::RecordUpsert | Self::RecordDelete)
    }
}

/// A parsed view of one log record.
#[derive(Debug, Clone, Copy)]
pub struct LogRecordView<'a> {
    pub kind: LogKind,
    pub storage_id: StorageId,
    pub xct_id: XctId,
    pub key: &'a [u8],
    pub payload: &'a [u8],
}

impl LogRecordView<'_> {
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.key.len() + self.payload.len()
    }
}

fn parse_record(bytes: &[u8]) -> Result<LogRecordView<'_>> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(Error::LogCorrupted);
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let kind = LogKind::from_u8(bytes[4]).ok_or(Error::LogCorrupted)?;
    let storage_id = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
    let xct_id = XctId(u64::from_le_bytes(bytes[9..17].try_into().unwrap()));
    let key_len = u16::from_le_bytes(bytes[17..19].try_into().unwrap()) as usize;
    if len < RECORD_HEADER_LEN + key_len || len > bytes.len() {
        return Err(Error::LogCorrupted);
    }
    let key = &bytes[RECORD_HEADER_LEN..RECORD_HEADER_LEN + key_len];
    let payload = &bytes[RECORD_HEADER_LEN + key_len..len];
    Ok(LogRecordView {
        kind,
        storage_id,
        xct_id,
        key,
        payload,
    })
}

/// Serializes one record into a byte vector; returns the record's offset.
pub(crate) fn append_record(
    bytes: &mut Vec<u8>,
    kind: LogKind,
    storage_id: StorageId,
    key: &[u8],
    payload: &[u8],
) -> usize {
    assert!(key.len() <= u16::MAX as usize);
    let offset = bytes.len();
    let len = RECORD_HEADER_LEN + key.len() + payload.len();
    bytes.push_u32(len as u32);
    bytes.push(kind as u8);
    bytes.push_u32(storage_id);
    bytes.push_u64(XctId::ZERO.0); // stamped at apply time
    bytes.push_u16(key.len() as u16);
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(payload);
    offset
}

/// Per-worker redo log staging area.
///
/// Records accumulate at the tail while a transaction runs; a successful
/// commit publishes the tail, an abort truncates back to the last
/// committed offset. Nothing before the committed offset is ever undone.
pub struct ThreadLogBuffer {
    bytes: Vec<u8>,
    committed: usize,
}

impl ThreadLogBuffer {
    pub(crate) fn new() -> Self {
        Self {
            bytes: Vec::new(),
            committed: 0,
        }
    }

    pub fn offset_committed(&self) -> usize {
        self.committed
    }

    pub fn offset_tail(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn push_record(
        &mut self,
        kind: LogKind,
        storage_id: StorageId,
        key: &[u8],
        payload: &[u8],
    ) -> usize {
        append_record(&mut self.bytes, kind, storage_id, key, payload)
    }

    pub(crate) fn stamp_xct_id(&mut self, offset: usize, id: XctId) {
        self.bytes.set_u64(offset + XCT_ID_OFFSET, id.0);
    }

    pub(crate) fn record_at(&self, offset: usize) -> LogRecordView<'_> {
        parse_record(&self.bytes[offset..]).expect("own log records parse")
    }

    /// Hands the committed tail to the closure and resets the buffer.
    /// The closure sees an empty slice for an empty commit.
    pub(crate) fn publish_committed_log<F: FnOnce(&[u8])>(&mut self, publish: F) {
        publish(&self.bytes[self.committed..]);
        self.bytes.clear();
        self.committed = 0;
    }

    /// Drops the uncommitted tail.
    pub(crate) fn discard_current_xct_log(&mut self) {
        self.bytes.truncate(self.committed);
    }
}

/// Stamps the xct id of a record previously appended at `offset`.
pub(crate) fn stamp_record(bytes: &mut Vec<u8>, offset: usize, id: XctId) {
    bytes.set_u64(offset + XCT_ID_OFFSET, id.0);
}

/// An owned log record read back from a log file.
#[derive(Debug)]
pub(crate) struct OwnedLogRecord {
    bytes: Vec<u8>,
}

impl OwnedLogRecord {
    pub fn view(&self) -> LogRecordView<'_> {
        parse_record(&self.bytes).expect("validated on read")
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Sequentially parses a logger's file.
pub(crate) struct LogFileReader {
    file: BufReader<File>,
}

impl LogFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: BufReader::new(File::open(path)?),
        })
    }

    pub fn next_record(&mut self) -> Result<Option<OwnedLogRecord>> {
        let mut len_bytes = [0; 4];
        let n = self.file.read(&mut len_bytes)?;
        if n == 0 {
            return Ok(None);
        }
        self.file.read_exact(&mut len_bytes[n..])?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < RECORD_HEADER_LEN {
            return Err(Error::LogCorrupted);
        }
        let mut bytes = vec![0; len];
        bytes[..4].copy_from_slice(&len_bytes);
        self.file.read_exact(&mut bytes[4..])?;

        parse_record(&bytes)?;
        Ok(Some(OwnedLogRecord { bytes }))
    }
}
