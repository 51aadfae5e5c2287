//! Core identifiers, versioned key/value types, and the WAL row structure.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::codec::{
    self, read_i64, read_string, read_u32, read_u8, write_bytes, write_string, CodecError,
};

/// Global Sequence Number. Monotonic 32-bit id stamping every version and
/// every log-writing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Gsn(pub u32);

impl fmt::Display for Gsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier. 32-bit, never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u32);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection identity token. The transaction layer uses it to enforce
/// that only the connection that opened a transaction may operate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Key used by control rows (BEGIN/COMMIT/ROLLBACK) that carry no user key.
pub const NULL_KEY: &str = "";

// ── Values ───────────────────────────────────────────────────────────────

/// Type tag carried by every stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Null = 0,
    Uint8 = 1,
    Uint16 = 2,
    Uint32 = 3,
    Uint64 = 4,
    Int8 = 5,
    Int16 = 6,
    Int32 = 7,
    Int64 = 8,
    Bool = 9,
    Float32 = 10,
    Float64 = 11,
    Bytes = 12,
    String = 13,
    /// Deletion marker; hides earlier versions from latest-visible reads.
    Tombstone = 14,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => ValueType::Null,
            1 => ValueType::Uint8,
            2 => ValueType::Uint16,
            3 => ValueType::Uint32,
            4 => ValueType::Uint64,
            5 => ValueType::Int8,
            6 => ValueType::Int16,
            7 => ValueType::Int32,
            8 => ValueType::Int64,
            9 => ValueType::Bool,
            10 => ValueType::Float32,
            11 => ValueType::Float64,
            12 => ValueType::Bytes,
            13 => ValueType::String,
            14 => ValueType::Tombstone,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "value type",
                    tag: other,
                })
            }
        })
    }
}

/// A stored value: type tag plus raw byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub tag: ValueType,
    pub payload: Vec<u8>,
}

impl Value {
    pub fn null() -> Self {
        Self {
            tag: ValueType::Null,
            payload: Vec::new(),
        }
    }

    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: ValueType::String,
            payload: s.into(),
        }
    }

    pub fn tombstone() -> Self {
        Self {
            tag: ValueType::Tombstone,
            payload: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tag == ValueType::Tombstone
    }

    pub fn is_null(&self) -> bool {
        self.tag == ValueType::Null
    }

    /// Payload interpreted as UTF-8 text (lossy). Used by the condition
    /// evaluator and the JSON response shaping.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.tag as u8);
        write_bytes(out, &self.payload);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let tag = ValueType::from_u8(read_u8(buf)?)?;
        let payload = codec::read_bytes(buf)?;
        Ok(Self { tag, payload })
    }
}

/// A (logical key, GSN) pair tagging one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    pub key: String,
    pub gsn: Gsn,
}

impl VersionedKey {
    pub fn new(key: impl Into<String>, gsn: Gsn) -> Self {
        Self {
            key: key.into(),
            gsn,
        }
    }

    /// Control-row key (no user key attached).
    pub fn control(gsn: Gsn) -> Self {
        Self::new(NULL_KEY, gsn)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.gsn.0);
        write_string(out, &self.key);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let gsn = Gsn(read_u32(buf)?);
        let key = read_string(buf, "key")?;
        Ok(Self { key, gsn })
    }
}

// ── Transactions ─────────────────────────────────────────────────────────

/// The four supported isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    SnapshotIsolation,
    Serializable,
}

impl IsolationLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READ_COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Some(IsolationLevel::RepeatableRead),
            "SNAPSHOT_ISOLATION" => Some(IsolationLevel::SnapshotIsolation),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::SnapshotIsolation => "SNAPSHOT_ISOLATION",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database operation recorded in a WAL row / staging entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Begin,
    Put,
    Delete,
    Get,
    Commit,
    Rollback,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Begin => "BEGIN",
            Operation::Put => "PUT",
            Operation::Delete => "DELETE",
            Operation::Get => "GET",
            Operation::Commit => "COMMIT",
            Operation::Rollback => "ROLLBACK",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        Ok(match s {
            "BEGIN" => Operation::Begin,
            "PUT" => Operation::Put,
            "DELETE" => Operation::Delete,
            "GET" => Operation::Get,
            "COMMIT" => Operation::Commit,
            "ROLLBACK" => Operation::Rollback,
            _ => {
                return Err(CodecError::InvalidTag {
                    what: "operation",
                    tag: 0,
                })
            }
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction state a WAL row was written under, encoded in the row's
/// `log_type` byte. A row in state `Commit` is the commit marker for its
/// transaction id (auto-commit writes carry it directly; interactive
/// transactions write a dedicated COMMIT row).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Queued = 0,
    Commit = 1,
    Rollback = 2,
}

impl TxnState {
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => TxnState::Queued,
            1 => TxnState::Commit,
            2 => TxnState::Rollback,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "txn state",
                    tag: other,
                })
            }
        })
    }
}

// ── WAL rows ─────────────────────────────────────────────────────────────

/// Payload of a log row: the versioned key plus the value transition.
/// Control rows carry null values on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPayload {
    pub key: VersionedKey,
    pub old_value: Value,
    pub new_value: Value,
}

impl RecordPayload {
    pub fn control(gsn: Gsn) -> Self {
        Self {
            key: VersionedKey::control(gsn),
            old_value: Value::null(),
            new_value: Value::null(),
        }
    }

    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();

        let mut key_bytes = BytesMut::new();
        self.key.encode(&mut key_bytes);
        write_bytes(&mut out, &key_bytes);

        let mut old_bytes = BytesMut::new();
        self.old_value.encode(&mut old_bytes);
        write_bytes(&mut out, &old_bytes);

        let mut new_bytes = BytesMut::new();
        self.new_value.encode(&mut new_bytes);
        write_bytes(&mut out, &new_bytes);

        out
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let key_bytes = codec::read_bytes(buf)?;
        let key = VersionedKey::decode(&mut key_bytes.as_slice())?;

        let old_bytes = codec::read_bytes(buf)?;
        let old_value = Value::decode(&mut old_bytes.as_slice())?;

        let new_bytes = codec::read_bytes(buf)?;
        let new_value = Value::decode(&mut new_bytes.as_slice())?;

        Ok(Self {
            key,
            old_value,
            new_value,
        })
    }
}

/// One write-ahead-log row.
///
/// Wire layout (big-endian):
/// `i64 lso || u8 log_type || u32 txn_id || i64 ts || string op ||
///  bytes payload || u32 checksum`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Byte offset of this row's length prefix within the WAL file.
    /// Filled in by the WAL manager on append.
    pub lso: i64,
    pub state: TxnState,
    pub txn_id: TxnId,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub operation: Operation,
    pub payload: RecordPayload,
    pub checksum: u32,
}

impl LogRecord {
    /// Build a row with no offset or timestamp; the WAL manager fills both
    /// in on append.
    pub fn new(txn_id: TxnId, operation: Operation, state: TxnState, payload: RecordPayload) -> Self {
        Self {
            lso: 0,
            state,
            txn_id,
            timestamp: 0,
            operation,
            payload,
            checksum: 0,
        }
    }

    /// Serialize the full row. The checksum field is written as stored; the
    /// WAL manager patches it after computing the CRC over the prefix.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(64);
        out.put_i64(self.lso);
        out.put_u8(self.state as u8);
        out.put_u32(self.txn_id.0);
        out.put_i64(self.timestamp);
        write_string(&mut out, self.operation.as_str());
        write_bytes(&mut out, &self.payload.encode());
        out.put_u32(self.checksum);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = data;
        let lso = read_i64(&mut buf)?;
        let state = TxnState::from_u8(read_u8(&mut buf)?)?;
        let txn_id = TxnId(read_u32(&mut buf)?);
        let timestamp = read_i64(&mut buf)?;
        let operation = Operation::parse(&read_string(&mut buf, "operation")?)?;
        let payload_bytes = codec::read_bytes(&mut buf)?;
        let payload = RecordPayload::decode(&mut payload_bytes.as_slice())?;
        let checksum = read_u32(&mut buf)?;
        Ok(Self {
            lso,
            state,
            txn_id,
            timestamp,
            operation,
            payload,
            checksum,
        })
    }
}
