use integer_encoding::VarInt;

use crate::error::{Error, Result};

/// Non-transactional writes are stamped with sequence number zero (spec.md §3).
pub const NON_TRANSACTION_SEQ_NO: u64 = 0;

/// Wire-key suffix appended to a transaction's commit-terminator record.
pub const TXN_FINISHED_KEY: &[u8] = b"txn-fin";

/// `crc(4) + type(1) + varint(key_size, <=5) + varint(value_size, <=5)`.
pub const MAX_LOG_RECORD_HEADER_SIZE: usize = 4 + 1 + 5 + 5;

/// The type tag stored in a log record's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A live key/value write.
    Normal = 1,
    /// A tombstone: the key was deleted, value is empty.
    Deleted = 2,
    /// Zero-payload marker closing a transaction's commit group.
    TxnFinished = 3,
}

impl LogRecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Normal),
            2 => Some(Self::Deleted),
            3 => Some(Self::TxnFinished),
            _ => None,
        }
    }
}

/// A single persisted log record (spec.md §3, "Log record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub rec_type: LogRecordType,
}

/// In-memory keydir entry: where a key's most recent live record lives.
///
/// `size` is the encoded size of the record at `(file_id, offset)`; it is
/// never used to interpret the record, only to maintain the
/// `reclaimable_bytes` statistic when a record is superseded or deleted
/// (SPEC_FULL.md §3 supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordPos {
    pub file_id: u32,
    pub offset: u64,
    pub size: u32,
}

impl LogRecordPos {
    /// `varint(file_id) || varint(offset) || varint(size)`, at most 20 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&self.file_id.encode_var_vec());
        buf.extend_from_slice(&self.offset.encode_var_vec());
        buf.extend_from_slice(&self.size.encode_var_vec());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (file_id, n1) = u32::decode_var(buf).ok_or(Error::DataDirectoryCorrupted)?;
        let (offset, n2) = u64::decode_var(&buf[n1..]).ok_or(Error::DataDirectoryCorrupted)?;
        let (size, _n3) = u32::decode_var(&buf[n1 + n2..]).ok_or(Error::DataDirectoryCorrupted)?;
        Ok(Self {
            file_id,
            offset,
            size,
        })
    }
}

/// A log record staged during startup scan recovery, paired with the
/// position it was found at (§4.6.1).
pub struct TransactionRecord {
    pub record: LogRecord,
    pub pos: LogRecordPos,
}

/// Result of decoding one on-disk record: the record plus its total encoded
/// size, so the caller can advance its read offset.
pub struct ReadLogRecord {
    pub record: LogRecord,
    pub size: u64,
}

/// A decoded, CRC-unverified record header.
pub(crate) struct Header {
    pub crc: u32,
    pub rec_type: LogRecordType,
    pub key_size: u32,
    pub value_size: u32,
    pub header_size: usize,
}

impl LogRecord {
    /// Encodes this record to its on-disk byte representation. Returns the
    /// encoded bytes; the caller can take `.len()` for the total size.
    pub fn encode(&self) -> Vec<u8> {
        let key_size = self.key.len() as u32;
        let value_size = self.value.len() as u32;

        let mut buf = Vec::with_capacity(
            MAX_LOG_RECORD_HEADER_SIZE + self.key.len() + self.value.len(),
        );
        // reserve the CRC field, filled in below
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(self.rec_type as u8);
        buf.extend_from_slice(&key_size.encode_var_vec());
        buf.extend_from_slice(&value_size.encode_var_vec());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

/// Decodes a record header from a buffer that was read starting at a
/// record's first byte. Returns `None` for the distinguished
/// end-of-file/blank-tail outcome (spec.md §4.1); the header's own CRC is not
/// checked here, only its own well-formedness.
pub(crate) fn decode_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < 5 {
        return None;
    }
    let crc = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let rec_type = LogRecordType::from_byte(buf[4])?;
    let (key_size, n1) = u32::decode_var(&buf[5..])?;
    let (value_size, n2) = u32::decode_var(&buf[5 + n1..])?;
    Some(Header {
        crc,
        rec_type,
        key_size,
        value_size,
        header_size: 5 + n1 + n2,
    })
}

/// Computes the CRC32 that should match `header.crc` for a fully-read
/// record: over `type || varint(key_size) || varint(value_size) || key ||
/// value`, i.e. the header bytes excluding the CRC field itself, plus the
/// key/value bytes.
pub(crate) fn record_crc(header_tail: &[u8], key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_tail);
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Prefixes `key` with `varint(seq_no)`, producing the bytes that are
/// actually persisted as a log record's key (spec.md §3, "Wire-key").
pub fn encode_log_record_key(key: &[u8], seq_no: u64) -> Vec<u8> {
    let mut buf = seq_no.encode_var_vec();
    buf.extend_from_slice(key);
    buf
}

/// Inverse of [`encode_log_record_key`]: splits a wire-key into the real
/// user key and its sequence number.
pub fn parse_log_record_key(wire_key: &[u8]) -> (Vec<u8>, u64) {
    let (seq_no, n) = u64::decode_var(wire_key).unwrap_or((0, 0));
    (wire_key[n..].to_vec(), seq_no)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let record = LogRecord {
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let enc = record.encode();

        let header = decode_header(&enc[..MAX_LOG_RECORD_HEADER_SIZE.min(enc.len())]).unwrap();
        assert_eq!(header.key_size as usize, record.key.len());
        assert_eq!(header.value_size as usize, record.value.len());
        assert_eq!(header.rec_type, LogRecordType::Normal);

        let key = &enc[header.header_size..header.header_size + header.key_size as usize];
        let value = &enc[header.header_size + header.key_size as usize..];
        assert_eq!(key, record.key.as_slice());
        assert_eq!(value, record.value.as_slice());

        let crc = record_crc(&enc[4..header.header_size], key, value);
        assert_eq!(crc, header.crc);
    }

    #[test]
    fn tampered_byte_breaks_crc() {
        let record = LogRecord {
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let mut enc = record.encode();
        let last = enc.len() - 1;
        enc[last] ^= 0xFF;

        let header = decode_header(&enc[..MAX_LOG_RECORD_HEADER_SIZE.min(enc.len())]).unwrap();
        let key = &enc[header.header_size..header.header_size + header.key_size as usize];
        let value = &enc[header.header_size + header.key_size as usize..];
        let crc = record_crc(&enc[4..header.header_size], key, value);
        assert_ne!(crc, header.crc);
    }

    #[test]
    fn wire_key_round_trips() {
        let key = b"hello".to_vec();
        let enc = encode_log_record_key(&key, 42);
        let (real_key, seq) = parse_log_record_key(&enc);
        assert_eq!(real_key, key);
        assert_eq!(seq, 42);
    }

    #[test]
    fn non_transactional_seq_no_is_zero() {
        let key = b"k".to_vec();
        let enc = encode_log_record_key(&key, NON_TRANSACTION_SEQ_NO);
        let (real_key, seq) = parse_log_record_key(&enc);
        assert_eq!(real_key, key);
        assert_eq!(seq, 0);
    }

    #[test]
    fn log_record_pos_round_trips() {
        let pos = LogRecordPos {
            file_id: 7,
            offset: 123_456,
            size: 42,
        };
        let enc = pos.encode();
        assert!(enc.len() <= 20);
        let decoded = LogRecordPos::decode(&enc).unwrap();
        assert_eq!(decoded, pos);
    }
}
