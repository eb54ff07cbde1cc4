use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::data::log_record::{
    decode_header, record_crc, LogRecord, LogRecordPos, LogRecordType, ReadLogRecord,
    MAX_LOG_RECORD_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::fio::{new_io_manager, IOManager, IOType};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";
pub const HINT_FILE_NAME: &str = "hint-index";
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";
pub const SEQ_NO_FILE_NAME: &str = "seq-no";
pub const LOCK_FILE_NAME: &str = "flock";

/// Builds the path of the numbered data file `file_id` within `dir_path`,
/// e.g. `000000001.data`.
pub fn data_file_name(dir_path: &Path, file_id: u32) -> PathBuf {
    dir_path.join(format!("{:09}{}", file_id, DATA_FILE_NAME_SUFFIX))
}

/// An append-only segment of the log, either the current active file or one
/// of the older, immutable files (spec.md §4.3).
pub struct DataFile {
    file_id: u32,
    path: PathBuf,
    write_offset: AtomicU64,
    io_manager: RwLock<Box<dyn IOManager>>,
}

impl DataFile {
    pub fn new(dir_path: &Path, file_id: u32, io_type: IOType) -> Result<Self> {
        let path = data_file_name(dir_path, file_id);
        Self::open(path, file_id, io_type)
    }

    pub fn new_hint_file(dir_path: &Path) -> Result<Self> {
        Self::open(dir_path.join(HINT_FILE_NAME), 0, IOType::Standard)
    }

    pub fn new_merge_finished_file(dir_path: &Path) -> Result<Self> {
        Self::open(dir_path.join(MERGE_FINISHED_FILE_NAME), 0, IOType::Standard)
    }

    pub fn new_seq_no_file(dir_path: &Path) -> Result<Self> {
        Self::open(dir_path.join(SEQ_NO_FILE_NAME), 0, IOType::Standard)
    }

    fn open(path: PathBuf, file_id: u32, io_type: IOType) -> Result<Self> {
        let io_manager = new_io_manager(&path, io_type)?;
        let write_offset = io_manager.size()?;
        Ok(Self {
            file_id,
            path,
            write_offset: AtomicU64::new(write_offset),
            io_manager: RwLock::new(io_manager),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::SeqCst)
    }

    /// Swaps this file's [`IOManager`] for one of type `io_type` — used to
    /// drop the read-only mmap view after the startup scan completes and
    /// switch back to standard positional I/O (spec.md §4.2).
    pub fn set_io_manager(&self, io_type: IOType) -> Result<()> {
        let new_manager = new_io_manager(&self.path, io_type)?;
        *self.io_manager.write().unwrap() = new_manager;
        Ok(())
    }

    /// Appends an already-encoded record and returns the offset it was
    /// written at.
    pub fn write(&self, buf: &[u8]) -> Result<u64> {
        let io = self.io_manager.read().unwrap();
        let offset = self.write_offset.load(Ordering::SeqCst);
        let n = io.write(buf)?;
        self.write_offset.fetch_add(n as u64, Ordering::SeqCst);
        Ok(offset)
    }

    /// Appends a hint record mapping `key` to `pos`, for the merge hint file.
    pub fn write_hint_record(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<()> {
        let record = LogRecord {
            key,
            value: pos.encode(),
            rec_type: LogRecordType::Normal,
        };
        self.write(&record.encode())?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.io_manager.read().unwrap().sync()
    }

    /// Reads and CRC-verifies one record starting at `offset`. Callers doing
    /// a sequential scan should stop once `offset` reaches the file's size
    /// rather than relying on an error to signal end-of-file.
    pub fn read_log_record(&self, offset: u64) -> Result<ReadLogRecord> {
        let io = self.io_manager.read().unwrap();
        let file_size = io.size()?;
        if offset >= file_size {
            return Err(Error::DataDirectoryCorrupted);
        }

        let header_buf_len = MAX_LOG_RECORD_HEADER_SIZE.min((file_size - offset) as usize);
        let mut header_buf = vec![0u8; header_buf_len];
        io.read(&mut header_buf, offset)?;
        let header = decode_header(&header_buf).ok_or(Error::DataDirectoryCorrupted)?;

        let key_size = header.key_size as usize;
        let value_size = header.value_size as usize;
        let mut kv_buf = vec![0u8; key_size + value_size];
        if !kv_buf.is_empty() {
            io.read(&mut kv_buf, offset + header.header_size as u64)?;
        }
        let key = kv_buf[..key_size].to_vec();
        let value = kv_buf[key_size..].to_vec();

        let crc = record_crc(&header_buf[4..header.header_size], &key, &value);
        if crc != header.crc {
            return Err(Error::InvalidCRC);
        }

        let size = (header.header_size + key_size + value_size) as u64;
        Ok(ReadLogRecord {
            record: LogRecord {
                key,
                value,
                rec_type: header.rec_type,
            },
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_back_sequential_records() {
        let dir = tempdir().unwrap();
        let file = DataFile::new(dir.path(), 0, IOType::Standard).unwrap();

        let r1 = LogRecord {
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let r2 = LogRecord {
            key: b"baz".to_vec(),
            value: Vec::new(),
            rec_type: LogRecordType::Deleted,
        };

        let off1 = file.write(&r1.encode()).unwrap();
        let off2 = file.write(&r2.encode()).unwrap();
        assert_eq!(off1, 0);

        let read1 = file.read_log_record(off1).unwrap();
        assert_eq!(read1.record, r1);
        let read2 = file.read_log_record(off2).unwrap();
        assert_eq!(read2.record, r2);
    }

    #[test]
    fn corrupted_record_fails_crc() {
        let dir = tempdir().unwrap();
        let file = DataFile::new(dir.path(), 0, IOType::Standard).unwrap();
        let record = LogRecord {
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
            rec_type: LogRecordType::Normal,
        };
        file.write(&record.encode()).unwrap();

        // flip the last byte on disk, bypassing DataFile's own writer
        let path = data_file_name(dir.path(), 0);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let file2 = DataFile::new(dir.path(), 0, IOType::Standard).unwrap();
        assert!(matches!(file2.read_log_record(0), Err(Error::InvalidCRC)));
    }
}
