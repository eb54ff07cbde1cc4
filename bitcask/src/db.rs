use std::collections::HashMap;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use lru::LruCache;
use log::{debug, warn};

use crate::data::data_file::{
    data_file_name, DataFile, DATA_FILE_NAME_SUFFIX, HINT_FILE_NAME, LOCK_FILE_NAME,
    SEQ_NO_FILE_NAME,
};
use crate::data::log_record::{
    encode_log_record_key, parse_log_record_key, LogRecord, LogRecordPos, LogRecordType,
    TransactionRecord, NON_TRANSACTION_SEQ_NO,
};
use crate::error::{Error, Result};
use crate::fio::IOType;
use crate::index::{new_indexer, Indexer};
use crate::options::{IteratorOptions, Options};
use crate::util;

const SEQ_NO_KEY: &[u8] = b"seq-no";

/// A point-in-time summary of the engine's size (spec.md §6, "Stat").
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub key_num: usize,
    pub data_file_num: usize,
    pub reclaimable_bytes: u64,
    pub disk_size: u64,
}

/// The open database. Every operation takes `&self`: concurrency is
/// provided internally (a single exclusive append path, a reader-writer
/// index, and per-file locks), so an `Engine` is normally shared across
/// threads behind an `Arc` (spec.md §5).
pub struct Engine {
    pub(crate) options: Options,
    pub(crate) active_file: RwLock<Arc<DataFile>>,
    pub(crate) older_file_ids: RwLock<Vec<u32>>,
    old_file_cache: Mutex<LruCache<u32, Arc<DataFile>>>,
    pub(crate) index: Box<dyn Indexer>,
    /// Held across an entire append-then-index-update sequence: `put`,
    /// `delete`, and `WriteBatch::commit` all take it once and keep it for
    /// their whole operation, so two writers touching the same key can never
    /// have their index updates apply out of order relative to their log
    /// writes (spec.md §5).
    pub(crate) write_lock: Mutex<()>,
    pub(crate) seq_no: AtomicU64,
    pub(crate) merge_lock: Mutex<()>,
    lock_file: File,
    bytes_since_sync: AtomicUsize,
    pub(crate) reclaim_size: AtomicU64,
}

impl Engine {
    /// Opens (creating if necessary) the database at `options.dir_path`.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;

        let dir_path = options.dir_path.clone();
        if !dir_path.is_dir() {
            fs::create_dir_all(&dir_path).map_err(|_| Error::FailedToCreateDatabaseDir)?;
        }

        let lock_file = acquire_dir_lock(&dir_path)?;

        crate::merge::load_merge_files(&dir_path)?;

        let data_file_ids = load_data_file_ids(&dir_path)?;
        let index = new_indexer(options.index_type, &dir_path)?;
        let needs_replay = index.requires_log_replay();
        let io_type = if options.mmap_at_startup && needs_replay {
            IOType::MemoryMap
        } else {
            IOType::Standard
        };

        let mut older_file_ids = Vec::new();
        let active_file = if data_file_ids.is_empty() {
            DataFile::new(&dir_path, 0, IOType::Standard)?
        } else {
            older_file_ids = data_file_ids[..data_file_ids.len() - 1].to_vec();
            let active_id = *data_file_ids.last().unwrap();
            DataFile::new(&dir_path, active_id, io_type)?
        };

        let cache_capacity = NonZeroUsize::new(options.max_open_files.max(1)).unwrap();

        let engine = Self {
            options,
            active_file: RwLock::new(Arc::new(active_file)),
            older_file_ids: RwLock::new(older_file_ids),
            old_file_cache: Mutex::new(LruCache::new(cache_capacity)),
            index,
            write_lock: Mutex::new(()),
            seq_no: AtomicU64::new(0),
            merge_lock: Mutex::new(()),
            lock_file,
            bytes_since_sync: AtomicUsize::new(0),
            reclaim_size: AtomicU64::new(0),
        };

        // The hint file repoints keys that `merge` compacted into freshly
        // numbered files; every backend needs it applied once after a swap,
        // including the persistent B+Tree index, which otherwise would keep
        // stale positions referring to data files the swap just deleted
        // (spec.md §4.7 combined with §4.4's B+Tree fast-open path).
        let hint_max_file_id = engine.load_index_from_hint_file()?;

        let mut max_replay_seq_no = NON_TRANSACTION_SEQ_NO;
        if needs_replay {
            max_replay_seq_no =
                engine.load_index_from_data_files(&data_file_ids, hint_max_file_id)?;
            if io_type == IOType::MemoryMap {
                engine
                    .active_file
                    .read()
                    .unwrap()
                    .set_io_manager(IOType::Standard)?;
            }
        }

        let persisted_seq_no = engine.load_seq_no()?;
        engine
            .seq_no
            .store(max_replay_seq_no.max(persisted_seq_no), Ordering::SeqCst);

        debug!(
            "opened database at {:?} ({} data file(s), {} key(s))",
            engine.options.dir_path,
            data_file_ids.len().max(1),
            engine.index.size()
        );
        Ok(engine)
    }

    /// Writes `value` under `key`, overwriting any existing value.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let record = LogRecord {
            key: encode_log_record_key(&key, NON_TRANSACTION_SEQ_NO),
            value,
            rec_type: LogRecordType::Normal,
        };
        // Held across the append and the matching index update so a second
        // writer for the same key can't apply its index update in between.
        let _guard = self.write_lock.lock().unwrap();
        let pos = self.append_log_record_locked(&record)?;
        self.apply_log_record(key, pos, LogRecordType::Normal)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let pos = self.index.get(key).ok_or(Error::KeyNotFound)?;
        self.get_value_by_position(&pos)
    }

    /// Removes `key`. Deleting a key that does not exist is a no-op, not an
    /// error (spec.md §4.5, "Delete").
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let _guard = self.write_lock.lock().unwrap();
        if self.index.get(&key).is_none() {
            return Ok(());
        }
        let record = LogRecord {
            key: encode_log_record_key(&key, NON_TRANSACTION_SEQ_NO),
            value: Vec::new(),
            rec_type: LogRecordType::Deleted,
        };
        let pos = self.append_log_record_locked(&record)?;
        self.apply_log_record(key, pos, LogRecordType::Deleted)?;
        Ok(())
    }

    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.index.list_keys()
    }

    /// Visits every live key/value pair in key order, stopping early if `f`
    /// returns `false`.
    pub fn fold<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let mut it = self.index.iterator(IteratorOptions::default());
        while let Some((key, pos)) = it.next() {
            let value = self.get_value_by_position(&pos)?;
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.active_file.read().unwrap().sync()
    }

    pub fn stat(&self) -> Result<Stat> {
        Ok(Stat {
            key_num: self.index.size(),
            data_file_num: self.older_file_ids.read().unwrap().len() + 1,
            reclaimable_bytes: self.reclaim_size.load(Ordering::SeqCst),
            disk_size: util::dir_disk_size(&self.options.dir_path),
        })
    }

    /// Copies the whole database directory to `dst_path` while the engine
    /// remains open, leaving the advisory lock file behind so the copy can
    /// be opened independently (spec.md §6, "BackUp").
    pub fn backup(&self, dst_path: &Path) -> Result<()> {
        util::copy_dir(&self.options.dir_path, dst_path, &[LOCK_FILE_NAME])
    }

    /// Flushes the active file, persists the sequence-number counter, closes
    /// the index, and releases the directory lock.
    pub fn close(&self) -> Result<()> {
        let seq_no_file = DataFile::new_seq_no_file(&self.options.dir_path)?;
        let record = LogRecord {
            key: SEQ_NO_KEY.to_vec(),
            value: self.seq_no.load(Ordering::SeqCst).to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        seq_no_file.write(&record.encode())?;
        seq_no_file.sync()?;

        self.active_file.read().unwrap().sync()?;
        self.index.close()?;
        FileExt::unlock(&self.lock_file)?;
        Ok(())
    }

    /// Appends an already-built record to the active file, rotating to a
    /// fresh active file first if it would overflow `data_file_size`.
    /// Assumes `write_lock` is already held by the caller — `put`, `delete`,
    /// and `WriteBatch::commit` each take it once and hold it across both
    /// this call and the matching index update, so the two never apply out
    /// of order relative to a concurrent writer on the same key (spec.md
    /// §5).
    pub(crate) fn append_log_record_locked(&self, record: &LogRecord) -> Result<LogRecordPos> {
        let encoded = record.encode();
        let record_len = encoded.len() as u64;

        let mut active_file = self.active_file.write().unwrap();
        if active_file.write_offset() + record_len > self.options.data_file_size {
            active_file.sync()?;
            let current_id = active_file.file_id();
            let retired = active_file.clone();
            self.older_file_ids.write().unwrap().push(current_id);
            self.old_file_cache
                .lock()
                .unwrap()
                .put(current_id, retired);

            let new_file = DataFile::new(&self.options.dir_path, current_id + 1, IOType::Standard)?;
            debug!("rotated active file {current_id} -> {}", current_id + 1);
            *active_file = Arc::new(new_file);
        }

        let offset = active_file.write(&encoded)?;

        let total_unsynced = self.bytes_since_sync.fetch_add(encoded.len(), Ordering::SeqCst)
            + encoded.len();
        let should_sync = self.options.sync_writes
            || (self.options.bytes_per_sync > 0 && total_unsynced >= self.options.bytes_per_sync);
        if should_sync {
            active_file.sync()?;
            self.bytes_since_sync.store(0, Ordering::SeqCst);
        }

        Ok(LogRecordPos {
            file_id: active_file.file_id(),
            offset,
            size: record_len as u32,
        })
    }

    /// Force-rotates the active file even if it has not reached
    /// `data_file_size`, so every record written so far becomes part of an
    /// immutable file. Used by `merge` to fix the live/mergeable boundary.
    pub(crate) fn rotate_active_file(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut active_file = self.active_file.write().unwrap();
        if active_file.write_offset() == 0 {
            return Ok(());
        }
        active_file.sync()?;
        let current_id = active_file.file_id();
        let retired = active_file.clone();
        self.older_file_ids.write().unwrap().push(current_id);
        self.old_file_cache.lock().unwrap().put(current_id, retired);
        let new_file = DataFile::new(&self.options.dir_path, current_id + 1, IOType::Standard)?;
        *active_file = Arc::new(new_file);
        Ok(())
    }

    /// Applies a decoded record's effect to the index, updating the
    /// reclaimable-bytes statistic for whatever position it supersedes.
    /// Shared by live writes and startup-scan replay.
    pub(crate) fn apply_log_record(
        &self,
        key: Vec<u8>,
        pos: LogRecordPos,
        rec_type: LogRecordType,
    ) -> Result<()> {
        match rec_type {
            LogRecordType::Normal => {
                if let Some(old) = self.index.put(key, pos)? {
                    self.reclaim_size.fetch_add(old.size as u64, Ordering::SeqCst);
                }
            }
            LogRecordType::Deleted => {
                if let Some(old) = self.index.delete(&key)? {
                    self.reclaim_size.fetch_add(old.size as u64, Ordering::SeqCst);
                }
                self.reclaim_size.fetch_add(pos.size as u64, Ordering::SeqCst);
            }
            LogRecordType::TxnFinished => {}
        }
        Ok(())
    }

    pub(crate) fn get_value_by_position(&self, pos: &LogRecordPos) -> Result<Vec<u8>> {
        let read = {
            let active_file = self.active_file.read().unwrap();
            if active_file.file_id() == pos.file_id {
                Some(active_file.read_log_record(pos.offset)?)
            } else {
                None
            }
        };
        let read = match read {
            Some(r) => r,
            None => self.get_old_file(pos.file_id)?.read_log_record(pos.offset)?,
        };
        if read.record.rec_type == LogRecordType::Deleted {
            return Err(Error::KeyNotFound);
        }
        Ok(read.record.value)
    }

    pub(crate) fn get_old_file(&self, file_id: u32) -> Result<Arc<DataFile>> {
        {
            let mut cache = self.old_file_cache.lock().unwrap();
            if let Some(file) = cache.get(&file_id) {
                return Ok(file.clone());
            }
        }
        if !data_file_name(&self.options.dir_path, file_id).is_file() {
            return Err(Error::DataFileNotFound);
        }
        let file = Arc::new(DataFile::new(&self.options.dir_path, file_id, IOType::Standard)?);
        self.old_file_cache.lock().unwrap().put(file_id, file.clone());
        Ok(file)
    }

    /// Loads keydir entries from `hint-index`, if one was left behind by a
    /// previous `merge` (spec.md §4.5 step 6). Every data file the hint file
    /// points into holds only live, non-transactional records written by
    /// merge itself, so priming the index from it and then skipping those
    /// same file ids during the full replay below is equivalent to — but far
    /// cheaper than — replaying them a second time. Returns the highest
    /// file-id referenced by the hint file, or `None` if there isn't one.
    fn load_index_from_hint_file(&self) -> Result<Option<u32>> {
        let hint_path = self.options.dir_path.join(HINT_FILE_NAME);
        if !hint_path.is_file() {
            return Ok(None);
        }

        let hint_file = DataFile::new_hint_file(&self.options.dir_path)?;
        let mut max_file_id = None;
        let mut offset = 0u64;
        loop {
            let read = match hint_file.read_log_record(offset) {
                Ok(r) => r,
                Err(_) if offset >= hint_file.write_offset() => break,
                Err(e) => return Err(e),
            };
            let pos = LogRecordPos::decode(&read.record.value)?;
            max_file_id = Some(max_file_id.map_or(pos.file_id, |m: u32| m.max(pos.file_id)));
            self.index.put(read.record.key, pos)?;
            offset += read.size;
        }
        Ok(max_file_id)
    }

    /// Replays every data file in ascending order, reconstructing the
    /// index. Writes staged under a non-zero sequence number are buffered
    /// until their batch's commit-terminator record is seen, so a crash
    /// mid-batch leaves none of its writes visible (spec.md §4.6.1).
    /// `hint_max_file_id` (when set) names the highest file-id whose
    /// contents are already reflected in the index via the hint file, so
    /// those files are skipped here rather than re-applied.
    /// Returns the highest sequence number observed.
    fn load_index_from_data_files(
        &self,
        data_file_ids: &[u32],
        hint_max_file_id: Option<u32>,
    ) -> Result<u64> {
        if data_file_ids.is_empty() {
            return Ok(NON_TRANSACTION_SEQ_NO);
        }

        let mut pending: HashMap<u64, Vec<TransactionRecord>> = HashMap::new();
        let mut max_seq_no = NON_TRANSACTION_SEQ_NO;
        let active_id = *data_file_ids.last().unwrap();

        for &file_id in data_file_ids {
            if hint_max_file_id.is_some_and(|hinted| file_id <= hinted) {
                continue;
            }
            let file: Arc<DataFile> = if file_id == active_id {
                self.active_file.read().unwrap().clone()
            } else {
                Arc::new(DataFile::new(
                    &self.options.dir_path,
                    file_id,
                    if self.options.mmap_at_startup {
                        IOType::MemoryMap
                    } else {
                        IOType::Standard
                    },
                )?)
            };

            let mut offset = 0u64;
            loop {
                let read = match file.read_log_record(offset) {
                    Ok(r) => r,
                    Err(_) if offset >= file.write_offset() => break,
                    Err(e) => {
                        warn!(
                            "corrupt record at {file_id:09}.data offset {offset}: {e}; \
                             aborting startup scan rather than guessing a record boundary"
                        );
                        return Err(e);
                    }
                };

                let (real_key, seq_no) = parse_log_record_key(&read.record.key);
                let pos = LogRecordPos {
                    file_id,
                    offset,
                    size: read.size as u32,
                };
                max_seq_no = max_seq_no.max(seq_no);

                if seq_no == NON_TRANSACTION_SEQ_NO {
                    self.apply_log_record(real_key, pos, read.record.rec_type)?;
                } else if read.record.rec_type == LogRecordType::TxnFinished {
                    if let Some(staged) = pending.remove(&seq_no) {
                        for txn_record in staged {
                            let (txn_key, _) = parse_log_record_key(&txn_record.record.key);
                            self.apply_log_record(
                                txn_key,
                                txn_record.pos,
                                txn_record.record.rec_type,
                            )?;
                        }
                    }
                } else {
                    pending.entry(seq_no).or_default().push(TransactionRecord {
                        record: LogRecord {
                            key: read.record.key.clone(),
                            value: read.record.value.clone(),
                            rec_type: read.record.rec_type,
                        },
                        pos,
                    });
                }

                offset += read.size;
            }
        }

        if !pending.is_empty() {
            warn!("log replay found {} uncommitted batch(es); discarding", pending.len());
        }

        Ok(max_seq_no)
    }

    fn load_seq_no(&self) -> Result<u64> {
        let path = self.options.dir_path.join(SEQ_NO_FILE_NAME);
        if !path.is_file() {
            return Ok(NON_TRANSACTION_SEQ_NO);
        }
        let seq_no_file = DataFile::new_seq_no_file(&self.options.dir_path)?;
        let read = seq_no_file.read_log_record(0)?;
        let seq_no = String::from_utf8_lossy(&read.record.value)
            .parse()
            .unwrap_or(NON_TRANSACTION_SEQ_NO);
        drop(seq_no_file);
        let _ = fs::remove_file(&path);
        Ok(seq_no)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to cleanly close database: {err}");
        }
    }
}

fn acquire_dir_lock(dir_path: &Path) -> Result<File> {
    let lock_path = dir_path.join(LOCK_FILE_NAME);
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)?;
    file.try_lock_exclusive().map_err(|_| Error::DatabaseInUse)?;
    Ok(file)
}

pub(crate) fn load_data_file_ids(dir_path: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(stem) = file_name.strip_suffix(DATA_FILE_NAME_SUFFIX) {
            if let Ok(id) = stem.parse::<u32>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use tempfile::tempdir;

    fn test_options(dir: &Path) -> Options {
        Options {
            dir_path: dir.to_path_buf(),
            data_file_size: 64 * 1024 * 1024,
            ..Options::default()
        }
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();

        engine.put(b"foo".to_vec(), b"bar".to_vec()).unwrap();
        assert_eq!(engine.get(b"foo").unwrap(), b"bar");

        engine.delete(b"foo".to_vec()).unwrap();
        assert!(matches!(engine.get(b"foo"), Err(Error::KeyNotFound)));

        // deleting again is a no-op, not an error
        engine.delete(b"foo".to_vec()).unwrap();
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        assert!(matches!(engine.put(Vec::new(), b"x".to_vec()), Err(Error::KeyIsEmpty)));
        assert!(matches!(engine.get(b""), Err(Error::KeyIsEmpty)));
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(test_options(dir.path())).unwrap();
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            engine.delete(b"a".to_vec()).unwrap();
        }
        let engine = Engine::open(test_options(dir.path())).unwrap();
        assert!(matches!(engine.get(b"a"), Err(Error::KeyNotFound)));
        assert_eq!(engine.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn second_open_fails_while_first_is_live() {
        let dir = tempdir().unwrap();
        let _engine = Engine::open(test_options(dir.path())).unwrap();
        let second = Engine::open(test_options(dir.path()));
        assert!(matches!(second, Err(Error::DatabaseInUse)));
    }

    #[test]
    fn rotates_active_file_past_size_threshold() {
        let dir = tempdir().unwrap();
        let mut options = test_options(dir.path());
        options.data_file_size = 64;
        let engine = Engine::open(options).unwrap();

        for i in 0..50 {
            engine
                .put(format!("key-{i}").into_bytes(), b"0123456789".to_vec())
                .unwrap();
        }

        assert!(!engine.older_file_ids.read().unwrap().is_empty());
        let stat = engine.stat().unwrap();
        assert_eq!(stat.key_num, 50);
    }

    #[test]
    fn fold_visits_keys_in_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        for key in ["b", "a", "c"] {
            engine.put(key.as_bytes().to_vec(), b"v".to_vec()).unwrap();
        }
        let mut seen = Vec::new();
        engine
            .fold(|k, _| {
                seen.push(k.to_vec());
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn get_old_file_reports_missing_file_instead_of_creating_it() {
        let dir = tempdir().unwrap();
        let mut options = test_options(dir.path());
        options.data_file_size = 64;
        let engine = Engine::open(options).unwrap();

        for i in 0..50 {
            engine
                .put(format!("key-{i}").into_bytes(), b"0123456789".to_vec())
                .unwrap();
        }
        let older = engine.older_file_ids.read().unwrap().clone();
        assert!(!older.is_empty());
        let missing_id = older.iter().max().unwrap() + 1000;

        assert!(matches!(
            engine.get_old_file(missing_id),
            Err(Error::DataFileNotFound)
        ));
        assert!(!data_file_name(&dir.path().to_path_buf(), missing_id).is_file());
    }

    #[test]
    fn backup_copies_data_without_lock_file() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        engine.put(b"foo".to_vec(), b"bar".to_vec()).unwrap();

        let backup_dir = tempdir().unwrap();
        let dst = backup_dir.path().join("copy");
        engine.backup(&dst).unwrap();

        assert!(!dst.join(LOCK_FILE_NAME).exists());
        let mut restored_options = test_options(&dst);
        restored_options.dir_path = dst;
        let restored = Engine::open(restored_options).unwrap();
        assert_eq!(restored.get(b"foo").unwrap(), b"bar");
    }
}
