use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::data::log_record::{encode_log_record_key, LogRecord, LogRecordType, TXN_FINISHED_KEY};
use crate::db::Engine;
use crate::error::{Error, Result};
use crate::options::WriteBatchOptions;

/// A group of writes that become visible to readers all at once, or not at
/// all if the process crashes before `commit` finishes (spec.md §4.6).
///
/// Every pending write shares one sequence number, assigned at commit time,
/// and the group is closed by a zero-payload `TxnFinished` record; a replay
/// that never sees that terminator discards the whole group.
pub struct WriteBatch<'a> {
    engine: &'a Engine,
    options: WriteBatchOptions,
    pending: Mutex<HashMap<Vec<u8>, LogRecord>>,
}

impl Engine {
    pub fn new_write_batch(&self, options: WriteBatchOptions) -> WriteBatch<'_> {
        WriteBatch {
            engine: self,
            options,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<'a> WriteBatch<'a> {
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= self.options.max_batch_num {
            return Err(Error::ExceedMaxBatchNum);
        }
        pending.insert(
            key.clone(),
            LogRecord {
                key,
                value,
                rec_type: LogRecordType::Normal,
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let mut pending = self.pending.lock().unwrap();
        // A key the engine has never committed can't be deleted: cancel
        // whatever write is pending for it (a prior `put` in this same
        // batch) and emit nothing, rather than staging a tombstone for a
        // key that never existed.
        if self.engine.index.get(&key).is_none() {
            pending.remove(&key);
            return Ok(());
        }
        if !pending.contains_key(&key) && pending.len() >= self.options.max_batch_num {
            return Err(Error::ExceedMaxBatchNum);
        }
        pending.insert(
            key.clone(),
            LogRecord {
                key,
                value: Vec::new(),
                rec_type: LogRecordType::Deleted,
            },
        );
        Ok(())
    }

    /// Appends every pending write under one sequence number, followed by a
    /// commit-terminator record, then applies them all to the index.
    ///
    /// The size check below runs after `pending`'s mutex is already held and
    /// covers the same critical section as the drain that follows, so two
    /// threads racing to fill and commit the same batch cannot both pass a
    /// check that's stale by the time either one writes. `write_lock` is
    /// held from the sequence-number allocation through the final index
    /// updates, the same lock `put`/`delete` hold across their own
    /// append-plus-index-update, so a concurrent single-key write can never
    /// interleave its index update between this batch's appends and applies.
    pub fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(());
        }
        if pending.len() > self.options.max_batch_num {
            return Err(Error::ExceedMaxBatchNum);
        }

        let _write_guard = self.engine.write_lock.lock().unwrap();
        let seq_no = self.engine.seq_no.fetch_add(1, Ordering::SeqCst) + 1;

        let mut applied = Vec::with_capacity(pending.len());
        for (key, record) in pending.drain() {
            let wire_record = LogRecord {
                key: encode_log_record_key(&record.key, seq_no),
                value: record.value,
                rec_type: record.rec_type,
            };
            let pos = self.engine.append_log_record_locked(&wire_record)?;
            applied.push((key, pos, record.rec_type));
        }

        let finish_record = LogRecord {
            key: encode_log_record_key(TXN_FINISHED_KEY, seq_no),
            value: Vec::new(),
            rec_type: LogRecordType::TxnFinished,
        };
        self.engine.append_log_record_locked(&finish_record)?;

        for (key, pos, rec_type) in applied {
            self.engine.apply_log_record(key, pos, rec_type)?;
        }

        if self.options.sync_writes {
            self.engine.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use tempfile::tempdir;

    fn test_options(dir: &std::path::Path) -> Options {
        Options {
            dir_path: dir.to_path_buf(),
            ..Options::default()
        }
    }

    #[test]
    fn uncommitted_batch_is_invisible() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert!(matches!(engine.get(b"a"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn committed_batch_is_visible_and_atomic() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        batch.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        batch.commit().unwrap();

        assert_eq!(engine.get(b"a").unwrap(), b"1");
        assert_eq!(engine.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn batch_survives_reopen_only_if_committed() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(test_options(dir.path())).unwrap();
            let batch = engine.new_write_batch(WriteBatchOptions::default());
            batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            batch.commit().unwrap();

            let uncommitted = engine.new_write_batch(WriteBatchOptions::default());
            uncommitted.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            // never committed
        }
        let engine = Engine::open(test_options(dir.path())).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), b"1");
        assert!(matches!(engine.get(b"b"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn delete_of_never_committed_key_cancels_pending_put() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        let batch = engine.new_write_batch(WriteBatchOptions::default());

        batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        batch.delete(b"a".to_vec()).unwrap();
        batch.commit().unwrap();

        // "a" was never committed before the batch, so put-then-delete
        // inside the same batch cancels out and commits nothing for it.
        assert!(matches!(engine.get(b"a"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn delete_of_already_committed_key_stages_tombstone() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        engine.put(b"a".to_vec(), b"0".to_vec()).unwrap();

        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        batch.delete(b"a".to_vec()).unwrap();
        batch.commit().unwrap();

        assert!(matches!(engine.get(b"a"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn exceeding_max_batch_num_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).unwrap();
        let batch = engine.new_write_batch(WriteBatchOptions {
            max_batch_num: 2,
            sync_writes: false,
        });
        batch.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        batch.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert!(matches!(
            batch.put(b"c".to_vec(), b"3".to_vec()),
            Err(Error::ExceedMaxBatchNum)
        ));
    }
}
