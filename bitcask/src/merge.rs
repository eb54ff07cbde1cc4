use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::data::data_file::{data_file_name, DataFile, MERGE_FINISHED_FILE_NAME};
use crate::data::log_record::{
    encode_log_record_key, parse_log_record_key, LogRecord, LogRecordPos, LogRecordType,
    NON_TRANSACTION_SEQ_NO,
};
use crate::db::{load_data_file_ids, Engine};
use crate::error::{Error, Result};
use crate::fio::IOType;
use crate::util;

const MERGE_FINISHED_KEY: &[u8] = b"merge-finished";

fn merge_dir_path(dir_path: &Path) -> PathBuf {
    let dir_name = dir_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    let parent = dir_path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{dir_name}-merge"))
}

impl Engine {
    /// Compacts every immutable data file into a sibling `-merge` directory,
    /// keeping only each key's live value and discarding tombstones and
    /// superseded versions. The rewritten files and a hint file (a fast
    /// index-rebuild shortcut) are left for the *next* `Engine::open` to
    /// swap into place atomically — `merge` itself never touches the live
    /// data directory's readable files (spec.md §4.7).
    pub fn merge(&self) -> Result<()> {
        let _guard = self
            .merge_lock
            .try_lock()
            .map_err(|_| Error::MergeIsProgress)?;

        let stat = self.stat()?;
        if stat.disk_size == 0 {
            return Ok(());
        }
        let ratio = stat.reclaimable_bytes as f32 / stat.disk_size as f32;
        if ratio < self.options.data_file_merge_ratio {
            return Err(Error::MergeRatioUnreached);
        }
        let needed = stat.disk_size.saturating_sub(stat.reclaimable_bytes);
        if util::available_disk_size(&self.options.dir_path)? < needed {
            return Err(Error::NoEnoughSpaceForMerge);
        }

        // Force-rotate so every record up to now lives in an immutable file;
        // the new active file's id becomes the merge/live boundary.
        self.rotate_active_file()?;
        let merge_file_ids = self.older_file_ids.read().unwrap().clone();
        let non_merge_file_id = self.active_file.read().unwrap().file_id();
        let total_files = merge_file_ids.len();

        let merge_dir = merge_dir_path(&self.options.dir_path);
        if merge_dir.is_dir() {
            fs::remove_dir_all(&merge_dir)?;
        }
        fs::create_dir_all(&merge_dir)?;

        let mut merge_active_id = 0u32;
        let mut merge_file = DataFile::new(&merge_dir, merge_active_id, IOType::Standard)?;
        let hint_file = DataFile::new_hint_file(&merge_dir)?;

        for file_id in merge_file_ids {
            let data_file = self.get_old_file(file_id)?;
            let mut offset = 0u64;
            loop {
                let read = match data_file.read_log_record(offset) {
                    Ok(r) => r,
                    Err(_) if offset >= data_file.write_offset() => break,
                    Err(e) => return Err(e),
                };
                let record_size = read.size;
                let (real_key, _seq_no) = parse_log_record_key(&read.record.key);

                let is_live = self.index.get(&real_key).is_some_and(|current_pos| {
                    current_pos.file_id == file_id
                        && current_pos.offset == offset
                        && read.record.rec_type != LogRecordType::Deleted
                });

                if is_live {
                    if merge_file.write_offset() + record_size > self.options.data_file_size {
                        merge_file.sync()?;
                        merge_active_id += 1;
                        merge_file = DataFile::new(&merge_dir, merge_active_id, IOType::Standard)?;
                    }
                    let rewritten = LogRecord {
                        key: encode_log_record_key(&real_key, NON_TRANSACTION_SEQ_NO),
                        value: read.record.value,
                        rec_type: LogRecordType::Normal,
                    };
                    let encoded = rewritten.encode();
                    let new_offset = merge_file.write(&encoded)?;
                    hint_file.write_hint_record(
                        real_key,
                        LogRecordPos {
                            file_id: merge_active_id,
                            offset: new_offset,
                            size: encoded.len() as u32,
                        },
                    )?;
                }

                offset += record_size;
            }
        }

        merge_file.sync()?;
        hint_file.sync()?;

        let finished_file = DataFile::new_merge_finished_file(&merge_dir)?;
        let marker = LogRecord {
            key: MERGE_FINISHED_KEY.to_vec(),
            value: non_merge_file_id.to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        finished_file.write(&marker.encode())?;
        finished_file.sync()?;

        debug!(
            "merge compacted {total_files} file(s) below id {non_merge_file_id}; swap pending on next open"
        );
        Ok(())
    }
}

/// Called once at the top of `Engine::open`, before data files are listed:
/// swaps in the previous `merge()` run's output, if any, or discards it if
/// the marker file shows the merge never finished (spec.md §4.7, "Recovery
/// interaction").
pub(crate) fn load_merge_files(dir_path: &Path) -> Result<()> {
    let merge_dir = merge_dir_path(dir_path);
    if !merge_dir.is_dir() {
        return Ok(());
    }

    let finished_path = merge_dir.join(MERGE_FINISHED_FILE_NAME);
    if !finished_path.is_file() {
        fs::remove_dir_all(&merge_dir)?;
        return Ok(());
    }

    let finished_file = DataFile::new_merge_finished_file(&merge_dir)?;
    let read = finished_file.read_log_record(0)?;
    let non_merge_file_id: u32 = String::from_utf8_lossy(&read.record.value)
        .parse()
        .map_err(|_| Error::DataDirectoryCorrupted)?;
    drop(finished_file);

    for id in load_data_file_ids(dir_path)? {
        if id < non_merge_file_id {
            let _ = fs::remove_file(data_file_name(dir_path, id));
        }
    }

    for entry in fs::read_dir(&merge_dir)? {
        let entry = entry?;
        if entry.file_name() == MERGE_FINISHED_FILE_NAME {
            continue;
        }
        fs::rename(entry.path(), dir_path.join(entry.file_name()))?;
    }

    fs::remove_dir_all(&merge_dir)?;
    debug!("swapped in merge output below id {non_merge_file_id}");
    Ok(())
}
