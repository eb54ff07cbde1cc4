use std::path::PathBuf;

use crate::error::{Error, Result};

/// Which in-memory/on-disk keydir backend the engine should use.
///
/// All three behave identically from the engine's point of view (§4.4): they
/// differ only in the data structure backing the index and, for
/// [`IndexType::BPlusTree`], in whether the engine needs to replay the log on
/// open (see [`crate::index::Indexer::requires_log_replay`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// In-memory ordered map (`std::collections::BTreeMap`).
    BTree,
    /// In-memory adaptive radix tree, optimized for string-like keys.
    Art,
    /// On-disk ordered store; the keydir itself is persistent.
    BPlusTree,
}

/// Configuration for opening an [`crate::db::Engine`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory the engine's data files, hint file, and lock file live in.
    pub dir_path: PathBuf,

    /// Active-file rotation threshold, in bytes. Must be greater than zero.
    pub data_file_size: u64,

    /// If true, every appended record is fsynced before the call returns.
    pub sync_writes: bool,

    /// If greater than zero and `sync_writes` is false, sync once this many
    /// unsynced bytes have accumulated in the active file.
    pub bytes_per_sync: usize,

    /// Which keydir backend to use.
    pub index_type: IndexType,

    /// Use read-only memory-mapped I/O while scanning data files at startup,
    /// then swap back to standard I/O once the scan completes.
    pub mmap_at_startup: bool,

    /// Minimum ratio of reclaimable bytes to total on-disk bytes required
    /// before `Merge()` is allowed to run.
    pub data_file_merge_ratio: f32,

    /// Capacity of the LRU cache of open read handles for non-active data
    /// files.
    pub max_open_files: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("/tmp/bitcask"),
            data_file_size: 256 * 1024 * 1024,
            sync_writes: false,
            bytes_per_sync: 0,
            index_type: IndexType::BTree,
            mmap_at_startup: false,
            data_file_merge_ratio: 0.5,
            max_open_files: 64,
        }
    }
}

impl Options {
    /// Validates the options the way `Engine::open` requires before doing
    /// any I/O (spec.md §4.5 step 1).
    pub(crate) fn validate(&self) -> Result<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(Error::DirPathIsEmpty);
        }
        if self.data_file_size == 0 {
            return Err(Error::DataFileSizeTooSmall);
        }
        if !(0.0..=1.0).contains(&self.data_file_merge_ratio) {
            return Err(Error::InvalidMergeRatio);
        }
        Ok(())
    }
}

/// Options controlling a [`crate::iterator::Iterator`].
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Only keys starting with this prefix are visited. Empty means no filter.
    pub prefix: Vec<u8>,
    /// Iterate in descending key order instead of ascending.
    pub reverse: bool,
}

/// Options controlling a [`crate::batch::WriteBatch`].
#[derive(Debug, Clone)]
pub struct WriteBatchOptions {
    /// Maximum number of pending writes a single batch may accumulate.
    pub max_batch_num: usize,
    /// Whether to fsync the active file once the batch's terminator record
    /// has been appended.
    pub sync_writes: bool,
}

impl Default for WriteBatchOptions {
    fn default() -> Self {
        Self {
            max_batch_num: 10_000,
            sync_writes: true,
        }
    }
}
