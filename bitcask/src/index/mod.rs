mod art;
mod bptree;
mod btree;

use std::path::Path;

use crate::data::log_record::LogRecordPos;
use crate::error::Result;
use crate::options::{IndexType, IteratorOptions};

/// The keydir: an in-memory (or, for [`bptree::BPlusTreeIndexer`], on-disk)
/// map from user key to the position of that key's most recent live record
/// (spec.md §4.4). All three backends are interchangeable behind this trait.
pub trait Indexer: Send + Sync {
    /// Inserts or overwrites `key`'s position, returning the position it
    /// previously held, if any — used by the engine to update the
    /// reclaimable-bytes statistic.
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>>;

    fn get(&self, key: &[u8]) -> Option<LogRecordPos>;

    /// Removes `key`, returning the position it held, if any.
    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>>;

    fn size(&self) -> usize;

    /// All keys currently in the index, in ascending order.
    fn list_keys(&self) -> Result<Vec<Vec<u8>>>;

    /// A snapshot iterator over `(key, pos)` pairs honoring `options`.
    fn iterator(&self, options: IteratorOptions) -> Box<dyn IndexIterator>;

    /// Whether the engine must replay the log on open to rebuild this index.
    /// `false` only for the persistent B+Tree backend, which keeps its own
    /// state on disk across restarts (SPEC_FULL.md §4.4 supplement).
    fn requires_log_replay(&self) -> bool;

    fn close(&self) -> Result<()>;
}

/// A forward-or-reverse cursor over an index. For the B-tree/ART backends
/// this walks a pre-taken in-memory snapshot; for the B+Tree backend it is a
/// live cursor inside a read transaction against the on-disk tree (spec.md
/// §4.4, §9).
pub trait IndexIterator: Send {
    fn rewind(&mut self);

    /// Positions the cursor at the first key >= `key` (descending order if
    /// the iterator was built in reverse).
    fn seek(&mut self, key: &[u8]);

    fn next(&mut self) -> Option<(Vec<u8>, LogRecordPos)>;

    /// Releases whatever read transaction or cursor state backs this
    /// iterator. A no-op for the snapshot-based backends, which hold no
    /// live transaction; the B+Tree backend overrides this to roll its read
    /// transaction back (spec.md §9, "Iterator.close").
    fn close(&mut self) {}
}

/// Builds the [`Indexer`] named by `index_type`. `dir_path` is only used by
/// the B+Tree backend, which persists its state under it.
pub fn new_indexer(index_type: IndexType, dir_path: &Path) -> Result<Box<dyn Indexer>> {
    match index_type {
        IndexType::BTree => Ok(Box::new(btree::BTreeIndexer::new())),
        IndexType::Art => Ok(Box::new(art::ArtIndexer::new())),
        IndexType::BPlusTree => Ok(Box::new(bptree::BPlusTreeIndexer::new(dir_path)?)),
    }
}

/// A plain in-memory cursor over a pre-sorted, pre-filtered snapshot of
/// `(key, pos)` pairs. Both the B-tree and ART backends take a full ordered
/// snapshot of their contents at iterator-creation time (spec.md §4.4,
/// "Iterator"); only the on-disk B+Tree backend walks a live cursor instead.
pub(crate) struct SnapshotIterator {
    items: Vec<(Vec<u8>, LogRecordPos)>,
    cursor: usize,
    reverse: bool,
}

impl SnapshotIterator {
    /// `items` must already be sorted ascending by key.
    pub(crate) fn new(items: Vec<(Vec<u8>, LogRecordPos)>, options: IteratorOptions) -> Self {
        let mut items = items;
        if !options.prefix.is_empty() {
            items.retain(|(k, _)| k.starts_with(options.prefix.as_slice()));
        }
        if options.reverse {
            items.reverse();
        }
        Self {
            items,
            cursor: 0,
            reverse: options.reverse,
        }
    }
}

impl IndexIterator for SnapshotIterator {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn seek(&mut self, key: &[u8]) {
        self.cursor = if self.reverse {
            self.items.partition_point(|(k, _)| k.as_slice() > key)
        } else {
            self.items.partition_point(|(k, _)| k.as_slice() < key)
        };
    }

    fn next(&mut self) -> Option<(Vec<u8>, LogRecordPos)> {
        let item = self.items.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }
}
