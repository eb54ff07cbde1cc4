use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::data::log_record::LogRecordPos;
use crate::error::Result;
use crate::index::{IndexIterator, Indexer, SnapshotIterator};
use crate::options::IteratorOptions;

/// In-memory keydir backed by a `BTreeMap`, naturally ordered by key bytes.
pub struct BTreeIndexer {
    tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTreeIndexer {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Indexer for BTreeIndexer {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().unwrap().insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.read().unwrap().get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().unwrap().remove(key))
    }

    fn size(&self) -> usize {
        self.tree.read().unwrap().len()
    }

    fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.tree.read().unwrap().keys().cloned().collect())
    }

    fn iterator(&self, options: IteratorOptions) -> Box<dyn IndexIterator> {
        let items: Vec<_> = self
            .tree
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Box::new(SnapshotIterator::new(items, options))
    }

    fn requires_log_replay(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
