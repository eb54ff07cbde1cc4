use std::sync::Mutex;

use crate::db::Engine;
use crate::error::Error;
use crate::index::IndexIterator;
use crate::options::IteratorOptions;

/// A forward-or-reverse, optionally prefix-filtered cursor over a snapshot
/// of the keys that were live when the iterator was created (spec.md §6,
/// "Iterator"). Writes made after creation are not visible to it.
pub struct Iterator<'a> {
    engine: &'a Engine,
    index_iter: Mutex<Box<dyn IndexIterator>>,
}

impl Engine {
    pub fn iter(&self, options: IteratorOptions) -> Iterator<'_> {
        Iterator {
            engine: self,
            index_iter: Mutex::new(self.index.iterator(options)),
        }
    }
}

impl<'a> Iterator<'a> {
    pub fn rewind(&self) {
        self.index_iter.lock().unwrap().rewind();
    }

    pub fn seek(&self, key: &[u8]) {
        self.index_iter.lock().unwrap().seek(key);
    }

    /// Returns the next live `(key, value)` pair, or `None` once the
    /// snapshot is exhausted.
    pub fn next(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let (key, pos) = self.index_iter.lock().unwrap().next()?;
            match self.engine.get_value_by_position(&pos) {
                Ok(value) => return Some((key, value)),
                Err(Error::KeyNotFound) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Releases the underlying cursor (for the B+Tree backend, rolls back
    /// its read transaction). Calling `next`/`seek`/`rewind` afterwards is
    /// safe but yields nothing further (spec.md §9, "Iterator.close").
    pub fn close(&self) {
        self.index_iter.lock().unwrap().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use tempfile::tempdir;

    #[test]
    fn iterates_prefix_in_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        })
        .unwrap();

        for key in ["apple", "apricot", "banana", "berry"] {
            engine.put(key.as_bytes().to_vec(), b"v".to_vec()).unwrap();
        }

        let it = engine.iter(IteratorOptions {
            prefix: b"ap".to_vec(),
            reverse: false,
        });
        let mut seen = Vec::new();
        while let Some((k, _)) = it.next() {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }

    #[test]
    fn reverse_iteration() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        })
        .unwrap();
        for key in ["a", "b", "c"] {
            engine.put(key.as_bytes().to_vec(), b"v".to_vec()).unwrap();
        }

        let it = engine.iter(IteratorOptions {
            prefix: Vec::new(),
            reverse: true,
        });
        let mut seen = Vec::new();
        while let Some((k, _)) = it.next() {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }
}
