use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::fio::IOManager;

/// Read-only memory-mapped I/O manager, used exclusively to accelerate the
/// startup scan over a data file (spec.md §4.2). The engine swaps each data
/// file back to [`super::FileIO`] once the scan finishes; `write`/`sync` are
/// never expected to be called and return [`Error::MmapWriteUnsupported`].
pub struct MmapIO {
    mmap: Mutex<Mmap>,
}

impl MmapIO {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Mutex::new(mmap),
        })
    }
}

impl IOManager for MmapIO {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mmap = self.mmap.lock().unwrap();
        let offset = offset as usize;
        if offset >= mmap.len() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(mmap.len());
        let n = end - offset;
        buf[..n].copy_from_slice(&mmap[offset..end]);
        Ok(n)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::MmapWriteUnsupported)
    }

    fn sync(&self) -> Result<()> {
        Err(Error::MmapWriteUnsupported)
    }

    fn size(&self) -> Result<u64> {
        let mmap = self.mmap.lock().unwrap();
        Ok(mmap.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::FileIO;
    use tempfile::tempdir;

    #[test]
    fn reads_bytes_written_before_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000001.data");
        {
            let io = FileIO::new(&path).unwrap();
            io.write(b"hello world").unwrap();
        }

        let mmap_io = MmapIO::new(&path).unwrap();
        assert_eq!(mmap_io.size().unwrap(), 11);
        let mut buf = [0u8; 5];
        mmap_io.read(&mut buf, 6).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn write_is_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000001.data");
        let mmap_io = MmapIO::new(&path).unwrap();
        assert!(matches!(mmap_io.write(b"x"), Err(Error::MmapWriteUnsupported)));
    }
}
