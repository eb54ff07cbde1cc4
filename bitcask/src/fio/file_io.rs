use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::fio::IOManager;

/// Standard, file-system-backed I/O manager. Reads are positional and do not
/// disturb the file's append cursor; writes always append, matching the
/// active data file's single-writer, sequential-append usage.
pub struct FileIO {
    file: Mutex<File>,
}

impl FileIO {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl IOManager for FileIO {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.lock().unwrap();
        Ok(file.read_at(buf, offset)?)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let file = self.file.lock().unwrap();
        Ok(file.write_at_end(buf)?)
    }

    fn sync(&self) -> Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }
}

/// `File::write` through a `&File` handle opened in append mode always
/// writes at the current end of file, ignoring any prior `read_at` offset.
trait AppendWrite {
    fn write_at_end(&self, buf: &[u8]) -> std::io::Result<usize>;
}

impl AppendWrite for File {
    fn write_at_end(&self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        (&mut &*self).write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000001.data");
        let io = FileIO::new(&path).unwrap();

        let n = io.write(b"hello").unwrap();
        assert_eq!(n, 5);
        let n = io.write(b"world").unwrap();
        assert_eq!(n, 5);
        assert_eq!(io.size().unwrap(), 10);

        let mut buf = [0u8; 5];
        io.read(&mut buf, 5).unwrap();
        assert_eq!(&buf, b"world");
    }
}
