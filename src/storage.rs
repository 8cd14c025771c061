use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

/// A file opened by a [`Storage`]. Segment files are written sequentially,
/// then read and patched in place when the segment is finalized.
pub trait StorageFile: Read + Write + Seek + Send {
    /// Flush everything to the underlying medium and release the handle.
    fn close(&mut self) -> io::Result<()>;
}

/// Creates the files a recording writes to.
pub trait Storage: Send + Sync {
    fn create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>>;
}

/// Local file system storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStorage;

impl Storage for DiskStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskFile { file: Some(file) }))
    }
}

struct DiskFile {
    file: Option<File>,
}

impl DiskFile {
    fn handle(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file already closed"))
    }
}

impl Read for DiskFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for DiskFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl Seek for DiskFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.handle()?.seek(pos)
    }
}

impl StorageFile for DiskFile {
    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::tempdir;

    #[test]
    fn create_makes_parent_dirs_and_supports_patching() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("seg.mp4");

        let mut f = DiskStorage.create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut head = [0u8; 5];
        f.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hello");
        f.seek(SeekFrom::Start(6)).unwrap();
        f.write_all(b"there").unwrap();
        f.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello there");
    }

    #[test]
    fn io_after_close_fails() {
        let dir = tempdir().unwrap();
        let mut f = DiskStorage.create(&dir.path().join("x")).unwrap();
        f.close().unwrap();
        assert!(f.write_all(b"x").is_err());
        assert!(f.close().is_ok());
    }
}
