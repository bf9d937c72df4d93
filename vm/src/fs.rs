//! File-like backing store used for swap.

use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;

/// A named-file store, as the kernel's file system exposes it.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str, create: bool) -> io::Result<Box<dyn OpenFile>>;

    /// Returns whether the file existed and was removed.
    fn remove(&self, name: &str) -> bool;
}

/// An open file addressed by byte offset.
///
/// `read` and `write` report how many bytes actually moved; a count below
/// `buf.len()` is not an error at this level.
pub trait OpenFile: Send {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Files under one directory of the host file system.
#[derive(Clone, Debug)]
pub struct HostFileSystem {
    root: PathBuf,
}

impl HostFileSystem {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        HostFileSystem {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl FileSystem for HostFileSystem {
    fn open(&self, name: &str, create: bool) -> io::Result<Box<dyn OpenFile>> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(self.path(name))?;

        debug!("fs: opened {:?}", self.path(name));

        Ok(Box::new(HostFile { file }))
    }

    fn remove(&self, name: &str) -> bool {
        fs::remove_file(self.path(name)).is_ok()
    }
}

struct HostFile {
    file: File,
}

impl OpenFile for HostFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        // Keep reading until the buffer is full or the file ends.
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match self.file.write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
