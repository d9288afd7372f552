// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Directory, RandomAccessFile, SequenceFileReader, SequenceFileWriter};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// A [`Directory`] backed by a file system folder
pub struct FsDirectory {
    base: PathBuf,
}

impl FsDirectory {
    /// Opens a directory, creating the folder if it does not exist yet.
    pub fn open<P: AsRef<Path>>(base: P) -> crate::Result<Self> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

impl Directory for FsDirectory {
    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).exists()
    }

    fn file_length(&self, name: &str) -> u64 {
        std::fs::metadata(self.resolve(name)).map_or(0, |m| m.len())
    }

    fn delete_file(&self, name: &str) -> crate::Result<()> {
        std::fs::remove_file(self.resolve(name))?;
        Ok(())
    }

    fn get_files(&self) -> crate::Result<Vec<String>> {
        let mut names = vec![];

        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(names)
    }

    fn open_random_access_file(&self, name: &str) -> crate::Result<Arc<dyn RandomAccessFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.resolve(name))?;

        Ok(Arc::new(FsFile { file }))
    }

    fn open_sequence_file_reader(&self, name: &str) -> crate::Result<Box<dyn SequenceFileReader>> {
        let file = File::open(self.resolve(name))?;
        Ok(Box::new(FsSequenceReader { file }))
    }

    fn open_sequence_file_writer(&self, name: &str) -> crate::Result<Box<dyn SequenceFileWriter>> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.resolve(name))?;

        Ok(Box::new(FsSequenceWriter { file }))
    }
}

struct FsFile {
    file: File,
}

impl RandomAccessFile for FsFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        use std::os::windows::fs::FileExt;

        let mut pos = offset;
        let mut rest = buf;

        while !rest.is_empty() {
            let n = self.file.seek_read(rest, pos)?;
            if n == 0 {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "partial positional read",
                )));
            }
            pos += n as u64;
            rest = &mut rest[n..];
        }

        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, data: &[u8]) -> crate::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, data: &[u8]) -> crate::Result<()> {
        use std::os::windows::fs::FileExt;

        let mut pos = offset;
        let mut rest = data;

        while !rest.is_empty() {
            let n = self.file.seek_write(rest, pos)?;
            pos += n as u64;
            rest = &rest[n..];
        }

        Ok(())
    }

    fn sync(&self) -> crate::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> crate::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

struct FsSequenceReader {
    file: File,
}

impl SequenceFileReader for FsSequenceReader {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> crate::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

struct FsSequenceWriter {
    file: File,
}

impl SequenceFileWriter for FsSequenceWriter {
    fn append(&mut self, data: &[u8]) -> crate::Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fs_directory_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsDirectory::open(dir.path())?;

        assert!(!store.file_exists("a"));

        {
            let mut writer = store.open_sequence_file_writer("a")?;
            writer.append(b"hello")?;
            writer.flush()?;
        }

        assert!(store.file_exists("a"));
        assert_eq!(5, store.file_length("a"));
        assert_eq!(vec!["a".to_string()], store.get_files()?);

        let mut buf = [0u8; 5];
        let mut reader = store.open_sequence_file_reader("a")?;
        reader.read(&mut buf)?;
        assert_eq!(b"hello", &buf);

        store.delete_file("a")?;
        assert!(!store.file_exists("a"));

        Ok(())
    }

    #[test]
    fn fs_random_access_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsDirectory::open(dir.path())?;

        let file = store.open_random_access_file("blocks")?;
        file.write_at(4_096, b"page")?;
        file.sync()?;

        let mut buf = [0u8; 4];
        file.read_at(4_096, &mut buf)?;
        assert_eq!(b"page", &buf);
        assert_eq!(4_100, file.len()?);

        Ok(())
    }
}
