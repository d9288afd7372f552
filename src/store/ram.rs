// Copyright (c) 2024-present, cascadb-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Directory, RandomAccessFile, SequenceFileReader, SequenceFileWriter};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

type FileData = Arc<RwLock<Vec<u8>>>;

/// An in-memory [`Directory`]
///
/// Contents vanish when the directory is dropped; handy for tests and
/// throwaway databases.
#[derive(Default)]
pub struct RamDirectory {
    files: RwLock<BTreeMap<String, FileData>>,
}

impl RamDirectory {
    /// Creates an empty in-memory directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, name: &str) -> FileData {
        let mut files = self.files.write().expect("lock is poisoned");
        files.entry(name.to_string()).or_default().clone()
    }

    fn get(&self, name: &str) -> Option<FileData> {
        let files = self.files.read().expect("lock is poisoned");
        files.get(name).cloned()
    }
}

impl Directory for RamDirectory {
    fn file_exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn file_length(&self, name: &str) -> u64 {
        self.get(name)
            .map_or(0, |data| data.read().expect("lock is poisoned").len() as u64)
    }

    fn delete_file(&self, name: &str) -> crate::Result<()> {
        let mut files = self.files.write().expect("lock is poisoned");
        files.remove(name);
        Ok(())
    }

    fn get_files(&self) -> crate::Result<Vec<String>> {
        let files = self.files.read().expect("lock is poisoned");
        Ok(files.keys().cloned().collect())
    }

    fn open_random_access_file(&self, name: &str) -> crate::Result<Arc<dyn RandomAccessFile>> {
        Ok(Arc::new(RamFile {
            data: self.get_or_create(name),
        }))
    }

    fn open_sequence_file_reader(&self, name: &str) -> crate::Result<Box<dyn SequenceFileReader>> {
        let data = self.get(name).ok_or_else(|| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {name}"),
            ))
        })?;

        Ok(Box::new(RamSequenceReader { data, pos: 0 }))
    }

    fn open_sequence_file_writer(&self, name: &str) -> crate::Result<Box<dyn SequenceFileWriter>> {
        Ok(Box::new(RamSequenceWriter {
            data: self.get_or_create(name),
        }))
    }
}

struct RamFile {
    data: FileData,
}

impl RandomAccessFile for RamFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        let data = self.data.read().expect("lock is poisoned");
        let offset = offset as usize;
        let end = offset + buf.len();

        if end > data.len() {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "positional read past end of file",
            )));
        }

        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
        let mut data = self.data.write().expect("lock is poisoned");
        let offset = offset as usize;
        let end = offset + bytes.len();

        if end > data.len() {
            data.resize(end, 0);
        }

        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&self) -> crate::Result<()> {
        Ok(())
    }

    fn len(&self) -> crate::Result<u64> {
        Ok(self.data.read().expect("lock is poisoned").len() as u64)
    }
}

struct RamSequenceReader {
    data: FileData,
    pos: usize,
}

impl SequenceFileReader for RamSequenceReader {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        let data = self.data.read().expect("lock is poisoned");
        let end = self.pos + buf.len();

        if end > data.len() {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "sequential read past end of file",
            )));
        }

        buf.copy_from_slice(&data[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> crate::Result<()> {
        self.pos = pos as usize;
        Ok(())
    }
}

struct RamSequenceWriter {
    data: FileData,
}

impl SequenceFileWriter for RamSequenceWriter {
    fn append(&mut self, bytes: &[u8]) -> crate::Result<()> {
        let mut data = self.data.write().expect("lock is poisoned");
        data.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn ram_directory_files() -> crate::Result<()> {
        let store = RamDirectory::new();

        {
            let mut writer = store.open_sequence_file_writer("log")?;
            writer.append(b"0123456789")?;
            writer.flush()?;
        }

        assert_eq!(10, store.file_length("log"));

        let mut reader = store.open_sequence_file_reader("log")?;
        reader.seek(5)?;

        let mut buf = [0u8; 5];
        reader.read(&mut buf)?;
        assert_eq!(b"56789", &buf);

        store.delete_file("log")?;
        assert!(!store.file_exists("log"));

        Ok(())
    }

    #[test]
    fn ram_file_extends_on_write() -> crate::Result<()> {
        let store = RamDirectory::new();
        let file = store.open_random_access_file("data")?;

        file.write_at(100, b"tail")?;
        assert_eq!(104, file.len()?);

        let mut buf = [0u8; 4];
        file.read_at(100, &mut buf)?;
        assert_eq!(b"tail", &buf);

        Ok(())
    }
}
