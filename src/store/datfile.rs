//! The row data file: a plain concatenation of packed row records.
//! Offsets into it live in the row directory (`table.db`).

use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

pub struct DatWriter {
    file: BufWriter<File>,
    path: PathBuf,
    pos: u64,
}

impl DatWriter {
    pub fn create(path: &Path) -> Result<DatWriter> {
        let file = File::create(path)?;
        Ok(DatWriter {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and returns its file offset.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        let offset = self.pos;
        self.file.write_all(record)?;
        self.pos += record.len() as u64;
        Ok(offset)
    }

    pub fn size(&self) -> u64 {
        self.pos
    }

    pub fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

pub struct DatReader {
    file: File,
}

impl DatReader {
    pub fn open(path: &Path) -> Result<DatReader> {
        Ok(DatReader {
            file: File::open(path)?,
        })
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for DatReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatReader").finish()
    }
}
