//! The ordered key-value file backing the row directory and the
//! indexes. Entries are bulk-loaded in (key, value) order and never
//! mutated afterwards.
//!
//! ```text
//! header : magic "RVKV" | format version u16 | reserved u16
//! entries: { key_len u16 | val_len u16 | key | val } ...
//! offsets: u64 per entry
//! footer : offsets_pos u64 | entry count u64 | magic "RVKV"
//! ```
//!
//! All integers are big-endian.

use bytes::Bytes;
use log::debug;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::util;

const KV_MAGIC: &[u8; 4] = b"RVKV";
const KV_FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 8;
const FOOTER_SIZE: u64 = 20;
const ENTRY_HEADER_SIZE: usize = 4;

fn corrupt(path: &Path, what: &str) -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::InvalidData,
        format!("{}: {}", path.display(), what),
    ))
}

/// Sequential bulk writer. Keys must arrive in non-decreasing
/// (key, value) order; `finish` seals the file with the offset section
/// and footer. Publication under the permanent name is the caller's
/// rename.
pub struct KvWriter {
    file: BufWriter<File>,
    path: PathBuf,
    offsets: Vec<u64>,
    pos: u64,
    last: Option<(Vec<u8>, Vec<u8>)>,
}

impl KvWriter {
    pub fn create(path: &Path) -> Result<KvWriter> {
        let file = File::create(path)?;
        let mut file = BufWriter::new(file);
        file.write_all(KV_MAGIC)?;
        file.write_all(&KV_FORMAT_VERSION.to_be_bytes())?;
        file.write_all(&[0u8; 2])?;
        Ok(KvWriter {
            file,
            path: path.to_path_buf(),
            offsets: Vec::new(),
            pos: HEADER_SIZE,
            last: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        assert!(key.len() <= u16::MAX as usize, "ERR_KV_KEY_LEN");
        assert!(val.len() <= u16::MAX as usize, "ERR_KV_VAL_LEN");
        if let Some((lk, lv)) = &self.last {
            assert!(
                (lk.as_slice(), lv.as_slice()) <= (key, val),
                "ERR_KV_KEY_ORDER"
            );
        }
        self.file.write_all(&(key.len() as u16).to_be_bytes())?;
        self.file.write_all(&(val.len() as u16).to_be_bytes())?;
        self.file.write_all(key)?;
        self.file.write_all(val)?;
        self.offsets.push(self.pos);
        self.pos += (ENTRY_HEADER_SIZE + key.len() + val.len()) as u64;
        self.last = Some((key.to_vec(), val.to_vec()));
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn finish(mut self) -> Result<()> {
        let offsets_pos = self.pos;
        for off in &self.offsets {
            self.file.write_all(&off.to_be_bytes())?;
        }
        self.file.write_all(&offsets_pos.to_be_bytes())?;
        self.file.write_all(&(self.offsets.len() as u64).to_be_bytes())?;
        self.file.write_all(KV_MAGIC)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        debug!(
            "sealed {:?}, {} entries, {} bytes",
            self.path,
            self.offsets.len(),
            offsets_pos + self.offsets.len() as u64 * 8 + FOOTER_SIZE
        );
        Ok(())
    }
}

/// Read-only view of a sealed file. Lookups binary search the offset
/// section; when that section fits the configured cache budget it is
/// held in memory, otherwise each probe seeks into the file.
pub struct KvReader {
    file: File,
    path: PathBuf,
    count: u64,
    offsets_pos: u64,
    resident_offsets: Option<Vec<u64>>,
}

impl KvReader {
    pub fn open(path: &Path, cache_size: u64) -> Result<KvReader> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(path, "file too short"));
        }
        let mut f = &file;
        let mut header = [0u8; HEADER_SIZE as usize];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut header)?;
        if &header[0..4] != KV_MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let version = util::u16_val(&header, 4);
        if version != KV_FORMAT_VERSION {
            return Err(corrupt(path, &format!("unsupported format version {}", version)));
        }
        let mut footer = [0u8; FOOTER_SIZE as usize];
        f.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        f.read_exact(&mut footer)?;
        if &footer[16..20] != KV_MAGIC {
            return Err(corrupt(path, "bad footer magic"));
        }
        let offsets_pos = util::u64_val(&footer, 0);
        let count = util::u64_val(&footer, 8);
        if offsets_pos + count * 8 + FOOTER_SIZE != size {
            return Err(corrupt(path, "footer does not match file size"));
        }
        let mut reader = KvReader {
            file,
            path: path.to_path_buf(),
            count,
            offsets_pos,
            resident_offsets: None,
        };
        if count * 8 <= cache_size {
            let mut buf = vec![0u8; (count * 8) as usize];
            let mut f = &reader.file;
            f.seek(SeekFrom::Start(offsets_pos))?;
            f.read_exact(&mut buf)?;
            let offsets = (0..count as usize).map(|i| util::u64_val(&buf, i * 8)).collect();
            reader.resident_offsets = Some(offsets);
        }
        debug!("opened {:?}, {} entries", reader.path, count);
        Ok(reader)
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entry_offset(&self, i: u64) -> Result<u64> {
        if let Some(offsets) = &self.resident_offsets {
            return Ok(offsets[i as usize]);
        }
        let mut f = &self.file;
        let mut buf = [0u8; 8];
        f.seek(SeekFrom::Start(self.offsets_pos + i * 8))?;
        f.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads entry `i`; out of range is the caller's bug.
    pub fn entry(&self, i: u64) -> Result<(Bytes, Bytes)> {
        assert!(i < self.count, "ERR_KV_ENTRY_RANGE");
        let off = self.entry_offset(i)?;
        let mut f = &self.file;
        let mut hdr = [0u8; ENTRY_HEADER_SIZE];
        f.seek(SeekFrom::Start(off))?;
        f.read_exact(&mut hdr)?;
        let key_len = util::u16_val(&hdr, 0) as usize;
        let val_len = util::u16_val(&hdr, 2) as usize;
        let mut buf = vec![0u8; key_len + val_len];
        f.read_exact(&mut buf)?;
        let mut payload = Bytes::from(buf);
        let val = payload.split_off(key_len);
        Ok((payload, val))
    }

    pub fn key(&self, i: u64) -> Result<Bytes> {
        Ok(self.entry(i)?.0)
    }

    /// First position whose key is >= `key` (count when none is).
    pub fn lower_bound(&self, key: &[u8]) -> Result<u64> {
        let (mut lo, mut hi) = (0u64, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid)?.as_ref() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First position whose key is > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<u64> {
        let (mut lo, mut hi) = (0u64, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid)?.as_ref() <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

impl std::fmt::Debug for KvReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvReader")
            .field("path", &self.path)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod kvfile_tests {
    use super::*;
    use crate::util;
    use tempfile::TempDir;

    fn setup() {
        util::init_unit_test();
    }

    fn build(dir: &TempDir, entries: &[(&[u8], &[u8])]) -> PathBuf {
        let path = dir.path().join("t.db");
        let mut w = KvWriter::create(&path).unwrap();
        for (k, v) in entries {
            w.append(k, v).unwrap();
        }
        w.finish().unwrap();
        path
    }

    #[test]
    fn test_write_and_read_back() {
        setup();
        let dir = TempDir::new().unwrap();
        let path = build(
            &dir,
            &[(b"alpha", b"1"), (b"beta", b"2"), (b"gamma", b"3")],
        );
        let r = KvReader::open(&path, 1 << 20).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r.entry(0).unwrap(), (Bytes::from_static(b"alpha"), Bytes::from_static(b"1")));
        assert_eq!(r.entry(2).unwrap(), (Bytes::from_static(b"gamma"), Bytes::from_static(b"3")));
    }

    #[test]
    fn test_bounds_with_duplicates() {
        setup();
        let dir = TempDir::new().unwrap();
        let path = build(
            &dir,
            &[
                (b"a", b"0"),
                (b"b", b"1"),
                (b"b", b"2"),
                (b"b", b"3"),
                (b"d", b"4"),
            ],
        );
        let r = KvReader::open(&path, 1 << 20).unwrap();
        assert_eq!(r.lower_bound(b"b").unwrap(), 1);
        assert_eq!(r.upper_bound(b"b").unwrap(), 4);
        assert_eq!(r.lower_bound(b"c").unwrap(), 4);
        assert_eq!(r.upper_bound(b"z").unwrap(), 5);
        assert_eq!(r.lower_bound(b"").unwrap(), 0);
    }

    #[test]
    fn test_empty_store() {
        setup();
        let dir = TempDir::new().unwrap();
        let path = build(&dir, &[]);
        let r = KvReader::open(&path, 1 << 20).unwrap();
        assert!(r.is_empty());
        assert_eq!(r.lower_bound(b"x").unwrap(), 0);
    }

    #[test]
    fn test_offsets_on_disk_when_cache_small() {
        setup();
        let dir = TempDir::new().unwrap();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0u32..100)
            .map(|i| (i.to_be_bytes().to_vec(), vec![i as u8]))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let path = build(&dir, &borrowed);
        // cache too small for 100 offsets, probes go to disk
        let r = KvReader::open(&path, 64).unwrap();
        assert_eq!(r.len(), 100);
        assert_eq!(r.lower_bound(&42u32.to_be_bytes()).unwrap(), 42);
        assert_eq!(r.entry(99).unwrap().1, Bytes::from_static(&[99]));
    }

    #[test]
    fn test_bad_magic_rejected() {
        setup();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, b"this is not a store file at all").unwrap();
        assert!(KvReader::open(&path, 1 << 20).is_err());
    }

    #[test]
    #[should_panic(expected = "ERR_KV_KEY_ORDER")]
    fn test_out_of_order_append_panics() {
        setup();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let mut w = KvWriter::create(&path).unwrap();
        w.append(b"b", b"").unwrap();
        w.append(b"a", b"").unwrap();
    }
}
