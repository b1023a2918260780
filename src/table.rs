//! The main storage table: a schema, a row data file and a row
//! directory, opened either for appending (write mode) or for random
//! and sequential reads (read mode).

use bytes::Bytes;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cursor::TableCursor;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::meta::def::Schema;
use crate::meta::doc::{self, TableStats};
use crate::store::codec;
use crate::store::datfile::{DatReader, DatWriter};
use crate::store::kvfile::{KvReader, KvWriter};
use crate::store::build_path;
use crate::value::Value;

pub const TABLE_DB_NAME: &str = "table.db";
pub const TABLE_DAT_NAME: &str = "table.dat";
pub const TABLE_XML_NAME: &str = "table.xml";
pub const INDEX_DB_PREFIX: &str = "index_";
pub const INDEX_DB_SUFFIX: &str = ".db";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
}

#[derive(Debug)]
struct TableReader {
    dat: DatReader,
    directory: KvReader,
}

struct TableWriter {
    dat: DatWriter,
    directory: KvWriter,
}

pub struct Table {
    homedir: PathBuf,
    mode: Mode,
    schema: Schema,
    cache_size: u64,
    stats: TableStats,
    reader: Option<TableReader>,
    writer: Option<TableWriter>,
    finalized: bool,
}

impl Table {
    pub fn xml_path(homedir: &Path) -> PathBuf {
        homedir.join(TABLE_XML_NAME)
    }

    pub fn db_path(homedir: &Path) -> PathBuf {
        homedir.join(TABLE_DB_NAME)
    }

    pub fn dat_path(homedir: &Path) -> PathBuf {
        homedir.join(TABLE_DAT_NAME)
    }

    /// True when the home directory holds a complete table.
    pub fn exists(homedir: &Path) -> bool {
        Self::xml_path(homedir).exists()
            && Self::db_path(homedir).exists()
            && Self::dat_path(homedir).exists()
    }

    /// Opens a fresh table in write mode. The home directory is created
    /// if needed; a populated destination is refused unless `force`.
    pub fn create(homedir: impl AsRef<Path>, schema: Schema, force: bool) -> Result<Table> {
        let homedir = homedir.as_ref().to_path_buf();
        if Self::exists(&homedir) && !force {
            return Err(Error::State(format!(
                "table '{}' exists; use force to overwrite",
                homedir.display()
            )));
        }
        fs::create_dir_all(&homedir)?;
        let dat = DatWriter::create(&build_path(&homedir, TABLE_DAT_NAME))?;
        let directory = KvWriter::create(&build_path(&homedir, TABLE_DB_NAME))?;
        debug!("created table build files under {:?}", homedir);
        Ok(Table {
            homedir,
            mode: Mode::Write,
            schema,
            cache_size: crate::DEFAULT_CACHE_SIZE,
            stats: TableStats::default(),
            reader: None,
            writer: Some(TableWriter { dat, directory }),
            finalized: false,
        })
    }

    /// Opens an existing table in read mode. Refuses a home directory
    /// without a permanent metadata file (a build in progress is
    /// invisible to readers).
    pub fn open(homedir: impl AsRef<Path>, cache_size: u64) -> Result<Table> {
        let homedir = homedir.as_ref().to_path_buf();
        let xml_path = Self::xml_path(&homedir);
        let text = fs::read_to_string(&xml_path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", xml_path.display(), e),
            ))
        })?;
        let (schema, stats) = doc::parse_table_doc(&text)?;
        let dat = DatReader::open(&Self::dat_path(&homedir))?;
        let directory = KvReader::open(&Self::db_path(&homedir), cache_size)?;
        if directory.len() != stats.num_rows {
            return Err(Error::Schema(format!(
                "row directory holds {} rows but the metadata says {}",
                directory.len(),
                stats.num_rows
            )));
        }
        debug!("opened table {:?}, {} rows", homedir, stats.num_rows);
        Ok(Table {
            homedir,
            mode: Mode::Read,
            schema,
            cache_size,
            stats,
            reader: Some(TableReader { dat, directory }),
            writer: None,
            finalized: true,
        })
    }

    pub fn homedir(&self) -> &Path {
        &self.homedir
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn len(&self) -> u64 {
        self.stats.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.stats.num_rows == 0
    }

    pub fn fixed_region_size(&self) -> usize {
        self.schema.fixed_region_size()
    }

    pub fn data_file_size(&self) -> Result<u64> {
        Ok(fs::metadata(Self::dat_path(&self.homedir))?.len())
    }

    pub fn db_file_size(&self) -> Result<u64> {
        Ok(fs::metadata(Self::db_path(&self.homedir))?.len())
    }

    fn verify_mode(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            let wanted = match mode {
                Mode::Read => "read",
                Mode::Write => "write",
            };
            return Err(Error::State(format!(
                "table must be open in {} mode",
                wanted
            )));
        }
        Ok(())
    }

    fn record_row(&mut self, record: &Bytes) -> Result<()> {
        let row_id = self.stats.num_rows;
        let writer = self.writer.as_mut().expect("ERR_TABLE_WRITER");
        let offset = writer.dat.append(record)?;
        let id_size = self.schema.id_size();
        let id_key = &row_id.to_be_bytes()[8 - id_size..];
        writer.directory.append(id_key, &offset.to_be_bytes())?;
        let size = record.len() as u64;
        if self.stats.num_rows == 0 {
            self.stats.min_row_size = size;
            self.stats.max_row_size = size;
        } else {
            self.stats.min_row_size = self.stats.min_row_size.min(size);
            self.stats.max_row_size = self.stats.max_row_size.max(size);
        }
        self.stats.total_row_size += size;
        self.stats.num_rows += 1;
        Ok(())
    }

    /// Appends one row. Trailing columns may be omitted; omitted and
    /// explicit missing values encode identically. The value at
    /// position 0 is assigned by the engine.
    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        self.verify_mode(Mode::Write)?;
        let record = codec::encode_row(&self.schema, values, self.stats.num_rows)?;
        self.record_row(&record)
    }

    /// Appends one row whose present values are already serialized
    /// element bytes. A malformed value fails before anything is
    /// written, leaving the table usable.
    pub fn append_encoded(&mut self, values: &[Option<Bytes>]) -> Result<()> {
        self.verify_mode(Mode::Write)?;
        let record = codec::encode_row_raw(&self.schema, values, self.stats.num_rows)?;
        self.record_row(&record)
    }

    /// Random access by row id; negative positions wrap from the end.
    pub fn get(&self, position: i64) -> Result<Vec<Value>> {
        self.verify_mode(Mode::Read)?;
        let n = self.stats.num_rows as i64;
        let k = if position < 0 { n + position } else { position };
        if k < 0 || k >= n {
            return Err(Error::NotFound(format!(
                "table position {} out of range",
                position
            )));
        }
        self.read_row(k as u64)
    }

    /// Reads and decodes the row with the given id.
    pub(crate) fn read_row(&self, row_id: u64) -> Result<Vec<Value>> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| Error::State("table must be open in read mode".to_string()))?;
        if row_id >= self.stats.num_rows {
            return Err(Error::NotFound(format!("row {} out of range", row_id)));
        }
        // dense monotone row ids make the directory entry ordinal the
        // row id itself
        let (_, offset_bytes) = reader.directory.entry(row_id)?;
        let offset = u64::from_be_bytes(offset_bytes.as_ref().try_into().expect("ERR_DIR_OFFSET"));
        let frs = self.schema.fixed_region_size();
        let fixed = reader.dat.read_at(offset, frs)?;
        let var_size = codec::var_region_size(&self.schema, &fixed);
        if var_size == 0 {
            return codec::decode_row(&self.schema, &fixed);
        }
        let var = reader.dat.read_at(offset + frs as u64, var_size)?;
        let mut record = Vec::with_capacity(frs + var_size);
        record.extend_from_slice(&fixed);
        record.extend_from_slice(&var);
        codec::decode_row(&self.schema, &record)
    }

    /// Resolves a column given by name or decimal position.
    pub fn column_position(&self, id: &str) -> Result<usize> {
        if let Ok(pos) = id.parse::<usize>() {
            self.schema.column(pos)?;
            return Ok(pos);
        }
        self.schema.position(id)
    }

    /// Sequential cursor over `start <= row_id < stop`, projecting the
    /// given column positions in the given order.
    pub fn cursor(&self, columns: &[usize], start: u64, stop: Option<u64>) -> Result<TableCursor<'_>> {
        self.verify_mode(Mode::Read)?;
        for &pos in columns {
            self.schema.column(pos)?;
        }
        let stop = stop.unwrap_or(self.stats.num_rows).min(self.stats.num_rows);
        Ok(TableCursor::new(self, columns.to_vec(), start.min(stop), stop))
    }

    /// Names of the indexes present in the home directory.
    pub fn indexes(&self) -> Result<Vec<String>> {
        self.verify_mode(Mode::Read)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.homedir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name
                .strip_prefix(INDEX_DB_PREFIX)
                .and_then(|s| s.strip_suffix(INDEX_DB_SUFFIX))
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn open_index(&self, name: &str, cache_size: u64) -> Result<Index<'_>> {
        self.verify_mode(Mode::Read)?;
        Index::open(self, name, cache_size)
    }

    /// Finalizes a write-mode table: seals the build files, writes the
    /// metadata and renames everything over the permanent names, the
    /// metadata document last. Read-mode close just releases handles.
    pub fn close(mut self) -> Result<()> {
        if self.mode == Mode::Read {
            self.reader = None;
            return Ok(());
        }
        // a failed close leaves the build files in place for diagnosis;
        // only dropping an unclosed table discards them
        self.finalized = true;
        let writer = self.writer.take().expect("ERR_TABLE_WRITER");
        let dat_build = writer.dat.path().to_path_buf();
        let db_build = writer.directory.path().to_path_buf();
        writer.dat.finish()?;
        writer.directory.finish()?;
        let xml_build = build_path(&self.homedir, TABLE_XML_NAME);
        fs::write(&xml_build, doc::table_doc_to_string(&self.schema, &self.stats)?)?;
        fs::rename(&dat_build, Self::dat_path(&self.homedir))?;
        fs::rename(&db_build, Self::db_path(&self.homedir))?;
        fs::rename(&xml_build, Self::xml_path(&self.homedir))?;
        debug!(
            "closed table {:?}, {} rows committed",
            self.homedir, self.stats.num_rows
        );
        Ok(())
    }

    /// Deletes the permanent table files.
    pub fn delete(homedir: &Path) -> Result<()> {
        fs::remove_file(Self::db_path(homedir))?;
        fs::remove_file(Self::xml_path(homedir))?;
        fs::remove_file(Self::dat_path(homedir))?;
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        // a write-mode table dropped without close abandons its build
        warn!("discarding unfinished table build in {:?}", self.homedir);
        self.writer = None;
        for name in [TABLE_DAT_NAME, TABLE_DB_NAME, TABLE_XML_NAME] {
            let p = build_path(&self.homedir, name);
            if p.exists() {
                let _ = fs::remove_file(p);
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("homedir", &self.homedir)
            .field("mode", &self.mode)
            .field("num_rows", &self.stats.num_rows)
            .finish()
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use crate::meta::def::{NumElements, SchemaBuilder};
    use crate::util;
    use tempfile::TempDir;

    fn setup() {
        util::init_unit_test();
    }

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new();
        b.add_id_column(4)
            .add_int_column("x", "", 2, NumElements::Fixed(1))
            .add_uint_column("y", "", 1, NumElements::Var1);
        b.build().unwrap()
    }

    fn write_rows(dir: &Path, rows: &[Vec<Value>]) {
        let mut t = Table::create(dir, schema(), false).unwrap();
        for row in rows {
            t.append(row).unwrap();
        }
        t.close().unwrap();
    }

    #[test]
    fn test_append_reopen_get() {
        setup();
        let dir = TempDir::new().unwrap();
        write_rows(
            dir.path(),
            &[
                vec![Value::Missing, Value::Int(-5), Value::UintList(vec![1, 2])],
                vec![Value::Missing, Value::Int(7)],
            ],
        );
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(
            t.get(0).unwrap(),
            vec![Value::Uint(0), Value::Int(-5), Value::UintList(vec![1, 2])]
        );
        assert_eq!(
            t.get(1).unwrap(),
            vec![Value::Uint(1), Value::Int(7), Value::Missing]
        );
        t.close().unwrap();
    }

    #[test]
    fn test_negative_positions_wrap() {
        setup();
        let dir = TempDir::new().unwrap();
        write_rows(
            dir.path(),
            &[
                vec![Value::Missing, Value::Int(0)],
                vec![Value::Missing, Value::Int(1)],
                vec![Value::Missing, Value::Int(2)],
            ],
        );
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.get(-1).unwrap()[1], Value::Int(2));
        assert_eq!(t.get(-3).unwrap()[1], Value::Int(0));
        assert!(matches!(t.get(3), Err(Error::NotFound(_))));
        assert!(matches!(t.get(-4), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_table_round_trip() {
        setup();
        let dir = TempDir::new().unwrap();
        write_rows(dir.path(), &[]);
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.len(), 0);
        assert!(matches!(t.get(0), Err(Error::NotFound(_))));
        assert_eq!(t.cursor(&[0], 0, None).unwrap().count(), 0);
    }

    #[test]
    fn test_wrong_mode_operations() {
        setup();
        let dir = TempDir::new().unwrap();
        let mut t = Table::create(dir.path(), schema(), false).unwrap();
        t.append(&[Value::Missing, Value::Int(1)]).unwrap();
        assert!(matches!(t.get(0), Err(Error::State(_))));
        assert!(matches!(t.cursor(&[0], 0, None), Err(Error::State(_))));
        assert!(matches!(t.indexes(), Err(Error::State(_))));
        t.close().unwrap();

        let mut t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert!(matches!(
            t.append(&[Value::Missing, Value::Int(2)]),
            Err(Error::State(_))
        ));
        t.close().unwrap();
    }

    #[test]
    fn test_open_refuses_unbuilt_home() {
        setup();
        let dir = TempDir::new().unwrap();
        // a table mid-build has no permanent metadata file
        let t = Table::create(dir.path(), schema(), false).unwrap();
        assert!(Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).is_err());
        drop(t);
        // dropping the unfinished build removed its transients
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_refuses_populated_home() {
        setup();
        let dir = TempDir::new().unwrap();
        write_rows(dir.path(), &[vec![Value::Missing, Value::Int(1)]]);
        assert!(matches!(
            Table::create(dir.path(), schema(), false),
            Err(Error::State(_))
        ));
        // force overwrites
        let t = Table::create(dir.path(), schema(), true).unwrap();
        t.close().unwrap();
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_bad_append_leaves_table_usable() {
        setup();
        let dir = TempDir::new().unwrap();
        let mut t = Table::create(dir.path(), schema(), false).unwrap();
        t.append(&[Value::Missing, Value::Int(1)]).unwrap();
        assert!(t.append(&[Value::Missing, Value::Int(40000)]).is_err());
        t.append(&[Value::Missing, Value::Int(2)]).unwrap();
        t.close().unwrap();
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(1).unwrap()[1], Value::Int(2));
    }

    #[test]
    fn test_column_position_lookup() {
        setup();
        let dir = TempDir::new().unwrap();
        write_rows(dir.path(), &[]);
        let t = Table::open(dir.path(), crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(t.column_position("x").unwrap(), 1);
        assert_eq!(t.column_position("2").unwrap(), 2);
        assert!(matches!(t.column_position("nope"), Err(Error::NotFound(_))));
        assert!(matches!(t.column_position("9"), Err(Error::NotFound(_))));
    }
}
