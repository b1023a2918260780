//! Key-sorted secondary indexes over a table. An index is built in one
//! bulk pass over a closed table and is immutable afterwards; reads go
//! through the same ordered key-value file as the row directory.

use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cursor::{IndexCursor, Progress};
use crate::error::{Error, Result};
use crate::meta::doc;
use crate::store::build_path;
use crate::store::keys::{self, KeyColumn};
use crate::store::kvfile::{KvReader, KvWriter};
use crate::table::{Mode, Table, INDEX_DB_PREFIX};
use crate::value::Value;

fn db_name(name: &str) -> String {
    format!("{}{}.db", INDEX_DB_PREFIX, name)
}

fn xml_name(name: &str) -> String {
    format!("{}{}.xml", INDEX_DB_PREFIX, name)
}

fn db_path(homedir: &Path, name: &str) -> PathBuf {
    homedir.join(db_name(name))
}

fn xml_path(homedir: &Path, name: &str) -> PathBuf {
    homedir.join(xml_name(name))
}

/// Progress callback invoked with the number of rows processed so far;
/// returning an error cancels the build.
pub type ProgressFn<'c> = &'c mut dyn FnMut(u64) -> Result<()>;

/// One-shot builder for a new index over a table open in read mode.
/// The build streams the table in row-id order, sorts the
/// (key, row id) pairs and bulk-loads the store; the permanent files
/// appear only through the final renames, and any failure removes the
/// partial build files.
pub struct IndexBuilder<'t> {
    table: &'t Table,
    name: String,
    key_columns: Vec<KeyColumn>,
    force: bool,
    callback_rows: u64,
}

impl<'t> IndexBuilder<'t> {
    pub fn new(table: &'t Table, name: &str) -> Self {
        IndexBuilder {
            table,
            name: name.to_string(),
            key_columns: Vec::new(),
            force: false,
            callback_rows: 100,
        }
    }

    pub fn key_column(mut self, position: usize, bin_width: f64) -> Self {
        self.key_columns.push(KeyColumn {
            position,
            bin_width,
        });
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn callback_rows(mut self, callback_rows: u64) -> Self {
        self.callback_rows = callback_rows.max(1);
        self
    }

    pub fn build(self, progress: Option<ProgressFn<'_>>) -> Result<()> {
        if self.table.mode() != Mode::Read {
            return Err(Error::State(
                "indexes are built over a table open in read mode".to_string(),
            ));
        }
        let homedir = self.table.homedir();
        keys::validate_key_columns(self.table.schema(), &self.key_columns)?;
        if db_path(homedir, &self.name).exists() && !self.force {
            return Err(Error::State(format!(
                "index '{}' exists; use force to overwrite",
                self.name
            )));
        }
        let db_build = build_path(homedir, &db_name(&self.name));
        let xml_build = build_path(homedir, &xml_name(&self.name));
        if let Err(e) = self.run(progress, &db_build, &xml_build) {
            let _ = fs::remove_file(&db_build);
            let _ = fs::remove_file(&xml_build);
            return Err(match e {
                Error::Build(_) => e,
                other => Error::Build(other.to_string()),
            });
        }
        Ok(())
    }

    fn run(
        &self,
        progress: Option<ProgressFn<'_>>,
        db_build: &Path,
        xml_build: &Path,
    ) -> Result<()> {
        let schema = self.table.schema();
        let positions: Vec<usize> = self.key_columns.iter().map(|kc| kc.position).collect();
        let scan = self.table.cursor(&positions, 0, None)?;

        let mut noop = |_: u64| -> Result<()> { Ok(()) };
        let callback: ProgressFn<'_> = match progress {
            Some(f) => f,
            None => &mut noop,
        };
        let mut pairs: Vec<(Vec<u8>, u64)> = Vec::with_capacity(self.table.len() as usize);
        for (row_id, tuple) in Progress::new(scan, self.callback_rows, callback).enumerate() {
            let key = keys::encode_key(schema, &self.key_columns, &tuple?)?;
            pairs.push((key, row_id as u64));
        }
        // a stable order on (key, row id): equal keys iterate by
        // ascending row id
        pairs.sort();

        let mut writer = KvWriter::create(db_build)?;
        for (key, row_id) in &pairs {
            writer.append(key, &row_id.to_be_bytes())?;
        }
        writer.finish()?;

        let key_columns: Vec<(usize, f64)> = self
            .key_columns
            .iter()
            .map(|kc| (kc.position, kc.bin_width))
            .collect();
        fs::write(xml_build, doc::index_doc_to_string(schema, &key_columns)?)?;
        fs::rename(db_build, db_path(self.table.homedir(), &self.name))?;
        fs::rename(xml_build, xml_path(self.table.homedir(), &self.name))?;
        info!(
            "built index '{}' over {:?}, {} entries",
            self.name,
            self.table.homedir(),
            pairs.len()
        );
        Ok(())
    }
}

/// A read-mode view of an index. Borrows the table, so the table
/// cannot close while the index is alive.
pub struct Index<'t> {
    table: &'t Table,
    name: String,
    key_columns: Vec<KeyColumn>,
    kv: KvReader,
}

impl<'t> Index<'t> {
    pub(crate) fn open(table: &'t Table, name: &str, cache_size: u64) -> Result<Index<'t>> {
        let homedir = table.homedir();
        let dbp = db_path(homedir, name);
        let xmlp = xml_path(homedir, name);
        if !dbp.exists() || !xmlp.exists() {
            return Err(Error::NotFound(format!("index '{}' not found", name)));
        }
        let text = fs::read_to_string(&xmlp)?;
        let key_columns: Vec<KeyColumn> = doc::parse_index_doc(&text, table.schema())?
            .into_iter()
            .map(|(position, bin_width)| KeyColumn {
                position,
                bin_width,
            })
            .collect();
        keys::validate_key_columns(table.schema(), &key_columns)?;
        let kv = KvReader::open(&dbp, cache_size)?;
        debug!("opened index '{}', {} entries", name, kv.len());
        Ok(Index {
            table,
            name: name.to_string(),
            key_columns,
            kv,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &'t Table {
        self.table
    }

    pub fn key_columns(&self) -> &[KeyColumn] {
        &self.key_columns
    }

    /// The column specification this index was defined with, e.g.
    /// `CHROM+POS` or `AF[0.1]`.
    pub fn colspec(&self) -> Result<String> {
        use crate::meta::def::ElementType;
        let mut parts = Vec::with_capacity(self.key_columns.len());
        for kc in &self.key_columns {
            let col = self.table.schema().column(kc.position)?;
            let mut s = col.name.clone();
            if kc.bin_width != 0.0 {
                match col.element_type {
                    ElementType::Int | ElementType::Uint => {
                        s.push_str(&format!("[{}]", kc.bin_width as i64))
                    }
                    _ => s.push_str(&format!("[{}]", kc.bin_width)),
                }
            }
            parts.push(s);
        }
        Ok(parts.join("+"))
    }

    /// Number of (key, row id) entries; equals the table's row count.
    pub fn num_entries(&self) -> u64 {
        self.kv.len()
    }

    pub fn db_file_size(&self) -> Result<u64> {
        Ok(fs::metadata(db_path(self.table.homedir(), &self.name))?.len())
    }

    pub(crate) fn row_id_at(&self, position: u64) -> Result<u64> {
        let (_, val) = self.kv.entry(position)?;
        Ok(u64::from_be_bytes(
            val.as_ref().try_into().expect("ERR_INDEX_ROW_ID"),
        ))
    }

    fn encode_full_key(&self, key: &[Value]) -> Result<Vec<u8>> {
        if key.len() != self.key_columns.len() {
            return Err(Error::Key(format!(
                "key has {} components but the index has {} key columns",
                key.len(),
                self.key_columns.len()
            )));
        }
        keys::encode_key(self.table.schema(), &self.key_columns, key)
    }

    /// Number of rows whose key equals the given full key after
    /// binning.
    pub fn count(&self, key: &[Value]) -> Result<u64> {
        let encoded = self.encode_full_key(key)?;
        Ok(self.kv.upper_bound(&encoded)? - self.kv.lower_bound(&encoded)?)
    }

    /// Smallest full key starting with the given prefix (global
    /// minimum for an empty prefix).
    pub fn min_key(&self, prefix: &[Value]) -> Result<Vec<Value>> {
        let encoded = keys::encode_key(self.table.schema(), &self.key_columns, prefix)?;
        let i = self.kv.lower_bound(&encoded)?;
        if i == self.kv.len() {
            return Err(Error::NotFound("no key with the given prefix".to_string()));
        }
        let key = self.kv.key(i)?;
        if !key.starts_with(&encoded) {
            return Err(Error::NotFound("no key with the given prefix".to_string()));
        }
        keys::decode_key(self.table.schema(), &self.key_columns, &key)
    }

    /// Largest full key starting with the given prefix (global maximum
    /// for an empty prefix).
    pub fn max_key(&self, prefix: &[Value]) -> Result<Vec<Value>> {
        let encoded = keys::encode_key(self.table.schema(), &self.key_columns, prefix)?;
        let end = match keys::prefix_successor(&encoded) {
            Some(succ) => self.kv.lower_bound(&succ)?,
            None => self.kv.len(),
        };
        if end == 0 {
            return Err(Error::NotFound("no key with the given prefix".to_string()));
        }
        let key = self.kv.key(end - 1)?;
        if !key.starts_with(&encoded) {
            return Err(Error::NotFound("no key with the given prefix".to_string()));
        }
        keys::decode_key(self.table.schema(), &self.key_columns, &key)
    }

    /// Lazy, ordered iteration of the distinct keys.
    pub fn keys(&self) -> KeyIter<'_, 't> {
        KeyIter {
            index: self,
            next: 0,
        }
    }

    /// Cursor over the rows whose key satisfies start <= key < stop in
    /// index order, with ties broken by ascending row id. The bounds
    /// are key tuples or prefixes of one; `None` leaves that end
    /// unbounded.
    pub fn cursor(
        &self,
        columns: &[usize],
        start: Option<&[Value]>,
        stop: Option<&[Value]>,
    ) -> Result<IndexCursor<'_, 't>> {
        for &pos in columns {
            self.table.schema().column(pos)?;
        }
        let schema = self.table.schema();
        let begin = match start {
            Some(values) => {
                let encoded = keys::encode_key(schema, &self.key_columns, values)?;
                self.kv.lower_bound(&encoded)?
            }
            None => 0,
        };
        let end = match stop {
            Some(values) => {
                let encoded = keys::encode_key(schema, &self.key_columns, values)?;
                self.kv.lower_bound(&encoded)?
            }
            None => self.kv.len(),
        };
        Ok(IndexCursor::new(self, columns.to_vec(), begin, end))
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Removes the index files: the store first, so the index stops
    /// being discoverable, then the metadata document.
    pub fn delete(table: &Table, name: &str) -> Result<()> {
        let dbp = db_path(table.homedir(), name);
        if !dbp.exists() {
            return Err(Error::NotFound(format!("index '{}' not found", name)));
        }
        fs::remove_file(&dbp)?;
        fs::remove_file(xml_path(table.homedir(), name))?;
        Ok(())
    }
}

impl std::fmt::Debug for Index<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("key_columns", &self.key_columns)
            .field("entries", &self.kv.len())
            .finish()
    }
}

/// Iterator over the distinct keys of an index in ascending order.
pub struct KeyIter<'a, 't> {
    index: &'a Index<'t>,
    next: u64,
}

impl Iterator for KeyIter<'_, '_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.index.kv.len() {
            return None;
        }
        let step = (|| {
            let key = self.index.kv.key(self.next)?;
            // skip the whole run of entries sharing this key
            self.next = self.index.kv.upper_bound(&key)?;
            keys::decode_key(self.index.table.schema(), &self.index.key_columns, &key)
        })();
        if step.is_err() {
            self.next = self.index.kv.len();
        }
        Some(step)
    }
}

#[cfg(test)]
mod index_tests {
    use super::*;
    use crate::meta::def::{NumElements, SchemaBuilder};
    use crate::util;
    use crate::value::Value;
    use tempfile::TempDir;

    fn setup() {
        util::init_unit_test();
    }

    fn variant_table(dir: &Path) -> Table {
        let mut b = SchemaBuilder::new();
        b.add_id_column(4)
            .add_char_column("CHROM", "Chromosome", NumElements::Var1)
            .add_uint_column("POS", "Position", 4, NumElements::Fixed(1));
        let mut t = Table::create(dir, b.build().unwrap(), false).unwrap();
        for (chrom, pos) in [("1", 100u64), ("1", 200), ("2", 50), ("1", 100), ("10", 5)] {
            t.append(&[Value::Missing, Value::from(chrom), Value::Uint(pos)])
                .unwrap();
        }
        t.close().unwrap();
        Table::open(dir, crate::DEFAULT_CACHE_SIZE).unwrap()
    }

    #[test]
    fn test_build_and_iterate() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        IndexBuilder::new(&t, "CHROM+POS")
            .key_column(1, 0.0)
            .key_column(2, 0.0)
            .build(None)
            .unwrap();
        let idx = t.open_index("CHROM+POS", crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(idx.num_entries(), 5);
        // index order: ("1",100)x2, ("1",200), ("10",5), ("2",50);
        // within the equal key, row ids ascend
        let ids: Vec<u64> = idx
            .cursor(&[0], None, None)
            .unwrap()
            .map(|r| match &r.unwrap()[0] {
                Value::Uint(v) => *v,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![0, 3, 1, 4, 2]);
    }

    #[test]
    fn test_count_and_min_max() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        IndexBuilder::new(&t, "CHROM+POS")
            .key_column(1, 0.0)
            .key_column(2, 0.0)
            .build(None)
            .unwrap();
        let idx = t.open_index("CHROM+POS", crate::DEFAULT_CACHE_SIZE).unwrap();
        assert_eq!(idx.count(&[Value::from("1"), Value::Uint(100)]).unwrap(), 2);
        assert_eq!(idx.count(&[Value::from("3"), Value::Uint(1)]).unwrap(), 0);
        assert!(matches!(idx.count(&[Value::from("1")]), Err(Error::Key(_))));
        assert_eq!(
            idx.min_key(&[]).unwrap(),
            vec![Value::from("1"), Value::Uint(100)]
        );
        assert_eq!(
            idx.max_key(&[]).unwrap(),
            vec![Value::from("2"), Value::Uint(50)]
        );
        assert_eq!(
            idx.min_key(&[Value::from("10")]).unwrap(),
            vec![Value::from("10"), Value::Uint(5)]
        );
        assert_eq!(
            idx.max_key(&[Value::from("1")]).unwrap(),
            vec![Value::from("1"), Value::Uint(200)]
        );
        assert!(idx.min_key(&[Value::from("3")]).is_err());
    }

    #[test]
    fn test_keys_are_distinct_and_sorted() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        IndexBuilder::new(&t, "CHROM")
            .key_column(1, 0.0)
            .build(None)
            .unwrap();
        let idx = t.open_index("CHROM", crate::DEFAULT_CACHE_SIZE).unwrap();
        let keys: Vec<Vec<Value>> = idx.keys().map(|k| k.unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                vec![Value::from("1")],
                vec![Value::from("10")],
                vec![Value::from("2")],
            ]
        );
    }

    #[test]
    fn test_existing_index_needs_force() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        IndexBuilder::new(&t, "POS").key_column(2, 0.0).build(None).unwrap();
        let again = IndexBuilder::new(&t, "POS").key_column(2, 0.0).build(None);
        assert!(matches!(again, Err(Error::State(_))));
        IndexBuilder::new(&t, "POS")
            .key_column(2, 0.0)
            .force(true)
            .build(None)
            .unwrap();
    }

    #[test]
    fn test_cancelled_build_leaves_nothing_behind() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        let mut cancel = |rows: u64| {
            if rows >= 2 {
                Err(Error::State("interrupted".to_string()))
            } else {
                Ok(())
            }
        };
        let res = IndexBuilder::new(&t, "POS")
            .key_column(2, 0.0)
            .callback_rows(1)
            .build(Some(&mut cancel));
        assert!(matches!(res, Err(Error::Build(_))));
        assert!(!db_path(dir.path(), "POS").exists());
        assert!(!xml_path(dir.path(), "POS").exists());
        // no transient build files either
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("_build_")
            })
            .count();
        assert_eq!(leftovers, 0);
        // the table itself is unaffected
        assert_eq!(t.len(), 5);
        assert_eq!(t.indexes().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_delete_index() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        IndexBuilder::new(&t, "POS").key_column(2, 0.0).build(None).unwrap();
        assert_eq!(t.indexes().unwrap(), vec!["POS".to_string()]);
        Index::delete(&t, "POS").unwrap();
        assert_eq!(t.indexes().unwrap(), Vec::<String>::new());
        assert!(matches!(Index::delete(&t, "POS"), Err(Error::NotFound(_))));
        assert!(matches!(
            t.open_index("POS", crate::DEFAULT_CACHE_SIZE),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_char_bin_width_rejected() {
        setup();
        let dir = TempDir::new().unwrap();
        let t = variant_table(dir.path());
        let res = IndexBuilder::new(&t, "CHROM[2]").key_column(1, 2.0).build(None);
        assert!(res.is_err());
    }
}
