//! Single-pass forward cursors over a table or an index, plus the
//! progress adapter used by long-running consumers such as the index
//! builder.

use crate::error::Result;
use crate::index::Index;
use crate::table::Table;
use crate::value::Value;

fn project(row: Vec<Value>, columns: &[usize]) -> Vec<Value> {
    columns.iter().map(|&p| row[p].clone()).collect()
}

/// Iterates rows in row-id order with `start <= row_id < stop`,
/// yielding the projected columns in the caller's order (duplicates
/// permitted).
pub struct TableCursor<'t> {
    table: &'t Table,
    columns: Vec<usize>,
    next: u64,
    stop: u64,
}

impl<'t> TableCursor<'t> {
    pub(crate) fn new(table: &'t Table, columns: Vec<usize>, start: u64, stop: u64) -> Self {
        TableCursor {
            table,
            columns,
            next: start,
            stop,
        }
    }
}

impl Iterator for TableCursor<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.stop {
            return None;
        }
        let row_id = self.next;
        self.next += 1;
        Some(self.table.read_row(row_id).map(|row| project(row, &self.columns)))
    }
}

/// Iterates rows in index order between two resolved entry positions,
/// fetching each row from the table by the row id stored in the index
/// entry.
pub struct IndexCursor<'a, 't> {
    index: &'a Index<'t>,
    columns: Vec<usize>,
    next: u64,
    stop: u64,
}

impl<'a, 't> IndexCursor<'a, 't> {
    pub(crate) fn new(index: &'a Index<'t>, columns: Vec<usize>, start: u64, stop: u64) -> Self {
        IndexCursor {
            index,
            columns,
            next: start,
            stop,
        }
    }
}

impl Iterator for IndexCursor<'_, '_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.stop {
            return None;
        }
        let position = self.next;
        self.next += 1;
        let step = self.index.row_id_at(position).and_then(|row_id| {
            self.index
                .table()
                .read_row(row_id)
                .map(|row| project(row, &self.columns))
        });
        Some(step)
    }
}

/// Wraps an iterator and invokes a callback every `every` items with
/// the number of items seen so far. An error from the callback stops
/// the iteration and surfaces as the next item.
pub struct Progress<I, F> {
    inner: I,
    every: u64,
    seen: u64,
    callback: F,
    failed: bool,
}

impl<I, F> Progress<I, F> {
    pub fn new(inner: I, every: u64, callback: F) -> Self {
        Progress {
            inner,
            every: every.max(1),
            seen: 0,
            callback,
            failed: false,
        }
    }
}

impl<T, I, F> Iterator for Progress<I, F>
where
    I: Iterator<Item = Result<T>>,
    F: FnMut(u64) -> Result<()>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.inner.next()?;
        if item.is_err() {
            self.failed = true;
            return Some(item);
        }
        self.seen += 1;
        if self.seen % self.every == 0 {
            if let Err(e) = (self.callback)(self.seen) {
                self.failed = true;
                return Some(Err(e));
            }
        }
        Some(item)
    }
}
