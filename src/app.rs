//! The administration commands behind the `rowvault` binary.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use log::{debug, info};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::index::{Index, IndexBuilder};
use crate::meta::def::ElementType;
use crate::table::Table;
use crate::util;
use crate::value::Value;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show details about the columns in the table
    Show {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,
    },

    /// List details of the table and its indexes
    Ls {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,
    },

    /// Add a new index to the table
    Add {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,

        /// Column specification for the index, of the form
        /// n_1[w_1]+n_2[w_2]+...; the optional bracketed w_j is the
        /// bin width of the j-th key column. For example, CHROM+POS
        /// indexes two columns without binning and AF[0.1] bins AF
        /// into buckets of width 0.1.
        #[arg(value_name = "COLSPEC")]
        colspec: String,

        /// Name of the index (defaults to COLSPEC)
        #[arg(short, long)]
        name: Option<String>,

        /// Cache size in bytes; suffixes K, M and G also supported
        #[arg(short, long, default_value = "64M")]
        cache_size: String,

        /// Force over-writing of an existing index
        #[arg(short, long, default_value_t = false)]
        force: bool,

        /// Suppress the progress monitor and messages
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },

    /// Delete an index
    Rm {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,

        /// Name of the index
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Show the keys and counts from an index
    Hist {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,

        /// Name of the index
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Dump rows from the table to stdout
    Dump {
        /// Table home directory
        #[arg(value_name = "HOMEDIR")]
        homedir: PathBuf,

        /// Columns to dump - defaults to all columns
        #[arg(value_name = "COLUMN")]
        columns: Vec<String>,

        /// Index to sort by when dumping rows
        #[arg(short, long)]
        index: Option<String>,

        /// Start key: a comma delimited series of values for the
        /// columns of the index, e.g. --start=AA,1
        #[arg(short, long)]
        start: Option<String>,

        /// Stop key: a comma delimited series of values for the
        /// columns of the index
        #[arg(short = 't', long)]
        stop: Option<String>,

        /// Cache size in bytes; suffixes K, M and G also supported
        #[arg(short, long, default_value = "64M")]
        cache_size: String,
    },
}

/// Terminal progress bar for index builds.
struct ProgressMonitor {
    total: u64,
    width: usize,
}

impl ProgressMonitor {
    fn new(total: u64) -> Self {
        ProgressMonitor { total, width: 40 }
    }

    fn update(&self, processed: u64) {
        let fraction = if self.total == 0 {
            1.0
        } else {
            processed as f64 / self.total as f64
        };
        let filled = (fraction * self.width as f64) as usize;
        print!(
            "\r[{}{}] {:6.2}% ",
            "#".repeat(filled),
            " ".repeat(self.width - filled),
            fraction * 100.0
        );
        let _ = std::io::stdout().flush();
    }

    fn finish(&self) {
        self.update(self.total);
        println!();
    }
}

#[derive(Debug)]
pub struct App {
    pub timer: Instant,
}

impl Default for App {
    fn default() -> Self {
        App::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            timer: Instant::now(),
        }
    }

    pub fn time_costs(&self) -> Duration {
        self.timer.elapsed()
    }

    pub fn run(&mut self, command: Commands) -> Result<()> {
        debug!("{:?}, {:?}", command, self);

        match command {
            Commands::Show { homedir } => self.do_show(homedir)?,
            Commands::Ls { homedir } => self.do_ls(homedir)?,
            Commands::Add {
                homedir,
                colspec,
                name,
                cache_size,
                force,
                quiet,
            } => self.do_add(homedir, colspec, name, cache_size, force, quiet)?,
            Commands::Rm { homedir, name } => self.do_rm(homedir, name)?,
            Commands::Hist { homedir, name } => self.do_hist(homedir, name)?,
            Commands::Dump {
                homedir,
                columns,
                index,
                start,
                stop,
                cache_size,
            } => self.do_dump(homedir, columns, index, start, stop, cache_size)?,
        }

        Ok(())
    }

    fn do_show(&self, homedir: PathBuf) -> Result<()> {
        let t = Table::open(&homedir, crate::DEFAULT_CACHE_SIZE)?;
        let name_width = t
            .schema()
            .columns()
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0)
            .max(4)
            + 2;
        let header = format!(
            "{:>4}   {:<name_width$} {:<6} {:>6}   {:<6}   |   {}",
            "",
            "name",
            "type",
            "size",
            "n",
            "description",
            name_width = name_width
        );
        println!("{}", "=".repeat(header.len() + 2));
        println!("{}", header);
        println!("{}", "=".repeat(header.len() + 2));
        for c in t.schema().columns() {
            println!(
                "{:>4}   {:<name_width$} {:<6} {:>6}   {:<6}   |   {}",
                c.position,
                c.name.magenta(),
                c.element_type.to_string().blue(),
                c.element_size,
                c.num_elements.to_metadata(),
                c.description,
                name_width = name_width
            );
        }
        t.close()?;
        Ok(())
    }

    fn do_ls(&self, homedir: PathBuf) -> Result<()> {
        let t = Table::open(&homedir, crate::DEFAULT_CACHE_SIZE)?;
        let n = t.len();
        let stats = *t.stats();
        let mean_row_size = if n == 0 { 0 } else { stats.total_row_size / n };
        let print_line =
            |label: &str, value: String| println!("{:<20}:{:>15}", label, value.blue());
        print_line("rows", n.to_string());
        print_line("data file size", util::format_size(t.data_file_size()?));
        print_line("db file size", util::format_size(t.db_file_size()?));
        print_line("minimum row size", util::format_size(stats.min_row_size));
        print_line("maximum row size", util::format_size(stats.max_row_size));
        print_line("mean row size", util::format_size(mean_row_size));
        print_line(
            "fixed region size",
            util::format_size(t.fixed_region_size() as u64),
        );
        let names = t.indexes()?;
        if names.is_empty() {
            println!("No indexes");
        } else {
            println!("Indexes:");
            let name_width = names.iter().map(|n| n.len()).max().unwrap_or(0).max(4) + 2;
            let header = format!(
                "{:<name_width$} {:>10} {:>3} | {}",
                "name",
                "size",
                "n",
                "colspec",
                name_width = name_width
            );
            println!("{}", "=".repeat(header.len() + 2));
            println!("{}", header);
            println!("{}", "=".repeat(header.len() + 2));
            for name in &names {
                let i = t.open_index(name, crate::DEFAULT_CACHE_SIZE)?;
                println!(
                    "{:<name_width$} {:>10} {:>3} | {}",
                    i.name().magenta(),
                    util::format_size(i.db_file_size()?),
                    i.key_columns().len(),
                    i.colspec()?.yellow(),
                    name_width = name_width
                );
                i.close()?;
            }
        }
        t.close()?;
        Ok(())
    }

    /// Splits a colspec `n_1[w_1]+n_2[w_2]+...` into its column names
    /// and bin widths.
    fn parse_colspec(colspec: &str) -> Result<Vec<(&str, f64)>> {
        let mut parts = Vec::new();
        for part in colspec.split('+') {
            match part.find('[') {
                Some(open) if part.ends_with(']') => {
                    let width: f64 = part[open + 1..part.len() - 1].parse().map_err(|_| {
                        Error::Schema(format!("invalid bin width in colspec part '{}'", part))
                    })?;
                    parts.push((&part[..open], width));
                }
                Some(_) => {
                    return Err(
                        Error::Schema(format!("malformed colspec part '{}'", part)).into()
                    )
                }
                None => parts.push((part, 0.0)),
            }
        }
        Ok(parts)
    }

    fn do_add(
        &self,
        homedir: PathBuf,
        colspec: String,
        name: Option<String>,
        cache_size: String,
        force: bool,
        quiet: bool,
    ) -> Result<()> {
        let cache_size = util::parse_cache_size(&cache_size)?;
        let t = Table::open(&homedir, cache_size)?;
        let index_name = name.unwrap_or_else(|| colspec.clone());
        let n = t.len();
        let mut builder = IndexBuilder::new(&t, &index_name)
            .force(force)
            .callback_rows((n / 1000).max(1));
        for (col_name, bin_width) in Self::parse_colspec(&colspec)? {
            let position = t.schema().position(col_name)?;
            builder = builder.key_column(position, bin_width);
        }
        if quiet {
            builder.build(None)?;
        } else {
            let monitor = ProgressMonitor::new(n);
            let mut progress = |processed: u64| -> crate::error::Result<()> {
                monitor.update(processed);
                Ok(())
            };
            builder.build(Some(&mut progress))?;
            monitor.finish();
        }
        info!("built index '{}' on {}", index_name, homedir.display());
        t.close()?;
        Ok(())
    }

    fn do_rm(&self, homedir: PathBuf, name: String) -> Result<()> {
        let t = Table::open(&homedir, crate::DEFAULT_CACHE_SIZE)?;
        Index::delete(&t, &name)?;
        t.close()?;
        Ok(())
    }

    fn do_hist(&self, homedir: PathBuf, name: String) -> Result<()> {
        let t = Table::open(&homedir, crate::DEFAULT_CACHE_SIZE)?;
        let index = t.open_index(&name, crate::DEFAULT_CACHE_SIZE)?;
        let col_names: Vec<&str> = index
            .key_columns()
            .iter()
            .map(|kc| t.schema().columns()[kc.position].name.as_str())
            .collect();
        println!("# n\t{}", col_names.join("\t"));
        for key in index.keys() {
            let key = key?;
            let count = index.count(&key)?;
            let rendered: Vec<String> = key.iter().map(|v| v.format()).collect();
            println!("{}\t{}", count, rendered.join("\t"));
        }
        index.close()?;
        t.close()?;
        Ok(())
    }

    /// Parses a comma delimited key from the command line against the
    /// index's key columns.
    fn parse_index_key(t: &Table, index: &Index<'_>, key: &str) -> Result<Vec<Value>> {
        let parts: Vec<&str> = key.split(',').collect();
        if parts.len() > index.key_columns().len() {
            return Err(Error::Key(format!(
                "key '{}' has more components than the index has key columns",
                key
            ))
            .into());
        }
        let mut values = Vec::with_capacity(parts.len());
        for (kc, part) in index.key_columns().iter().zip(parts) {
            let col = t.schema().column(kc.position)?;
            let component = match col.element_type {
                ElementType::Int => Value::Int(
                    part.parse()
                        .map_err(|_| Error::Key(format!("invalid int key component '{}'", part)))?,
                ),
                ElementType::Uint => Value::Uint(
                    part.parse()
                        .map_err(|_| Error::Key(format!("invalid uint key component '{}'", part)))?,
                ),
                ElementType::Float => Value::Float(
                    part.parse()
                        .map_err(|_| Error::Key(format!("invalid float key component '{}'", part)))?,
                ),
                ElementType::Char => Value::from(part),
            };
            values.push(component);
        }
        Ok(values)
    }

    fn do_dump(
        &self,
        homedir: PathBuf,
        columns: Vec<String>,
        index: Option<String>,
        start: Option<String>,
        stop: Option<String>,
        cache_size: String,
    ) -> Result<()> {
        let cache_size = util::parse_cache_size(&cache_size)?;
        let t = Table::open(&homedir, cache_size)?;
        let positions: Vec<usize> = if columns.is_empty() {
            (0..t.schema().len()).collect()
        } else {
            columns
                .iter()
                .map(|id| t.column_position(id))
                .collect::<crate::error::Result<_>>()?
        };
        match index {
            None => {
                let start = match start {
                    Some(s) => s
                        .parse()
                        .map_err(|_| Error::Key(format!("invalid start row id '{}'", s)))?,
                    None => 0,
                };
                let stop = match stop {
                    Some(s) => Some(
                        s.parse()
                            .map_err(|_| Error::Key(format!("invalid stop row id '{}'", s)))?,
                    ),
                    None => None,
                };
                for row in t.cursor(&positions, start, stop)? {
                    Self::print_row(&row?);
                }
            }
            Some(index_name) => {
                let idx = t.open_index(&index_name, cache_size)?;
                let start_key = match &start {
                    Some(s) => Some(Self::parse_index_key(&t, &idx, s)?),
                    None => None,
                };
                let stop_key = match &stop {
                    Some(s) => Some(Self::parse_index_key(&t, &idx, s)?),
                    None => None,
                };
                for row in idx.cursor(&positions, start_key.as_deref(), stop_key.as_deref())? {
                    Self::print_row(&row?);
                }
                idx.close()?;
            }
        }
        t.close()?;
        Ok(())
    }

    fn print_row(row: &[Value]) {
        let rendered: Vec<String> = row.iter().map(|v| v.format()).collect();
        println!("{}", rendered.join("\t"));
    }
}
