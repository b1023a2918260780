//! The XML metadata documents stored next to the data files: the table
//! document (schema + stats, version 0.3) and the index document (key
//! columns + bin widths, version 0.4). Attribute values stay strings in
//! this layer; typing and validation happen against [`Schema`].

use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta::def::{ColumnDef, ElementType, NumElements, Schema};

pub const TABLE_METADATA_VERSION: &str = "0.3";
pub const INDEX_METADATA_VERSION: &str = "0.4";
pub const SCHEMA_ADDRESS_SIZE: &str = "2";

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";
const XML_WARNING: &str = "<!-- Do not edit this file! -->";

/// Row statistics finalized when a table is closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub num_rows: u64,
    pub min_row_size: u64,
    pub max_row_size: u64,
    pub total_row_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "table")]
struct TableDoc {
    #[serde(rename = "@version")]
    version: String,
    schema: SchemaDoc,
    stats: StatsDoc,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaDoc {
    #[serde(rename = "@address_size")]
    address_size: String,
    #[serde(rename = "@version")]
    version: String,
    columns: ColumnsDoc,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ColumnsDoc {
    #[serde(rename = "column", default)]
    entries: Vec<ColumnDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@description")]
    description: String,
    #[serde(rename = "@element_type")]
    element_type: String,
    #[serde(rename = "@element_size")]
    element_size: String,
    #[serde(rename = "@num_elements")]
    num_elements: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsDoc {
    #[serde(rename = "stat", default)]
    entries: Vec<StatDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "index")]
struct IndexDoc {
    #[serde(rename = "@version")]
    version: String,
    key_columns: KeyColumnsDoc,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyColumnsDoc {
    #[serde(rename = "key_column", default)]
    entries: Vec<KeyColumnDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyColumnDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@bin_width")]
    bin_width: String,
}

fn root_tag(text: &str) -> Result<String> {
    let mut reader = quick_xml::Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.name().as_ref()).into_owned())
            }
            Ok(Event::Eof) => return Err(Error::Schema("empty metadata document".to_string())),
            Err(e) => return Err(Error::Schema(format!("invalid xml: {}", e))),
            _ => continue,
        }
    }
}

fn to_pretty_xml<T: Serialize>(doc: &T) -> Result<String> {
    let mut body = String::new();
    let mut ser = quick_xml::se::Serializer::new(&mut body);
    ser.indent(' ', 2);
    doc.serialize(ser)
        .map_err(|e| Error::Schema(format!("cannot serialize metadata: {}", e)))?;
    Ok(format!("{}\n{}\n{}\n", XML_DECLARATION, XML_WARNING, body))
}

/// Renders the table metadata document for the given schema and stats.
pub fn table_doc_to_string(schema: &Schema, stats: &TableStats) -> Result<String> {
    let entries = schema
        .columns()
        .iter()
        .map(|c| ColumnDoc {
            name: c.name.clone(),
            description: c.description.clone(),
            element_type: c.element_type.to_string(),
            element_size: c.element_size.to_string(),
            num_elements: c.num_elements.to_metadata(),
        })
        .collect();
    let stat_entries = [
        ("num_rows", stats.num_rows),
        ("max_row_size", stats.max_row_size),
        ("min_row_size", stats.min_row_size),
        ("total_row_size", stats.total_row_size),
    ]
    .iter()
    .map(|(name, value)| StatDoc {
        name: name.to_string(),
        value: value.to_string(),
    })
    .collect();
    let doc = TableDoc {
        version: TABLE_METADATA_VERSION.to_string(),
        schema: SchemaDoc {
            address_size: SCHEMA_ADDRESS_SIZE.to_string(),
            version: TABLE_METADATA_VERSION.to_string(),
            columns: ColumnsDoc { entries },
        },
        stats: StatsDoc {
            entries: stat_entries,
        },
    };
    to_pretty_xml(&doc)
}

/// Parses and validates a table metadata document.
pub fn parse_table_doc(text: &str) -> Result<(Schema, TableStats)> {
    match root_tag(text)?.as_str() {
        "table" => {}
        "schema" => {
            return Err(Error::Schema(
                "this table was built with a pre-0.3 layout and must be rebuilt".to_string(),
            ))
        }
        other => {
            return Err(Error::Schema(format!(
                "invalid metadata document root '{}'",
                other
            )))
        }
    }
    let doc: TableDoc = quick_xml::de::from_str(text)
        .map_err(|e| Error::Schema(format!("invalid xml: {}", e)))?;
    if doc.version != TABLE_METADATA_VERSION {
        return Err(Error::Schema(format!(
            "unsupported table metadata version '{}'",
            doc.version
        )));
    }
    if doc.schema.address_size != SCHEMA_ADDRESS_SIZE {
        return Err(Error::Schema(format!(
            "unsupported address size '{}'",
            doc.schema.address_size
        )));
    }
    let mut columns = Vec::with_capacity(doc.schema.columns.entries.len());
    for (position, c) in doc.schema.columns.entries.iter().enumerate() {
        let element_type: ElementType = c
            .element_type
            .parse()
            .map_err(|_| Error::Schema(format!("unknown element type '{}'", c.element_type)))?;
        let element_size: usize = c
            .element_size
            .parse()
            .map_err(|_| Error::Schema(format!("invalid element size '{}'", c.element_size)))?;
        columns.push(ColumnDef {
            position,
            name: c.name.clone(),
            description: c.description.clone(),
            element_type,
            element_size,
            num_elements: NumElements::from_metadata(&c.num_elements)?,
        });
    }
    let schema = Schema::from_columns(columns)?;
    let mut stats = TableStats::default();
    for stat in &doc.stats.entries {
        let value: u64 = stat
            .value
            .parse()
            .map_err(|_| Error::Schema(format!("invalid stat value '{}'", stat.value)))?;
        match stat.name.as_str() {
            "num_rows" => stats.num_rows = value,
            "min_row_size" => stats.min_row_size = value,
            "max_row_size" => stats.max_row_size = value,
            "total_row_size" => stats.total_row_size = value,
            other => {
                return Err(Error::Schema(format!("unknown table statistic '{}'", other)))
            }
        }
    }
    Ok((schema, stats))
}

/// Renders the index metadata document. Bin widths of integer key
/// columns serialize without a fractional part.
pub fn index_doc_to_string(schema: &Schema, key_columns: &[(usize, f64)]) -> Result<String> {
    let mut entries = Vec::with_capacity(key_columns.len());
    for &(position, bin_width) in key_columns {
        let col = schema.column(position)?;
        let rendered = match col.element_type {
            ElementType::Int | ElementType::Uint => (bin_width as i64).to_string(),
            _ => bin_width.to_string(),
        };
        entries.push(KeyColumnDoc {
            name: col.name.clone(),
            bin_width: rendered,
        });
    }
    let doc = IndexDoc {
        version: INDEX_METADATA_VERSION.to_string(),
        key_columns: KeyColumnsDoc { entries },
    };
    to_pretty_xml(&doc)
}

/// Parses an index metadata document into (column position, bin width)
/// pairs resolved against the table's schema.
pub fn parse_index_doc(text: &str, schema: &Schema) -> Result<Vec<(usize, f64)>> {
    if root_tag(text)? != "index" {
        return Err(Error::Schema(
            "invalid index metadata document".to_string(),
        ));
    }
    let doc: IndexDoc = quick_xml::de::from_str(text)
        .map_err(|e| Error::Schema(format!("invalid xml: {}", e)))?;
    if doc.version != INDEX_METADATA_VERSION {
        return Err(Error::Schema(format!(
            "unsupported index metadata version '{}'",
            doc.version
        )));
    }
    let mut key_columns = Vec::with_capacity(doc.key_columns.entries.len());
    for entry in &doc.key_columns.entries {
        let position = schema.position(&entry.name)?;
        let bin_width: f64 = entry
            .bin_width
            .parse()
            .map_err(|_| Error::Schema(format!("invalid bin width '{}'", entry.bin_width)))?;
        key_columns.push((position, bin_width));
    }
    if key_columns.is_empty() {
        return Err(Error::Schema("index has no key columns".to_string()));
    }
    Ok(key_columns)
}
