use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Name of the primary key column at position 0 of every table.
pub const PRIMARY_KEY_NAME: &str = "row_id";

#[derive(Debug, Display, EnumString, Serialize, Deserialize, Clone, Copy, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int,
    Uint,
    Float,
    Char,
}

/// Column arity: a fixed element count, or a variable count stored in a
/// one-byte or two-byte length slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NumElements {
    Fixed(u32),
    Var1,
    Var2,
}

impl NumElements {
    pub fn is_var(&self) -> bool {
        !matches!(self, NumElements::Fixed(_))
    }

    /// Upper bound on the element count a value may carry.
    pub fn max_elements(&self) -> u32 {
        match self {
            NumElements::Fixed(k) => *k,
            NumElements::Var1 => u8::MAX as u32,
            NumElements::Var2 => u16::MAX as u32,
        }
    }

    /// Width of the length field in the fixed-region slot.
    pub fn length_size(&self) -> usize {
        match self {
            NumElements::Fixed(_) => 0,
            NumElements::Var1 => 1,
            NumElements::Var2 => 2,
        }
    }

    pub(crate) fn to_metadata(self) -> String {
        match self {
            NumElements::Fixed(k) => k.to_string(),
            NumElements::Var1 => "var(1)".to_string(),
            NumElements::Var2 => "var(2)".to_string(),
        }
    }

    pub(crate) fn from_metadata(s: &str) -> Result<Self> {
        match s {
            "var(1)" => Ok(NumElements::Var1),
            "var(2)" => Ok(NumElements::Var2),
            _ => {
                let k: u32 = s
                    .parse()
                    .map_err(|_| Error::Schema(format!("invalid num_elements '{}'", s)))?;
                if k == 0 {
                    return Err(Error::Schema("num_elements must be positive".to_string()));
                }
                Ok(NumElements::Fixed(k))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub position: usize,           // ordinal position in the schema
    pub name: String,              // column name, unique within a schema
    pub description: String,       // free text
    pub element_type: ElementType, // int/uint/float/char
    pub element_size: usize,       // bytes per element
    pub num_elements: NumElements, // fixed arity or var(1)/var(2)
}

impl ColumnDef {
    pub fn is_var(&self) -> bool {
        self.num_elements.is_var()
    }

    /// Width of this column's slot in the fixed region: the packed
    /// elements for fixed arity, or a 2-byte offset plus the length
    /// field for variable arity.
    pub fn slot_size(&self) -> usize {
        match self.num_elements {
            NumElements::Fixed(k) => k as usize * self.element_size,
            NumElements::Var1 => 2 + 1,
            NumElements::Var2 => 2 + 2,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Schema("column name must not be empty".to_string()));
        }
        let size_ok = match self.element_type {
            ElementType::Int | ElementType::Uint => (1..=8).contains(&self.element_size),
            ElementType::Float => self.element_size == 4 || self.element_size == 8,
            ElementType::Char => self.element_size == 1,
        };
        if !size_ok {
            return Err(Error::Schema(format!(
                "invalid element size {} for {} column '{}'",
                self.element_size, self.element_type, self.name
            )));
        }
        if let NumElements::Fixed(0) = self.num_elements {
            return Err(Error::Schema(format!(
                "column '{}' must hold at least one element",
                self.name
            )));
        }
        Ok(())
    }
}

/// The ordered column list of a table, including the primary key column
/// at position 0.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<ColumnDef>,
    name_map: HashMap<String, usize>,
    fixed_region_size: usize,
}

impl Schema {
    pub(crate) fn from_columns(columns: Vec<ColumnDef>) -> Result<Schema> {
        let id = columns
            .first()
            .ok_or_else(|| Error::Schema("schema has no columns".to_string()))?;
        if id.name != PRIMARY_KEY_NAME
            || id.element_type != ElementType::Uint
            || id.num_elements != NumElements::Fixed(1)
            || id.element_size < 4
        {
            return Err(Error::Schema(format!(
                "position 0 must be the '{}' column, an unsigned scalar of size >= 4",
                PRIMARY_KEY_NAME
            )));
        }
        let mut name_map = HashMap::new();
        for (pos, col) in columns.iter().enumerate() {
            col.validate()?;
            if col.position != pos {
                return Err(Error::Schema(format!(
                    "column '{}' is out of position",
                    col.name
                )));
            }
            if name_map.insert(col.name.clone(), pos).is_some() {
                return Err(Error::Schema(format!("duplicate column name '{}'", col.name)));
            }
        }
        let fixed_region_size = columns.iter().map(|c| c.slot_size()).sum();
        Ok(Schema {
            columns,
            name_map,
            fixed_region_size,
        })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Sum of all slot sizes; the minimum size of a row.
    pub fn fixed_region_size(&self) -> usize {
        self.fixed_region_size
    }

    /// Element size of the primary key column.
    pub fn id_size(&self) -> usize {
        self.columns[0].element_size
    }

    pub fn column(&self, position: usize) -> Result<&ColumnDef> {
        self.columns
            .get(position)
            .ok_or_else(|| Error::NotFound(format!("column position {} out of range", position)))
    }

    pub fn column_by_name(&self, name: &str) -> Result<&ColumnDef> {
        self.position(name).map(|p| &self.columns[p])
    }

    pub fn position(&self, name: &str) -> Result<usize> {
        self.name_map
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("column '{}' not found", name)))
    }
}

/// Incrementally assembles a [`Schema`], starting with the primary key
/// column. Ingestion callers add one column per input field in order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        SchemaBuilder::default()
    }

    pub fn add_id_column(&mut self, size: usize) -> &mut Self {
        self.add_column(
            PRIMARY_KEY_NAME,
            "Primary key column",
            ElementType::Uint,
            size,
            NumElements::Fixed(1),
        )
    }

    pub fn add_uint_column(
        &mut self,
        name: &str,
        description: &str,
        size: usize,
        num_elements: NumElements,
    ) -> &mut Self {
        self.add_column(name, description, ElementType::Uint, size, num_elements)
    }

    pub fn add_int_column(
        &mut self,
        name: &str,
        description: &str,
        size: usize,
        num_elements: NumElements,
    ) -> &mut Self {
        self.add_column(name, description, ElementType::Int, size, num_elements)
    }

    pub fn add_float_column(
        &mut self,
        name: &str,
        description: &str,
        size: usize,
        num_elements: NumElements,
    ) -> &mut Self {
        self.add_column(name, description, ElementType::Float, size, num_elements)
    }

    pub fn add_char_column(
        &mut self,
        name: &str,
        description: &str,
        num_elements: NumElements,
    ) -> &mut Self {
        self.add_column(name, description, ElementType::Char, 1, num_elements)
    }

    pub fn add_column(
        &mut self,
        name: &str,
        description: &str,
        element_type: ElementType,
        element_size: usize,
        num_elements: NumElements,
    ) -> &mut Self {
        self.columns.push(ColumnDef {
            position: self.columns.len(),
            name: name.to_string(),
            description: description.to_string(),
            element_type,
            element_size,
            num_elements,
        });
        self
    }

    pub fn build(&self) -> Result<Schema> {
        Schema::from_columns(self.columns.clone())
    }
}
