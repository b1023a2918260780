use bytes::Bytes;

/// A single column value as seen by the append and read paths. Scalars
/// are the one-element case of fixed arity; lists cover fixed arity
/// k > 1 and the variable-length arities.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(Bytes),
    IntList(Vec<i64>),
    UintList(Vec<u64>),
    FloatList(Vec<f64>),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Formats this value for printing: missing renders as "NA", char
    /// data as text, scalars as plain decimals and lists as
    /// comma-separated elements in parentheses.
    pub fn format(&self) -> String {
        fn list<T: ToString>(l: &[T]) -> String {
            let parts: Vec<String> = l.iter().map(|u| u.to_string()).collect();
            format!("({})", parts.join(","))
        }
        match self {
            Value::Missing => "NA".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Char(b) => String::from_utf8_lossy(b).into_owned(),
            Value::IntList(l) => list(l),
            Value::UintList(l) => list(l),
            Value::FloatList(l) => list(l),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Char(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::IntList(v)
    }
}

impl From<Vec<u64>> for Value {
    fn from(v: Vec<u64>) -> Self {
        Value::UintList(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::FloatList(v)
    }
}
