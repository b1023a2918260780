//! Total-order key encoding. A key is the concatenation of per-column
//! component encodings chosen so that byte-wise comparison of two
//! encoded keys equals tuple comparison of the original values.
//!
//! Numeric components are 9 bytes: a presence byte (0 for missing, so
//! missing sorts below every present value) followed by an 8-byte
//! big-endian payload — sign-bit flip for ints, the IEEE-754
//! total-order transform for floats, the raw value for uints.
//! Variable-length char components are the raw bytes plus a NUL
//! terminator, which keeps composite keys comparing as tuples; fixed
//! char components are their NUL-padded slot bytes.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::meta::def::{ColumnDef, ElementType, NumElements, Schema};
use crate::store::codec;
use crate::value::Value;

/// One key column of an index: a schema position and the bin width
/// applied before encoding (0 means unbinned).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyColumn {
    pub position: usize,
    pub bin_width: f64,
}

const NUMERIC_COMPONENT_SIZE: usize = 9;
const PRESENT: u8 = 1;
const MISSING: u8 = 0;
const TERMINATOR: u8 = 0;

/// Checks a key column definition against the schema: bin widths are
/// numeric-only, integer bins must be whole, and variable-length
/// numeric columns cannot be key columns (their element sequences have
/// no fixed-width order-preserving encoding).
pub fn validate_key_columns(schema: &Schema, key_columns: &[KeyColumn]) -> Result<()> {
    if key_columns.is_empty() {
        return Err(Error::Schema("an index needs at least one key column".to_string()));
    }
    for kc in key_columns {
        let col = schema.column(kc.position)?;
        if kc.bin_width < 0.0 {
            return Err(Error::Schema(format!(
                "negative bin width on column '{}'",
                col.name
            )));
        }
        match col.element_type {
            ElementType::Char => {
                if kc.bin_width > 0.0 {
                    return Err(Error::Schema(format!(
                        "bin width is not supported on char column '{}'",
                        col.name
                    )));
                }
            }
            ElementType::Int | ElementType::Uint => {
                if col.is_var() {
                    return Err(Error::Schema(format!(
                        "variable-length numeric column '{}' cannot be a key column",
                        col.name
                    )));
                }
                if kc.bin_width > 0.0 && (kc.bin_width.fract() != 0.0 || kc.bin_width < 1.0) {
                    return Err(Error::Schema(format!(
                        "bin width on integer column '{}' must be a whole number >= 1",
                        col.name
                    )));
                }
            }
            ElementType::Float => {
                if col.is_var() {
                    return Err(Error::Schema(format!(
                        "variable-length numeric column '{}' cannot be a key column",
                        col.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn put_int_component(out: &mut Vec<u8>, v: i64, bin_width: f64) {
    let v = if bin_width > 0.0 {
        let b = bin_width as i64;
        v.div_euclid(b) * b
    } else {
        v
    };
    out.push(PRESENT);
    let mut payload = v.to_be_bytes();
    payload[0] ^= 0x80;
    out.extend_from_slice(&payload);
}

fn put_uint_component(out: &mut Vec<u8>, v: u64, bin_width: f64) {
    let v = if bin_width > 0.0 {
        let b = bin_width as u64;
        v / b * b
    } else {
        v
    };
    out.push(PRESENT);
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_float_component(out: &mut Vec<u8>, v: f64, bin_width: f64) {
    let v = if bin_width > 0.0 {
        (v / bin_width).floor() * bin_width
    } else {
        v
    };
    out.push(PRESENT);
    let bits = v.to_bits();
    let bits = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    out.extend_from_slice(&bits.to_be_bytes());
}

fn put_missing_numeric(out: &mut Vec<u8>) {
    out.push(MISSING);
    out.extend_from_slice(&[0u8; 8]);
}

fn key_error(col: &ColumnDef, v: &Value) -> Error {
    Error::Key(format!(
        "component {:?} does not match {} key column '{}'",
        v, col.element_type, col.name
    ))
}

fn put_component(out: &mut Vec<u8>, col: &ColumnDef, bin_width: f64, v: &Value) -> Result<()> {
    let fixed_list = match col.num_elements {
        NumElements::Fixed(k) if k > 1 => Some(k as usize),
        _ => None,
    };
    match (col.element_type, v) {
        (_, Value::Missing) => match col.element_type {
            ElementType::Char => {
                if col.is_var() {
                    out.push(TERMINATOR);
                } else {
                    out.extend(std::iter::repeat(0u8).take(col.slot_size()));
                }
            }
            _ => {
                for _ in 0..fixed_list.unwrap_or(1) {
                    put_missing_numeric(out);
                }
            }
        },
        (ElementType::Int, Value::Int(x)) if fixed_list.is_none() => {
            put_int_component(out, *x, bin_width)
        }
        (ElementType::Int, Value::IntList(l)) if fixed_list == Some(l.len()) => {
            for x in l {
                put_int_component(out, *x, bin_width);
            }
        }
        (ElementType::Uint, Value::Uint(x)) if fixed_list.is_none() => {
            put_uint_component(out, *x, bin_width)
        }
        (ElementType::Uint, Value::UintList(l)) if fixed_list == Some(l.len()) => {
            for x in l {
                put_uint_component(out, *x, bin_width);
            }
        }
        (ElementType::Float, Value::Float(x)) if fixed_list.is_none() => {
            if x.is_nan() {
                put_missing_numeric(out);
            } else {
                put_float_component(out, *x, bin_width);
            }
        }
        (ElementType::Float, Value::FloatList(l)) if fixed_list == Some(l.len()) => {
            for x in l {
                put_float_component(out, *x, bin_width);
            }
        }
        (ElementType::Char, Value::Char(b)) => {
            if col.is_var() {
                out.extend_from_slice(b);
                out.push(TERMINATOR);
            } else {
                let k = col.slot_size();
                if b.len() > k {
                    return Err(Error::Key(format!(
                        "char component longer than key column '{}'",
                        col.name
                    )));
                }
                out.extend_from_slice(b);
                out.extend(std::iter::repeat(0u8).take(k - b.len()));
            }
        }
        _ => return Err(key_error(col, v)),
    }
    Ok(())
}

/// Encodes a key tuple or a prefix of one. Components are validated
/// against the key columns and binned before encoding; a tuple longer
/// than the key arity is a key error.
pub fn encode_key(schema: &Schema, key_columns: &[KeyColumn], values: &[Value]) -> Result<Vec<u8>> {
    if values.len() > key_columns.len() {
        return Err(Error::Key(format!(
            "key has {} components but the index has {} key columns",
            values.len(),
            key_columns.len()
        )));
    }
    let mut out = Vec::new();
    for (kc, v) in key_columns.iter().zip(values) {
        let col = schema.column(kc.position)?;
        put_component(&mut out, col, kc.bin_width, v)?;
    }
    Ok(out)
}

fn get_numeric_component(col: &ColumnDef, buf: &[u8]) -> Value {
    if buf[0] == MISSING {
        return match col.element_type {
            ElementType::Int => Value::Int(codec::int_missing(col.element_size)),
            ElementType::Uint => Value::Uint(codec::uint_missing(col.element_size)),
            ElementType::Float => Value::Float(f64::NAN),
            ElementType::Char => unreachable!(),
        };
    }
    let payload = u64::from_be_bytes(buf[1..9].try_into().expect("ERR_KEY_PAYLOAD"));
    match col.element_type {
        ElementType::Int => Value::Int(i64::from_be_bytes((payload ^ (1 << 63)).to_be_bytes())),
        ElementType::Uint => Value::Uint(payload),
        ElementType::Float => {
            let bits = if payload >> 63 == 1 {
                payload ^ (1 << 63)
            } else {
                !payload
            };
            Value::Float(f64::from_bits(bits))
        }
        ElementType::Char => unreachable!(),
    }
}

/// Decodes an encoded key back into one value per key column.
pub fn decode_key(schema: &Schema, key_columns: &[KeyColumn], key: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(key_columns.len());
    let mut pos = 0usize;
    for kc in key_columns {
        let col = schema.column(kc.position)?;
        match col.element_type {
            ElementType::Char if col.is_var() => {
                let end = key[pos..]
                    .iter()
                    .position(|&b| b == TERMINATOR)
                    .ok_or_else(|| Error::Key("unterminated char component".to_string()))?;
                values.push(if end == 0 {
                    Value::Missing
                } else {
                    Value::Char(Bytes::copy_from_slice(&key[pos..pos + end]))
                });
                pos += end + 1;
            }
            ElementType::Char => {
                let k = col.slot_size();
                let raw = &key[pos..pos + k];
                let trimmed = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                values.push(if trimmed == 0 {
                    Value::Missing
                } else {
                    Value::Char(Bytes::copy_from_slice(&raw[..trimmed]))
                });
                pos += k;
            }
            _ => {
                let k = match col.num_elements {
                    NumElements::Fixed(k) => k as usize,
                    _ => 1,
                };
                if k == 1 {
                    let v = get_numeric_component(col, &key[pos..pos + NUMERIC_COMPONENT_SIZE]);
                    values.push(if key[pos] == MISSING { Value::Missing } else { v });
                } else {
                    let mut all_missing = true;
                    let mut ints = Vec::new();
                    let mut uints = Vec::new();
                    let mut floats = Vec::new();
                    for j in 0..k {
                        let at = pos + j * NUMERIC_COMPONENT_SIZE;
                        all_missing &= key[at] == MISSING;
                        match get_numeric_component(col, &key[at..at + NUMERIC_COMPONENT_SIZE]) {
                            Value::Int(x) => ints.push(x),
                            Value::Uint(x) => uints.push(x),
                            Value::Float(x) => floats.push(x),
                            _ => {}
                        }
                    }
                    values.push(if all_missing {
                        Value::Missing
                    } else {
                        match col.element_type {
                            ElementType::Int => Value::IntList(ints),
                            ElementType::Uint => Value::UintList(uints),
                            _ => Value::FloatList(floats),
                        }
                    });
                }
                pos += k * NUMERIC_COMPONENT_SIZE;
            }
        }
    }
    Ok(values)
}

/// The smallest byte string greater than every string with this
/// prefix, or `None` when the prefix is all 0xFF.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return Some(out);
        }
    }
    None
}
