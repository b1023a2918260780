//! Packed row format: a fixed region with one slot per column followed
//! by a variable region holding the payload of variable-length columns.
//!
//! ```text
//! [ fixed region | variable region ]
//! ```
//!
//! A fixed-arity slot packs its k elements big-endian (numeric) or raw
//! (char). A variable-arity slot holds a 2-byte offset into the
//! variable region plus a 1-byte (var(1)) or 2-byte (var(2)) element
//! count; offset 0 with count 0 is the missing value.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::meta::def::{ColumnDef, ElementType, NumElements, Schema};
use crate::util;
use crate::value::Value;

/// Bit pattern stored for a missing 4-byte float element.
pub const F32_MISSING_BITS: u32 = 0x7fc0_0000;
/// Bit pattern stored for a missing 8-byte float element.
pub const F64_MISSING_BITS: u64 = 0x7ff8_0000_0000_0000;

/// The variable region of one row is addressed with 2-byte offsets.
const VAR_REGION_LIMIT: usize = u16::MAX as usize;

/// Smallest signed value representable in `size` bytes; doubles as the
/// missing sentinel for int columns.
pub fn int_missing(size: usize) -> i64 {
    if size == 8 {
        i64::MIN
    } else {
        -(1i64 << (8 * size - 1))
    }
}

/// Largest signed value representable in `size` bytes.
pub fn int_max(size: usize) -> i64 {
    if size == 8 {
        i64::MAX
    } else {
        (1i64 << (8 * size - 1)) - 1
    }
}

/// Largest unsigned value representable in `size` bytes; doubles as the
/// missing sentinel for uint columns.
pub fn uint_missing(size: usize) -> u64 {
    if size == 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

pub(crate) fn put_int(buf: &mut Vec<u8>, v: i64, size: usize) -> Result<()> {
    if v < int_missing(size) || v > int_max(size) {
        return Err(Error::Type(format!(
            "value {} does not fit a {}-byte int element",
            v, size
        )));
    }
    buf.extend_from_slice(&v.to_be_bytes()[8 - size..]);
    Ok(())
}

pub(crate) fn put_uint(buf: &mut Vec<u8>, v: u64, size: usize) -> Result<()> {
    if v > uint_missing(size) {
        return Err(Error::Type(format!(
            "value {} does not fit a {}-byte uint element",
            v, size
        )));
    }
    buf.extend_from_slice(&v.to_be_bytes()[8 - size..]);
    Ok(())
}

pub(crate) fn put_float(buf: &mut Vec<u8>, v: f64, size: usize) {
    if size == 4 {
        buf.extend_from_slice(&(v as f32).to_bits().to_be_bytes());
    } else {
        buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }
}

/// Sign-extending decode of a 1..=8 byte big-endian signed element.
pub(crate) fn get_int(buf: &[u8], addr: usize, size: usize) -> i64 {
    let mut arr = [0u8; 8];
    arr[8 - size..].copy_from_slice(&buf[addr..addr + size]);
    let shift = 64 - 8 * size as u32;
    (i64::from_be_bytes(arr) << shift) >> shift
}

/// Zero-extending decode of a 1..=8 byte big-endian unsigned element.
pub(crate) fn get_uint(buf: &[u8], addr: usize, size: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr[8 - size..].copy_from_slice(&buf[addr..addr + size]);
    u64::from_be_bytes(arr)
}

pub(crate) fn get_float(buf: &[u8], addr: usize, size: usize) -> f64 {
    if size == 4 {
        f32::from_bits(util::u32_val(buf, addr)) as f64
    } else {
        f64::from_bits(util::u64_val(buf, addr))
    }
}

fn put_missing_elements(buf: &mut Vec<u8>, col: &ColumnDef, n: usize) {
    for _ in 0..n {
        match col.element_type {
            ElementType::Int => {
                buf.extend_from_slice(&int_missing(col.element_size).to_be_bytes()[8 - col.element_size..])
            }
            ElementType::Uint => {
                buf.extend_from_slice(&uint_missing(col.element_size).to_be_bytes()[8 - col.element_size..])
            }
            ElementType::Float => {
                if col.element_size == 4 {
                    buf.extend_from_slice(&F32_MISSING_BITS.to_be_bytes())
                } else {
                    buf.extend_from_slice(&F64_MISSING_BITS.to_be_bytes())
                }
            }
            ElementType::Char => buf.push(0),
        }
    }
}

fn type_error(col: &ColumnDef, v: &Value) -> Error {
    Error::Type(format!(
        "value {:?} does not match {} column '{}'",
        v, col.element_type, col.name
    ))
}

/// Packs the elements of one present value, checking type and arity.
/// Returns the element count.
fn put_elements(buf: &mut Vec<u8>, col: &ColumnDef, v: &Value) -> Result<usize> {
    let scalar = col.num_elements == NumElements::Fixed(1);
    match (col.element_type, v) {
        (ElementType::Int, Value::Int(x)) if scalar => {
            put_int(buf, *x, col.element_size)?;
            Ok(1)
        }
        (ElementType::Int, Value::IntList(l)) if !scalar => {
            for x in l {
                put_int(buf, *x, col.element_size)?;
            }
            Ok(l.len())
        }
        (ElementType::Uint, Value::Uint(x)) if scalar => {
            put_uint(buf, *x, col.element_size)?;
            Ok(1)
        }
        (ElementType::Uint, Value::UintList(l)) if !scalar => {
            for x in l {
                put_uint(buf, *x, col.element_size)?;
            }
            Ok(l.len())
        }
        (ElementType::Float, Value::Float(x)) if scalar => {
            put_float(buf, *x, col.element_size);
            Ok(1)
        }
        (ElementType::Float, Value::FloatList(l)) if !scalar => {
            for x in l {
                put_float(buf, *x, col.element_size);
            }
            Ok(l.len())
        }
        (ElementType::Char, Value::Char(b)) => {
            buf.extend_from_slice(b);
            Ok(b.len())
        }
        _ => Err(type_error(col, v)),
    }
}

/// Encodes a full row. `values` holds the caller's column values in
/// schema order; trailing columns may be omitted and position 0 is
/// replaced by `row_id` regardless of what the caller put there.
pub fn encode_row(schema: &Schema, values: &[Value], row_id: u64) -> Result<Bytes> {
    if values.len() > schema.len() {
        return Err(Error::Type(format!(
            "row has {} values but the schema has {} columns",
            values.len(),
            schema.len()
        )));
    }
    let mut fixed = Vec::with_capacity(schema.fixed_region_size());
    let mut var: Vec<u8> = Vec::new();
    for col in schema.columns() {
        if col.position == 0 {
            put_uint(&mut fixed, row_id, col.element_size)?;
            continue;
        }
        let value = values.get(col.position).unwrap_or(&Value::Missing);
        match col.num_elements {
            NumElements::Fixed(k) => {
                if value.is_missing() || float_all_missing(col, value) {
                    put_missing_elements(&mut fixed, col, k as usize);
                    continue;
                }
                let before = fixed.len();
                let n = put_elements(&mut fixed, col, value)?;
                if n != k as usize {
                    fixed.truncate(before);
                    if col.element_type == ElementType::Char && n < k as usize {
                        // short char data is right-padded with NUL
                        put_elements(&mut fixed, col, value)?;
                        fixed.resize(before + col.slot_size(), 0);
                        continue;
                    }
                    return Err(Error::Type(format!(
                        "column '{}' expects {} elements, got {}",
                        col.name, k, n
                    )));
                }
            }
            NumElements::Var1 | NumElements::Var2 => {
                let before = var.len();
                let n = if value.is_missing() {
                    0
                } else {
                    put_elements(&mut var, col, value)?
                };
                if n > col.num_elements.max_elements() as usize {
                    return Err(Error::Type(format!(
                        "column '{}' holds at most {} elements, got {}",
                        col.name,
                        col.num_elements.max_elements(),
                        n
                    )));
                }
                if var.len() > VAR_REGION_LIMIT {
                    return Err(Error::Type(format!(
                        "row variable region exceeds {} bytes",
                        VAR_REGION_LIMIT
                    )));
                }
                // empty collapses to missing: offset 0, count 0
                let offset = if n == 0 { 0 } else { before as u16 };
                fixed.extend_from_slice(&offset.to_be_bytes());
                match col.num_elements {
                    NumElements::Var1 => fixed.push(n as u8),
                    _ => fixed.extend_from_slice(&(n as u16).to_be_bytes()),
                }
            }
        }
    }
    debug_assert_eq!(fixed.len(), schema.fixed_region_size());
    fixed.extend_from_slice(&var);
    Ok(Bytes::from(fixed))
}

/// A float scalar holding NaN is classified missing on the way in.
fn float_all_missing(col: &ColumnDef, v: &Value) -> bool {
    col.element_type == ElementType::Float && matches!(v, Value::Float(x) if x.is_nan())
}

/// Encodes a row whose present values are already serialized element
/// bytes: k·s bytes for a fixed column, n·s bytes for a variable one.
pub fn encode_row_raw(schema: &Schema, values: &[Option<Bytes>], row_id: u64) -> Result<Bytes> {
    if values.len() > schema.len() {
        return Err(Error::Type(format!(
            "row has {} values but the schema has {} columns",
            values.len(),
            schema.len()
        )));
    }
    let mut fixed = Vec::with_capacity(schema.fixed_region_size());
    let mut var: Vec<u8> = Vec::new();
    for col in schema.columns() {
        if col.position == 0 {
            put_uint(&mut fixed, row_id, col.element_size)?;
            continue;
        }
        let value = values.get(col.position).and_then(|v| v.as_ref());
        match col.num_elements {
            NumElements::Fixed(k) => match value {
                None => put_missing_elements(&mut fixed, col, k as usize),
                Some(b) => {
                    if b.len() != k as usize * col.element_size {
                        return Err(Error::Type(format!(
                            "column '{}' expects {} encoded bytes, got {}",
                            col.name,
                            k as usize * col.element_size,
                            b.len()
                        )));
                    }
                    fixed.extend_from_slice(b);
                }
            },
            NumElements::Var1 | NumElements::Var2 => {
                let b = value.map(|b| b.as_ref()).unwrap_or(&[]);
                if b.len() % col.element_size != 0 {
                    return Err(Error::Type(format!(
                        "column '{}' encoded length {} is not a multiple of the element size",
                        col.name,
                        b.len()
                    )));
                }
                let n = b.len() / col.element_size;
                if n > col.num_elements.max_elements() as usize {
                    return Err(Error::Type(format!(
                        "column '{}' holds at most {} elements, got {}",
                        col.name,
                        col.num_elements.max_elements(),
                        n
                    )));
                }
                if var.len() + b.len() > VAR_REGION_LIMIT {
                    return Err(Error::Type(format!(
                        "row variable region exceeds {} bytes",
                        VAR_REGION_LIMIT
                    )));
                }
                let offset = if n == 0 { 0 } else { var.len() as u16 };
                var.extend_from_slice(b);
                fixed.extend_from_slice(&offset.to_be_bytes());
                match col.num_elements {
                    NumElements::Var1 => fixed.push(n as u8),
                    _ => fixed.extend_from_slice(&(n as u16).to_be_bytes()),
                }
            }
        }
    }
    debug_assert_eq!(fixed.len(), schema.fixed_region_size());
    fixed.extend_from_slice(&var);
    Ok(Bytes::from(fixed))
}

/// Size of the variable region, derived from the offset/count slots in
/// the fixed region.
pub fn var_region_size(schema: &Schema, fixed: &[u8]) -> usize {
    let mut end = 0usize;
    let mut addr = 0usize;
    for col in schema.columns() {
        if col.is_var() {
            let offset = util::u16_val(fixed, addr) as usize;
            let count = match col.num_elements {
                NumElements::Var1 => fixed[addr + 2] as usize,
                _ => util::u16_val(fixed, addr + 2) as usize,
            };
            end = end.max(offset + count * col.element_size);
        }
        addr += col.slot_size();
    }
    end
}

fn decode_fixed_elements(col: &ColumnDef, buf: &[u8], addr: usize, k: usize) -> Value {
    let s = col.element_size;
    match col.element_type {
        // integer sentinels decode as their extreme values: the full
        // width is in range, so the boundary must round-trip
        ElementType::Int => {
            let l: Vec<i64> = (0..k).map(|j| get_int(buf, addr + j * s, s)).collect();
            if k == 1 {
                Value::Int(l[0])
            } else {
                Value::IntList(l)
            }
        }
        ElementType::Uint => {
            let l: Vec<u64> = (0..k).map(|j| get_uint(buf, addr + j * s, s)).collect();
            if k == 1 {
                Value::Uint(l[0])
            } else {
                Value::UintList(l)
            }
        }
        ElementType::Float => {
            let l: Vec<f64> = (0..k).map(|j| get_float(buf, addr + j * s, s)).collect();
            if l.iter().all(|x| x.is_nan()) {
                Value::Missing
            } else if k == 1 {
                Value::Float(l[0])
            } else {
                Value::FloatList(l)
            }
        }
        ElementType::Char => {
            let raw = &buf[addr..addr + k];
            let trimmed = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
            if trimmed == 0 {
                Value::Missing
            } else {
                Value::Char(Bytes::copy_from_slice(&raw[..trimmed]))
            }
        }
    }
}

fn decode_var_elements(col: &ColumnDef, var: &[u8], offset: usize, count: usize) -> Value {
    if count == 0 {
        return Value::Missing;
    }
    let s = col.element_size;
    match col.element_type {
        ElementType::Int => {
            Value::IntList((0..count).map(|j| get_int(var, offset + j * s, s)).collect())
        }
        ElementType::Uint => {
            Value::UintList((0..count).map(|j| get_uint(var, offset + j * s, s)).collect())
        }
        ElementType::Float => {
            Value::FloatList((0..count).map(|j| get_float(var, offset + j * s, s)).collect())
        }
        ElementType::Char => Value::Char(Bytes::copy_from_slice(&var[offset..offset + count])),
    }
}

/// Decodes a full row record back into one value per column.
pub fn decode_row(schema: &Schema, record: &[u8]) -> Result<Vec<Value>> {
    let frs = schema.fixed_region_size();
    if record.len() < frs {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "row record shorter than the fixed region",
        )));
    }
    let (fixed, var) = record.split_at(frs);
    let mut row = Vec::with_capacity(schema.len());
    let mut addr = 0usize;
    for col in schema.columns() {
        match col.num_elements {
            NumElements::Fixed(k) => row.push(decode_fixed_elements(col, fixed, addr, k as usize)),
            NumElements::Var1 | NumElements::Var2 => {
                let offset = util::u16_val(fixed, addr) as usize;
                let count = match col.num_elements {
                    NumElements::Var1 => fixed[addr + 2] as usize,
                    _ => util::u16_val(fixed, addr + 2) as usize,
                };
                if offset + count * col.element_size > var.len() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "row record shorter than its variable region",
                    )));
                }
                row.push(decode_var_elements(col, var, offset, count));
            }
        }
        addr += col.slot_size();
    }
    Ok(row)
}

#[cfg(test)]
mod codec_tests {
    use super::*;
    use crate::meta::def::SchemaBuilder;
    use crate::util;

    fn setup() {
        util::init_unit_test();
    }

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new();
        b.add_id_column(4)
            .add_int_column("x", "", 2, NumElements::Fixed(1))
            .add_uint_column("y", "", 1, NumElements::Var1)
            .add_char_column("s", "", NumElements::Var2)
            .add_float_column("q", "", 4, NumElements::Fixed(1));
        b.build().unwrap()
    }

    fn round_trip(schema: &Schema, values: &[Value], row_id: u64) -> Vec<Value> {
        let rec = encode_row(schema, values, row_id).unwrap();
        decode_row(schema, &rec).unwrap()
    }

    #[test]
    fn test_scalar_round_trip() {
        setup();
        let s = schema();
        let row = round_trip(
            &s,
            &[
                Value::Missing,
                Value::Int(-32768),
                Value::UintList(vec![1, 2, 3]),
                Value::from("hello"),
                Value::Float(2.5),
            ],
            7,
        );
        assert_eq!(row[0], Value::Uint(7));
        assert_eq!(row[1], Value::Int(-32768));
        assert_eq!(row[2], Value::UintList(vec![1, 2, 3]));
        assert_eq!(row[3], Value::from("hello"));
        assert_eq!(row[4], Value::Float(2.5));
    }

    #[test]
    fn test_missing_and_elided_values() {
        setup();
        let s = schema();
        // trailing columns elided entirely
        let row = round_trip(&s, &[], 0);
        assert_eq!(row[0], Value::Uint(0));
        // the int sentinel reads back as the extreme value
        assert_eq!(row[1], Value::Int(-32768));
        assert_eq!(row[2], Value::Missing);
        assert_eq!(row[3], Value::Missing);
        assert_eq!(row[4], Value::Missing);
        // explicit missing encodes the same bytes
        let a = encode_row(&s, &[], 3).unwrap();
        let b = encode_row(
            &s,
            &[Value::Missing, Value::Missing, Value::Missing, Value::Missing, Value::Missing],
            3,
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_collapses_to_missing() {
        setup();
        let s = schema();
        let row = round_trip(&s, &[Value::Missing, Value::Missing, Value::UintList(vec![])], 0);
        assert_eq!(row[2], Value::Missing);
        let row = round_trip(&s, &[Value::Missing, Value::Missing, Value::Missing, Value::from("")], 0);
        assert_eq!(row[3], Value::Missing);
    }

    #[test]
    fn test_int_boundaries_round_trip() {
        setup();
        let s = schema();
        // the extreme values share bytes with the missing sentinel and
        // still round-trip
        let row = round_trip(&s, &[Value::Missing, Value::Int(-32768)], 0);
        assert_eq!(row[1], Value::Int(-32768));
        let mut b = SchemaBuilder::new();
        b.add_id_column(4)
            .add_int_column("x", "", 2, NumElements::Fixed(2))
            .add_uint_column("u", "", 3, NumElements::Fixed(1));
        let s2 = b.build().unwrap();
        let rec = encode_row(
            &s2,
            &[
                Value::Missing,
                Value::IntList(vec![-32768, 32767]),
                Value::Uint(uint_missing(3)),
            ],
            0,
        )
        .unwrap();
        let row = decode_row(&s2, &rec).unwrap();
        assert_eq!(row[1], Value::IntList(vec![-32768, 32767]));
        assert_eq!(row[2], Value::Uint(uint_missing(3)));
    }

    #[test]
    fn test_int_range_checks() {
        setup();
        let s = schema();
        assert!(encode_row(&s, &[Value::Missing, Value::Int(32768)], 0).is_err());
        assert!(encode_row(&s, &[Value::Missing, Value::Int(-32769)], 0).is_err());
        assert!(encode_row(&s, &[Value::Missing, Value::Int(32767)], 0).is_ok());
    }

    #[test]
    fn test_extended_widths() {
        setup();
        for size in [3usize, 5, 6, 7] {
            let mut b = SchemaBuilder::new();
            b.add_id_column(4)
                .add_int_column("i", "", size, NumElements::Fixed(1))
                .add_uint_column("u", "", size, NumElements::Fixed(1));
            let s = b.build().unwrap();
            let lo = int_missing(size) + 1;
            let hi = int_max(size);
            let umax = uint_missing(size) - 1;
            for (iv, uv) in [(lo, 0u64), (hi, umax), (-1, 1)] {
                let row = round_trip(&s, &[Value::Missing, Value::Int(iv), Value::Uint(uv)], 0);
                assert_eq!(row[1], Value::Int(iv), "size {}", size);
                assert_eq!(row[2], Value::Uint(uv), "size {}", size);
            }
            assert!(encode_row(&s, &[Value::Missing, Value::Int(int_max(size) + 1)], 0).is_err());
            assert!(encode_row(
                &s,
                &[Value::Missing, Value::Int(0), Value::Uint(uint_missing(size) + 1)],
                0
            )
            .is_err());
        }
    }

    #[test]
    fn test_float_boundaries() {
        setup();
        let mut b = SchemaBuilder::new();
        b.add_id_column(4).add_float_column("q", "", 8, NumElements::Fixed(1));
        let s = b.build().unwrap();
        for v in [0.0, -0.0, f64::MIN_POSITIVE / 2.0, f64::MAX, f64::MIN] {
            let row = round_trip(&s, &[Value::Missing, Value::Float(v)], 0);
            assert_eq!(row[1], Value::Float(v));
        }
        // NaN is classified missing
        let row = round_trip(&s, &[Value::Missing, Value::Float(f64::NAN)], 0);
        assert_eq!(row[1], Value::Missing);
    }

    #[test]
    fn test_var1_boundary() {
        setup();
        let s = schema();
        let big = Value::UintList(vec![9; 255]);
        let row = round_trip(&s, &[Value::Missing, Value::Missing, big.clone()], 0);
        assert_eq!(row[2], big);
        let too_big = Value::UintList(vec![9; 256]);
        assert!(encode_row(&s, &[Value::Missing, Value::Missing, too_big], 0).is_err());
    }

    #[test]
    fn test_var2_boundary() {
        setup();
        let s = schema();
        let big = Value::Char(Bytes::from(vec![b'a'; 65535]));
        let rec = encode_row(
            &s,
            &[Value::Missing, Value::Missing, Value::Missing, big.clone()],
            0,
        )
        .unwrap();
        assert_eq!(decode_row(&s, &rec).unwrap()[3], big);
        let too_big = Value::Char(Bytes::from(vec![b'a'; 65536]));
        assert!(encode_row(
            &s,
            &[Value::Missing, Value::Missing, Value::Missing, too_big],
            0
        )
        .is_err());
    }

    #[test]
    fn test_var_region_overflow() {
        setup();
        let s = schema();
        // a full var(2) string plus one var(1) element overflows the
        // 2-byte address space of the row
        let res = encode_row(
            &s,
            &[
                Value::Missing,
                Value::Missing,
                Value::UintList(vec![1, 2]),
                Value::Char(Bytes::from(vec![b'a'; 65535])),
            ],
            0,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_type_mismatch() {
        setup();
        let s = schema();
        assert!(encode_row(&s, &[Value::Missing, Value::Uint(1)], 0).is_err());
        assert!(encode_row(&s, &[Value::Missing, Value::Int(0), Value::IntList(vec![1])], 0).is_err());
        assert!(encode_row(&s, &vec![Value::Missing; 6], 0).is_err());
    }

    #[test]
    fn test_encoded_round_trip() {
        setup();
        let s = schema();
        let rec = encode_row_raw(
            &s,
            &[
                None,
                Some(Bytes::from_static(&[0x80, 0x00])), // int2 -32768
                Some(Bytes::from_static(&[1, 2, 3])),
                Some(Bytes::from_static(b"chr1")),
                None,
            ],
            5,
        )
        .unwrap();
        let row = decode_row(&s, &rec).unwrap();
        assert_eq!(row[0], Value::Uint(5));
        assert_eq!(row[1], Value::Int(-32768));
        assert_eq!(row[2], Value::UintList(vec![1, 2, 3]));
        assert_eq!(row[3], Value::from("chr1"));
        assert_eq!(row[4], Value::Missing);
    }

    #[test]
    fn test_encoded_size_checks() {
        setup();
        let s = schema();
        // wrong fixed width
        assert!(encode_row_raw(&s, &[None, Some(Bytes::from_static(&[1]))], 0).is_err());
        // var element count above the arity bound
        let blob = Bytes::from(vec![7u8; 256]);
        assert!(encode_row_raw(&s, &[None, None, Some(blob)], 0).is_err());
    }

    #[test]
    fn test_var_region_size() {
        setup();
        let s = schema();
        let rec = encode_row(
            &s,
            &[
                Value::Missing,
                Value::Int(1),
                Value::UintList(vec![1, 2, 3]),
                Value::from("abc"),
            ],
            0,
        )
        .unwrap();
        let frs = s.fixed_region_size();
        assert_eq!(var_region_size(&s, &rec[..frs]), 6);
        assert_eq!(rec.len(), frs + 6);
    }
}
