use crate::error::{Error, Result};
use chrono::Local;
use std::io::Write;
use std::sync::Once;

static INIT_LOGGER_ONCE: Once = Once::new();

pub fn init() {
    INIT_LOGGER_ONCE.call_once(|| {
        dotenv::dotenv().ok();

        env_logger::builder()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {:<5} {}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.module_path().unwrap(),
                    record.args()
                )
            })
            .init();
    })
}

pub fn init_unit_test() {
    std::env::set_var("RUST_LOG", "info");
    init();
}

pub fn u16_val(buf: &[u8], addr: usize) -> u16 {
    u16::from_be_bytes(buf[addr..addr + 2].try_into().expect("ERR_READ_VALUE_u16"))
}

pub fn u32_val(buf: &[u8], addr: usize) -> u32 {
    u32::from_be_bytes(buf[addr..addr + 4].try_into().expect("ERR_READ_VALUE_u32"))
}

pub fn u64_val(buf: &[u8], addr: usize) -> u64 {
    u64::from_be_bytes(buf[addr..addr + 8].try_into().expect("ERR_READ_VALUE_u64"))
}

/// Parses a cache size given either as a plain byte count or with one of
/// the suffixes K, M or G.
pub fn parse_cache_size(s: &str) -> Result<u64> {
    let t = s.trim();
    let (digits, multiplier) = match t.chars().last() {
        Some('K') | Some('k') => (&t[..t.len() - 1], 1u64 << 10),
        Some('M') | Some('m') => (&t[..t.len() - 1], 1u64 << 20),
        Some('G') | Some('g') => (&t[..t.len() - 1], 1u64 << 30),
        _ => (t, 1u64),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Type(format!("invalid cache size '{}'", s)))?;
    Ok(n * multiplier)
}

/// Formats a byte count into a human readable size.
pub fn format_size(n: u64) -> String {
    let mut num = n as f64;
    for unit in ["B", "KiB", "MiB", "GiB"] {
        if num < 1024.0 {
            return format!("{:.1} {}", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1} TiB", num)
}
