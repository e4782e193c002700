use std::fmt;
use std::io;

use flash_endurance::{DeviceInfo, ERROR_RATE_AUTOMOTIVE, ERROR_RATE_CONSUMER, ERROR_RATE_HIGH_RELIABILITY, ERROR_RATE_INDUSTRIAL};

#[derive(Debug)]
pub enum ConfigError {
    /// Couldn't parse string as number
    NumberParseError(String),

    /// The numbers parsed, but don't describe a usable flash part
    BadGeometry(DeviceInfo),

    /// Generic IO Error
    IoError(io::Error),
}

impl std::convert::From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError { ConfigError::IoError(e) }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NumberParseError(s) => write!(f, "couldn't parse \"{}\" as a number", s),
            ConfigError::BadGeometry(info) => write!(
                f,
                "unusable geometry: capacity {:#x}, page {:#x}, sector {:#x}, block {:#x}",
                info.capacity, info.page_size, info.sector_size, info.block_size
            ),
            ConfigError::IoError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn get_base(value: &str) -> (&str, u32) {
    if value.starts_with("0x") {
        (value.trim_start_matches("0x"), 16)
    } else if value.starts_with("0X") {
        (value.trim_start_matches("0X"), 16)
    } else if value.starts_with("0b") {
        (value.trim_start_matches("0b"), 2)
    } else if value.starts_with("0B") {
        (value.trim_start_matches("0B"), 2)
    } else {
        (value, 10)
    }
}

/// Accepts decimal, `0x` hex, `0b` binary, and a `k`/`m` suffix for KiB/MiB.
pub fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    let err = || ConfigError::NumberParseError(value.to_owned());
    let (digits, scale) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    let (digits, base) = get_base(digits);
    let n = u32::from_str_radix(digits, base).map_err(|_| err())?;
    n.checked_mul(scale).ok_or_else(err)
}

pub fn parse_u64(value: &str) -> Result<u64, ConfigError> {
    let (digits, base) = get_base(value);
    u64::from_str_radix(digits, base).map_err(|_| ConfigError::NumberParseError(value.to_owned()))
}

/// An error rate: either a fraction like `1e-4`, or a reliability class name.
pub fn parse_error_rate(value: &str) -> Result<f32, ConfigError> {
    match value {
        "consumer" => Ok(ERROR_RATE_CONSUMER),
        "industrial" => Ok(ERROR_RATE_INDUSTRIAL),
        "automotive" => Ok(ERROR_RATE_AUTOMOTIVE),
        "high-reliability" => Ok(ERROR_RATE_HIGH_RELIABILITY),
        _ => value.parse::<f32>().map_err(|_| ConfigError::NumberParseError(value.to_owned())),
    }
}

pub fn parse_geometry(capacity: &str, page: &str, sector: &str, block: &str) -> Result<DeviceInfo, ConfigError> {
    let info = DeviceInfo {
        capacity: parse_u32(capacity)?,
        page_size: parse_u32(page)?,
        sector_size: parse_u32(sector)?,
        block_size: parse_u32(block)?,
    };
    if info.is_valid() {
        Ok(info)
    } else {
        Err(ConfigError::BadGeometry(info))
    }
}
