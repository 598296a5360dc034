//! Command line configuration
//!
//! Everything the tool does is decided here, once, before the device is
//! touched. The resulting [`Config`] is immutable and handed to the mapper
//! and the access sequencer explicitly.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::access::OutputFormat;
use crate::devmem::{map_offset, page_base};

/// Default device path (set at compile time via build.rs)
const DEFAULT_DEVICE: &str = match option_env!("DEVMEM_DEFAULT_PATH") {
    Some(s) => s,
    None => "/dev/mem",
};

#[derive(Parser, Debug)]
#[command(
    name = "devmem",
    version,
    about = "Read or write physical memory (hardware registers) through a memory device"
)]
pub struct Args {
    /// Physical address to access (hex with 0x, octal with leading 0, or decimal)
    #[arg(value_name = "ADDRESS", value_parser = parse_address)]
    pub address: u64,

    /// Write VALUE to the address instead of reading it
    #[arg(short, long, value_name = "VALUE", value_parser = parse_value)]
    pub write: Option<u64>,

    /// Element size in bytes: 1, 2, 4 or 8
    #[arg(short, long, value_name = "BYTES", default_value = "4", value_parser = parse_size)]
    pub size: ElementSize,

    /// Number of consecutive elements to read
    #[arg(short, long, value_name = "N", default_value = "1", value_parser = parse_count)]
    pub count: NonZeroUsize,

    /// Print the resolved configuration and every access to stdout
    #[arg(short, long)]
    pub verbose: bool,

    /// Physical memory device to map
    #[arg(short, long, value_name = "PATH", env = "DEVMEM_PATH", default_value = DEFAULT_DEVICE)]
    pub device: PathBuf,

    /// Emit one JSON object per element instead of text
    #[arg(short, long)]
    pub json: bool,
}

/// Width of a single typed access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    U8 = 1,
    U16 = 2,
    U32 = 4,
    U64 = 8,
}

impl ElementSize {
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Hex digits needed to print a full element
    pub const fn hex_digits(self) -> usize {
        self.bytes() * 2
    }

    /// Truncate `value` to the element width
    pub const fn truncate(self, value: u64) -> u64 {
        match self {
            ElementSize::U64 => value,
            _ => value & ((1u64 << (self.bytes() * 8)) - 1),
        }
    }
}

impl TryFrom<u64> for ElementSize {
    type Error = u64;

    fn try_from(bytes: u64) -> Result<Self, Self::Error> {
        match bytes {
            1 => Ok(ElementSize::U8),
            2 => Ok(ElementSize::U16),
            4 => Ok(ElementSize::U32),
            8 => Ok(ElementSize::U64),
            other => Err(other),
        }
    }
}

impl fmt::Display for ElementSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// What to do at the target address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read { count: NonZeroUsize },
    Write { value: u64 },
}

impl Operation {
    pub fn count(&self) -> usize {
        match self {
            Operation::Read { count } => count.get(),
            Operation::Write { .. } => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("multiple writes are not supported (count {0})")]
    MultipleWrites(usize),

    #[error("address 0x{0:x} is beyond the range the device can map")]
    AddressOutOfRange(u64),
}

/// Resolved, validated run configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub address: u64,
    pub size: ElementSize,
    pub operation: Operation,
    pub device: PathBuf,
    pub format: OutputFormat,
    pub verbose: bool,
}

impl Config {
    /// Log the resolved configuration (visible with `-v`)
    pub fn log_resolved(&self) {
        let (mode, write_value) = match self.operation {
            Operation::Read { .. } => ("read", 0),
            Operation::Write { value } => ("write", value),
        };
        tracing::debug!(
            "mode={} address=0x{:x} count={} size={} write_value=0x{:x} device={}",
            mode,
            self.address,
            self.operation.count(),
            self.size,
            write_value,
            self.device.display()
        );
    }
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let operation = match args.write {
            Some(_) if args.count.get() > 1 => {
                return Err(ConfigError::MultipleWrites(args.count.get()))
            }
            Some(value) => Operation::Write { value },
            None => Operation::Read { count: args.count },
        };

        if map_offset(page_base(args.address)).is_none() {
            return Err(ConfigError::AddressOutOfRange(args.address));
        }

        Ok(Config {
            address: args.address,
            size: args.size,
            operation,
            device: args.device,
            format: if args.json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            verbose: args.verbose,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid integer `{0}`")]
pub struct InvalidInteger(String);

/// Parse an unsigned integer with C-style base prefixes
///
/// `0x`/`0X` selects hex, a leading `0` octal, anything else decimal.
/// The whole string must be consumed.
pub fn parse_int(s: &str) -> Result<u64, InvalidInteger> {
    let invalid = || InvalidInteger(s.to_string());
    let trimmed = s.trim();

    let (digits, radix) = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        (hex, 16)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') {
        (&trimmed[1..], 8)
    } else {
        (trimmed, 10)
    };

    // from_str_radix tolerates a sign, strtoul-style literals here do not
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

fn parse_value(s: &str) -> Result<u64, String> {
    parse_int(s).map_err(|e| e.to_string())
}

fn parse_address(s: &str) -> Result<u64, String> {
    // Zero doubles as the "nothing parsed" value, so it is refused outright.
    match parse_int(s) {
        Ok(0) => Err("address must not be zero".to_string()),
        Ok(address) => Ok(address),
        Err(e) => Err(format!("unable to parse the address: {}", e)),
    }
}

fn parse_size(s: &str) -> Result<ElementSize, String> {
    let bytes = parse_int(s).map_err(|e| format!("unable to parse the size: {}", e))?;
    ElementSize::try_from(bytes)
        .map_err(|bytes| format!("invalid size {} (expected 1, 2, 4 or 8)", bytes))
}

fn parse_count(s: &str) -> Result<NonZeroUsize, String> {
    let count = parse_int(s).map_err(|e| format!("wrong count specified: {}", e))?;
    usize::try_from(count)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| format!("count must be between 1 and {}", usize::MAX))
}
