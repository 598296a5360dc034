//! Access sequencing
//!
//! Drives the configured read or write against a mapped window and prints
//! the results.

use std::io::Write;

use serde::Serialize;

use crate::config::{Config, ElementSize, Operation};
use crate::devmem::{page_offset, PageWindow, WINDOW_SIZE};
use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// `0x00001000: 0xdeadbeef`
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every requested element was read
    Complete { elements: usize },
    /// The page edge stopped the read early
    Truncated { elements: usize, remaining: usize },
    Written,
}

/// A single element read from memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub address: u64,
    pub size: ElementSize,
    pub value: u64,
}

#[derive(Serialize)]
struct JsonSample {
    address: String,
    size: usize,
    value: String,
}

impl Sample {
    fn emit<W: Write>(&self, out: &mut W, format: OutputFormat) -> Result<(), Error> {
        let value = format!("0x{:0width$x}", self.value, width = self.size.hex_digits());
        match format {
            OutputFormat::Text => writeln!(out, "0x{:08x}: {}", self.address, value)?,
            OutputFormat::Json => {
                let sample = JsonSample {
                    address: format!("0x{:08x}", self.address),
                    size: self.size.bytes(),
                    value,
                };
                serde_json::to_writer(&mut *out, &sample).map_err(std::io::Error::from)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

/// Run the configured operation against `window`, writing results to `out`
pub fn execute<W: Write>(
    config: &Config,
    window: &PageWindow,
    out: &mut W,
) -> Result<Outcome, Error> {
    match config.operation {
        Operation::Write { value } => {
            window.store(config.address, config.size, value)?;
            Ok(Outcome::Written)
        }
        Operation::Read { count } => read_sequence(
            window,
            config.address,
            config.size,
            count.get(),
            config.format,
            out,
        ),
    }
}

fn read_sequence<W: Write>(
    window: &PageWindow,
    start: u64,
    size: ElementSize,
    count: usize,
    format: OutputFormat,
    out: &mut W,
) -> Result<Outcome, Error> {
    let step = size.bytes();
    let mut address = start;
    let mut remaining = count;
    let mut elements = 0;

    while remaining > 0 {
        let offset = page_offset(address);
        // An element hanging over the page edge is never read
        if offset + step > WINDOW_SIZE {
            break;
        }

        let value = window.load(address, size)?;
        Sample {
            address,
            size,
            value,
        }
        .emit(out, format)?;
        elements += 1;
        remaining -= 1;

        if offset + step >= WINDOW_SIZE {
            break;
        }
        address += step as u64;
    }
    out.flush()?;

    if remaining > 0 {
        tracing::warn!(
            "border of mapping reached, stopping here ({} remaining items)",
            remaining
        );
        return Ok(Outcome::Truncated {
            elements,
            remaining,
        });
    }
    Ok(Outcome::Complete { elements })
}
