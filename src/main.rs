//! devmem: peek and poke physical memory
//!
//! Maps one page of a physical-memory device (`/dev/mem` by default) and
//! reads or writes 1, 2, 4 or 8-byte elements inside it.
//!
//! ```text
//! devmem [-w value] [-s size] [-c count] [-v] <address>
//! ```
//!
//! ## Build-time Configuration
//! - `DEVMEM_DEFAULT_PATH`: device opened when `--device` is not given (default: /dev/mem)
//! - `DEVMEM_STRICT_ALIGNMENT`: align every access down to its element size
//!
//! ## Runtime Configuration
//! - `DEVMEM_PATH`: override the device path
//! - `RUST_LOG`: override the log filter

mod access;
mod config;
mod devmem;
mod error;

use std::io::{self, IsTerminal};
use std::process;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::access::Outcome;
use crate::config::{Args, Config};
use crate::devmem::PageWindow;
use crate::error::Error;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    init_logging(args.verbose);

    let result = Config::try_from(args)
        .map_err(Error::from)
        .and_then(|config| run(&config));

    match result {
        Ok(Outcome::Complete { elements }) => tracing::debug!("read {} elements", elements),
        Ok(Outcome::Truncated {
            elements,
            remaining,
        }) => tracing::debug!("read {} elements, skipped {}", elements, remaining),
        Ok(Outcome::Written) => tracing::debug!("write done"),
        Err(e) => {
            tracing::error!("{}", e);
            process::exit(1);
        }
    }
}

/// Warnings and errors go to stderr, verbose diagnostics to stdout
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "devmem=debug" } else { "devmem=warn" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr.with_max_level(Level::WARN)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_ansi(io::stdout().is_terminal())
                .with_writer(io::stdout.with_min_level(Level::INFO)),
        )
        .init();
}

/// Map the window, run the access sequence, release the window.
///
/// The window is released even when the sequence fails.
fn run(config: &Config) -> Result<Outcome, Error> {
    if config.verbose {
        config.log_resolved();
    }

    let window = PageWindow::open(&config.device, config.address)?;
    tracing::debug!(
        "window covers physical 0x{:08x}..0x{:08x}",
        window.physical_base(),
        window.physical_base() + devmem::WINDOW_SIZE as u64
    );

    let stdout = io::stdout();
    let outcome = access::execute(config, &window, &mut stdout.lock());
    let released = window.close();

    match (outcome, released) {
        (Ok(outcome), released) => {
            released?;
            Ok(outcome)
        }
        (Err(e), Err(release)) => {
            tracing::error!("{}", release);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
