use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::devmem::DevMemError;

/// Anything that ends a run with a non-zero exit status
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    DevMem(#[from] DevMemError),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}
