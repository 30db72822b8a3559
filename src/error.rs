use thiserror::Error;

use crate::config;
use crate::kernel;

/// Top-level error type aggregating every subsystem's errors.
///
/// Per the error taxonomy: no error here is fatal except an inability to
/// run cleanup on shutdown. The supervisor logs everything else and keeps
/// going.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kernel adapter error: {0}")]
    Kernel(#[from] kernel::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::Error),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("general error: {0}")]
    General(String),
}
