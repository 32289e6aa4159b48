use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Startup failures. Any of these stops the sidecar before its loops run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required environment variable: {0}")]
    Config(&'static str),
    #[error("required path {path:?} unavailable")]
    Environment {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("process {0:?} not found")]
    NotFound(String),
    #[error("staging {path:?} failed")]
    Staging {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
}
