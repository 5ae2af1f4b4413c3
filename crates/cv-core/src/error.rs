//! Error types for Cavern

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    BadParam(&'static str),

    #[error("Operation not valid in current state: {0}")]
    BadState(&'static str),

    #[error("Allocation failed: {0}")]
    MemAlloc(&'static str),

    #[error("IR load failed: {0}")]
    IrLoad(String),

    #[error("Worker thread creation failed: {0}")]
    ThreadCreate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
