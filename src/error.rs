use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pool::PoolKind;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Failed to start {}: {source}", program.display())]
    StartFailure {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to parse engine output for {input}: {reason}")]
    ParseFailure { input: String, reason: String },

    #[error("Probe returned no result for {input}")]
    EmptyResult { input: String },

    #[error("Engine stopped making progress on {input} after {waited:?}")]
    Hang { input: String, waited: Duration },

    #[error("Image extraction failed for {input}")]
    ExtractionFailure { input: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource pool {0} is closed")]
    PoolClosed(PoolKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EncoderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EncoderError::Cancelled)
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, EncoderError::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, EncoderError>;
