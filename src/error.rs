//! Error types for trace reading and the fingerprinting pipeline.
//!
//! Recoverable pipeline conditions (malformed records, degenerate segments,
//! failed fits) are typed so callers can log and fall back; a dimension
//! mismatch during classification is the one hard error per sample.

use thiserror::Error;

/// Errors raised while turning a capture into packet records.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to spawn tshark for '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read packets from '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse CSV export '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),
}

/// Errors raised by the per-flow pipeline stages.
#[derive(Error, Debug, PartialEq)]
pub enum PipelineError {
    #[error("Malformed record: missing {0}")]
    MalformedRecord(&'static str),

    #[error("Degenerate segment: {0}")]
    DegenerateSegment(String),

    #[error("Polynomial fit failed at degree {degree}")]
    FitFailure { degree: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Insufficient training data for {cca} (need at least {required}, got {actual})")]
    InsufficientTrainingData {
        cca: String,
        required: usize,
        actual: usize,
    },
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
