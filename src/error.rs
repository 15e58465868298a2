use thiserror::Error;

/// Error taxonomy for the pipeline. The runner treats `Infrastructure`-class
/// errors as stage-fatal but run-survivable, `ShapeMismatch` as degradable,
/// and `EmptyInput` as a legitimate short-circuit rather than a failure.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV read failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("warehouse error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("table shape mismatch in {table}: {detail}")]
    ShapeMismatch { table: String, detail: String },

    #[error("empty input: {0}")]
    EmptyInput(String),
}

pub type Result<T> = std::result::Result<T, EtlError>;
