//! Error taxonomy shared across the pipeline.
//!
//! Errors cross module boundaries as a kind tag plus message; callers
//! decide fatality. Signal-quality problems are not errors at all, they
//! are counted in per-decoder stats and processing continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration. Fatal at startup.
    #[error("config: {0}")]
    Config(String),

    /// Device open/parameter failure. Fatal at startup, retried mid-run.
    #[error("device: {0}")]
    Device(String),

    /// Audio sink failure. Marks playback unhealthy, never fatal.
    #[error("audio: {0}")]
    Audio(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable kind tag for log/status surfaces.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Device(_) => "device",
            Error::Audio(_) => "audio",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
