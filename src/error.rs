//! Error types for the scanout core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("mode setting failed: {0}")]
    Ioctl(String),

    #[error("buffer map failed: {0}")]
    Map(String),

    #[error("buffer is locked for read, cannot acquire for write")]
    LockContention,

    /// Not a failure: the acceleration backend cannot express the operation
    /// and the caller should take the software path.
    #[error("operation not supported by acceleration backend: {0}")]
    CapabilityMismatch(&'static str),

    #[error("[CRTC:{0}] no outputs found")]
    NoOutputs(u32),

    #[error("no free scanout slot")]
    ScanoutsExhausted,

    #[error("mode transition failed: {0}")]
    ModeTransition(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that only signal "use the fallback path".
    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self, Error::CapabilityMismatch(_))
    }
}
