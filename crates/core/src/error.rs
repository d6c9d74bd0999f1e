/// Result alias that carries the custom [`LightSyncError`] type.
pub type Result<T> = std::result::Result<T, LightSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LightSyncError {
    /// A caller supplied a value the operation refuses to act on. Nothing is
    /// mutated when this is returned.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Malformed signal data reached the analysis boundary.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Channel write outside the 1..=512 universe.
    #[error("channel {channel} is outside the universe (1..=512)")]
    Channel { channel: u16 },
    #[error("configuration error: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
}

impl LightSyncError {
    /// Creates a validation error from the provided message.
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }
}
