use thiserror::Error;

pub type Result<T, E = WireError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid digit {value} at position {position}")]
    InvalidDigit { position: usize, value: u8 },
    #[error("identity checksum mismatch")]
    ChecksumMismatch,
    /// Caller handed a buffer of the wrong size. Never reported to devices.
    #[error("frame length {actual}, expected {expected}")]
    FrameLength { expected: usize, actual: usize },
    #[error("invalid identity text: {0}")]
    InvalidText(&'static str),
    #[error("identity {0} does not fit in 15 digits")]
    IdentityOutOfRange(u64),
}

impl WireError {
    /// True for errors a remote device can cause with its login frame.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            WireError::InvalidDigit { .. } | WireError::ChecksumMismatch
        )
    }
}
