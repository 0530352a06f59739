use std::time::Duration;
use telemetry_wire::WireError;
use thiserror::Error;

/// Why a session ended. Every variant is terminal for its session only.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login frame truncated after {0} bytes")]
    ShortLoginRead(usize),
    #[error("no login frame before the login deadline")]
    LoginTimeout,
    #[error("invalid login frame: {0}")]
    Protocol(#[from] WireError),
    #[error("login rejected by registry")]
    Rejected,
    #[error("no reading within {0:?}")]
    ReadTimeout(Duration),
    #[error("connection closed by device")]
    ConnectionClosed,
    #[error("short reading frame of {0} bytes")]
    ShortRead(usize),
    #[error("evicted by registry")]
    Killed,
    #[error("registry service unavailable")]
    RegistryUnavailable,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether an authenticated session ending this way must tell the
    /// registry it left. Kill and registry loss mean the entry is already gone.
    pub fn requires_logout(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionClosed
                | SessionError::ReadTimeout(_)
                | SessionError::ShortRead(_)
                | SessionError::Io(_)
        )
    }
}
