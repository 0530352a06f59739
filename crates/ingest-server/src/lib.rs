//! ingest-server: TCP front end for device telemetry
//!
//! The [`ConnectionAcceptor`] admits connections up to the configured cap and
//! hands each one to a [`DeviceSession`], which logs the device in, then
//! forwards every measurement frame to the registry service until the device
//! disconnects, goes silent, or is evicted.

mod config;
pub use config::{load_config_file, ServerConfig, SessionConfig, ShortReadPolicy};

mod error;
pub use error::SessionError;

mod session;
pub use session::{DeviceSession, SessionEnd, SessionState};

mod acceptor;
pub use acceptor::{start, ConnectionAcceptor, RunningServer};
