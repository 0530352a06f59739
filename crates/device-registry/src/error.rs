use telemetry_wire::{Identity, InvalidFields};
use thiserror::Error;

pub type Result<T, E = RegistryError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} already logged in")]
    AlreadyRegistered(Identity),
    #[error("device {0} is not logged in")]
    UnknownDevice(Identity),
    /// The reading was stored, minus the rejected fields.
    #[error("reading from {identity} has out-of-range fields: {fields}")]
    MeasurementInvalid {
        identity: Identity,
        fields: InvalidFields,
    },
    #[error("internal fault in {op}: {message}")]
    InternalFault { op: &'static str, message: String },
    #[error("registry service is not running")]
    ServiceStopped,
}

impl RegistryError {
    /// Validation problems are logged but do not indicate a broken caller.
    pub fn is_validation(&self) -> bool {
        matches!(self, RegistryError::MeasurementInvalid { .. })
    }
}
