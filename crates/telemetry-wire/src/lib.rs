//! telemetry-wire: codecs for the device telemetry protocol
//!
//! A device opens a TCP connection and sends a 15-byte login frame (raw
//! decimal digits with a Luhn check digit), then a stream of 40-byte
//! measurement frames (five big-endian f64 values). Frames carry no header;
//! boundaries are defined by their fixed lengths.

mod types;
pub use types::{
    Field, Identity, InvalidFields, MeasurementRecord, IDENTITY_FRAME_LEN, IDENTITY_MAX,
    MEASUREMENT_FRAME_LEN,
};

mod error;
pub use error::{Result, WireError};

mod identity;
pub use identity::{decode_identity, encode_identity, identity_frame_from_str, with_check_digit};

mod measurement;
pub use measurement::{decode_fields, decode_measurement, encode_measurement};
