use core::fmt;
use serde::Serialize;
use telemetry_wire::{Identity, MeasurementRecord, MEASUREMENT_FRAME_LEN};
use tokio::sync::mpsc;

/// Replies buffered per session. Login needs one slot; one more leaves room
/// for an eviction notice.
pub const REPLY_CAPACITY: usize = 2;

pub type ReplySender = mpsc::Sender<RegistryReply>;
pub type ReplyReceiver = mpsc::Receiver<RegistryReply>;

/// Private channel over which the registry answers one session.
pub fn reply_channel() -> (ReplySender, ReplyReceiver) {
    mpsc::channel(REPLY_CAPACITY)
}

/// Messages a session sends to the registry.
#[derive(Debug)]
pub enum SessionCommand {
    Login {
        identity: Identity,
        reply: ReplySender,
    },
    Logout {
        identity: Identity,
    },
    Reading {
        identity: Identity,
        payload: [u8; MEASUREMENT_FRAME_LEN],
    },
}

impl SessionCommand {
    pub fn identity(&self) -> Identity {
        match self {
            SessionCommand::Login { identity, .. }
            | SessionCommand::Logout { identity }
            | SessionCommand::Reading { identity, .. } => *identity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Login { .. } => "login",
            SessionCommand::Logout { .. } => "logout",
            SessionCommand::Reading { .. } => "reading",
        }
    }
}

/// Registry answer to a login, or a later eviction notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryReply {
    Welcome,
    Kill,
}

/// Last accepted reading with its epoch-nanosecond stamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampedReading {
    pub timestamp_epoch: i64,
    pub reading: MeasurementRecord,
}

/// Per-device state owned by the registry.
#[derive(Debug)]
pub(crate) struct RegistryEntry {
    pub reply: ReplySender,
    pub connected_at: i64,
    pub last: Option<TimestampedReading>,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub identity: Identity,
    pub connected_at: i64,
    pub last_reading_at: Option<i64>,
}

/// Emitted after every committed reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingEvent {
    pub identity: Identity,
    pub timestamp_epoch: i64,
    pub reading: MeasurementRecord,
}

impl fmt::Display for ReadingEvent {
    /// CSV: `epoch_nanos,identity,temperature,altitude,latitude,longitude,battery_level`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.reading;
        write!(
            f,
            "{},{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            self.timestamp_epoch,
            self.identity.get(),
            r.temperature,
            r.altitude,
            r.latitude,
            r.longitude,
            r.battery_level
        )
    }
}
